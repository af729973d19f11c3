//! Subscription registry.
//!
//! The set of channels the application wants, kept independently of any one
//! connection so it can be replayed after every reconnect. Entries keep
//! insertion order; replay subscribes in that order.

use serde_json::Value;

/// One wanted channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Channel name, e.g. `files/<id>`.
    pub channel: String,
    /// Scope parameters sent with `subscribe_request`.
    pub params: Value,
}

/// Ordered set of subscriptions keyed by channel.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `channel`, or replace its params if already present.
    ///
    /// Returns `true` if the channel is new.
    pub fn insert(&mut self, channel: impl Into<String>, params: Value) -> bool {
        let channel = channel.into();
        if let Some(existing) = self.entries.iter_mut().find(|s| s.channel == channel) {
            existing.params = params;
            return false;
        }
        self.entries.push(Subscription { channel, params });
        true
    }

    /// Remove `channel`. Returns whether it was present.
    pub fn remove(&mut self, channel: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.channel != channel);
        self.entries.len() != before
    }

    /// Whether `channel` is registered.
    pub fn contains(&self, channel: &str) -> bool {
        self.entries.iter().any(|s| s.channel == channel)
    }

    /// Copy of the current entries, in insertion order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.clone()
    }

    /// Channel names, in insertion order.
    pub fn channels(&self) -> Vec<String> {
        self.entries.iter().map(|s| s.channel.clone()).collect()
    }
}
