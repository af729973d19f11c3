//! Full-document snapshots.
//!
//! A session needs the complete notebook twice: once on open, to seed the
//! mirror, and again whenever the delta stream can no longer be trusted
//! (version gap, unknown cell, server-reported inconsistency). Both go
//! through a [`SnapshotSource`].
//!
//! [`HttpSnapshotClient`] is the production source: it asks the files API
//! for the current version and a presigned download URL, then downloads the
//! nbformat document from that URL. [`MemorySnapshots`] serves canned
//! snapshots in-process.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::constants;
use crate::notebook::Notebook;

/// A notebook at a known version.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    /// Version of the last delta folded into `notebook`.
    pub version: u64,
    /// Document content.
    pub notebook: Notebook,
}

/// Fetches the current document for a file.
#[async_trait]
pub trait SnapshotSource: Send + Sync + std::fmt::Debug {
    /// Latest snapshot of `file_id`.
    async fn fetch(&self, file_id: &str) -> Result<DocumentSnapshot>;
}

/// File record returned by `GET /v1/files/{id}`.
#[derive(Debug, Deserialize)]
struct FileRecord {
    current_version: Option<u64>,
    presigned_download_url: Option<String>,
}

/// Snapshot source backed by the files REST API.
#[derive(Debug, Clone)]
pub struct HttpSnapshotClient {
    client: Client,
    api_url: String,
    token: String,
}

impl HttpSnapshotClient {
    /// Creates a client for `api_url` authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, api_url, token))
    }

    /// Creates a client with a pre-configured HTTP client.
    pub fn with_client(client: Client, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Base API URL (no trailing slash).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotClient {
    async fn fetch(&self, file_id: &str) -> Result<DocumentSnapshot> {
        let url = format!("{}/v1/files/{}", self.api_url, file_id);
        log::debug!("[Snapshot] Fetching file record {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to fetch file {file_id}"))?;

        if !response.status().is_success() {
            anyhow::bail!("File request for {} failed: {}", file_id, response.status());
        }

        let record: FileRecord = response
            .json()
            .await
            .context("Failed to parse file record")?;

        let version = record
            .current_version
            .with_context(|| format!("File {file_id} has no current version"))?;
        let download_url = record
            .presigned_download_url
            .with_context(|| format!("File {file_id} has no download URL"))?;

        // Presigned URLs carry their own credentials; no bearer header.
        let response = self
            .client
            .get(&download_url)
            .send()
            .await
            .context("Failed to download notebook content")?;

        if !response.status().is_success() {
            anyhow::bail!("Notebook download for {} failed: {}", file_id, response.status());
        }

        let notebook: Notebook = response
            .json()
            .await
            .context("Failed to parse notebook content")?;

        log::info!(
            "[Snapshot] Loaded file {} at version {} ({} cells)",
            file_id,
            version,
            notebook.cells.len()
        );
        Ok(DocumentSnapshot { version, notebook })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<DocumentSnapshot>,
    failures: VecDeque<String>,
    fetches: u32,
}

/// In-process snapshot source serving whatever snapshot was set last.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshots {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySnapshots {
    /// Source serving `snapshot`.
    pub fn new(snapshot: DocumentSnapshot) -> Self {
        let source = Self::default();
        source.set(snapshot);
        source
    }

    /// Replace the snapshot served by later fetches.
    pub fn set(&self, snapshot: DocumentSnapshot) {
        self.lock().current = Some(snapshot);
    }

    /// Make the next fetch fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.lock().failures.push_back(reason.into());
    }

    /// Number of fetches so far, failed ones included.
    pub fn fetches(&self) -> u32 {
        self.lock().fetches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshots {
    async fn fetch(&self, file_id: &str) -> Result<DocumentSnapshot> {
        let mut state = self.lock();
        state.fetches += 1;
        if let Some(reason) = state.failures.pop_front() {
            anyhow::bail!("snapshot for {file_id} unavailable: {reason}");
        }
        state
            .current
            .clone()
            .with_context(|| format!("no snapshot for {file_id}"))
    }
}
