//! Notebook document model and delta application.
//!
//! - [`model`] - nbformat document and cell types
//! - [`patch`] - diff-match-patch text patches used by content deltas
//! - [`delta`] - typed delta operations and their wire form
//! - [`builder`] - version-ordered application of deltas onto a document

pub mod builder;
pub mod delta;
pub mod model;
pub mod patch;

pub use builder::{DeltaError, Ingest, NotebookBuilder};
pub use delta::{Delta, DeltaDraft, DeltaOp, ExecuteScope};
pub use model::{Cell, CellType, ExecutionState, Notebook};
pub use patch::{PatchError, TextPatch};
