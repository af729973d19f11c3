//! Delta application engine.
//!
//! [`NotebookBuilder`] owns the mirrored [`Notebook`] and its version
//! watermark. Deltas are accepted strictly in order: `watermark + 1` is
//! applied, anything at or below the watermark is a duplicate, anything
//! further ahead is a gap. Gaps and operations that reference cells the
//! mirror does not have are reported back to the caller, which rebuilds
//! from a snapshot; the builder never guesses at missing state.
//!
//! Every operation validates before it mutates, so a failed delta leaves
//! the document exactly as it was.

use std::collections::HashSet;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::delta::{Delta, DeltaOp};
use super::model::{Cell, ExecutionState, Notebook};
use super::patch::PatchError;
use crate::snapshot::DocumentSnapshot;

/// Why a delta could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    /// The delta skipped over versions this mirror never saw.
    #[error("version gap: expected {expected}, received {received}")]
    VersionGap {
        /// Next version the mirror can apply.
        expected: u64,
        /// Version that arrived.
        received: u64,
    },
    /// The delta references a cell the mirror does not have.
    #[error("unknown cell {0}")]
    UnknownEntity(String),
    /// A content patch did not fit the local text.
    #[error("patch for cell {cell_id} failed: {source}")]
    PatchFailed {
        /// Target cell.
        cell_id: String,
        /// Underlying patch failure.
        source: PatchError,
    },
    /// A metadata update with an empty key path and a non-object value.
    #[error("empty metadata path with non-object value")]
    InvalidPath,
}

/// Outcome of [`NotebookBuilder::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Applied; the watermark advanced.
    Applied,
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Mirror must resync before applying anything else.
    Resync(DeltaError),
}

/// In-memory notebook rebuilt from a snapshot plus deltas.
#[derive(Debug, Clone)]
pub struct NotebookBuilder {
    notebook: Notebook,
    watermark: u64,
    last_applied_delta_id: Option<Uuid>,
    /// Cells removed by deltas; later edits to them are skipped, not errors.
    deleted_cell_ids: HashSet<String>,
}

impl NotebookBuilder {
    /// Builder seeded from a snapshot.
    pub fn new(snapshot: DocumentSnapshot) -> Self {
        let mut builder = Self {
            notebook: Notebook::default(),
            watermark: 0,
            last_applied_delta_id: None,
            deleted_cell_ids: HashSet::new(),
        };
        builder.reset(snapshot);
        builder
    }

    /// Discard all state and start over from `snapshot`.
    pub fn reset(&mut self, snapshot: DocumentSnapshot) {
        let mut seen = HashSet::new();
        for cell in &snapshot.notebook.cells {
            if !seen.insert(cell.id.as_str()) {
                log::warn!("[Notebook] Snapshot contains duplicate cell id {}", cell.id);
            }
        }
        self.notebook = snapshot.notebook;
        self.watermark = snapshot.version;
        self.last_applied_delta_id = None;
        self.deleted_cell_ids.clear();
    }

    /// Highest version applied.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Id of the last delta applied since the last reset.
    pub fn last_applied_delta_id(&self) -> Option<Uuid> {
        self.last_applied_delta_id
    }

    /// Current document.
    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    /// Cell by id.
    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.notebook.cell(cell_id)
    }

    /// Whether a delta deleted `cell_id` since the last reset.
    pub fn was_deleted(&self, cell_id: &str) -> bool {
        self.deleted_cell_ids.contains(cell_id)
    }

    /// Version-check and apply one delta.
    pub fn ingest(&mut self, delta: &Delta) -> Ingest {
        let expected = self.watermark.saturating_add(1);

        if delta.version <= self.watermark {
            if delta.version < self.watermark {
                // Only plain re-delivery of the last delta is routine.
                log::warn!(
                    "[Notebook] Stale delta {} at version {} (watermark {})",
                    delta.id,
                    delta.version,
                    self.watermark
                );
            } else {
                log::debug!("[Notebook] Duplicate delta {} at version {}", delta.id, delta.version);
            }
            return Ingest::Duplicate;
        }

        if delta.version > expected {
            return Ingest::Resync(DeltaError::VersionGap {
                expected,
                received: delta.version,
            });
        }

        match self.apply(&delta.op) {
            Ok(()) => {
                self.watermark = delta.version;
                self.last_applied_delta_id = Some(delta.id);
                Ingest::Applied
            }
            Err(e) => {
                log::warn!(
                    "[Notebook] Delta {} ({}/{}) failed at version {}: {}",
                    delta.id,
                    delta.op.kind().0,
                    delta.op.kind().1,
                    delta.version,
                    e
                );
                Ingest::Resync(e)
            }
        }
    }

    /// Apply an operation without version accounting.
    ///
    /// On error the document is unchanged.
    pub fn apply(&mut self, op: &DeltaOp) -> Result<(), DeltaError> {
        match op {
            DeltaOp::AddCell { after_id, cell } => {
                let index = match after_id {
                    Some(after_id) => self.index_of(after_id)? + 1,
                    None => 0,
                };
                if self.notebook.cell(&cell.id).is_some() {
                    log::warn!("[Notebook] Adding cell {} which already exists", cell.id);
                }
                self.deleted_cell_ids.remove(&cell.id);
                self.notebook.cells.insert(index, cell.clone());
            }
            DeltaOp::DeleteCell { cell_id } => {
                let index = self.index_of(cell_id)?;
                self.notebook.cells.remove(index);
                self.deleted_cell_ids.insert(cell_id.clone());
            }
            DeltaOp::MoveCell { cell_id, after_id } => {
                let from = self.index_of(cell_id)?;
                if after_id.as_deref() == Some(cell_id.as_str()) {
                    return Ok(());
                }
                if let Some(after_id) = after_id {
                    self.index_of(after_id)?;
                }
                let cell = self.notebook.cells.remove(from);
                let to = match after_id {
                    Some(after_id) => self.index_of(after_id)? + 1,
                    None => 0,
                };
                self.notebook.cells.insert(to, cell);
            }
            DeltaOp::PatchContents { cell_id, patch } => {
                let cell = self.cell_mut(cell_id)?;
                cell.source = patch
                    .apply(&cell.source)
                    .map_err(|source| DeltaError::PatchFailed {
                        cell_id: cell_id.clone(),
                        source,
                    })?;
            }
            DeltaOp::ReplaceContents { cell_id, source } => {
                self.cell_mut(cell_id)?.source.clone_from(source);
            }
            DeltaOp::UpdateCellMetadata {
                cell_id,
                path,
                value,
                prior_value,
            } => {
                if self.skip_deleted(cell_id, "cell_metadata/update") {
                    return Ok(());
                }
                let cell = self.cell_mut(cell_id)?;
                set_path(&mut cell.metadata, path, value.clone(), prior_value.as_ref(), cell_id)?;
            }
            DeltaOp::ReplaceCellMetadata {
                cell_id,
                cell_type,
                language,
            } => {
                let cell = self.cell_mut(cell_id)?;
                if let Some(cell_type) = cell_type {
                    cell.cell_type = *cell_type;
                    if let Some(language) = language {
                        cell.set_service_metadata("cell_type", Value::String(language.clone()));
                    }
                }
            }
            DeltaOp::UpdateNotebookMetadata {
                path,
                value,
                prior_value,
            } => {
                set_path(
                    &mut self.notebook.metadata,
                    path,
                    value.clone(),
                    prior_value.as_ref(),
                    "notebook",
                )?;
            }
            DeltaOp::ReplaceOutputCollection {
                cell_id,
                output_collection_id,
            } => {
                if self.skip_deleted(cell_id, "cell_output_collection/replace") {
                    return Ok(());
                }
                self.cell_mut(cell_id)?.set_service_metadata(
                    "output_collection_id",
                    Value::String(output_collection_id.clone()),
                );
            }
            DeltaOp::Execute { .. } => {}
            DeltaOp::Unrecognized {
                delta_type,
                delta_action,
            } => {
                log::warn!("[Notebook] Unhandled delta {}/{}", delta_type, delta_action);
            }
        }
        Ok(())
    }

    /// Record a kernel-reported execution state.
    ///
    /// Returns the updated cell, or `None` if the cell is not in the document.
    pub fn apply_cell_state(&mut self, cell_id: &str, state: ExecutionState) -> Option<Cell> {
        let cell = self.notebook.cells.iter_mut().find(|cell| cell.id == cell_id)?;
        cell.execution_state = state;
        Some(cell.clone())
    }

    fn index_of(&self, cell_id: &str) -> Result<usize, DeltaError> {
        self.notebook
            .index_of(cell_id)
            .ok_or_else(|| DeltaError::UnknownEntity(cell_id.to_string()))
    }

    fn cell_mut(&mut self, cell_id: &str) -> Result<&mut Cell, DeltaError> {
        self.notebook
            .cells
            .iter_mut()
            .find(|cell| cell.id == cell_id)
            .ok_or_else(|| DeltaError::UnknownEntity(cell_id.to_string()))
    }

    fn skip_deleted(&self, cell_id: &str, what: &str) -> bool {
        let deleted = self.deleted_cell_ids.contains(cell_id);
        if deleted {
            log::info!("[Notebook] Skipping {} for deleted cell {}", what, cell_id);
        }
        deleted
    }
}

/// Store `value` at `path`, creating intermediate objects.
///
/// Works on a copy and swaps it in, so a failure leaves `root` untouched.
fn set_path(
    root: &mut Map<String, Value>,
    path: &[String],
    value: Value,
    prior_value: Option<&Value>,
    owner: &str,
) -> Result<(), DeltaError> {
    let Some((last, leading)) = path.split_last() else {
        return match value {
            Value::Object(map) => {
                *root = map;
                Ok(())
            }
            _ => Err(DeltaError::InvalidPath),
        };
    };

    let mut updated = root.clone();
    let mut node = &mut updated;
    for key in leading {
        let entry = node
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = match entry {
            Value::Object(map) => map,
            _ => return Err(DeltaError::InvalidPath),
        };
    }

    if let (Some(current), Some(prior)) = (node.get(last), prior_value) {
        if !prior.is_null() && current != prior {
            log::warn!(
                "[Notebook] {} metadata path {:?} expected prior value {} but was {}",
                owner,
                path,
                prior,
                current
            );
        }
    }
    node.insert(last.clone(), value);
    *root = updated;
    Ok(())
}
