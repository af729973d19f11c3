//! Delta records.
//!
//! On the wire a delta is a flat `{id, version, delta_type, delta_action,
//! resource_id, properties}` object. It is decoded once, at the boundary,
//! into [`Delta`] carrying a typed [`DeltaOp`]; the engine only ever matches
//! on the enum. `(delta_type, delta_action)` pairs this client does not know
//! decode to [`DeltaOp::Unrecognized`] so that newer servers do not break
//! version accounting.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::model::{Cell, CellType};
use super::patch::TextPatch;
use crate::constants::NULL_RESOURCE_SENTINEL;

/// Which cells a `cell_execute` delta runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteScope {
    /// Only the target cell.
    Cell,
    /// Every cell up to and including the target.
    Before,
    /// The target and every cell after it.
    After,
    /// The whole notebook.
    All,
}

impl ExecuteScope {
    fn action(self) -> &'static str {
        match self {
            Self::Cell => "execute",
            Self::Before => "execute_before",
            Self::After => "execute_after",
            Self::All => "execute_all",
        }
    }
}

/// Typed delta operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp {
    /// `nb_cells/add`: insert `cell` after `after_id`, or at the top.
    AddCell {
        /// Anchor cell, `None` for the first position.
        after_id: Option<String>,
        /// Cell to insert.
        cell: Cell,
    },
    /// `nb_cells/delete`.
    DeleteCell {
        /// Cell to remove.
        cell_id: String,
    },
    /// `nb_cells/move`: reposition after `after_id`, or to the top.
    MoveCell {
        /// Cell to move.
        cell_id: String,
        /// New anchor, `None` for the first position.
        after_id: Option<String>,
    },
    /// `cell_contents/update`: apply a text patch.
    PatchContents {
        /// Target cell.
        cell_id: String,
        /// Patch to apply.
        patch: TextPatch,
    },
    /// `cell_contents/replace`: overwrite the source.
    ReplaceContents {
        /// Target cell.
        cell_id: String,
        /// New source.
        source: String,
    },
    /// `cell_metadata/update`: set a value at a key path.
    UpdateCellMetadata {
        /// Target cell.
        cell_id: String,
        /// Key path from the metadata root.
        path: Vec<String>,
        /// Value to store.
        value: Value,
        /// Value the sender believed was there, if it said.
        prior_value: Option<Value>,
    },
    /// `cell_metadata/replace`: change type and language.
    ReplaceCellMetadata {
        /// Target cell.
        cell_id: String,
        /// New nbformat type.
        cell_type: Option<CellType>,
        /// New language (`python`, `sql`, `markdown`, ...).
        language: Option<String>,
    },
    /// `nb_metadata/update`: set a value at a key path in notebook metadata.
    UpdateNotebookMetadata {
        /// Key path from the metadata root.
        path: Vec<String>,
        /// Value to store.
        value: Value,
        /// Value the sender believed was there, if it said.
        prior_value: Option<Value>,
    },
    /// `cell_output_collection/replace`.
    ReplaceOutputCollection {
        /// Target cell.
        cell_id: String,
        /// New output collection id.
        output_collection_id: String,
    },
    /// `cell_execute/*`: a request to run cells. No document effect.
    Execute {
        /// Target cell (absent for `execute_all`).
        cell_id: Option<String>,
        /// Range to run.
        scope: ExecuteScope,
    },
    /// Anything this client does not model.
    Unrecognized {
        /// Wire `delta_type`.
        delta_type: String,
        /// Wire `delta_action`.
        delta_action: String,
    },
}

impl DeltaOp {
    /// Cell this operation targets, if it targets one.
    pub fn cell_id(&self) -> Option<&str> {
        match self {
            Self::AddCell { cell, .. } => Some(&cell.id),
            Self::DeleteCell { cell_id }
            | Self::MoveCell { cell_id, .. }
            | Self::PatchContents { cell_id, .. }
            | Self::ReplaceContents { cell_id, .. }
            | Self::UpdateCellMetadata { cell_id, .. }
            | Self::ReplaceCellMetadata { cell_id, .. }
            | Self::ReplaceOutputCollection { cell_id, .. } => Some(cell_id),
            Self::Execute { cell_id, .. } => cell_id.as_deref(),
            Self::UpdateNotebookMetadata { .. } | Self::Unrecognized { .. } => None,
        }
    }

    /// `(delta_type, delta_action)` wire pair.
    pub fn kind(&self) -> (&str, &str) {
        match self {
            Self::AddCell { .. } => ("nb_cells", "add"),
            Self::DeleteCell { .. } => ("nb_cells", "delete"),
            Self::MoveCell { .. } => ("nb_cells", "move"),
            Self::PatchContents { .. } => ("cell_contents", "update"),
            Self::ReplaceContents { .. } => ("cell_contents", "replace"),
            Self::UpdateCellMetadata { .. } => ("cell_metadata", "update"),
            Self::ReplaceCellMetadata { .. } => ("cell_metadata", "replace"),
            Self::UpdateNotebookMetadata { .. } => ("nb_metadata", "update"),
            Self::ReplaceOutputCollection { .. } => ("cell_output_collection", "replace"),
            Self::Execute { scope, .. } => ("cell_execute", scope.action()),
            Self::Unrecognized {
                delta_type,
                delta_action,
            } => (delta_type, delta_action),
        }
    }

    fn resource_id(&self) -> String {
        match self {
            // nb_cells deltas carry the cell id in properties, not resource_id.
            Self::AddCell { .. } | Self::DeleteCell { .. } | Self::MoveCell { .. } => {
                NULL_RESOURCE_SENTINEL.to_string()
            }
            other => other
                .cell_id()
                .unwrap_or(NULL_RESOURCE_SENTINEL)
                .to_string(),
        }
    }

    fn properties(&self) -> Value {
        match self {
            Self::AddCell { after_id, cell } => {
                json!({ "id": cell.id, "after_id": after_id, "cell": cell })
            }
            Self::DeleteCell { cell_id } => json!({ "id": cell_id }),
            Self::MoveCell { cell_id, after_id } => json!({ "id": cell_id, "after_id": after_id }),
            Self::PatchContents { patch, .. } => json!({ "patch": patch.to_string() }),
            Self::ReplaceContents { source, .. } => json!({ "source": source }),
            Self::UpdateCellMetadata {
                path,
                value,
                prior_value,
                ..
            }
            | Self::UpdateNotebookMetadata {
                path,
                value,
                prior_value,
            } => {
                let mut props = json!({ "path": path, "value": value });
                if let Some(prior) = prior_value {
                    props["prior_value"] = prior.clone();
                }
                props
            }
            Self::ReplaceCellMetadata {
                cell_type,
                language,
                ..
            } => json!({ "type": cell_type.map(CellType::as_str), "language": language }),
            Self::ReplaceOutputCollection {
                output_collection_id,
                ..
            } => json!({ "output_collection_id": output_collection_id }),
            Self::Execute { .. } | Self::Unrecognized { .. } => Value::Null,
        }
    }

    fn decode(
        delta_type: &str,
        delta_action: &str,
        resource_id: String,
        properties: Value,
    ) -> Result<Self, String> {
        let cell_id = resource_id;
        let op = match (delta_type, delta_action) {
            ("nb_cells", "add") => {
                let props: AddProps = from_props(properties)?;
                let mut cell = props.cell;
                cell.id = props.id;
                Self::AddCell {
                    after_id: props.after_id,
                    cell,
                }
            }
            ("nb_cells", "delete") => {
                let props: IdProps = from_props(properties)?;
                Self::DeleteCell { cell_id: props.id }
            }
            ("nb_cells", "move") => {
                let props: IdProps = from_props(properties)?;
                Self::MoveCell {
                    cell_id: props.id,
                    after_id: props.after_id,
                }
            }
            ("cell_contents", "update") => {
                let props: PatchProps = from_props(properties)?;
                let patch = TextPatch::parse(&props.patch).map_err(|e| e.to_string())?;
                Self::PatchContents { cell_id, patch }
            }
            ("cell_contents", "replace") => {
                let props: SourceProps = from_props(properties)?;
                Self::ReplaceContents {
                    cell_id,
                    source: props.source,
                }
            }
            ("cell_metadata", "update") => {
                let props: PathProps = from_props(properties)?;
                Self::UpdateCellMetadata {
                    cell_id,
                    path: props.path,
                    value: props.value,
                    prior_value: props.prior_value,
                }
            }
            ("cell_metadata", "replace") => {
                let props: ReplaceMetadataProps = from_props(properties)?;
                Self::ReplaceCellMetadata {
                    cell_id,
                    cell_type: props.cell_type,
                    language: props.language,
                }
            }
            ("nb_metadata", "update") => {
                let props: PathProps = from_props(properties)?;
                Self::UpdateNotebookMetadata {
                    path: props.path,
                    value: props.value,
                    prior_value: props.prior_value,
                }
            }
            ("cell_output_collection", "replace") => {
                let props: OutputCollectionProps = from_props(properties)?;
                Self::ReplaceOutputCollection {
                    cell_id,
                    output_collection_id: props.output_collection_id,
                }
            }
            ("cell_execute", action) => {
                let scope = match action {
                    "execute" => ExecuteScope::Cell,
                    "execute_before" => ExecuteScope::Before,
                    "execute_after" => ExecuteScope::After,
                    "execute_all" => ExecuteScope::All,
                    _ => return Ok(Self::unrecognized(delta_type, delta_action)),
                };
                Self::Execute {
                    cell_id: (cell_id != NULL_RESOURCE_SENTINEL).then_some(cell_id),
                    scope,
                }
            }
            _ => Self::unrecognized(delta_type, delta_action),
        };
        Ok(op)
    }

    fn unrecognized(delta_type: &str, delta_action: &str) -> Self {
        Self::Unrecognized {
            delta_type: delta_type.to_string(),
            delta_action: delta_action.to_string(),
        }
    }
}

fn from_props<T: serde::de::DeserializeOwned>(properties: Value) -> Result<T, String> {
    serde_json::from_value(properties).map_err(|e| format!("invalid properties: {e}"))
}

#[derive(Deserialize)]
struct AddProps {
    id: String,
    #[serde(default)]
    after_id: Option<String>,
    cell: Cell,
}

#[derive(Deserialize)]
struct IdProps {
    id: String,
    #[serde(default)]
    after_id: Option<String>,
}

#[derive(Deserialize)]
struct PatchProps {
    patch: String,
}

#[derive(Deserialize)]
struct SourceProps {
    source: String,
}

#[derive(Deserialize)]
struct PathProps {
    path: Vec<String>,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    prior_value: Option<Value>,
}

#[derive(Deserialize)]
struct ReplaceMetadataProps {
    #[serde(default, rename = "type")]
    cell_type: Option<CellType>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct OutputCollectionProps {
    output_collection_id: String,
}

/// Flat wire shape shared by inbound deltas and outbound drafts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDelta {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
    delta_type: String,
    delta_action: String,
    #[serde(default = "null_resource")]
    resource_id: String,
    #[serde(default)]
    properties: Value,
}

fn null_resource() -> String {
    NULL_RESOURCE_SENTINEL.to_string()
}

/// A versioned change record received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDelta", into = "RawDelta")]
pub struct Delta {
    /// Unique id (the id the author chose when submitting it).
    pub id: Uuid,
    /// Position in the document's delta sequence.
    pub version: u64,
    /// What it does.
    pub op: DeltaOp,
}

impl Delta {
    /// Delta with a fresh id.
    pub fn new(version: u64, op: DeltaOp) -> Self {
        Self {
            id: Uuid::new_v4(),
            version,
            op,
        }
    }
}

impl TryFrom<RawDelta> for Delta {
    type Error = String;

    fn try_from(raw: RawDelta) -> Result<Self, Self::Error> {
        let version = raw
            .version
            .ok_or_else(|| format!("delta {} has no version", raw.id))?;
        let op = DeltaOp::decode(
            &raw.delta_type,
            &raw.delta_action,
            raw.resource_id,
            raw.properties,
        )
        .map_err(|e| format!("{}/{}: {e}", raw.delta_type, raw.delta_action))?;
        Ok(Self {
            id: raw.id,
            version,
            op,
        })
    }
}

impl From<Delta> for RawDelta {
    fn from(delta: Delta) -> Self {
        let mut raw = raw_from_op(delta.id, &delta.op);
        raw.version = Some(delta.version);
        raw
    }
}

fn raw_from_op(id: Uuid, op: &DeltaOp) -> RawDelta {
    let (delta_type, delta_action) = op.kind();
    RawDelta {
        id,
        version: None,
        file_id: None,
        delta_type: delta_type.to_string(),
        delta_action: delta_action.to_string(),
        resource_id: op.resource_id(),
        properties: op.properties(),
    }
}

/// A delta the client wants to submit. The server assigns the version.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaDraft {
    /// Id the broadcast delta will carry.
    pub id: Uuid,
    /// Operation to submit.
    pub op: DeltaOp,
}

impl DeltaDraft {
    /// Draft with a fresh id.
    pub fn new(op: DeltaOp) -> Self {
        Self {
            id: Uuid::new_v4(),
            op,
        }
    }

    /// Wire JSON for a `new_delta_request` on `file_id`.
    pub fn to_wire(&self, file_id: &str) -> Value {
        let mut raw = raw_from_op(self.id, &self.op);
        raw.file_id = Some(file_id.to_string());
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }
}
