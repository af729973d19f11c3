//! Notebook document model.
//!
//! Mirrors the nbformat layout (top-level `nbformat`, `metadata`, `cells`)
//! plus the per-cell execution state the realtime channel reports.
//! Service-specific cell data (query cells, output collections) lives under
//! the `noteable` key of the cell metadata.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Metadata namespace for service-specific cell and notebook data.
pub const SERVICE_METADATA_KEY: &str = "noteable";

/// nbformat cell type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    /// Executable code (including query cells, see [`Cell::is_query`]).
    Code,
    /// Markdown prose.
    Markdown,
    /// Raw, unrendered text.
    Raw,
}

impl CellType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Raw => "raw",
        }
    }
}

/// Execution lifecycle of a cell as reported by the kernel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ExecutionState {
    /// Not queued or running.
    #[default]
    Idle,
    /// Accepted by the kernel, waiting for its turn.
    Queued,
    /// Currently executing.
    Running,
    /// Finished without error.
    Complete,
    /// Finished with an error.
    Error,
}

impl From<String> for ExecutionState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "queued" => Self::Queued,
            "running" | "executing" => Self::Running,
            "complete" | "finished_with_no_error" => Self::Complete,
            "error" | "finished_with_error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

impl ExecutionState {
    /// Whether the state ends an execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// One notebook cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Stable id assigned at creation.
    #[serde(default)]
    pub id: String,
    /// nbformat type.
    pub cell_type: CellType,
    /// Cell text. nbformat list-of-lines sources are joined on load.
    #[serde(default, deserialize_with = "deserialize_source")]
    pub source: String,
    /// Free-form metadata mapping.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Execution counter for code cells.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
    /// Inline outputs (code cells only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Value>,
    /// Last execution state reported for the cell. Not part of nbformat.
    #[serde(skip)]
    pub execution_state: ExecutionState,
}

fn deserialize_source<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Source {
        Text(String),
        Lines(Vec<String>),
    }

    Ok(match Option::<Source>::deserialize(deserializer)? {
        Some(Source::Text(text)) => text,
        Some(Source::Lines(lines)) => lines.join("\n"),
        None => String::new(),
    })
}

impl Cell {
    /// New cell with empty metadata.
    pub fn new(id: impl Into<String>, cell_type: CellType, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cell_type,
            source: source.into(),
            metadata: Map::new(),
            execution_count: None,
            outputs: Vec::new(),
            execution_state: ExecutionState::Idle,
        }
    }

    /// Service-specific metadata value at `key`, if present.
    pub fn service_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(SERVICE_METADATA_KEY)?.get(key)
    }

    /// Code cell flagged as a SQL query cell.
    pub fn is_query(&self) -> bool {
        self.cell_type == CellType::Code
            && self.service_metadata("cell_type").and_then(Value::as_str) == Some("sql")
    }

    /// Id of the output collection holding this cell's latest outputs.
    pub fn output_collection_id(&self) -> Option<&str> {
        self.service_metadata("output_collection_id")
            .and_then(Value::as_str)
    }

    /// Whether the cell can be submitted for execution.
    pub fn is_runnable(&self) -> bool {
        self.cell_type == CellType::Code && !self.source.trim().is_empty()
    }

    /// Sets `key` in the service metadata object, creating it when missing.
    pub(crate) fn set_service_metadata(&mut self, key: &str, value: Value) {
        let mut service = match self.metadata.remove(SERVICE_METADATA_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        service.insert(key.to_string(), value);
        self.metadata
            .insert(SERVICE_METADATA_KEY.to_string(), Value::Object(service));
    }
}

/// Full notebook document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    /// nbformat major version.
    #[serde(default = "default_nbformat")]
    pub nbformat: u32,
    /// nbformat minor version.
    #[serde(default)]
    pub nbformat_minor: u32,
    /// Document-level metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Ordered cells.
    #[serde(default)]
    pub cells: Vec<Cell>,
}

fn default_nbformat() -> u32 {
    4
}

impl Default for Notebook {
    fn default() -> Self {
        Self {
            nbformat: default_nbformat(),
            nbformat_minor: 5,
            metadata: Map::new(),
            cells: Vec::new(),
        }
    }
}

impl Notebook {
    /// Notebook containing `cells`.
    pub fn with_cells(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            ..Self::default()
        }
    }

    /// Position and cell for `cell_id`.
    pub fn find(&self, cell_id: &str) -> Option<(usize, &Cell)> {
        self.cells
            .iter()
            .enumerate()
            .find(|(_, cell)| cell.id == cell_id)
    }

    /// Cell by id.
    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.find(cell_id).map(|(_, cell)| cell)
    }

    /// Position of `cell_id` in the cell list.
    pub fn index_of(&self, cell_id: &str) -> Option<usize> {
        self.find(cell_id).map(|(index, _)| index)
    }

    /// Cell ids in document order.
    pub fn cell_ids(&self) -> Vec<String> {
        self.cells.iter().map(|cell| cell.id.clone()).collect()
    }

    /// Kernel language from `metadata.language_info.name`.
    pub fn language(&self) -> Option<&str> {
        self.metadata.get("language_info")?.get("name")?.as_str()
    }
}
