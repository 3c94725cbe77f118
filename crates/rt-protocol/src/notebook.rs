//! The notebook document wire format: notebook / cell / output JSON shapes.
//!
//! These types are pure data — no mutation logic lives here. `rt-model`
//! owns `apply_delta` and friends; this crate only owns what can cross the
//! wire and round-trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Default `nbformat` for a notebook created fresh in memory (no seed yet).
pub const DEFAULT_NBFORMAT: u32 = 4;
/// Default `nbformat_minor` for a notebook created fresh in memory.
pub const DEFAULT_NBFORMAT_MINOR: u32 = 5;

pub type Metadata = Map<String, Value>;

/// A notebook document: ordered cells plus document-level metadata.
///
/// `nbformat`/`nbformat_minor` are opaque version markers preserved
/// byte-for-byte across a load/save round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub nbformat: u32,
    pub nbformat_minor: u32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
    pub cells: Vec<Cell>,
}

impl Notebook {
    /// An empty notebook, as constructed before a seed download completes.
    pub fn empty() -> Self {
        Notebook {
            nbformat: DEFAULT_NBFORMAT,
            nbformat_minor: DEFAULT_NBFORMAT_MINOR,
            metadata: Metadata::new(),
            cells: Vec::new(),
        }
    }

    /// Serialize as compact JSON, suitable for the wire or storage.
    pub fn to_json_compact(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize as indented JSON, suitable for human inspection.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn index_of(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id() == cell_id)
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id() == cell_id)
    }

    pub fn cell_mut(&mut self, cell_id: &str) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.id() == cell_id)
    }
}

/// A single notebook cell. Discriminated on the wire by `cell_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "snake_case")]
pub enum Cell {
    Code(CodeCell),
    Markdown(TextCell),
    Raw(TextCell),
}

impl Cell {
    pub fn id(&self) -> &str {
        match self {
            Cell::Code(c) => &c.id,
            Cell::Markdown(c) | Cell::Raw(c) => &c.id,
        }
    }

    pub fn set_id(&mut self, id: String) {
        match self {
            Cell::Code(c) => c.id = id,
            Cell::Markdown(c) | Cell::Raw(c) => c.id = id,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Cell::Code(c) => &c.source,
            Cell::Markdown(c) | Cell::Raw(c) => &c.source,
        }
    }

    pub fn set_source(&mut self, source: String) {
        match self {
            Cell::Code(c) => c.source = source,
            Cell::Markdown(c) | Cell::Raw(c) => c.source = source,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Cell::Code(c) => &c.metadata,
            Cell::Markdown(c) | Cell::Raw(c) => &c.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Cell::Code(c) => &mut c.metadata,
            Cell::Markdown(c) | Cell::Raw(c) => &mut c.metadata,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Cell::Code(_) => "code",
            Cell::Markdown(_) => "markdown",
            Cell::Raw(_) => "raw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeCell {
    pub id: String,
    #[serde(deserialize_with = "deserialize_joined_source")]
    #[serde(serialize_with = "serialize_source")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
    #[serde(default)]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCell {
    pub id: String,
    #[serde(deserialize_with = "deserialize_joined_source")]
    #[serde(serialize_with = "serialize_source")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

/// A cell output. Discriminated on the wire by `output_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream(StreamOutput),
    DisplayData(RichOutput),
    ExecuteResult(ExecuteResultOutput),
    Error(ErrorOutput),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOutput {
    /// `stdout` or `stderr`.
    pub name: String,
    #[serde(deserialize_with = "deserialize_joined_source")]
    #[serde(serialize_with = "serialize_source")]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichOutput {
    /// MIME type -> rendering payload.
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResultOutput {
    pub execution_count: Option<i64>,
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Accepts either a JSON string or an array of strings and joins the array
/// form with `"\n"`. Used for every `source`/`text` field on the wire.
fn deserialize_joined_source<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrLines {
        Joined(String),
        Lines(Vec<String>),
    }

    match StringOrLines::deserialize(deserializer)? {
        StringOrLines::Joined(s) => Ok(s),
        StringOrLines::Lines(lines) => Ok(lines.join("\n")),
    }
}

/// Always emit the single-string form; the array form is only an ingest
/// convenience, never a re-serialization target.
fn serialize_source<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(value)
}
