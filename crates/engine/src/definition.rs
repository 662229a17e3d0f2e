//! Raw workflow definition model.
//!
//! These types mirror the authored JSON document one-to-one. The parser
//! works on untyped `serde_json::Value` input so it can accumulate every
//! fault instead of stopping at serde's first complaint; this module is the
//! typed form used for canonical re-serialization (and by hosts that build
//! definitions programmatically).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Slug identifier, `[a-z0-9][a-z0-9-_]*`.
    pub id: String,
    pub name: String,
    /// Semantic version, `MAJOR.MINOR.PATCH`.
    pub version: String,
    #[serde(
        default,
        rename = "initialState",
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_state: Option<Value>,
    pub workflow: WorkflowBody,
}

/// The workflow body — either a mapping keyed by node name or an ordered
/// sequence of entries. Both are semantically equivalent; the sequence form
/// preserves authoring order as the default fall-through order (so does the
/// mapping form, since JSON object order is preserved end-to-end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowBody {
    Map(Map<String, Value>),
    Sequence(Vec<WorkflowEntry>),
}

/// One entry of the sequence form: a bare node name (implicit configuration,
/// node type defaults to the name) or a single-key `{name: config}` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowEntry {
    Name(String),
    Configured(Map<String, Value>),
}

impl WorkflowDefinition {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
