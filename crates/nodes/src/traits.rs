//! The `Node` trait — the contract every node must fulfil.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::edge::EdgeMap;
use crate::error::{NodeError, RegistryError};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Immutable description of a node kind.
///
/// `id` is the type name workflows reference; `version` participates in
/// registry conflict detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_hints: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
}

impl NodeMetadata {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `id`, `name`, and `version` must all be non-empty.
    ///
    /// # Errors
    /// [`RegistryError::InvalidMetadata`] naming the offending field.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                return Err(RegistryError::InvalidMetadata(format!(
                    "field '{field}' must be a non-empty string"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Shared context passed to every node during execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
///
/// `state` is a snapshot of the execution's state; mutations a node makes to
/// it are merged back by the engine after the call returns. It is the only
/// channel through which nodes communicate across invocations.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Mutable snapshot of the per-execution state object.
    pub state: Value,
    /// Per-call inputs supplied by the caller (Null when absent).
    pub inputs: Value,
    /// Id of the parent workflow.
    pub workflow_id: String,
    /// Authoring name of the node being executed.
    pub node_id: String,
    /// Id of the current execution run.
    pub execution_id: String,
}

impl NodeContext {
    /// Read a top-level state key.
    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Write a top-level state key, promoting non-object state to an object.
    pub fn set_state_value(&mut self, key: impl Into<String>, value: Value) {
        if !self.state.is_object() {
            self.state = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.state.as_object_mut() {
            map.insert(key.into(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Node + factory traits
// ---------------------------------------------------------------------------

/// The core node trait.
///
/// All built-in nodes and discovered plug-ins must implement this. The
/// engine dispatches execution through the trait object and interprets the
/// returned [`EdgeMap`] for routing; `config` is the node's (opaque to the
/// engine) configuration.
#[async_trait]
pub trait Node: Send + Sync {
    fn metadata(&self) -> &NodeMetadata;

    async fn execute(
        &self,
        ctx: &mut NodeContext,
        config: &Value,
    ) -> Result<EdgeMap, NodeError>;
}

/// Produces node instances for the registry.
///
/// Class-like nodes get a fresh instance per invocation; singleton
/// registrations cache the first instance.
pub trait NodeFactory: Send + Sync {
    fn metadata(&self) -> &NodeMetadata;

    fn create(&self) -> Result<Arc<dyn Node>, NodeError>;
}

/// Factory backed by a closure.
pub struct FnNodeFactory {
    metadata: NodeMetadata,
    build: Box<dyn Fn() -> Arc<dyn Node> + Send + Sync>,
}

impl FnNodeFactory {
    pub fn new(
        metadata: NodeMetadata,
        build: impl Fn() -> Arc<dyn Node> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            build: Box::new(build),
        })
    }
}

impl NodeFactory for FnNodeFactory {
    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    fn create(&self) -> Result<Arc<dyn Node>, NodeError> {
        Ok((self.build)())
    }
}

/// Factory that always hands out the same instance.
pub struct InstanceFactory {
    instance: Arc<dyn Node>,
}

impl InstanceFactory {
    pub fn new(instance: Arc<dyn Node>) -> Arc<Self> {
        Arc::new(Self { instance })
    }
}

impl NodeFactory for InstanceFactory {
    fn metadata(&self) -> &NodeMetadata {
        self.instance.metadata()
    }

    fn create(&self) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::clone(&self.instance))
    }
}
