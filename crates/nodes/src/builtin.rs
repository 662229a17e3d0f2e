//! Built-in nodes.
//!
//! Deliberately small: enough to exercise a workflow end-to-end from the CLI
//! without pulling in real integrations. Production node packs are expected
//! to arrive through [`discovery`](crate::discovery) or explicit
//! registration.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::edge::EdgeMap;
use crate::error::{NodeError, RegistryError};
use crate::registry::NodeRegistry;
use crate::traits::{Node, NodeContext, NodeMetadata};

/// Writes `config.values` into the execution state and emits `success`.
pub struct SetStateNode {
    metadata: NodeMetadata,
}

impl SetStateNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            metadata: NodeMetadata::new("set-state", "Set State", "1.0.0")
                .with_description("Writes the configured values into execution state"),
        })
    }
}

#[async_trait]
impl Node for SetStateNode {
    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        ctx: &mut NodeContext,
        config: &Value,
    ) -> Result<EdgeMap, NodeError> {
        let values = config
            .get("values")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                NodeError::InvalidConfig("'values' must be an object".to_string())
            })?;

        let mut written = Vec::with_capacity(values.len());
        for (key, value) in values {
            ctx.set_state_value(key.clone(), value.clone());
            written.push(key.clone());
        }

        Ok(EdgeMap::single("success", json!({ "written": written })))
    }
}

/// Logs a message (with optional state keys) and emits `success`.
pub struct LogNode {
    metadata: NodeMetadata,
}

impl LogNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            metadata: NodeMetadata::new("log", "Log", "1.0.0")
                .with_description("Logs a message and selected state keys"),
        })
    }
}

#[async_trait]
impl Node for LogNode {
    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        ctx: &mut NodeContext,
        config: &Value,
    ) -> Result<EdgeMap, NodeError> {
        let message = config.get("message").and_then(Value::as_str).unwrap_or("");

        let mut echoed = serde_json::Map::new();
        if let Some(keys) = config.get("keys").and_then(Value::as_array) {
            for key in keys.iter().filter_map(Value::as_str) {
                if let Some(value) = ctx.state_value(key) {
                    echoed.insert(key.to_string(), value.clone());
                }
            }
        }

        info!(
            node_id = %ctx.node_id,
            execution_id = %ctx.execution_id,
            state = %serde_json::Value::Object(echoed),
            "{message}"
        );

        Ok(EdgeMap::single("success", json!({ "logged": message })))
    }
}

/// Register every built-in node as a singleton.
pub fn register_builtins(registry: &NodeRegistry) -> Result<(), RegistryError> {
    registry.register_singleton(SetStateNode::new())?;
    registry.register_singleton(LogNode::new())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> NodeContext {
        NodeContext {
            state: json!({}),
            inputs: Value::Null,
            workflow_id: "wf".to_string(),
            node_id: "n".to_string(),
            execution_id: "exec".to_string(),
        }
    }

    #[tokio::test]
    async fn set_state_writes_values() {
        let node = SetStateNode::new();
        let mut ctx = ctx();
        let mut edges = node
            .execute(&mut ctx, &json!({ "values": { "count": 1, "label": "x" } }))
            .await
            .expect("should succeed");

        assert_eq!(ctx.state["count"], json!(1));
        assert_eq!(ctx.state["label"], json!("x"));
        assert!(edges.contains("success"));
        let payload = edges.resolve("success").unwrap();
        assert_eq!(payload["written"], json!(["count", "label"]));
    }

    #[tokio::test]
    async fn set_state_rejects_missing_values() {
        let node = SetStateNode::new();
        let mut ctx = ctx();
        let result = node.execute(&mut ctx, &json!({})).await;
        assert!(matches!(result, Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn log_emits_success() {
        let node = LogNode::new();
        let mut ctx = ctx();
        ctx.set_state_value("count", json!(3));
        let edges = node
            .execute(&mut ctx, &json!({ "message": "hi", "keys": ["count"] }))
            .await
            .expect("should succeed");
        assert!(edges.contains("success"));
    }

    #[test]
    fn builtins_register_cleanly() {
        let registry = NodeRegistry::new();
        register_builtins(&registry).expect("register");
        assert!(registry.has_node("set-state"));
        assert!(registry.has_node("log"));
    }
}
