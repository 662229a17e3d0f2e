//! `MockNode` — a test double for [`Node`].
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::edge::EdgeMap;
use crate::error::NodeError;
use crate::traits::{Node, NodeContext, NodeMetadata};

/// State-aware behaviour scripted into a mock.
pub type MockScript =
    Box<dyn Fn(&mut NodeContext, &Value) -> Result<EdgeMap, NodeError> + Send + Sync>;

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Emit one edge with a fixed payload.
    EmitEdge { edge: String, payload: Value },
    /// Fail with an execution error.
    Fail(String),
    /// Run an arbitrary closure against the context.
    Script(MockScript),
}

/// A mock node that records every call it receives and plays a
/// programmer-specified behaviour.
pub struct MockNode {
    metadata: NodeMetadata,
    behaviour: MockBehaviour,
    /// State snapshots seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockNode {
    /// Create a mock registered under `id` that always emits `edge`.
    pub fn emitting(
        id: impl Into<String>,
        edge: impl Into<String>,
        payload: Value,
    ) -> Arc<Self> {
        Self::with_behaviour(
            id,
            MockBehaviour::EmitEdge {
                edge: edge.into(),
                payload,
            },
        )
    }

    /// Create a mock that always fails.
    pub fn failing(id: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Self::with_behaviour(id, MockBehaviour::Fail(message.into()))
    }

    /// Create a mock driven by a closure — the closure may read and mutate
    /// `ctx.state` and decide which edges to emit.
    pub fn scripted(
        id: impl Into<String>,
        script: impl Fn(&mut NodeContext, &Value) -> Result<EdgeMap, NodeError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Self::with_behaviour(id, MockBehaviour::Script(Box::new(script)))
    }

    pub fn with_behaviour(id: impl Into<String>, behaviour: MockBehaviour) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            metadata: NodeMetadata::new(id.clone(), format!("Mock {id}"), "1.0.0"),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Node for MockNode {
    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        ctx: &mut NodeContext,
        config: &Value,
    ) -> Result<EdgeMap, NodeError> {
        self.calls.lock().unwrap().push(ctx.state.clone());

        match &self.behaviour {
            MockBehaviour::EmitEdge { edge, payload } => {
                Ok(EdgeMap::single(edge.clone(), payload.clone()))
            }
            MockBehaviour::Fail(message) => Err(NodeError::Execution(message.clone())),
            MockBehaviour::Script(script) => script(ctx, config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext {
            state: json!({ "seen": true }),
            inputs: Value::Null,
            workflow_id: "wf".to_string(),
            node_id: "mock".to_string(),
            execution_id: "exec".to_string(),
        }
    }

    #[tokio::test]
    async fn emitting_mock_records_calls() {
        let node = MockNode::emitting("m", "success", json!({ "ok": true }));
        let mut ctx = ctx();

        let mut edges = node.execute(&mut ctx, &json!({})).await.expect("success");
        assert_eq!(edges.resolve("success"), Some(json!({ "ok": true })));
        assert_eq!(node.call_count(), 1);
        assert_eq!(node.calls.lock().unwrap()[0], json!({ "seen": true }));
    }

    #[tokio::test]
    async fn failing_mock_returns_execution_error() {
        let node = MockNode::failing("m", "boom");
        let mut ctx = ctx();
        let result = node.execute(&mut ctx, &json!({})).await;
        assert!(matches!(result, Err(NodeError::Execution(_))));
    }

    #[tokio::test]
    async fn scripted_mock_sees_state_and_config() {
        let node = MockNode::scripted("m", |ctx, config| {
            let threshold = config.get("threshold").and_then(Value::as_i64).unwrap_or(0);
            let value = ctx
                .state_value("value")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let edge = if value > threshold { "big" } else { "small" };
            ctx.set_state_value("checked", json!(true));
            Ok(EdgeMap::single(edge, json!(value)))
        });

        let mut ctx = ctx();
        ctx.set_state_value("value", json!(10));
        let edges = node
            .execute(&mut ctx, &json!({ "threshold": 5 }))
            .await
            .expect("success");
        assert!(edges.contains("big"));
        assert_eq!(ctx.state["checked"], json!(true));
    }
}
