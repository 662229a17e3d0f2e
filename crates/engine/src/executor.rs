//! Node execution.
//!
//! `NodeExecutor` runs exactly one node invocation end-to-end: resolve the
//! implementation, read state, build the context, execute, persist the
//! mutated state, classify failures. Every failure path produces an `error`
//! edge carrying a structured [`WorkflowError`] — the executor itself never
//! unwinds into the driver.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use nodes::{EdgeMap, NodeContext, NodeRegistry, ERROR_EDGE};

use crate::error::{ErrorCategory, ErrorCode, ErrorIndex, ErrorScope, Severity, WorkflowError};
use crate::loops::LoopManager;
use crate::state::{StateManager, DEFAULT_CLEANUP_DELAY};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Delay before a completed execution's state is destroyed.
    pub completion_cleanup_delay: Duration,
    /// Loop iteration bound applied when a loop node does not configure its
    /// own `maxIterations`.
    pub default_max_iterations: u32,
    /// Loop wall-clock bound applied when a loop node does not configure its
    /// own `maxExecutionTime` (milliseconds in config).
    pub default_max_loop_duration: Duration,
    /// Hard cap on node invocations per execution; a safety valve against
    /// runaway flows.
    pub max_node_visits: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            completion_cleanup_delay: DEFAULT_CLEANUP_DELAY,
            default_max_iterations: crate::loops::DEFAULT_MAX_ITERATIONS,
            default_max_loop_duration: crate::loops::DEFAULT_MAX_EXECUTION_TIME,
            max_node_visits: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything needed to run one node once.
#[derive(Debug)]
pub struct NodeInvocation<'a> {
    pub node_id: &'a str,
    pub node_type: &'a str,
    pub config: &'a Value,
    pub workflow_id: &'a str,
    pub execution_id: &'a str,
    pub inputs: Option<Value>,
}

// ---------------------------------------------------------------------------
// NodeExecutor
// ---------------------------------------------------------------------------

/// Executes single nodes against shared collaborators.
pub struct NodeExecutor {
    registry: Arc<NodeRegistry>,
    state: Arc<StateManager>,
    loops: Arc<LoopManager>,
    errors: Arc<ErrorIndex>,
    config: ExecutorConfig,
}

impl NodeExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        state: Arc<StateManager>,
        loops: Arc<LoopManager>,
        errors: Arc<ErrorIndex>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            state,
            loops,
            errors,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn error_index(&self) -> &Arc<ErrorIndex> {
        &self.errors
    }

    /// Run one node and return its edge map.
    ///
    /// Failures never propagate as `Err`: they come back as an `error` edge
    /// whose payload is the structured error, so routing can forward them to
    /// an author-declared error branch.
    #[instrument(
        skip(self, invocation),
        fields(
            node_id = %invocation.node_id,
            node_type = %invocation.node_type,
            execution_id = %invocation.execution_id,
        )
    )]
    pub async fn execute_node(&self, invocation: NodeInvocation<'_>) -> EdgeMap {
        let scope = ErrorScope::node(
            invocation.workflow_id,
            invocation.execution_id,
            invocation.node_id,
        );

        if invocation.node_type.trim().is_empty() {
            let err = self.errors.create(
                ErrorCategory::Validation,
                ErrorCode::MissingNodeType,
                format!("node '{}' has no type", invocation.node_id),
                Severity::Error,
                scope,
            );
            return error_edge(&err);
        }

        if !self.registry.has_node(invocation.node_type) {
            let err = self.errors.create(
                ErrorCategory::Validation,
                ErrorCode::UnknownNodeType,
                format!(
                    "node '{}' uses unregistered type '{}'",
                    invocation.node_id, invocation.node_type
                ),
                Severity::Error,
                scope,
            );
            return error_edge(&err);
        }

        let node = match self.registry.get_instance(invocation.node_type) {
            Ok(node) => node,
            Err(registry_err) => {
                let err = self.errors.create(
                    ErrorCategory::Runtime,
                    ErrorCode::NodeInstantiationFailed,
                    format!(
                        "failed to instantiate node type '{}': {registry_err}",
                        invocation.node_type
                    ),
                    Severity::Error,
                    scope,
                );
                return error_edge(&err);
            }
        };

        let state_snapshot = match self.state.get(invocation.execution_id).await {
            Ok(snapshot) => snapshot,
            Err(state_err) => {
                let err = self.errors.create(
                    ErrorCategory::Runtime,
                    ErrorCode::StateRetrievalFailed,
                    format!(
                        "cannot read state for execution '{}': {state_err}",
                        invocation.execution_id
                    ),
                    Severity::Error,
                    scope,
                );
                return error_edge(&err);
            }
        };

        let mut ctx = NodeContext {
            state: state_snapshot,
            inputs: invocation.inputs.unwrap_or(Value::Null),
            workflow_id: invocation.workflow_id.to_string(),
            node_id: invocation.node_id.to_string(),
            execution_id: invocation.execution_id.to_string(),
        };

        match node.execute(&mut ctx, invocation.config).await {
            Ok(mut edge_map) => {
                // Persist the node's state mutations. A failing write is
                // downgraded to a warning edge so the node's own result
                // survives.
                if let Err(state_err) = self
                    .state
                    .update(invocation.execution_id, ctx.state)
                    .await
                {
                    let err = self.errors.create(
                        ErrorCategory::Runtime,
                        ErrorCode::StateUpdateFailed,
                        format!(
                            "failed to persist state after node '{}': {state_err}",
                            invocation.node_id
                        ),
                        Severity::Warning,
                        scope,
                    );
                    edge_map.insert(ERROR_EDGE, err.to_payload());
                }
                edge_map
            }
            Err(node_err) => {
                let (err, edge) = self.errors.handle_execution_error(&node_err, scope);

                // Best-effort compact summary for downstream nodes.
                if let Err(write_err) = self
                    .state
                    .set_property(invocation.execution_id, "lastError", err.summary())
                    .await
                {
                    warn!(
                        execution_id = %invocation.execution_id,
                        error = %write_err,
                        "could not record lastError in state"
                    );
                    self.errors.create(
                        ErrorCategory::Runtime,
                        ErrorCode::ErrorStateUpdateFailed,
                        format!("could not record error in state: {write_err}"),
                        Severity::Warning,
                        ErrorScope::node(
                            invocation.workflow_id,
                            invocation.execution_id,
                            invocation.node_id,
                        ),
                    );
                }

                EdgeMap::single(edge, err.to_payload())
            }
        }
    }

    /// Allocate a fresh execution with its own state.
    ///
    /// # Errors
    /// `state_already_exists` (should never happen for generated ids).
    pub async fn create_execution(
        &self,
        workflow_id: &str,
        initial_state: Option<Value>,
    ) -> Result<String, WorkflowError> {
        let execution_id = Uuid::new_v4().to_string();
        self.state
            .initialize(&execution_id, initial_state)
            .await
            .map_err(|state_err| {
                self.errors.create(
                    ErrorCategory::Runtime,
                    state_err.code(),
                    state_err.to_string(),
                    Severity::Error,
                    ErrorScope {
                        workflow_id: Some(workflow_id.to_string()),
                        execution_id: Some(execution_id.clone()),
                        ..ErrorScope::default()
                    },
                )
            })?;
        Ok(execution_id)
    }

    /// Tear down an execution: clear loop state and schedule state cleanup.
    pub fn complete_execution(&self, execution_id: &str, cleanup_delay: Option<Duration>) {
        self.loops.cleanup(execution_id);
        self.state.schedule_cleanup(
            execution_id,
            Some(cleanup_delay.unwrap_or(self.config.completion_cleanup_delay)),
        );
    }

    /// Deep clone of an execution's current state.
    ///
    /// # Errors
    /// `state_not_found` once cleanup has fired.
    pub async fn get_final_state(&self, execution_id: &str) -> Result<Value, WorkflowError> {
        self.state.get(execution_id).await.map_err(|state_err| {
            WorkflowError::runtime(state_err.code(), state_err.to_string())
        })
    }
}

fn error_edge(err: &WorkflowError) -> EdgeMap {
    EdgeMap::single(ERROR_EDGE, err.to_payload())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::mock::MockNode;
    use serde_json::json;

    fn executor() -> (NodeExecutor, Arc<NodeRegistry>, Arc<StateManager>) {
        let registry = Arc::new(NodeRegistry::new());
        let state = Arc::new(StateManager::new());
        let executor = NodeExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&state),
            Arc::new(LoopManager::new()),
            Arc::new(ErrorIndex::new()),
            ExecutorConfig::default(),
        );
        (executor, registry, state)
    }

    fn invocation<'a>(
        node_id: &'a str,
        node_type: &'a str,
        config: &'a Value,
        execution_id: &'a str,
    ) -> NodeInvocation<'a> {
        NodeInvocation {
            node_id,
            node_type,
            config,
            workflow_id: "wf-test",
            execution_id,
            inputs: None,
        }
    }

    fn error_code(edge_map: &mut EdgeMap) -> String {
        let payload = edge_map.resolve(ERROR_EDGE).expect("error edge present");
        payload["code"].as_str().expect("code").to_string()
    }

    #[tokio::test]
    async fn successful_node_persists_state_mutations() {
        let (executor, registry, state) = executor();
        let node = MockNode::scripted("writer", |ctx, _config| {
            ctx.set_state_value("touched", json!(true));
            Ok(EdgeMap::single("success", json!(null)))
        });
        registry.register_singleton(node).expect("register");
        state.initialize("e1", None).await.expect("init");

        let config = json!({});
        let edges = executor
            .execute_node(invocation("writer", "writer", &config, "e1"))
            .await;

        assert!(edges.contains("success"));
        assert_eq!(state.get("e1").await.unwrap()["touched"], json!(true));
    }

    #[tokio::test]
    async fn missing_type_yields_error_edge() {
        let (executor, _registry, state) = executor();
        state.initialize("e1", None).await.expect("init");

        let config = json!({});
        let mut edges = executor
            .execute_node(invocation("mystery", "", &config, "e1"))
            .await;
        assert_eq!(error_code(&mut edges), "missing_node_type");
    }

    #[tokio::test]
    async fn unknown_type_yields_error_edge() {
        let (executor, _registry, state) = executor();
        state.initialize("e1", None).await.expect("init");

        let config = json!({});
        let mut edges = executor
            .execute_node(invocation("mystery", "nope", &config, "e1"))
            .await;
        assert_eq!(error_code(&mut edges), "unknown_node_type");
    }

    #[tokio::test]
    async fn missing_state_yields_retrieval_error() {
        let (executor, registry, _state) = executor();
        registry
            .register_singleton(MockNode::emitting("n", "success", json!(null)))
            .expect("register");

        let config = json!({});
        let mut edges = executor
            .execute_node(invocation("n", "n", &config, "never-initialized"))
            .await;
        assert_eq!(error_code(&mut edges), "state_retrieval_failed");
    }

    #[tokio::test]
    async fn node_failure_is_classified_and_recorded() {
        let (executor, registry, state) = executor();
        registry
            .register_singleton(MockNode::failing("bomb", "kaboom"))
            .expect("register");
        state.initialize("e1", None).await.expect("init");

        let config = json!({});
        let mut edges = executor
            .execute_node(invocation("bomb", "bomb", &config, "e1"))
            .await;
        assert_eq!(error_code(&mut edges), "node_execution_failed");

        // Compact summary lands under state.lastError.
        let final_state = state.get("e1").await.unwrap();
        assert_eq!(final_state["lastError"]["code"], "node_execution_failed");

        // And the structured error is indexed by execution.
        let recorded = executor.error_index().get_by_execution("e1");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].code, ErrorCode::NodeExecutionFailed);
    }

    #[tokio::test]
    async fn create_execution_yields_fresh_isolated_ids() {
        let (executor, _registry, state) = executor();
        let first = executor
            .create_execution("wf", Some(json!({ "seed": 1 })))
            .await
            .expect("create");
        let second = executor.create_execution("wf", None).await.expect("create");

        assert_ne!(first, second);
        assert_eq!(state.get(&first).await.unwrap()["seed"], json!(1));
        assert_eq!(state.get(&second).await.unwrap(), json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_execution_schedules_cleanup() {
        let (executor, _registry, state) = executor();
        let execution_id = executor.create_execution("wf", None).await.expect("create");

        executor.complete_execution(&execution_id, Some(Duration::from_secs(1)));
        assert!(state.has(&execution_id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!state.has(&execution_id));
    }
}
