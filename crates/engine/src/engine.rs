//! The execution engine driver.
//!
//! `WorkflowEngine` walks a parsed workflow from its first authoring-order
//! node, maintaining a work list of scheduled invocations. After each node
//! runs, the loop manager is consulted first (an active or starting loop
//! owns the frontier), then the edge router. A single execution is a
//! strictly sequential chain of node invocations; parallelism exists only
//! across executions.
//!
//! Collaborators are injected explicitly — there are no hidden globals.
//! [`WorkflowEngine::with_defaults`] wires fresh defaults for hosts that do
//! not need to share them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use nodes::{EdgeMap, NodeRegistry, ERROR_EDGE};

use crate::ast::{AstNode, NodeIndex, ParsedWorkflow};
use crate::error::{
    ErrorCategory, ErrorCode, ErrorIndex, ErrorScope, Severity, WorkflowError,
};
use crate::executor::{ExecutorConfig, NodeExecutor, NodeInvocation};
use crate::loops::{LoopManager, LoopTermination};
use crate::parser::WorkflowParser;
use crate::router::{self, RouteResult};
use crate::state::{deep_merge, StateManager};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

/// The result of driving one execution to the end of its frontier.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub final_state: Value,
    pub errors: Vec<WorkflowError>,
}

// ---------------------------------------------------------------------------
// Work list bookkeeping
// ---------------------------------------------------------------------------

/// One scheduled invocation. `advance` marks items that carry the top-level
/// sequence cursor: only those fall through to the next authoring-order node
/// when no edge matches. Targets reached through a matched edge are one-shot
/// branches.
#[derive(Debug, Clone, Copy)]
struct WorkItem {
    ast: NodeIndex,
    advance: bool,
}

/// Captured scheduling info for the active loop: the loop node's own work
/// item plus the body items (with any inline overlays), so each iteration
/// re-schedules identically.
#[derive(Default)]
struct LoopContext {
    origin: Option<WorkItem>,
    items: HashMap<String, WorkItem>,
}

impl LoopContext {
    fn clear(&mut self) {
        self.origin = None;
        self.items.clear();
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives parsed workflows through the executor, router, and loop manager.
pub struct WorkflowEngine {
    registry: Arc<NodeRegistry>,
    state: Arc<StateManager>,
    loops: Arc<LoopManager>,
    errors: Arc<ErrorIndex>,
    executor: NodeExecutor,
    parser: WorkflowParser,
    config: ExecutorConfig,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        state: Arc<StateManager>,
        loops: Arc<LoopManager>,
        errors: Arc<ErrorIndex>,
        config: ExecutorConfig,
    ) -> Self {
        let executor = NodeExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&state),
            Arc::clone(&loops),
            Arc::clone(&errors),
            config.clone(),
        );
        let parser = WorkflowParser::with_registry(Arc::clone(&registry));
        Self {
            registry,
            state,
            loops,
            errors,
            executor,
            parser,
            config,
        }
    }

    /// Convenience wiring: fresh state manager, loop manager, and error
    /// index around the given registry.
    pub fn with_defaults(registry: Arc<NodeRegistry>) -> Self {
        Self::new(
            registry,
            Arc::new(StateManager::new()),
            Arc::new(LoopManager::new()),
            Arc::new(ErrorIndex::new()),
            ExecutorConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn loop_manager(&self) -> &Arc<LoopManager> {
        &self.loops
    }

    pub fn error_index(&self) -> &Arc<ErrorIndex> {
        &self.errors
    }

    /// Parse a raw definition against this engine's registry.
    ///
    /// # Errors
    /// The accumulated parse fault list.
    pub fn parse(&self, raw: &Value) -> Result<ParsedWorkflow, Vec<WorkflowError>> {
        self.parser.parse(raw)
    }

    /// Allocate an execution with its own state.
    pub async fn create_execution(
        &self,
        workflow_id: &str,
        initial_state: Option<Value>,
    ) -> Result<String, WorkflowError> {
        self.executor.create_execution(workflow_id, initial_state).await
    }

    /// Clear loop state and schedule state cleanup for an execution.
    pub fn complete_execution(&self, execution_id: &str, cleanup_delay: Option<Duration>) {
        self.executor.complete_execution(execution_id, cleanup_delay);
    }

    /// Deep clone of an execution's current state.
    pub async fn get_final_state(&self, execution_id: &str) -> Result<Value, WorkflowError> {
        self.executor.get_final_state(execution_id).await
    }

    /// Parse and execute a definition end-to-end.
    ///
    /// The engine refuses to start when parsing reports any fault.
    pub async fn run(&self, raw: &Value) -> RunOutcome {
        let parsed = match self.parser.parse(raw) {
            Ok(parsed) => parsed,
            Err(errors) => {
                return RunOutcome {
                    status: RunStatus::Failed,
                    final_state: Value::Null,
                    errors,
                }
            }
        };

        let execution_id = match self
            .executor
            .create_execution(&parsed.id, parsed.initial_state.clone())
            .await
        {
            Ok(id) => id,
            Err(err) => {
                return RunOutcome {
                    status: RunStatus::Failed,
                    final_state: Value::Null,
                    errors: vec![err],
                }
            }
        };

        let outcome = self.run_parsed(&parsed, &execution_id).await;
        self.executor.complete_execution(&execution_id, None);
        outcome
    }

    /// Drive one execution over an already-parsed workflow.
    #[instrument(skip(self, parsed), fields(workflow_id = %parsed.id, execution_id))]
    pub async fn run_parsed(&self, parsed: &ParsedWorkflow, execution_id: &str) -> RunOutcome {
        let mut queue: VecDeque<WorkItem> = VecDeque::new();
        let mut loop_ctx = LoopContext::default();
        let mut failed = false;
        let mut visits = 0u32;

        if let Some(first) = parsed.first_root() {
            queue.push_back(WorkItem {
                ast: first,
                advance: true,
            });
        }

        while let Some(item) = queue.pop_front() {
            visits += 1;
            if visits > self.config.max_node_visits {
                let err = self.errors.create(
                    ErrorCategory::System,
                    ErrorCode::ExecutionLimitExceeded,
                    format!(
                        "execution exceeded {} node invocations",
                        self.config.max_node_visits
                    ),
                    Severity::Error,
                    ErrorScope::execution(execution_id),
                );
                let _ = self
                    .state
                    .set_property(execution_id, "error", err.summary())
                    .await;
                failed = true;
                break;
            }

            let node = parsed.node(item.ast);
            let (routing_node, effective_config) = effective_view(parsed, node);

            debug!(node_id = %node.node_id, unique_id = %node.unique_id, "executing node");
            let mut edge_map = self
                .executor
                .execute_node(NodeInvocation {
                    node_id: &node.node_id,
                    node_type: &node.node_type,
                    config: &effective_config,
                    workflow_id: &parsed.id,
                    execution_id,
                    inputs: None,
                })
                .await;

            // An active loop owns the frontier.
            if self.loops.is_in_loop(execution_id) {
                let loop_result =
                    self.loops.continue_loop(execution_id, &node.node_id, &edge_map);

                if !loop_result.terminated {
                    // The loop edge was followed; honor the laziness
                    // contract for its payload.
                    let _ = edge_map.resolve(nodes::LOOP_EDGE);
                    if let Some(next) = &loop_result.next_node {
                        if let Some(next_item) = loop_item(parsed, &loop_ctx, next) {
                            queue.push_back(next_item);
                        }
                    }
                    continue;
                }

                match loop_result.reason {
                    Some(
                        reason @ (LoopTermination::MaxIterations | LoopTermination::Timeout),
                    ) => {
                        loop_ctx.clear();
                        let code = match reason {
                            LoopTermination::MaxIterations => ErrorCode::MaxIterationsExceeded,
                            _ => ErrorCode::LoopTimeout,
                        };
                        let err = self.errors.create(
                            ErrorCategory::FlowControl,
                            code,
                            format!(
                                "loop at node '{}' terminated: {}",
                                node.node_id,
                                reason.as_str()
                            ),
                            Severity::Error,
                            ErrorScope::node(&parsed.id, execution_id, &node.node_id),
                        );

                        // A declared error branch on the loop node catches
                        // budget faults; otherwise the execution fails.
                        if routing_node.has_edge(ERROR_EDGE) {
                            let synthetic = EdgeMap::single(ERROR_EDGE, err.to_payload());
                            match router::route(parsed, routing_node, &synthetic) {
                                Ok(route) => {
                                    self.push_route(parsed, routing_node, &route, &mut queue);
                                    continue;
                                }
                                Err(route_err) => {
                                    self.fail_execution(execution_id, parsed, route_err).await;
                                    failed = true;
                                    break;
                                }
                            }
                        }

                        let _ = self
                            .state
                            .set_property(execution_id, "error", err.summary())
                            .await;
                        failed = true;
                        break;
                    }
                    // NonLoopEdge / Completed: the edge map goes through
                    // normal routing below.
                    _ => loop_ctx.clear(),
                }
            }

            let route = match router::route(parsed, routing_node, &edge_map) {
                Ok(route) => route,
                Err(err) => {
                    self.fail_execution(execution_id, parsed, err).await;
                    failed = true;
                    break;
                }
            };

            // Only the chosen edge has its (possibly lazy) payload produced.
            if let Some(matched) = &route.matched_edge {
                if let Some(payload) = edge_map.resolve(matched) {
                    debug!(node_id = %node.node_id, edge = %matched, payload = %payload, "edge resolved");
                }
            }

            // Entering a loop (C6 has priority over plain routing).
            if route.is_loop && !self.loops.is_in_loop(execution_id) {
                let sequence = self.loops.extract_loop_sequence(&route);
                let max_iterations = effective_config
                    .get("maxIterations")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32)
                    .unwrap_or(self.config.default_max_iterations);
                let max_duration = effective_config
                    .get("maxExecutionTime")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis)
                    .unwrap_or(self.config.default_max_loop_duration);

                match self.loops.start_loop(
                    execution_id,
                    &node.node_id,
                    sequence,
                    Some(max_iterations),
                    Some(max_duration),
                ) {
                    Ok(loop_result) => {
                        loop_ctx.origin = Some(item);
                        loop_ctx.items.clear();
                        for name in &route.next_nodes {
                            if let Some(target) = resolve_target_item(
                                parsed,
                                routing_node,
                                name,
                                route.inline_configs.contains_key(name),
                            ) {
                                loop_ctx.items.insert(name.clone(), target);
                            }
                        }
                        if let Some(next) = &loop_result.next_node {
                            if let Some(next_item) = loop_item(parsed, &loop_ctx, next) {
                                queue.push_back(next_item);
                            }
                        }
                        continue;
                    }
                    Err(loop_err) => {
                        let err = self.errors.create(
                            ErrorCategory::FlowControl,
                            loop_err.code(),
                            loop_err.to_string(),
                            Severity::Error,
                            ErrorScope::node(&parsed.id, execution_id, &node.node_id),
                        );
                        let _ = self
                            .state
                            .set_property(execution_id, "error", err.summary())
                            .await;
                        failed = true;
                        break;
                    }
                }
            }

            if route.continue_sequence {
                // No edge matched (or an optional target was missing). A
                // node that failed without declaring an error branch ends
                // the run; warning-severity error edges (e.g. a state
                // write-back problem) are annotations, not failures.
                if edge_map.contains(ERROR_EDGE) && !routing_node.has_edge(ERROR_EDGE) {
                    let payload = edge_map.resolve(ERROR_EDGE).unwrap_or(Value::Null);
                    let severity = payload
                        .get("severity")
                        .and_then(Value::as_str)
                        .unwrap_or("error");
                    if severity != "info" && severity != "warning" {
                        let _ = self
                            .state
                            .set_property(execution_id, "error", compact_error(&payload))
                            .await;
                        failed = true;
                        break;
                    }
                }

                // Only the sequence-cursor item advances in authoring order;
                // branch targets end their branch here. The router pre-fills
                // the successor in the no-match case; a matched-but-missing
                // optional target leaves the frontier empty instead.
                if item.advance {
                    if !route.next_nodes.is_empty() {
                        for name in &route.next_nodes {
                            if let Some(ast) = parsed.root_index_of(name) {
                                queue.push_back(WorkItem { ast, advance: true });
                            }
                        }
                    } else if let Some(next) = parsed.next_in_order(&node.node_id) {
                        if let Some(ast) = parsed.root_index_of(next) {
                            queue.push_back(WorkItem { ast, advance: true });
                        }
                    }
                }
                continue;
            }

            self.push_route(parsed, routing_node, &route, &mut queue);
        }

        let final_state = self.state.get(execution_id).await.unwrap_or(Value::Null);
        let errors = self.errors.get_by_execution(execution_id);
        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        info!(
            execution_id,
            status = ?status,
            visits,
            "execution finished"
        );

        RunOutcome {
            status,
            final_state,
            errors,
        }
    }

    fn push_route(
        &self,
        parsed: &ParsedWorkflow,
        routing_node: &AstNode,
        route: &RouteResult,
        queue: &mut VecDeque<WorkItem>,
    ) {
        for name in &route.next_nodes {
            if let Some(target) = resolve_target_item(
                parsed,
                routing_node,
                name,
                route.inline_configs.contains_key(name),
            ) {
                queue.push_back(target);
            }
        }
    }

    async fn fail_execution(
        &self,
        execution_id: &str,
        parsed: &ParsedWorkflow,
        mut err: WorkflowError,
    ) {
        err.execution_id = Some(execution_id.to_string());
        err.workflow_id = Some(parsed.id.clone());
        let err = self.errors.record(err);
        let _ = self
            .state
            .set_property(execution_id, "error", err.summary())
            .await;
    }
}

/// The node to route with and the effective configuration for an invocation.
///
/// Root-level items use their own node as-is. Inline-override items merge
/// the overlay's flattened config over the base node's and route with the
/// overlay's edge table when it declares one (falling back to the base
/// table otherwise).
fn effective_view<'p>(parsed: &'p ParsedWorkflow, node: &'p AstNode) -> (&'p AstNode, Value) {
    if node.depth == 0 {
        return (node, node.config.clone());
    }
    match parsed.root_node(&node.node_id) {
        Some(base) => {
            let mut config = base.config.clone();
            deep_merge(&mut config, node.config.clone());
            let routing = if node.edges.is_empty() { base } else { node };
            (routing, config)
        }
        None => (node, node.config.clone()),
    }
}

fn resolve_target_item(
    parsed: &ParsedWorkflow,
    routing_node: &AstNode,
    name: &str,
    inline: bool,
) -> Option<WorkItem> {
    if inline {
        for &child in &routing_node.children {
            if parsed.node(child).node_id == name {
                return Some(WorkItem {
                    ast: child,
                    advance: false,
                });
            }
        }
    }
    parsed.root_index_of(name).map(|ast| WorkItem {
        ast,
        advance: false,
    })
}

fn loop_item(parsed: &ParsedWorkflow, loop_ctx: &LoopContext, name: &str) -> Option<WorkItem> {
    if let Some(origin) = loop_ctx.origin {
        if parsed.node(origin.ast).node_id == name {
            return Some(origin);
        }
    }
    if let Some(item) = loop_ctx.items.get(name) {
        return Some(*item);
    }
    parsed.root_index_of(name).map(|ast| WorkItem {
        ast,
        advance: false,
    })
}

fn compact_error(payload: &Value) -> Value {
    if payload.is_object() {
        json!({
            "code": payload.get("code").cloned().unwrap_or(Value::Null),
            "message": payload.get("message").cloned().unwrap_or(Value::Null),
            "nodeId": payload.get("node_id").cloned().unwrap_or(Value::Null),
            "timestamp": payload.get("timestamp").cloned().unwrap_or(Value::Null),
        })
    } else {
        json!({ "message": payload })
    }
}
