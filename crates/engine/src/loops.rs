//! Bounded loop management.
//!
//! A node that emits the reserved `loop` edge (and declares one) starts a
//! loop: the edge's targets become the loop body, executed in order once per
//! iteration before control returns to the loop-initiating node. Iteration
//! and wall-clock budgets guarantee termination; at most one loop may be
//! active per execution and nesting is a fault.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use nodes::{EdgeMap, LOOP_EDGE};

use crate::ast::ParsedWorkflow;
use crate::error::{ErrorCode, WorkflowError};
use crate::router::RouteResult;

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_millis(30_000);

#[derive(Debug, Error)]
pub enum LoopError {
    /// Nested loops are disallowed: one active loop per execution.
    #[error("execution '{0}' already has an active loop")]
    AlreadyActive(String),

    #[error("loop at node '{0}' has an empty body sequence")]
    EmptySequence(String),
}

impl LoopError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LoopError::AlreadyActive(_) => ErrorCode::NestedLoop,
            LoopError::EmptySequence(_) => ErrorCode::EmptyLoopSequence,
        }
    }
}

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTermination {
    MaxIterations,
    Timeout,
    /// The loop node emitted a non-`loop` edge; the router handles it
    /// normally.
    NonLoopEdge,
    /// The loop node emitted nothing routable.
    Completed,
}

impl LoopTermination {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopTermination::MaxIterations => "max_iterations",
            LoopTermination::Timeout => "timeout",
            LoopTermination::NonLoopEdge => "non_loop_edge",
            LoopTermination::Completed => "completed",
        }
    }
}

/// Tracked state of one active loop.
#[derive(Debug, Clone)]
struct LoopState {
    node_id: String,
    iteration: u32,
    max_iterations: u32,
    sequence: Vec<String>,
    /// −1 means "back at the loop node"; 0..len is the body element being
    /// executed.
    sequence_index: isize,
    is_active: bool,
    started_at: Instant,
    max_execution_time: Duration,
}

/// What the driver should do next for a loop-managed execution.
#[derive(Debug, Clone, Default)]
pub struct LoopResult {
    /// True while the loop remains active.
    pub is_loop: bool,
    /// The next node the loop wants executed.
    pub next_node: Option<String>,
    pub terminated: bool,
    pub reason: Option<LoopTermination>,
}

impl LoopResult {
    fn active(next_node: String) -> Self {
        Self {
            is_loop: true,
            next_node: Some(next_node),
            terminated: false,
            reason: None,
        }
    }

    fn terminated(reason: LoopTermination) -> Self {
        Self {
            is_loop: false,
            next_node: None,
            terminated: true,
            reason: Some(reason),
        }
    }
}

/// Observable statistics for a live loop.
#[derive(Debug, Clone)]
pub struct LoopStats {
    pub node_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub sequence: Vec<String>,
    pub sequence_index: isize,
    pub elapsed: Duration,
    pub is_active: bool,
}

/// Per-execution loop bookkeeping.
///
/// Lock domain is separate from the state manager's; neither lock is ever
/// held across a node invocation.
#[derive(Default)]
pub struct LoopManager {
    states: DashMap<String, LoopState>,
}

impl LoopManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an edge map asks for loop treatment.
    pub fn has_loop_edge(&self, edge_map: &EdgeMap) -> bool {
        edge_map.contains(LOOP_EDGE)
    }

    pub fn is_in_loop(&self, execution_id: &str) -> bool {
        self.states.contains_key(execution_id)
    }

    /// Begin a loop and return the first body element to execute.
    ///
    /// # Errors
    /// - [`LoopError::AlreadyActive`] when the execution is already looping.
    /// - [`LoopError::EmptySequence`] when there is no body to iterate.
    pub fn start_loop(
        &self,
        execution_id: &str,
        node_id: &str,
        sequence: Vec<String>,
        max_iterations: Option<u32>,
        max_execution_time: Option<Duration>,
    ) -> Result<LoopResult, LoopError> {
        use dashmap::mapref::entry::Entry;

        if sequence.is_empty() {
            return Err(LoopError::EmptySequence(node_id.to_string()));
        }

        match self.states.entry(execution_id.to_string()) {
            Entry::Occupied(_) => Err(LoopError::AlreadyActive(execution_id.to_string())),
            Entry::Vacant(vacant) => {
                let first = sequence[0].clone();
                debug!(
                    execution_id,
                    node_id,
                    body_len = sequence.len(),
                    "loop started"
                );
                vacant.insert(LoopState {
                    node_id: node_id.to_string(),
                    iteration: 0,
                    max_iterations: max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                    sequence,
                    sequence_index: 0,
                    is_active: true,
                    started_at: Instant::now(),
                    max_execution_time: max_execution_time
                        .unwrap_or(DEFAULT_MAX_EXECUTION_TIME),
                });
                Ok(LoopResult::active(first))
            }
        }
    }

    /// Advance the loop state machine after `completed_node_id` finished.
    ///
    /// Body elements advance the sequence; the loop node itself decides —
    /// via its fresh edge map — whether to iterate, hand control to normal
    /// routing, or finish.
    pub fn continue_loop(
        &self,
        execution_id: &str,
        completed_node_id: &str,
        edge_map: &EdgeMap,
    ) -> LoopResult {
        enum Step {
            Next(String),
            Terminate(LoopTermination),
        }

        let Some(mut entry) = self.states.get_mut(execution_id) else {
            // A terminated (or never-started) loop: report completion.
            return LoopResult::terminated(LoopTermination::Completed);
        };

        let state = entry.value_mut();
        let step = if state.sequence_index >= 0 {
            // A body element finished.
            let expected = &state.sequence[state.sequence_index as usize];
            if expected != completed_node_id {
                warn!(
                    execution_id,
                    expected = %expected,
                    completed = completed_node_id,
                    "loop body completion out of sequence"
                );
            }

            let next_index = state.sequence_index + 1;
            if (next_index as usize) < state.sequence.len() {
                state.sequence_index = next_index;
                Step::Next(state.sequence[next_index as usize].clone())
            } else {
                // Body exhausted: return to the loop node.
                state.sequence_index = -1;
                Step::Next(state.node_id.clone())
            }
        } else if edge_map.contains(LOOP_EDGE) {
            // The loop node asked for another iteration.
            state.iteration += 1;
            if state.iteration >= state.max_iterations {
                Step::Terminate(LoopTermination::MaxIterations)
            } else if state.started_at.elapsed() > state.max_execution_time {
                Step::Terminate(LoopTermination::Timeout)
            } else {
                state.sequence_index = 0;
                Step::Next(state.sequence[0].clone())
            }
        } else if !edge_map.is_empty() {
            Step::Terminate(LoopTermination::NonLoopEdge)
        } else {
            Step::Terminate(LoopTermination::Completed)
        };
        drop(entry);

        match step {
            Step::Next(next) => LoopResult::active(next),
            Step::Terminate(reason) => {
                self.states.remove(execution_id);
                debug!(execution_id, reason = reason.as_str(), "loop terminated");
                LoopResult::terminated(reason)
            }
        }
    }

    /// Read the loop body out of a route result.
    pub fn extract_loop_sequence(&self, route: &RouteResult) -> Vec<String> {
        route.next_nodes.clone()
    }

    /// Check that every body element names a root-level node.
    pub fn validate_loop_sequence(
        &self,
        sequence: &[String],
        parsed: &ParsedWorkflow,
    ) -> Vec<WorkflowError> {
        let mut errors = Vec::new();
        if sequence.is_empty() {
            errors.push(WorkflowError::flow_control(
                ErrorCode::EmptyLoopSequence,
                "loop body sequence is empty",
            ));
        }
        for name in sequence {
            if !parsed.has_root(name) {
                errors.push(WorkflowError::flow_control(
                    ErrorCode::InvalidNodeReference,
                    format!("loop body references unknown node '{name}'"),
                ));
            }
        }
        errors
    }

    pub fn get_loop_stats(&self, execution_id: &str) -> Option<LoopStats> {
        self.states.get(execution_id).map(|entry| {
            let state = entry.value();
            LoopStats {
                node_id: state.node_id.clone(),
                iteration: state.iteration,
                max_iterations: state.max_iterations,
                sequence: state.sequence.clone(),
                sequence_index: state.sequence_index,
                elapsed: state.started_at.elapsed(),
                is_active: state.is_active,
            }
        })
    }

    /// Drop loop state for one execution (no-op when absent).
    pub fn cleanup(&self, execution_id: &str) {
        self.states.remove(execution_id);
    }

    pub fn clear(&self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loop_map() -> EdgeMap {
        EdgeMap::single(LOOP_EDGE, json!(true))
    }

    fn other_map() -> EdgeMap {
        EdgeMap::single("stop", json!(true))
    }

    fn empty_map() -> EdgeMap {
        EdgeMap::new()
    }

    #[test]
    fn has_loop_edge_checks_the_reserved_name() {
        let manager = LoopManager::new();
        assert!(manager.has_loop_edge(&loop_map()));
        assert!(!manager.has_loop_edge(&other_map()));
    }

    #[test]
    fn start_returns_first_body_element() {
        let manager = LoopManager::new();
        let result = manager
            .start_loop("e1", "cycler", vec!["step".into(), "audit".into()], None, None)
            .expect("start");

        assert!(result.is_loop);
        assert_eq!(result.next_node.as_deref(), Some("step"));
        assert!(manager.is_in_loop("e1"));
    }

    #[test]
    fn empty_sequence_is_a_fault() {
        let manager = LoopManager::new();
        assert!(matches!(
            manager.start_loop("e1", "cycler", vec![], None, None),
            Err(LoopError::EmptySequence(_))
        ));
    }

    #[test]
    fn nested_loop_is_a_fault() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "outer", vec!["step".into()], None, None)
            .expect("start");
        assert!(matches!(
            manager.start_loop("e1", "inner", vec!["other".into()], None, None),
            Err(LoopError::AlreadyActive(_))
        ));
        // A different execution may loop concurrently.
        assert!(manager
            .start_loop("e2", "outer", vec!["step".into()], None, None)
            .is_ok());
    }

    #[test]
    fn body_advances_in_order_then_returns_to_loop_node() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "cycler", vec!["step".into(), "audit".into()], None, None)
            .expect("start");

        let after_step = manager.continue_loop("e1", "step", &empty_map());
        assert_eq!(after_step.next_node.as_deref(), Some("audit"));

        let after_audit = manager.continue_loop("e1", "audit", &empty_map());
        assert_eq!(after_audit.next_node.as_deref(), Some("cycler"));
    }

    #[test]
    fn loop_edge_starts_a_new_iteration() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "cycler", vec!["step".into()], None, None)
            .expect("start");

        manager.continue_loop("e1", "step", &empty_map());
        let next = manager.continue_loop("e1", "cycler", &loop_map());
        assert!(next.is_loop);
        assert_eq!(next.next_node.as_deref(), Some("step"));
        assert_eq!(manager.get_loop_stats("e1").unwrap().iteration, 1);
    }

    #[test]
    fn non_loop_edge_terminates_and_hands_over_to_routing() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "cycler", vec!["step".into()], None, None)
            .expect("start");

        manager.continue_loop("e1", "step", &empty_map());
        let result = manager.continue_loop("e1", "cycler", &other_map());
        assert!(result.terminated);
        assert_eq!(result.reason, Some(LoopTermination::NonLoopEdge));
        assert!(!manager.is_in_loop("e1"));
    }

    #[test]
    fn empty_edge_map_at_loop_node_completes() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "cycler", vec!["step".into()], None, None)
            .expect("start");

        manager.continue_loop("e1", "step", &empty_map());
        let result = manager.continue_loop("e1", "cycler", &empty_map());
        assert_eq!(result.reason, Some(LoopTermination::Completed));
    }

    #[test]
    fn max_iterations_bound_is_enforced() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "cycler", vec!["step".into()], Some(3), None)
            .expect("start");

        // Iterations 1 and 2 are allowed, the third hits the bound.
        for expected_iteration in 1..=2 {
            manager.continue_loop("e1", "step", &empty_map());
            let result = manager.continue_loop("e1", "cycler", &loop_map());
            assert!(result.is_loop, "iteration {expected_iteration} continues");
        }
        manager.continue_loop("e1", "step", &empty_map());
        let result = manager.continue_loop("e1", "cycler", &loop_map());
        assert!(result.terminated);
        assert_eq!(result.reason, Some(LoopTermination::MaxIterations));
    }

    #[test]
    fn wall_clock_budget_is_enforced() {
        let manager = LoopManager::new();
        manager
            .start_loop(
                "e1",
                "cycler",
                vec!["step".into()],
                None,
                Some(Duration::ZERO),
            )
            .expect("start");

        manager.continue_loop("e1", "step", &empty_map());
        std::thread::sleep(Duration::from_millis(2));
        let result = manager.continue_loop("e1", "cycler", &loop_map());
        assert!(result.terminated);
        assert_eq!(result.reason, Some(LoopTermination::Timeout));
    }

    #[test]
    fn continue_after_termination_reports_completed() {
        let manager = LoopManager::new();
        let result = manager.continue_loop("ghost", "whatever", &empty_map());
        assert!(result.terminated);
        assert!(!result.is_loop);
        assert_eq!(result.reason, Some(LoopTermination::Completed));
    }

    #[test]
    fn cleanup_and_clear_drop_state() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "a", vec!["s".into()], None, None)
            .expect("start");
        manager
            .start_loop("e2", "a", vec!["s".into()], None, None)
            .expect("start");

        manager.cleanup("e1");
        assert!(!manager.is_in_loop("e1"));
        assert!(manager.is_in_loop("e2"));

        manager.clear();
        assert!(!manager.is_in_loop("e2"));
    }

    #[test]
    fn loop_sequences_are_validated_against_the_workflow() {
        use crate::parser::WorkflowParser;

        let parsed = WorkflowParser::new()
            .parse(&serde_json::json!({
                "id": "loops",
                "name": "Loops",
                "version": "1.0.0",
                "workflow": ["step", "audit"],
            }))
            .expect("valid workflow");
        let manager = LoopManager::new();

        assert!(manager
            .validate_loop_sequence(&["step".to_string(), "audit".to_string()], &parsed)
            .is_empty());

        let faults =
            manager.validate_loop_sequence(&["step".to_string(), "ghost".to_string()], &parsed);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, ErrorCode::InvalidNodeReference);

        let empty_faults = manager.validate_loop_sequence(&[], &parsed);
        assert_eq!(empty_faults[0].code, ErrorCode::EmptyLoopSequence);
    }

    #[test]
    fn stats_reflect_progress() {
        let manager = LoopManager::new();
        manager
            .start_loop("e1", "cycler", vec!["step".into(), "audit".into()], Some(7), None)
            .expect("start");

        let stats = manager.get_loop_stats("e1").expect("stats");
        assert_eq!(stats.node_id, "cycler");
        assert_eq!(stats.iteration, 0);
        assert_eq!(stats.max_iterations, 7);
        assert_eq!(stats.sequence_index, 0);
        assert!(stats.is_active);
        assert!(manager.get_loop_stats("missing").is_none());
    }
}
