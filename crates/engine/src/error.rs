//! Structured error model.
//!
//! Errors are values, not control-flow exceptions: operations that can fail
//! return either a result or a [`WorkflowError`], and inside the engine a
//! single privileged edge name (`error`) conveys that a node execution
//! yielded one. Centralizing the error shape lets the router and the state
//! manager attach failure information without depending on unwinding.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use nodes::ERROR_EDGE;

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Runtime,
    FlowControl,
    NodeExecution,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::FlowControl => "flow_control",
            ErrorCategory::NodeExecution => "node_execution",
            ErrorCategory::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity influences logging only; it never changes routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // validation
    MissingRequiredField,
    InvalidIdFormat,
    InvalidVersionFormat,
    EmptyWorkflow,
    UnknownProperty,
    InvalidInitialState,
    InvalidWorkflowEntry,
    DuplicateNodeId,
    MissingNodeType,
    UnknownNodeType,
    NestedNodeMissingType,
    InvalidNodeReference,
    EdgeTargetNotFound,
    CircularReference,
    InvalidMetadata,
    // runtime
    StateRetrievalFailed,
    StateUpdateFailed,
    ErrorStateUpdateFailed,
    NodeInstantiationFailed,
    StateAlreadyExists,
    StateNotFound,
    VersionConflict,
    // flow_control
    MaxIterationsExceeded,
    LoopTimeout,
    NestedLoop,
    EmptyLoopSequence,
    // node_execution
    NodeExecutionFailed,
    // system
    ExecutionLimitExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingRequiredField => "missing_required_field",
            ErrorCode::InvalidIdFormat => "invalid_id_format",
            ErrorCode::InvalidVersionFormat => "invalid_version_format",
            ErrorCode::EmptyWorkflow => "empty_workflow",
            ErrorCode::UnknownProperty => "unknown_property",
            ErrorCode::InvalidInitialState => "invalid_initial_state",
            ErrorCode::InvalidWorkflowEntry => "invalid_workflow_entry",
            ErrorCode::DuplicateNodeId => "duplicate_node_id",
            ErrorCode::MissingNodeType => "missing_node_type",
            ErrorCode::UnknownNodeType => "unknown_node_type",
            ErrorCode::NestedNodeMissingType => "nested_node_missing_type",
            ErrorCode::InvalidNodeReference => "invalid_node_reference",
            ErrorCode::EdgeTargetNotFound => "edge_target_not_found",
            ErrorCode::CircularReference => "circular_reference",
            ErrorCode::InvalidMetadata => "invalid_metadata",
            ErrorCode::StateRetrievalFailed => "state_retrieval_failed",
            ErrorCode::StateUpdateFailed => "state_update_failed",
            ErrorCode::ErrorStateUpdateFailed => "error_state_update_failed",
            ErrorCode::NodeInstantiationFailed => "node_instantiation_failed",
            ErrorCode::StateAlreadyExists => "state_already_exists",
            ErrorCode::StateNotFound => "state_not_found",
            ErrorCode::VersionConflict => "version_conflict",
            ErrorCode::MaxIterationsExceeded => "max_iterations",
            ErrorCode::LoopTimeout => "timeout",
            ErrorCode::NestedLoop => "nested_loop",
            ErrorCode::EmptyLoopSequence => "empty_loop_sequence",
            ErrorCode::NodeExecutionFailed => "node_execution_failed",
            ErrorCode::ExecutionLimitExceeded => "execution_limit_exceeded",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// The error value
// ---------------------------------------------------------------------------

/// Identifying scope attached to an error at creation time.
#[derive(Debug, Clone, Default)]
pub struct ErrorScope {
    pub node_id: Option<String>,
    pub execution_id: Option<String>,
    pub workflow_id: Option<String>,
    pub context: Option<Value>,
}

impl ErrorScope {
    pub fn execution(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            ..Self::default()
        }
    }

    pub fn node(
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: Some(node_id.into()),
            execution_id: Some(execution_id.into()),
            workflow_id: Some(workflow_id.into()),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// A structured error value.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("[{category}/{code}] {message}")]
pub struct WorkflowError {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WorkflowError>>,
}

impl WorkflowError {
    pub fn new(
        category: ErrorCategory,
        code: ErrorCode,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            code,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            node_id: None,
            execution_id: None,
            workflow_id: None,
            context: None,
            cause: None,
        }
    }

    /// Error-severity validation fault.
    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message, Severity::Error)
    }

    /// Error-severity runtime fault.
    pub fn runtime(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Runtime, code, message, Severity::Error)
    }

    /// Error-severity routing fault.
    pub fn flow_control(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::FlowControl, code, message, Severity::Error)
    }

    pub fn with_scope(mut self, scope: ErrorScope) -> Self {
        self.node_id = scope.node_id;
        self.execution_id = scope.execution_id;
        self.workflow_id = scope.workflow_id;
        self.context = scope.context;
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_cause(mut self, cause: WorkflowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Compact form written under `state.error` / `state.lastError`.
    pub fn summary(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "nodeId": self.node_id,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }

    /// The full value carried on an `error` edge.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "message": self.message }))
    }
}

// ---------------------------------------------------------------------------
// External response shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponseBody {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// The canonical shape surfaced to anything outside the engine.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorResponseBody,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// In-memory error store, indexed by error id and by execution id.
///
/// Entries live until [`ErrorIndex::cleanup_by_execution`] (or `clear`) —
/// hosts that surface errors after an execution finishes read them from
/// here.
#[derive(Default)]
pub struct ErrorIndex {
    by_id: DashMap<Uuid, WorkflowError>,
    by_execution: DashMap<String, Vec<Uuid>>,
}

impl ErrorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, log, and index a new error.
    pub fn create(
        &self,
        category: ErrorCategory,
        code: ErrorCode,
        message: impl Into<String>,
        severity: Severity,
        scope: ErrorScope,
    ) -> WorkflowError {
        let err = WorkflowError::new(category, code, message, severity).with_scope(scope);
        self.record(err)
    }

    /// Log and index an already-built error.
    pub fn record(&self, err: WorkflowError) -> WorkflowError {
        match err.severity {
            Severity::Info => info!(
                code = %err.code,
                node_id = err.node_id.as_deref(),
                execution_id = err.execution_id.as_deref(),
                "{}", err.message
            ),
            Severity::Warning => warn!(
                code = %err.code,
                node_id = err.node_id.as_deref(),
                execution_id = err.execution_id.as_deref(),
                "{}", err.message
            ),
            Severity::Error => error!(
                code = %err.code,
                node_id = err.node_id.as_deref(),
                execution_id = err.execution_id.as_deref(),
                "{}", err.message
            ),
            Severity::Fatal => error!(
                code = %err.code,
                node_id = err.node_id.as_deref(),
                execution_id = err.execution_id.as_deref(),
                context = ?err.context,
                cause = ?err.cause,
                "FATAL: {}", err.message
            ),
        }

        if let Some(execution_id) = &err.execution_id {
            self.by_execution
                .entry(execution_id.clone())
                .or_default()
                .push(err.id);
        }
        self.by_id.insert(err.id, err.clone());
        err
    }

    /// Normalize any unstructured failure into a structured error and return
    /// the edge name the caller should route through.
    pub fn handle_execution_error(
        &self,
        failure: impl fmt::Display,
        scope: ErrorScope,
    ) -> (WorkflowError, &'static str) {
        let err = self.create(
            ErrorCategory::NodeExecution,
            ErrorCode::NodeExecutionFailed,
            failure.to_string(),
            Severity::Error,
            scope,
        );
        (err, ERROR_EDGE)
    }

    /// Produce the external-facing form.
    pub fn response(err: &WorkflowError) -> ErrorResponse {
        ErrorResponse {
            success: false,
            error: ErrorResponseBody {
                id: err.id,
                category: err.category,
                code: err.code,
                message: err.message.clone(),
                severity: err.severity,
                timestamp: err.timestamp,
                details: err.context.clone(),
            },
        }
    }

    pub fn get(&self, id: Uuid) -> Option<WorkflowError> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    /// All errors recorded for an execution, in creation order.
    pub fn get_by_execution(&self, execution_id: &str) -> Vec<WorkflowError> {
        self.by_execution
            .get(execution_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_id.get(id).map(|entry| entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every error recorded for an execution.
    pub fn cleanup_by_execution(&self, execution_id: &str) {
        if let Some((_, ids)) = self.by_execution.remove(execution_id) {
            for id in ids {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&self) {
        self.by_id.clear();
        self.by_execution.clear();
    }
}
