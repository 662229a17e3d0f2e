//! Edge routing — from a node's returned edge map to the next frontier.
//!
//! Resolution is deterministic first-match: the reserved `loop` edge has
//! strict priority, everything else is consulted in the order the node
//! inserted it. Optional edges degrade to authoring-order fall-through where
//! required edges fault.

use indexmap::IndexMap;
use serde_json::Value;

use nodes::{EdgeMap, LOOP_EDGE};

use crate::ast::{AstNode, EdgeDescriptor, EdgeTarget, ParsedWorkflow};
use crate::error::{ErrorCode, WorkflowError};

/// The next frontier for one routing decision.
#[derive(Debug, Clone, Default)]
pub struct RouteResult {
    /// Stripped name of the edge that matched, when one did. The driver
    /// resolves this edge's payload — only chosen edges have their lazy
    /// producers invoked.
    pub matched_edge: Option<String>,
    /// Node names to schedule, in order.
    pub next_nodes: Vec<String>,
    /// Per-use configuration overlays keyed by node name, taken from inline
    /// nested edge shapes.
    pub inline_configs: IndexMap<String, Value>,
    /// Whether the resolved edge was marked `?`.
    pub is_optional: bool,
    /// Whether the driver should advance to the next node in authoring
    /// order (no edge matched, or an optional target was missing).
    pub continue_sequence: bool,
    /// Set when the chosen edge was the reserved `loop` edge.
    pub is_loop: bool,
}

/// Resolve the edge map returned by `node` into a route.
///
/// # Errors
/// `invalid_node_reference` (flow_control) when a required target does not
/// exist in the workflow.
pub fn route(
    parsed: &ParsedWorkflow,
    node: &AstNode,
    edge_map: &EdgeMap,
) -> Result<RouteResult, WorkflowError> {
    // The loop edge always wins when both the map and the table carry it.
    if edge_map.contains(LOOP_EDGE) {
        if let Some(descriptor) = node.edge(LOOP_EDGE) {
            let mut result = resolve_descriptor(parsed, node, descriptor)?;
            result.is_loop = true;
            return Ok(result);
        }
    }

    // First emitted edge that the node's table declares wins. The table is
    // keyed by stripped names, so `x` matches a declared `x` or `x?` (with
    // the required form shadowing its optional twin).
    for key in edge_map.keys() {
        if let Some(descriptor) = node.edge(key) {
            return resolve_descriptor(parsed, node, descriptor);
        }
    }

    // Nothing matched: fall through to the next node in authoring order.
    let mut result = RouteResult {
        continue_sequence: true,
        ..RouteResult::default()
    };
    if let Some(next) = parsed.next_in_order(&node.node_id) {
        result.next_nodes.push(next.to_string());
    }
    Ok(result)
}

fn resolve_descriptor(
    parsed: &ParsedWorkflow,
    node: &AstNode,
    descriptor: &EdgeDescriptor,
) -> Result<RouteResult, WorkflowError> {
    let mut result = RouteResult {
        matched_edge: Some(descriptor.name.clone()),
        is_optional: descriptor.is_optional,
        ..RouteResult::default()
    };
    let mut skipped = 0usize;

    resolve_target(parsed, node, descriptor, &descriptor.target, &mut result, &mut skipped)?;

    // An optional edge whose targets were all missing degrades to
    // fall-through rather than a fault.
    if result.next_nodes.is_empty() && skipped > 0 {
        result.continue_sequence = true;
    }
    Ok(result)
}

fn resolve_target(
    parsed: &ParsedWorkflow,
    node: &AstNode,
    descriptor: &EdgeDescriptor,
    target: &EdgeTarget,
    result: &mut RouteResult,
    skipped: &mut usize,
) -> Result<(), WorkflowError> {
    match target {
        EdgeTarget::Node(name) => {
            if parsed.has_root(name) {
                result.next_nodes.push(name.clone());
            } else if descriptor.is_optional {
                *skipped += 1;
            } else {
                return Err(unknown_target(node, descriptor, name));
            }
        }
        EdgeTarget::Sequence(elements) => {
            for element in elements {
                resolve_target(parsed, node, descriptor, element, result, skipped)?;
            }
        }
        EdgeTarget::Inline(configs) => {
            for (name, overlay) in configs {
                if parsed.has_root(name) {
                    result.next_nodes.push(name.clone());
                    result.inline_configs.insert(name.clone(), overlay.clone());
                } else if descriptor.is_optional {
                    *skipped += 1;
                } else {
                    return Err(unknown_target(node, descriptor, name));
                }
            }
        }
    }
    Ok(())
}

fn unknown_target(node: &AstNode, descriptor: &EdgeDescriptor, name: &str) -> WorkflowError {
    WorkflowError::flow_control(
        ErrorCode::InvalidNodeReference,
        format!(
            "edge '{}' of node '{}' routes to unknown node '{name}'",
            descriptor.name, node.node_id
        ),
    )
    .with_node(node.node_id.clone())
}

/// Dry-run every declared edge of every node against a synthetic truthy edge
/// map and accumulate the faults, without throwing.
pub fn validate_all_edges(parsed: &ParsedWorkflow) -> Vec<WorkflowError> {
    let mut errors = Vec::new();
    for node in parsed.nodes() {
        for descriptor in node.edges.values() {
            if let Err(err) = resolve_descriptor(parsed, node, descriptor) {
                errors.push(err);
            }
        }
    }
    errors
}
