//! Workflow parsing and validation.
//!
//! Parsing runs in two phases over the raw JSON value:
//!
//! 1. **Schema validation** — shape of the top-level document (id/name/
//!    version grammars, workflow body present and non-empty, no stray
//!    top-level properties).
//! 2. **Semantic validation + AST construction** — every node needs a
//!    resolvable type, every required edge target must reference a known
//!    node, inline nested configurations recurse under the same rules, and
//!    non-`loop` circular references are rejected.
//!
//! Faults are accumulated, never thrown-on-first: `parse` either returns a
//! complete [`ParsedWorkflow`] or the full list of problems, so authors fix
//! a definition in one round trip.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use nodes::NodeRegistry;

use crate::ast::{AstNode, EdgeDescriptor, EdgeTarget, NodeIndex, ParsedWorkflow};
use crate::error::{ErrorCode, WorkflowError};

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-_]*$").expect("valid id pattern"));
static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid version pattern"));

const TOP_LEVEL_KEYS: [&str; 5] = ["id", "name", "version", "initialState", "workflow"];
const NODE_KEYS: [&str; 3] = ["type", "config", "edges"];

/// Parses workflow definitions into [`ParsedWorkflow`] ASTs.
#[derive(Default)]
pub struct WorkflowParser {
    registry: Option<Arc<NodeRegistry>>,
}

impl WorkflowParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser that additionally rejects node types the registry does not
    /// know (`unknown_node_type`).
    pub fn with_registry(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Parse a JSON string.
    ///
    /// # Errors
    /// The accumulated fault list; a syntactically broken document yields a
    /// single `missing_required_field` entry carrying the serde message.
    pub fn parse_str(&self, input: &str) -> Result<ParsedWorkflow, Vec<WorkflowError>> {
        let raw: Value = serde_json::from_str(input).map_err(|e| {
            vec![WorkflowError::validation(
                ErrorCode::MissingRequiredField,
                format!("definition is not valid JSON: {e}"),
            )]
        })?;
        self.parse(&raw)
    }

    /// Parse an already-deserialized JSON value.
    pub fn parse(&self, raw: &Value) -> Result<ParsedWorkflow, Vec<WorkflowError>> {
        let Some(document) = raw.as_object() else {
            return Err(vec![WorkflowError::validation(
                ErrorCode::MissingRequiredField,
                "workflow definition must be a JSON object",
            )]);
        };

        let mut errors = Vec::new();

        // ------------------------------------------------------------------
        // Phase A — schema validation
        // ------------------------------------------------------------------
        let id = require_string(document, "id", &mut errors);
        if let Some(id) = &id {
            if !ID_PATTERN.is_match(id) {
                errors.push(WorkflowError::validation(
                    ErrorCode::InvalidIdFormat,
                    format!("id '{id}' must match [a-z0-9][a-z0-9-_]*"),
                ));
            }
        }

        let name = require_string(document, "name", &mut errors);
        if let Some(name) = &name {
            if name.trim().is_empty() {
                errors.push(WorkflowError::validation(
                    ErrorCode::MissingRequiredField,
                    "'name' must be a non-empty string",
                ));
            }
        }

        let version = require_string(document, "version", &mut errors);
        if let Some(version) = &version {
            if !VERSION_PATTERN.is_match(version) {
                errors.push(WorkflowError::validation(
                    ErrorCode::InvalidVersionFormat,
                    format!("version '{version}' must match MAJOR.MINOR.PATCH"),
                ));
            }
        }

        let initial_state = match document.get("initialState") {
            None => None,
            Some(Value::Object(_)) => document.get("initialState").cloned(),
            Some(other) => {
                errors.push(WorkflowError::validation(
                    ErrorCode::InvalidInitialState,
                    format!("'initialState' must be an object, got {}", kind_of(other)),
                ));
                None
            }
        };

        for key in document.keys() {
            if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                errors.push(WorkflowError::validation(
                    ErrorCode::UnknownProperty,
                    format!("unknown top-level property '{key}'"),
                ));
            }
        }

        let entries = match document.get("workflow") {
            None => {
                errors.push(WorkflowError::validation(
                    ErrorCode::MissingRequiredField,
                    "missing required field 'workflow'",
                ));
                Vec::new()
            }
            Some(body) => normalize_body(body, &mut errors),
        };

        if entries.is_empty() && document.get("workflow").is_some() {
            // normalize_body only returns empty for an empty (or completely
            // malformed) body; the specific shape faults are already queued.
            if !errors
                .iter()
                .any(|e| matches!(e.code, ErrorCode::InvalidWorkflowEntry))
            {
                errors.push(WorkflowError::validation(
                    ErrorCode::EmptyWorkflow,
                    "'workflow' must contain at least one node",
                ));
            }
        }

        // ------------------------------------------------------------------
        // Phase B — semantic validation + AST construction
        // ------------------------------------------------------------------
        let mut seen_names: HashSet<&str> = HashSet::new();
        for (node_name, _) in &entries {
            if !seen_names.insert(node_name.as_str()) {
                errors.push(WorkflowError::validation(
                    ErrorCode::DuplicateNodeId,
                    format!("duplicate node '{node_name}' in workflow"),
                ));
            }
        }

        let root_names: HashSet<String> =
            entries.iter().map(|(name, _)| name.clone()).collect();

        let mut builder = AstBuilder {
            registry: self.registry.as_deref(),
            root_names: &root_names,
            nodes: Vec::new(),
            errors: &mut errors,
        };

        let mut roots = Vec::with_capacity(entries.len());
        for (index, (node_name, raw_config)) in entries.iter().enumerate() {
            let unique_id = format!("{node_name}_{index}");
            roots.push(builder.build_node(node_name, raw_config.as_ref(), None, 0, unique_id));
        }

        let nodes = builder.nodes;
        detect_circular_references(&nodes, &roots, &mut errors);

        if errors.is_empty() {
            debug!(
                workflow_id = id.as_deref().unwrap_or_default(),
                node_count = nodes.len(),
                "workflow parsed"
            );
            Ok(ParsedWorkflow::new(
                id.unwrap_or_default(),
                name.unwrap_or_default(),
                version.unwrap_or_default(),
                initial_state,
                nodes,
                roots,
            ))
        } else {
            Err(errors)
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_string(
    document: &Map<String, Value>,
    key: &str,
    errors: &mut Vec<WorkflowError>,
) -> Option<String> {
    match document.get(key) {
        Some(Value::String(value)) => Some(value.clone()),
        Some(other) => {
            errors.push(WorkflowError::validation(
                ErrorCode::MissingRequiredField,
                format!("'{key}' must be a string, got {}", kind_of(other)),
            ));
            None
        }
        None => {
            errors.push(WorkflowError::validation(
                ErrorCode::MissingRequiredField,
                format!("missing required field '{key}'"),
            ));
            None
        }
    }
}

/// Flatten both authoring forms into an ordered `(name, raw config)` list.
/// `None` raw config marks a bare-string entry, whose node type defaults to
/// the entry name.
fn normalize_body(
    body: &Value,
    errors: &mut Vec<WorkflowError>,
) -> Vec<(String, Option<Value>)> {
    match body {
        Value::Object(map) => map
            .iter()
            .map(|(name, config)| (name.clone(), Some(config.clone())))
            .collect(),
        Value::Array(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    Value::String(name) => out.push((name.clone(), None)),
                    Value::Object(map) if map.len() == 1 => {
                        if let Some((name, config)) = map.iter().next() {
                            out.push((name.clone(), Some(config.clone())));
                        }
                    }
                    other => {
                        errors.push(WorkflowError::validation(
                            ErrorCode::InvalidWorkflowEntry,
                            format!(
                                "workflow entries must be node names or single-key objects, got {}",
                                kind_of(other)
                            ),
                        ));
                    }
                }
            }
            out
        }
        other => {
            errors.push(WorkflowError::validation(
                ErrorCode::InvalidWorkflowEntry,
                format!("'workflow' must be an object or array, got {}", kind_of(other)),
            ));
            Vec::new()
        }
    }
}

struct AstBuilder<'a> {
    registry: Option<&'a NodeRegistry>,
    root_names: &'a HashSet<String>,
    nodes: Vec<AstNode>,
    errors: &'a mut Vec<WorkflowError>,
}

impl AstBuilder<'_> {
    /// Build one AST node (and, recursively, its inline-nested children).
    /// `raw` is `None` for bare-string entries.
    fn build_node(
        &mut self,
        node_id: &str,
        raw: Option<&Value>,
        parent: Option<NodeIndex>,
        depth: usize,
        unique_id: String,
    ) -> NodeIndex {
        // Reserve the slot up front so children can point back at it.
        let index = self.nodes.len();
        self.nodes.push(AstNode {
            node_id: node_id.to_string(),
            unique_id: unique_id.clone(),
            node_type: String::new(),
            config: Value::Object(Map::new()),
            edges: IndexMap::new(),
            depth,
            parent,
            children: Vec::new(),
        });

        let (node_type, config, edges, children) = match raw {
            // Bare entry: implicit empty config/edges, type defaults to name.
            None => (
                node_id.to_string(),
                Value::Object(Map::new()),
                IndexMap::new(),
                Vec::new(),
            ),
            Some(Value::Object(map)) => self.build_configured(
                node_id, map, index, depth, &unique_id,
            ),
            Some(other) => {
                self.errors.push(WorkflowError::validation(
                    ErrorCode::InvalidWorkflowEntry,
                    format!(
                        "configuration of node '{node_id}' must be an object, got {}",
                        kind_of(other)
                    ),
                ));
                (String::new(), Value::Object(Map::new()), IndexMap::new(), Vec::new())
            }
        };

        if let Some(registry) = self.registry {
            if !node_type.is_empty() && !registry.has_node(&node_type) {
                self.errors.push(
                    WorkflowError::validation(
                        ErrorCode::UnknownNodeType,
                        format!("node '{node_id}' uses unregistered type '{node_type}'"),
                    )
                    .with_node(node_id),
                );
            }
        }

        let slot = &mut self.nodes[index];
        slot.node_type = node_type;
        slot.config = config;
        slot.edges = edges;
        slot.children = children;
        index
    }

    #[allow(clippy::type_complexity)]
    fn build_configured(
        &mut self,
        node_id: &str,
        map: &Map<String, Value>,
        index: NodeIndex,
        depth: usize,
        unique_id: &str,
    ) -> (String, Value, IndexMap<String, EdgeDescriptor>, Vec<NodeIndex>) {
        let node_type = match map.get("type") {
            Some(Value::String(t)) if !t.trim().is_empty() => t.clone(),
            _ => {
                let code = if depth == 0 {
                    ErrorCode::MissingNodeType
                } else {
                    ErrorCode::NestedNodeMissingType
                };
                self.errors.push(
                    WorkflowError::validation(
                        code,
                        format!("node '{node_id}' is missing a 'type'"),
                    )
                    .with_node(node_id),
                );
                String::new()
            }
        };

        // Sibling keys flatten into config; an explicit `config` map wins on
        // collisions.
        let mut config = Map::new();
        for (key, value) in map {
            if !NODE_KEYS.contains(&key.as_str()) {
                config.insert(key.clone(), value.clone());
            }
        }
        match map.get("config") {
            None => {}
            Some(Value::Object(explicit)) => {
                for (key, value) in explicit {
                    config.insert(key.clone(), value.clone());
                }
            }
            Some(other) => {
                self.errors.push(WorkflowError::validation(
                    ErrorCode::InvalidWorkflowEntry,
                    format!(
                        "'config' of node '{node_id}' must be an object, got {}",
                        kind_of(other)
                    ),
                ));
            }
        }

        let mut edges: IndexMap<String, EdgeDescriptor> = IndexMap::new();
        let mut children = Vec::new();

        match map.get("edges") {
            None => {}
            Some(Value::Object(edge_table)) => {
                for (raw_name, raw_target) in edge_table {
                    let is_optional = raw_name.ends_with('?');
                    let edge_name = raw_name.trim_end_matches('?').to_string();

                    let target = self.build_edge_target(
                        node_id,
                        &edge_name,
                        is_optional,
                        raw_target,
                        index,
                        depth,
                        unique_id,
                        &mut children,
                    );

                    let Some(target) = target else { continue };
                    let descriptor = EdgeDescriptor {
                        name: edge_name.clone(),
                        is_optional,
                        target,
                    };

                    // When both `x` and `x?` are declared, the required form
                    // shadows the optional one.
                    let replace = match edges.get(&edge_name) {
                        None => true,
                        Some(existing) => existing.is_optional && !is_optional,
                    };
                    if replace {
                        edges.insert(edge_name, descriptor);
                    }
                }
            }
            Some(other) => {
                self.errors.push(WorkflowError::validation(
                    ErrorCode::InvalidWorkflowEntry,
                    format!(
                        "'edges' of node '{node_id}' must be an object, got {}",
                        kind_of(other)
                    ),
                ));
            }
        }

        (node_type, Value::Object(config), edges, children)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_edge_target(
        &mut self,
        node_id: &str,
        edge_name: &str,
        is_optional: bool,
        raw_target: &Value,
        owner_index: NodeIndex,
        depth: usize,
        owner_unique_id: &str,
        children: &mut Vec<NodeIndex>,
    ) -> Option<EdgeTarget> {
        // Inline children of one edge share an index space, including across
        // sequence elements.
        let mut nested_counter = 0usize;
        self.build_edge_target_inner(
            node_id,
            edge_name,
            is_optional,
            raw_target,
            owner_index,
            depth,
            owner_unique_id,
            children,
            &mut nested_counter,
            true,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_edge_target_inner(
        &mut self,
        node_id: &str,
        edge_name: &str,
        is_optional: bool,
        raw_target: &Value,
        owner_index: NodeIndex,
        depth: usize,
        owner_unique_id: &str,
        children: &mut Vec<NodeIndex>,
        nested_counter: &mut usize,
        allow_sequence: bool,
    ) -> Option<EdgeTarget> {
        match raw_target {
            Value::String(target_name) => {
                if !self.root_names.contains(target_name) && !is_optional {
                    self.errors.push(
                        WorkflowError::validation(
                            ErrorCode::InvalidNodeReference,
                            format!(
                                "edge '{edge_name}' of node '{node_id}' references unknown node '{target_name}'"
                            ),
                        )
                        .with_node(node_id),
                    );
                }
                Some(EdgeTarget::Node(target_name.clone()))
            }
            Value::Array(elements) if allow_sequence => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    if let Some(target) = self.build_edge_target_inner(
                        node_id,
                        edge_name,
                        is_optional,
                        element,
                        owner_index,
                        depth,
                        owner_unique_id,
                        children,
                        nested_counter,
                        false,
                    ) {
                        out.push(target);
                    }
                }
                Some(EdgeTarget::Sequence(out))
            }
            Value::Object(inline) => {
                let mut configs = IndexMap::new();
                for (nested_name, nested_raw) in inline {
                    if !self.root_names.contains(nested_name) && !is_optional {
                        self.errors.push(
                            WorkflowError::validation(
                                ErrorCode::EdgeTargetNotFound,
                                format!(
                                    "edge '{edge_name}' of node '{node_id}' configures unknown node '{nested_name}'"
                                ),
                            )
                            .with_node(node_id),
                        );
                    }

                    let child_unique =
                        format!("{owner_unique_id}_nested_{edge_name}_{nested_counter}");
                    *nested_counter += 1;
                    let child_index = self.build_node(
                        nested_name,
                        Some(nested_raw),
                        Some(owner_index),
                        depth + 1,
                        child_unique,
                    );
                    children.push(child_index);
                    configs.insert(nested_name.clone(), nested_raw.clone());
                }
                Some(EdgeTarget::Inline(configs))
            }
            other => {
                self.errors.push(
                    WorkflowError::validation(
                        ErrorCode::InvalidWorkflowEntry,
                        format!(
                            "edge '{edge_name}' of node '{node_id}' has invalid target of type {}",
                            kind_of(other)
                        ),
                    )
                    .with_node(node_id),
                );
                None
            }
        }
    }
}

/// Reject non-`loop` circular references.
///
/// `loop`-named edges are sanctioned back-edges and are excluded from the
/// traversal entirely; everything else that can transitively lead back to
/// the owning node is a fault.
fn detect_circular_references(
    nodes: &[AstNode],
    roots: &[NodeIndex],
    errors: &mut Vec<WorkflowError>,
) {
    // Successor names per node name, across every arena node (an inline
    // override's edges apply under the name of the node it overrides).
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        let entry = successors.entry(node.node_id.as_str()).or_default();
        for descriptor in node.edges.values() {
            if descriptor.name == nodes::LOOP_EDGE {
                continue;
            }
            collect_target_names(&descriptor.target, entry);
        }
    }

    for &root in roots {
        let origin = nodes[root].node_id.as_str();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = successors.get(origin).cloned().unwrap_or_default();

        while let Some(current) = stack.pop() {
            if current == origin {
                errors.push(
                    WorkflowError::validation(
                        ErrorCode::CircularReference,
                        format!("node '{origin}' is part of a non-loop circular reference"),
                    )
                    .with_node(origin),
                );
                break;
            }
            if visited.insert(current) {
                if let Some(next) = successors.get(current) {
                    stack.extend(next.iter().copied());
                }
            }
        }
    }
}

fn collect_target_names<'a>(target: &'a EdgeTarget, out: &mut Vec<&'a str>) {
    match target {
        EdgeTarget::Node(name) => out.push(name.as_str()),
        EdgeTarget::Sequence(elements) => {
            for element in elements {
                collect_target_names(element, out);
            }
        }
        EdgeTarget::Inline(configs) => {
            for name in configs.keys() {
                out.push(name.as_str());
            }
        }
    }
}
