//! The parsed workflow AST.
//!
//! Every node — root-level and inline-nested alike — lives in one flat
//! arena owned by [`ParsedWorkflow`]; `parent` and `children` are indices
//! into that arena, so the tree has no reference cycles and is trivially
//! clonable.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::definition::{WorkflowBody, WorkflowDefinition};

/// Index of an [`AstNode`] within its arena.
pub type NodeIndex = usize;

/// One resolved edge target.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeTarget {
    /// Reference to another node by name.
    Node(String),
    /// Ordered list of targets, all scheduled in order.
    Sequence(Vec<EdgeTarget>),
    /// Inline nested configuration(s): node name → configuration overlay.
    Inline(IndexMap<String, Value>),
}

impl EdgeTarget {
    /// Re-serialize to the authored JSON shape.
    pub fn to_value(&self) -> Value {
        match self {
            EdgeTarget::Node(name) => Value::String(name.clone()),
            EdgeTarget::Sequence(elements) => {
                Value::Array(elements.iter().map(EdgeTarget::to_value).collect())
            }
            EdgeTarget::Inline(configs) => {
                let mut map = Map::new();
                for (name, config) in configs {
                    map.insert(name.clone(), config.clone());
                }
                Value::Object(map)
            }
        }
    }
}

/// A parsed edge: name with the `?` suffix stripped, the optional flag
/// retained, and the target in resolved form.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDescriptor {
    pub name: String,
    pub is_optional: bool,
    pub target: EdgeTarget,
}

/// A single node of the parsed AST.
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    /// Authoring name (unique within its scope).
    pub node_id: String,
    /// Path-qualified identifier, unique across the whole AST.
    pub unique_id: String,
    /// Registered node kind.
    pub node_type: String,
    /// Flattened configuration (sibling keys plus the explicit `config` map).
    pub config: Value,
    /// Edge table in authoring order, keyed by stripped edge name.
    pub edges: IndexMap<String, EdgeDescriptor>,
    /// 0 for roots, parent depth + 1 for nested nodes.
    pub depth: usize,
    pub parent: Option<NodeIndex>,
    /// Inline-nested nodes, in authoring order.
    pub children: Vec<NodeIndex>,
}

impl AstNode {
    /// Look up an edge by its stripped name.
    pub fn edge(&self, name: &str) -> Option<&EdgeDescriptor> {
        self.edges.get(name)
    }

    pub fn has_edge(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// Re-serialize this node's configuration to the authored shape.
    fn to_config_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("type".to_string(), Value::String(self.node_type.clone()));

        if let Some(config) = self.config.as_object() {
            if !config.is_empty() {
                out.insert("config".to_string(), self.config.clone());
            }
        }

        if !self.edges.is_empty() {
            let mut edges = Map::new();
            for descriptor in self.edges.values() {
                let key = if descriptor.is_optional {
                    format!("{}?", descriptor.name)
                } else {
                    descriptor.name.clone()
                };
                edges.insert(key, descriptor.target.to_value());
            }
            out.insert("edges".to_string(), Value::Object(edges));
        }

        Value::Object(out)
    }
}

/// A fully parsed and validated workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWorkflow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub initial_state: Option<Value>,
    nodes: Vec<AstNode>,
    roots: Vec<NodeIndex>,
}

impl ParsedWorkflow {
    pub(crate) fn new(
        id: String,
        name: String,
        version: String,
        initial_state: Option<Value>,
        nodes: Vec<AstNode>,
        roots: Vec<NodeIndex>,
    ) -> Self {
        Self {
            id,
            name,
            version,
            initial_state,
            nodes,
            roots,
        }
    }

    /// Every node in the arena (roots and nested), in construction order.
    pub fn nodes(&self) -> &[AstNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> &AstNode {
        &self.nodes[index]
    }

    /// Root-level nodes in authoring order.
    pub fn roots(&self) -> impl Iterator<Item = &AstNode> {
        self.roots.iter().map(|&index| &self.nodes[index])
    }

    pub fn root_indices(&self) -> &[NodeIndex] {
        &self.roots
    }

    /// Arena index of the first root-level node with this name.
    pub fn root_index_of(&self, name: &str) -> Option<NodeIndex> {
        self.roots
            .iter()
            .copied()
            .find(|&index| self.nodes[index].node_id == name)
    }

    pub fn root_node(&self, name: &str) -> Option<&AstNode> {
        self.root_index_of(name).map(|index| &self.nodes[index])
    }

    pub fn has_root(&self, name: &str) -> bool {
        self.root_index_of(name).is_some()
    }

    /// The entry point: the first node in authoring order.
    pub fn first_root(&self) -> Option<NodeIndex> {
        self.roots.first().copied()
    }

    /// Name of the root following `name` in authoring order, if any.
    pub fn next_in_order(&self, name: &str) -> Option<&str> {
        let position = self
            .roots
            .iter()
            .position(|&index| self.nodes[index].node_id == name)?;
        self.roots
            .get(position + 1)
            .map(|&index| self.nodes[index].node_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Re-serialize to the canonical definition form. Parsing the result
    /// yields an AST structurally equal to this one.
    pub fn to_definition(&self) -> WorkflowDefinition {
        let mut body = Map::new();
        for root in self.roots() {
            body.insert(root.node_id.clone(), root.to_config_value());
        }

        WorkflowDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            initial_state: self.initial_state.clone(),
            workflow: WorkflowBody::Map(body),
        }
    }
}
