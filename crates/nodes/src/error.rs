//! Node- and registry-level error types.

use thiserror::Error;

/// Errors returned by a node's `execute` method or its factory.
///
/// The engine never unwinds on these — it converts them into a structured
/// error payload carried on the reserved `error` edge.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// The node's configuration failed the node's own validation.
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),

    /// The node ran but failed.
    #[error("node execution failed: {0}")]
    Execution(String),

    /// The factory could not produce an instance.
    #[error("failed to construct node: {0}")]
    Construction(String),
}

/// Errors produced by the node registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Metadata is missing one of the required `id`/`name`/`version` fields.
    #[error("invalid node metadata: {0}")]
    InvalidMetadata(String),

    /// The same node id was registered with a different version.
    #[error("node '{id}' already registered as version {existing}, refusing {attempted}")]
    VersionConflict {
        id: String,
        existing: String,
        attempted: String,
    },

    /// No factory registered under the requested type name.
    #[error("node type '{0}' is not registered")]
    NotFound(String),

    #[error(transparent)]
    Node(#[from] NodeError),
}
