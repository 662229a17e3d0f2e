//! `nodes` crate — the [`Node`] trait, edge maps, and the node registry.
//!
//! Every node — built-in and plug-in alike — must implement [`Node`]. The
//! engine crate dispatches execution through this trait object and interprets
//! the returned [`EdgeMap`] for routing.

pub mod builtin;
pub mod discovery;
pub mod edge;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use edge::{EdgeMap, EdgeValue, ERROR_EDGE, LOOP_EDGE};
pub use error::{NodeError, RegistryError};
pub use registry::{NodeRegistry, RegisterOptions};
pub use traits::{Node, NodeContext, NodeFactory, NodeMetadata};
