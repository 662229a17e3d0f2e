//! Filesystem discovery of node plug-ins.
//!
//! Scans a directory for platform dynamic libraries that export a
//! `create_node_factory` symbol, loads each one, and registers the factory it
//! returns. A bad file is logged and skipped; discovery never aborts on a
//! single broken module. Loaded libraries are kept alive for the lifetime of
//! the [`NodeDiscovery`] so factory vtables stay valid.

#![allow(unsafe_code)]

use std::fs::read_dir;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::{Library, Symbol};
use thiserror::Error;
use tracing::{info, warn};

use crate::registry::{NodeRegistry, RegisterOptions};
use crate::traits::NodeFactory;

/// Symbol every node library must export:
/// `#[no_mangle] pub fn create_node_factory() -> Arc<dyn NodeFactory>`.
const FACTORY_SYMBOL: &[u8] = b"create_node_factory";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot read plug-in directory {0}: {1}")]
    DirectoryRead(PathBuf, String),
}

/// Summary of one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Number of factories registered this pass.
    pub registered: usize,
    /// Files that failed to load or register, with the failure message.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Loads node libraries and keeps them resident.
#[derive(Default)]
pub struct NodeDiscovery {
    libraries: Mutex<Vec<Library>>,
}

impl NodeDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `directory` and register every loadable node factory.
    ///
    /// # Errors
    /// Only when the directory itself cannot be read; per-file failures are
    /// collected in the report instead.
    pub fn discover(
        &self,
        registry: &NodeRegistry,
        directory: &Path,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        let entries = read_dir(directory)
            .map_err(|e| DiscoveryError::DirectoryRead(directory.to_path_buf(), e.to_string()))?;

        let mut report = DiscoveryReport::default();

        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !is_node_library(&path) {
                continue;
            }

            match self.load_factory(&path) {
                Ok(factory) => {
                    let id = factory.metadata().id.clone();
                    match registry.register(factory, RegisterOptions::default()) {
                        Ok(()) => {
                            info!(node_id = %id, path = %path.display(), "discovered node");
                            report.registered += 1;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "discovered node rejected");
                            report.skipped.push((path, e.to_string()));
                        }
                    }
                }
                Err(message) => {
                    warn!(path = %path.display(), error = %message, "failed to load node library");
                    report.skipped.push((path, message));
                }
            }
        }

        Ok(report)
    }

    fn load_factory(&self, path: &Path) -> Result<Arc<dyn NodeFactory>, String> {
        // A misbehaving plug-in may panic inside its constructor.
        let result = panic::catch_unwind(|| unsafe {
            let library =
                Library::new(path).map_err(|e| format!("failed to load library: {e}"))?;

            let factory = {
                let create: Symbol<fn() -> Arc<dyn NodeFactory>> = library
                    .get(FACTORY_SYMBOL)
                    .map_err(|e| format!("missing create_node_factory symbol: {e}"))?;
                create()
            };

            self.libraries.lock().unwrap().push(library);
            Ok::<_, String>(factory)
        });

        match result {
            Ok(inner) => inner,
            Err(_) => Err("panic while loading node library".to_string()),
        }
    }
}

fn is_node_library(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("so") | Some("dylib") | Some("dll")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_library_paths_are_filtered() {
        assert!(!is_node_library(Path::new("/tmp/definitely-missing.txt")));
        assert!(!is_node_library(Path::new("/tmp/missing-dir")));
    }

    #[test]
    fn unreadable_directory_is_an_error() {
        let discovery = NodeDiscovery::new();
        let registry = NodeRegistry::new();
        let result = discovery.discover(&registry, Path::new("/definitely/not/a/dir"));
        assert!(matches!(result, Err(DiscoveryError::DirectoryRead(..))));
    }
}
