use std::path::{Path, PathBuf};

use crate::plugin::manifest::PluginId;

/// Supplies every filesystem location the plugin core touches.
pub trait PathProvider: Send + Sync {
    /// Directory every other location lives under.
    fn root(&self) -> PathBuf;

    /// Live installed packages.
    fn plugin_dir(&self) -> PathBuf;

    /// Packages waiting for the next replay.
    fn staging_dir(&self) -> PathBuf;

    /// Parent of every plugin's private data directory.
    fn data_dir(&self) -> PathBuf;

    fn enabled_file(&self) -> PathBuf;

    fn pending_operations_file(&self) -> PathBuf;

    /// Host-provided modules any plugin may import.
    fn shared_modules_dir(&self) -> PathBuf;

    fn plugin_data_dir(&self, id: &PluginId) -> PathBuf {
        self.data_dir().join(id.as_str())
    }
}

/// Conventional layout under a single root.
#[derive(Debug, Clone)]
pub struct RootPaths {
    root: PathBuf,
}

impl RootPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathProvider for RootPaths {
    fn root(&self) -> PathBuf {
        self.root.clone()
    }

    fn plugin_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn enabled_file(&self) -> PathBuf {
        self.root.join("enabled.json")
    }

    fn pending_operations_file(&self) -> PathBuf {
        self.staging_dir().join("pending-operations.json")
    }

    fn shared_modules_dir(&self) -> PathBuf {
        self.root.join("shared")
    }
}

/// Lexically resolves `.` and `..` so containment checks work on paths
/// that do not exist.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// True when `path` lies strictly inside `dir`.
pub fn is_within(path: &Path, dir: &Path) -> bool {
    let path = normalize(path);
    let dir = normalize(dir);
    path != dir && path.starts_with(&dir)
}
