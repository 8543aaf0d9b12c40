use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::plugin::manifest::PluginId;

pub type Result<T> = std::result::Result<T, PluginError>;

/// Failures raised by the plugin core.
///
/// Per-plugin variants carry the offending id so a propagated error can be
/// traced back to a package without extra context.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Malformed manifest, version, or version range.
    #[error("parse error in {context}: {message}")]
    Parse { context: String, message: String },

    /// Missing or version-incompatible required dependency.
    #[error("plugin {plugin}: {message}")]
    Dependency { plugin: PluginId, message: String },

    #[error("dependency cycle detected at plugin {plugin}")]
    Cycle { plugin: PluginId },

    /// Absent or ambiguous entry type, or a module that failed to instantiate.
    #[error("failed to load plugin {plugin}: {message}")]
    Load { plugin: PluginId, message: String },

    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    /// A transition that conflicts with the state of other loaded plugins.
    #[error("plugin {plugin}: {message}")]
    Concurrency { plugin: PluginId, message: String },

    /// Failure reported by module code or by the module runtime.
    #[error("module error: {0}")]
    Module(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl PluginError {
    pub fn parse(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn dependency(plugin: &PluginId, message: impl Into<String>) -> Self {
        Self::Dependency {
            plugin: plugin.clone(),
            message: message.into(),
        }
    }

    pub fn load(plugin: &PluginId, message: impl ToString) -> Self {
        Self::Load {
            plugin: plugin.clone(),
            message: message.to_string(),
        }
    }

    pub fn concurrency(plugin: &PluginId, message: impl Into<String>) -> Self {
        Self::Concurrency {
            plugin: plugin.clone(),
            message: message.into(),
        }
    }

    pub fn module(message: impl ToString) -> Self {
        Self::Module(message.to_string())
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Attaches a path to bare `io::Error`s.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|err| PluginError::io(path, err))
    }
}
