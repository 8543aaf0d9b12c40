use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::paths::PathProvider;

const APP_NAME: &str = "plugin-host";

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub plugins: PluginsConfig,
    pub logging: LoggingConfig,
}

/// Directory layout. Relative entries resolve against `root`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginsConfig {
    pub root: String,
    pub plugin_dir: String,
    pub staging_dir: String,
    pub data_dir: String,
    pub shared_modules: String,
    pub enabled_file: String,
    pub pending_operations_file: String,
    pub unload_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    pub directory: String,
}

impl HostConfig {
    /// Load configuration with layering: defaults → user config → `explicit`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(DEFAULTS).context("built-in defaults")?;

        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", APP_NAME) {
            let config_path = proj_dirs.config_dir().join("config.toml");
            if config_path.exists() {
                merge(&mut table, read_table(&config_path)?);
            }
        }
        if let Some(path) = explicit {
            merge(&mut table, read_table(path)?);
        }

        let mut config: HostConfig = table.try_into().context("invalid configuration")?;
        config.resolve_root()?;
        Ok(config)
    }

    /// Parses `overlay` on top of the built-in defaults.
    pub fn from_toml(overlay: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(DEFAULTS)?;
        merge(&mut table, toml::from_str(overlay)?);

        let mut config: HostConfig = table.try_into()?;
        config.resolve_root()?;
        Ok(config)
    }

    fn resolve_root(&mut self) -> Result<()> {
        let root = self.plugins.root.trim();
        let resolved = if root.is_empty() {
            directories::ProjectDirs::from("", "", APP_NAME)
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or_else(|| anyhow!("cannot determine a data directory, set plugins.root"))?
        } else {
            expand_tilde(root)?
        };
        self.plugins.root = resolved.to_string_lossy().into_owned();
        Ok(())
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.plugins.unload_timeout_ms)
    }

    pub fn log_dir(&self) -> PathBuf {
        if self.logging.directory.trim().is_empty() {
            self.root().join("logs")
        } else {
            self.under_root(&self.logging.directory)
        }
    }

    fn under_root(&self, path: &str) -> PathBuf {
        let path = expand_tilde(path).unwrap_or_else(|_| PathBuf::from(path));
        if path.is_absolute() {
            path
        } else {
            self.root().join(path)
        }
    }
}

impl PathProvider for HostConfig {
    fn root(&self) -> PathBuf {
        PathBuf::from(&self.plugins.root)
    }

    fn plugin_dir(&self) -> PathBuf {
        self.under_root(&self.plugins.plugin_dir)
    }

    fn staging_dir(&self) -> PathBuf {
        self.under_root(&self.plugins.staging_dir)
    }

    fn data_dir(&self) -> PathBuf {
        self.under_root(&self.plugins.data_dir)
    }

    fn enabled_file(&self) -> PathBuf {
        self.under_root(&self.plugins.enabled_file)
    }

    fn pending_operations_file(&self) -> PathBuf {
        self.under_root(&self.plugins.pending_operations_file)
    }

    fn shared_modules_dir(&self) -> PathBuf {
        self.under_root(&self.plugins.shared_modules)
    }
}

const DEFAULTS: &str = include_str!("../config/default.toml");

fn read_table(path: &Path) -> Result<toml::Table> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Overlays `overlay` onto `base`, recursing into nested tables.
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn expand_tilde(path: &str) -> Result<PathBuf> {
    if !path.starts_with('~') {
        return Ok(PathBuf::from(path));
    }

    let home = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(PathBuf::from(path.replacen('~', &home.to_string_lossy(), 1)))
}
