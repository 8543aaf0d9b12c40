use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plugin::manifest::PluginId;

/// Capability contracts a module can export implementations of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contract {
    /// The plugin entry type.
    Plugin,
    /// Supplies additional localized strings.
    LocalizedStrings,
}

/// One row of a module's registration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedType {
    pub name: String,
    pub contract: Contract,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
}

/// Constructor arguments handed to a plugin entry type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInit {
    pub plugin_id: PluginId,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    Entry,
    /// Bundled in the package's `lib/` folder, private to one boundary.
    Private,
    /// Provided by the host and shared across boundaries.
    Shared,
}

#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub origin: ModuleOrigin,
}

/// Everything a runtime needs to instantiate one boundary's code.
#[derive(Debug, Clone)]
pub struct LinkedModules {
    pub plugin_id: PluginId,
    pub entry: ModuleSource,
    /// Resolved imports, dependencies before the modules importing them.
    pub dependencies: Vec<ModuleSource>,
}

/// Instantiates module code. The WASM backend lives in `extism_host`.
pub trait ModuleHost: Send + Sync {
    fn instantiate(&self, modules: LinkedModules) -> Result<Arc<dyn ModuleInstance>>;
}

/// Instantiated module code resident in one load boundary.
pub trait ModuleInstance: Send + Sync {
    fn exports(&self) -> Result<Vec<ExportedType>>;

    fn create_plugin(
        self: Arc<Self>,
        type_name: &str,
        init: &PluginInit,
    ) -> Result<Box<dyn PluginInstance>>;

    fn localized_strings(
        self: Arc<Self>,
        type_name: &str,
    ) -> Result<Arc<dyn LocalizationProvider>>;
}

/// The plugin base contract.
pub trait PluginInstance: Send + Sync {
    fn on_enable(&self) -> Result<()>;
    fn on_disable(&self) -> Result<()>;
    fn dispose(&self) -> Result<()>;
}

pub trait LocalizationProvider: Send + Sync {
    fn strings(&self, culture: &str) -> Result<BTreeMap<String, String>>;
}

/// Picks the single concrete entry type out of a registration table.
pub fn entry_type(exports: &[ExportedType]) -> std::result::Result<&ExportedType, String> {
    let mut candidates = exports
        .iter()
        .filter(|export| export.contract == Contract::Plugin && !export.is_abstract);

    match (candidates.next(), candidates.next()) {
        (Some(entry), None) => Ok(entry),
        (None, _) => Err("module exports no concrete plugin entry type".to_string()),
        (Some(first), Some(second)) => Err(format!(
            "module exports more than one plugin entry type ({}, {}, ...)",
            first.name, second.name
        )),
    }
}

pub fn localization_types(exports: &[ExportedType]) -> impl Iterator<Item = &ExportedType> {
    exports
        .iter()
        .filter(|export| export.contract == Contract::LocalizedStrings && !export.is_abstract)
}
