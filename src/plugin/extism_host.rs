use std::collections::BTreeMap;
use std::sync::Arc;

use extism::{Manifest, Plugin, Wasm};
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::error::{PluginError, Result};
use crate::plugin::host_fns;
use crate::plugin::manifest::PluginId;
use crate::plugin::module::{
    ExportedType, LinkedModules, LocalizationProvider, ModuleHost, ModuleInstance, PluginInit,
    PluginInstance,
};

const MAIN_MODULE: &str = "main";

/// Runs plugin modules as extism WASM instances, one instance per boundary.
#[derive(Debug, Clone, Copy)]
pub struct ExtismHost {
    with_wasi: bool,
}

impl ExtismHost {
    pub fn new(with_wasi: bool) -> Self {
        Self { with_wasi }
    }
}

impl Default for ExtismHost {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ModuleHost for ExtismHost {
    fn instantiate(&self, modules: LinkedModules) -> Result<Arc<dyn ModuleInstance>> {
        let mut wasm: Vec<Wasm> = modules
            .dependencies
            .iter()
            .map(|module| Wasm::data(module.bytes.to_vec()).with_name(module.name.clone()))
            .collect();
        wasm.push(Wasm::data(modules.entry.bytes.to_vec()).with_name(MAIN_MODULE));

        debug!(
            plugin = %modules.plugin_id,
            linked = modules.dependencies.len(),
            "instantiating wasm module"
        );

        let manifest = Manifest::new(wasm);
        let plugin = Plugin::new(
            &manifest,
            host_fns::functions(&modules.plugin_id),
            self.with_wasi,
        )
        .map_err(|err| PluginError::load(&modules.plugin_id, err))?;

        Ok(Arc::new(ExtismModule {
            plugin_id: modules.plugin_id,
            plugin: Mutex::new(plugin),
        }))
    }
}

struct ExtismModule {
    plugin_id: PluginId,
    plugin: Mutex<Plugin>,
}

impl ExtismModule {
    fn call(&self, function: &str, input: &str) -> Result<String> {
        let mut plugin = self.plugin.lock();
        let output: String = plugin
            .call(function, input)
            .map_err(|err| PluginError::module(format!("{}::{function}: {err}", self.plugin_id)))?;
        Ok(output)
    }

    /// Lifecycle hooks are optional exports.
    fn call_hook(&self, function: &str, type_name: &str) -> Result<()> {
        if !self.plugin.lock().function_exists(function) {
            return Ok(());
        }
        self.call(function, type_name).map(drop)
    }
}

impl ModuleInstance for ExtismModule {
    fn exports(&self) -> Result<Vec<ExportedType>> {
        let table = self.call("describe", "")?;
        serde_json::from_str(&table).map_err(|err| {
            PluginError::parse(format!("registration table of {}", self.plugin_id), err)
        })
    }

    fn create_plugin(
        self: Arc<Self>,
        type_name: &str,
        init: &PluginInit,
    ) -> Result<Box<dyn PluginInstance>> {
        let input = json!({
            "type": type_name,
            "plugin_id": init.plugin_id,
            "data_dir": init.data_dir,
        });
        self.call("create", &input.to_string())?;

        Ok(Box::new(ExtismPlugin {
            module: self,
            type_name: type_name.to_string(),
        }))
    }

    fn localized_strings(
        self: Arc<Self>,
        type_name: &str,
    ) -> Result<Arc<dyn LocalizationProvider>> {
        Ok(Arc::new(ExtismStrings {
            module: self,
            type_name: type_name.to_string(),
        }))
    }
}

struct ExtismPlugin {
    module: Arc<ExtismModule>,
    type_name: String,
}

impl PluginInstance for ExtismPlugin {
    fn on_enable(&self) -> Result<()> {
        self.module.call_hook("enable", &self.type_name)
    }

    fn on_disable(&self) -> Result<()> {
        self.module.call_hook("disable", &self.type_name)
    }

    fn dispose(&self) -> Result<()> {
        self.module.call_hook("dispose", &self.type_name)
    }
}

struct ExtismStrings {
    module: Arc<ExtismModule>,
    type_name: String,
}

impl LocalizationProvider for ExtismStrings {
    fn strings(&self, culture: &str) -> Result<BTreeMap<String, String>> {
        let input = json!({ "type": self.type_name, "culture": culture });
        let output = self.module.call("localized_strings", &input.to_string())?;
        serde_json::from_str(&output).map_err(|err| {
            PluginError::parse(format!("localized strings of {}", self.module.plugin_id), err)
        })
    }
}
