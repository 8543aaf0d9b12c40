#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::FileOptions;

use plugin_host::error::{PluginError, Result};
use plugin_host::paths::{PathProvider, RootPaths};
use plugin_host::plugin::module::{
    Contract, ExportedType, LinkedModules, LocalizationProvider, ModuleHost, ModuleInstance,
    PluginInit, PluginInstance,
};
use plugin_host::plugin::{LocalizationCatalog, PluginId, PluginManager};

/// Header-only module: valid WASM without imports.
pub const EMPTY_MODULE: &[u8] = b"\0asm\x01\0\0\0";

/// Ordered record of every call the fake runtime saw.
#[derive(Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn position(&self, entry: &str) -> usize {
        self.0
            .lock()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} never recorded"))
    }
}

/// How the fake runtime behaves for one plugin.
#[derive(Clone)]
pub struct Behavior {
    pub exports: Vec<ExportedType>,
    pub fail_enable: bool,
    /// Blocks the dispose hook this long.
    pub dispose_delay: Option<Duration>,
    /// Cancelled once the plugin instance has been created.
    pub cancel_on_create: Option<CancellationToken>,
    /// culture -> key -> text
    pub strings: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            exports: vec![export("Entry", Contract::Plugin, false)],
            fail_enable: false,
            dispose_delay: None,
            cancel_on_create: None,
            strings: BTreeMap::new(),
        }
    }
}

pub fn export(name: &str, contract: Contract, is_abstract: bool) -> ExportedType {
    ExportedType {
        name: name.to_string(),
        contract,
        is_abstract,
    }
}

/// In-process stand-in for the WASM runtime.
#[derive(Default)]
pub struct FakeHost {
    pub journal: Arc<Journal>,
    behaviors: Mutex<HashMap<PluginId, Behavior>>,
}

impl FakeHost {
    pub fn set(&self, id: &str, behavior: Behavior) {
        self.behaviors.lock().insert(PluginId::from(id), behavior);
    }
}

impl ModuleHost for FakeHost {
    fn instantiate(&self, modules: LinkedModules) -> Result<Arc<dyn ModuleInstance>> {
        if !modules.entry.bytes.starts_with(b"\0asm") {
            return Err(PluginError::load(&modules.plugin_id, "entry is not a wasm module"));
        }
        self.journal.record(format!("instantiate:{}", modules.plugin_id));

        let behavior = self
            .behaviors
            .lock()
            .get(&modules.plugin_id)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(FakeModule {
            plugin_id: modules.plugin_id,
            behavior,
            journal: Arc::clone(&self.journal),
        }))
    }
}

struct FakeModule {
    plugin_id: PluginId,
    behavior: Behavior,
    journal: Arc<Journal>,
}

impl ModuleInstance for FakeModule {
    fn exports(&self) -> Result<Vec<ExportedType>> {
        Ok(self.behavior.exports.clone())
    }

    fn create_plugin(
        self: Arc<Self>,
        type_name: &str,
        init: &PluginInit,
    ) -> Result<Box<dyn PluginInstance>> {
        assert_eq!(init.plugin_id, self.plugin_id);
        self.journal.record(format!("create:{}:{type_name}", self.plugin_id));
        if let Some(cancel) = &self.behavior.cancel_on_create {
            cancel.cancel();
        }
        Ok(Box::new(FakePlugin { module: self }))
    }

    fn localized_strings(
        self: Arc<Self>,
        _type_name: &str,
    ) -> Result<Arc<dyn LocalizationProvider>> {
        Ok(Arc::new(FakeStrings(self.behavior.strings.clone())))
    }
}

struct FakePlugin {
    module: Arc<FakeModule>,
}

impl PluginInstance for FakePlugin {
    fn on_enable(&self) -> Result<()> {
        self.module
            .journal
            .record(format!("enable:{}", self.module.plugin_id));
        if self.module.behavior.fail_enable {
            return Err(PluginError::module("enable hook failed"));
        }
        Ok(())
    }

    fn on_disable(&self) -> Result<()> {
        self.module
            .journal
            .record(format!("disable:{}", self.module.plugin_id));
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if let Some(delay) = self.module.behavior.dispose_delay {
            std::thread::sleep(delay);
        }
        self.module
            .journal
            .record(format!("dispose:{}", self.module.plugin_id));
        Ok(())
    }
}

struct FakeStrings(BTreeMap<String, BTreeMap<String, String>>);

impl LocalizationProvider for FakeStrings {
    fn strings(&self, culture: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.0.get(culture).cloned().unwrap_or_default())
    }
}

/// A host root in a temp directory plus the fakes wired to it.
pub struct Fixture {
    pub dir: TempDir,
    pub paths: Arc<RootPaths>,
    pub host: Arc<FakeHost>,
    pub catalog: Arc<LocalizationCatalog>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(RootPaths::new(dir.path()));
        Self {
            dir,
            paths,
            host: Arc::new(FakeHost::default()),
            catalog: Arc::new(LocalizationCatalog::new()),
        }
    }

    pub fn manager(&self) -> PluginManager {
        PluginManager::new(
            self.paths.clone(),
            self.host.clone(),
            self.catalog.clone(),
        )
        .unwrap()
    }

    /// Writes `<plugin-dir>/<id>.afp`.
    pub fn install(&self, id: &str, version: &str, deps: &[(&str, &str, bool)]) -> PathBuf {
        let path = self.paths.plugin_dir().join(format!("{id}.afp"));
        write_package(&path, id, version, deps);
        path
    }

    pub fn enable_on_disk(&self, ids: &[&str]) {
        let path = self.paths.enabled_file();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_string(ids).unwrap()).unwrap();
    }

    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.host.journal)
    }
}

pub fn manifest_json(id: &str, version: &str, deps: &[(&str, &str, bool)]) -> String {
    let dependencies: Vec<String> = deps
        .iter()
        .map(|(dep, range, optional)| {
            format!(r#"{{"id":"{dep}","version":"{range}","optional":{optional}}}"#)
        })
        .collect();
    format!(
        r#"{{"id":"{id}","name":"{id} plugin","version":"{version}","author":"tests","entry":"plugin.wasm","description":{{"en":"test plugin"}},"dependencies":[{}]}}"#,
        dependencies.join(",")
    )
}

/// Builds a real `.afp` archive with a manifest and an import-free entry.
pub fn write_package(path: &Path, id: &str, version: &str, deps: &[(&str, &str, bool)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
    zip.start_file("manifest.json", FileOptions::default()).unwrap();
    zip.write_all(manifest_json(id, version, deps).as_bytes())
        .unwrap();
    zip.start_file("plugin.wasm", FileOptions::default()).unwrap();
    zip.write_all(EMPTY_MODULE).unwrap();
    zip.finish().unwrap();
}
