use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{IoContext, PluginError, Result};
use crate::plugin::manifest::PluginId;
use crate::plugin::module::{LinkedModules, ModuleInstance, ModuleOrigin, ModuleSource};
use crate::plugin::package::{MODULE_EXTENSION, PackageArchive};
use crate::plugin::wasm;

/// Outcome of the boundary's resolution hook.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Found in the package's private dependency folder.
    Private(Arc<[u8]>),
    /// Not bundled; the caller falls through to shared modules.
    Unresolved,
}

/// Host-provided modules any plugin may import.
#[derive(Debug, Default)]
pub struct SharedModules {
    modules: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl SharedModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.wasm` in `dir`, keyed by file stem. A missing
    /// directory yields an empty set.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let shared = Self::new();
        if !dir.is_dir() {
            return Ok(shared);
        }

        for entry in fs::read_dir(dir).at(dir)? {
            let path = entry.at(dir)?.path();
            let is_module = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(MODULE_EXTENSION));
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if is_module && path.is_file() {
                let bytes = fs::read(&path).at(&path)?;
                shared.insert(name, bytes);
            }
        }

        Ok(shared)
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.modules.write().insert(name.into(), bytes.into());
    }

    pub fn get(&self, name: &str) -> Option<Arc<[u8]>> {
        self.modules.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of a boundary for queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryInfo {
    pub plugin_id: PluginId,
    pub package_path: PathBuf,
    pub private_modules: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

/// An isolated, independently unloadable code boundary for one package.
///
/// Private modules resolved here are cached per boundary, so two plugins
/// bundling different builds of the same module never share code.
pub struct LoadBoundary {
    plugin_id: PluginId,
    package: Mutex<PackageArchive>,
    private: Mutex<HashMap<String, Arc<[u8]>>>,
    module: Option<Arc<dyn ModuleInstance>>,
    loaded_at: DateTime<Utc>,
}

impl LoadBoundary {
    pub fn open(plugin_id: PluginId, package_path: &Path) -> Result<Self> {
        Ok(Self {
            plugin_id,
            package: Mutex::new(PackageArchive::open(package_path)?),
            private: Mutex::new(HashMap::new()),
            module: None,
            loaded_at: Utc::now(),
        })
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Resolution hook for a module name requested by code in this boundary.
    pub fn resolve(&self, name: &str) -> Result<Resolution> {
        if let Some(bytes) = self.private.lock().get(name) {
            return Ok(Resolution::Private(Arc::clone(bytes)));
        }

        let Some(bytes) = self.package.lock().private_module(name)? else {
            return Ok(Resolution::Unresolved);
        };

        debug!(plugin = %self.plugin_id, module = name, "resolved private module");
        let bytes: Arc<[u8]> = bytes.into();
        self.private.lock().insert(name.to_string(), Arc::clone(&bytes));
        Ok(Resolution::Private(bytes))
    }

    /// Reads the entry module and resolves its imports transitively:
    /// private modules first, then `shared`. Names neither can supply are
    /// left for the runtime (host functions, WASI).
    pub fn link(&self, entry: &str, shared: &SharedModules) -> Result<LinkedModules> {
        let bytes = self.package.lock().read(entry)?.ok_or_else(|| {
            PluginError::load(&self.plugin_id, format!("entry module '{entry}' not found in package"))
        })?;

        let entry = ModuleSource {
            name: entry.to_string(),
            bytes: bytes.into(),
            origin: ModuleOrigin::Entry,
        };

        let dependencies = self.link_imports(&entry, shared)?;

        Ok(LinkedModules {
            plugin_id: self.plugin_id.clone(),
            entry,
            dependencies,
        })
    }

    /// Walks the import graph below `entry` depth-first with an explicit
    /// stack, yielding every resolved module after the modules it imports.
    fn link_imports(
        &self,
        entry: &ModuleSource,
        shared: &SharedModules,
    ) -> Result<Vec<ModuleSource>> {
        let mut visited = HashSet::new();
        let mut linked = Vec::new();
        // (module, its imports, next import to visit); the entry has no module.
        let mut stack: Vec<(Option<ModuleSource>, Vec<String>, usize)> =
            vec![(None, self.imports_of(entry)?, 0)];

        while let Some((_, imports, next)) = stack.last_mut() {
            let Some(name) = imports.get(*next).cloned() else {
                if let Some((Some(source), _, _)) = stack.pop() {
                    linked.push(source);
                }
                continue;
            };
            *next += 1;

            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(source) = self.resolve_source(name, shared)? else {
                continue;
            };
            let imports = self.imports_of(&source)?;
            stack.push((Some(source), imports, 0));
        }

        Ok(linked)
    }

    fn imports_of(&self, module: &ModuleSource) -> Result<Vec<String>> {
        wasm::imported_modules(&module.bytes).map_err(|err| {
            PluginError::load(&self.plugin_id, format!("module '{}': {err}", module.name))
        })
    }

    fn resolve_source(&self, name: String, shared: &SharedModules) -> Result<Option<ModuleSource>> {
        let source = match self.resolve(&name)? {
            Resolution::Private(bytes) => ModuleSource {
                name,
                bytes,
                origin: ModuleOrigin::Private,
            },
            Resolution::Unresolved => match shared.get(&name) {
                Some(bytes) => ModuleSource {
                    name,
                    bytes,
                    origin: ModuleOrigin::Shared,
                },
                None => return Ok(None),
            },
        };
        Ok(Some(source))
    }

    pub fn attach(&mut self, module: Arc<dyn ModuleInstance>) {
        self.module = Some(module);
    }

    pub fn module(&self) -> Option<&Arc<dyn ModuleInstance>> {
        self.module.as_ref()
    }

    pub fn info(&self) -> BoundaryInfo {
        let mut private_modules: Vec<String> = self.private.lock().keys().cloned().collect();
        private_modules.sort();

        BoundaryInfo {
            plugin_id: self.plugin_id.clone(),
            package_path: self.package.lock().path().to_path_buf(),
            private_modules,
            loaded_at: self.loaded_at,
        }
    }

    /// Tears the boundary down. Returns `false` if module code is still
    /// reachable afterwards, i.e. someone kept a handle into it.
    pub fn unload(mut self) -> bool {
        self.private.lock().clear();

        let Some(module) = self.module.take() else {
            return true;
        };
        let weak = Arc::downgrade(&module);
        drop(module);
        weak.upgrade().is_none()
    }
}
