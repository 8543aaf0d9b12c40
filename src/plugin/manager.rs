use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IoContext, PluginError, Result};
use crate::paths::PathProvider;
use crate::plugin::boundary::{BoundaryInfo, LoadBoundary, SharedModules};
use crate::plugin::dependency::{check_dependencies, dependency_order};
use crate::plugin::enabled::EnabledSet;
use crate::plugin::events::PluginEvent;
use crate::plugin::installer::{Installer, InstallerOperation};
use crate::plugin::localization::LocalizationRegistry;
use crate::plugin::manifest::{PluginDescriptor, PluginId};
use crate::plugin::module::{self, LocalizationProvider, ModuleHost, PluginInit, PluginInstance};
use crate::plugin::package::{self, PACKAGE_EXTENSION};
use crate::plugin::runtime::{PluginContext, PluginStatus};

const EVENT_CAPACITY: usize = 128;

/// Everything a successful load hands back to the registry.
struct Resident {
    boundary: LoadBoundary,
    instance: Box<dyn PluginInstance>,
    localization: Vec<Arc<dyn LocalizationProvider>>,
}

/// Authoritative index of discovered plugins and the sole writer of their
/// runtime state.
///
/// Load and unload transitions for one plugin are serialized by a lock
/// dedicated to its id; different plugins transition independently.
pub struct PluginManager {
    paths: Arc<dyn PathProvider>,
    host: Arc<dyn ModuleHost>,
    shared: Arc<SharedModules>,
    localization: Arc<dyn LocalizationRegistry>,
    installer: Installer,
    enabled: EnabledSet,
    index: RwLock<HashMap<PluginId, PluginContext>>,
    locks: Mutex<HashMap<PluginId, Arc<AsyncMutex<()>>>>,
    events: broadcast::Sender<PluginEvent>,
}

impl PluginManager {
    pub fn new(
        paths: Arc<dyn PathProvider>,
        host: Arc<dyn ModuleHost>,
        localization: Arc<dyn LocalizationRegistry>,
    ) -> Result<Self> {
        let enabled = EnabledSet::open(paths.enabled_file())?;
        let shared = SharedModules::load_dir(&paths.shared_modules_dir())?;
        let installer = Installer::from_paths(paths.as_ref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        debug!(
            plugins = %paths.plugin_dir().display(),
            shared_modules = shared.len(),
            "plugin manager ready"
        );

        Ok(Self {
            paths,
            host,
            shared: Arc::new(shared),
            localization,
            installer,
            enabled,
            index: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    /// Rescans the plugin directory and rebuilds the index.
    ///
    /// Malformed packages are logged and skipped. Contexts of resident
    /// plugins keep their boundary and instance, so a plugin is never
    /// resident without being indexed.
    pub async fn discover(&self) -> Result<Vec<PluginDescriptor>> {
        let dir = self.paths.plugin_dir();
        let scanned = tokio::task::spawn_blocking(move || scan_packages(&dir))
            .await
            .map_err(PluginError::module)??;

        let mut descriptors = Vec::with_capacity(scanned.len());
        let mut index = self.index.write();
        let mut previous = std::mem::take(&mut *index);

        for mut descriptor in scanned {
            if index.contains_key(&descriptor.id) {
                warn!(
                    plugin = %descriptor.id,
                    path = ?descriptor.install_path,
                    "duplicate plugin id, skipping package"
                );
                continue;
            }

            descriptor.status = if self.enabled.contains(&descriptor.id) {
                PluginStatus::Enabled
            } else {
                PluginStatus::Disabled
            };

            let mut context = PluginContext::discover(descriptor.clone());
            if let Some(old) = previous.remove(&descriptor.id)
                && old.is_loaded()
            {
                context.boundary = old.boundary;
                context.instance = old.instance;
            }
            descriptors.push(descriptor);
            index.insert(context.id().clone(), context);
        }

        for (id, old) in previous {
            if old.is_loaded() {
                warn!(plugin = %id, "package of resident plugin disappeared");
                index.insert(id, old);
            }
        }

        info!(count = descriptors.len(), "plugin discovery complete");
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(descriptors)
    }

    /// Discovers, then loads every enabled plugin in dependency order.
    ///
    /// Per-plugin failures leave that plugin Faulted and the batch going.
    /// A dependency cycle aborts the batch before anything loads.
    pub async fn load_all(&self, cancel: &CancellationToken) -> Result<()> {
        self.discover().await?;

        let order = {
            let mut index = self.index.write();
            let (order, excluded) = plan_load(&index)?;
            for (id, message) in excluded {
                warn!(plugin = %id, "{message}");
                if let Some(context) = index.get_mut(&id) {
                    context.fault(message);
                }
            }
            order
        };

        for id in order {
            if cancel.is_cancelled() {
                info!("plugin loading cancelled");
                return Err(PluginError::Cancelled);
            }
            if let Err(err) = self.load_one(&id, cancel).await {
                error!(plugin = %id, "plugin failed to load: {err}");
            }
        }

        Ok(())
    }

    /// Loads one plugin into its own boundary. No-op when the plugin is
    /// unknown or already resident.
    pub async fn load_one(&self, id: &PluginId, cancel: &CancellationToken) -> Result<()> {
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let descriptor = {
            let mut index = self.index.write();
            let Some(context) = index.get_mut(id) else {
                warn!(plugin = %id, "load requested for unknown plugin");
                return Ok(());
            };
            if context.is_loaded() {
                return Ok(());
            }
            context.set_status(PluginStatus::Loading);
            context.descriptor.clone()
        };

        let resident = match self.instantiate(descriptor).await {
            Ok(resident) => resident,
            Err(err) => {
                if let Some(context) = self.index.write().get_mut(id) {
                    context.fault(err.to_string());
                }
                return Err(err);
            }
        };

        let Resident {
            boundary,
            instance,
            localization,
        } = resident;
        let contributions = localization.len();
        let orphaned = match self.index.write().get_mut(id) {
            Some(context) => {
                context.boundary = Some(boundary);
                context.instance = Some(instance);
                context.set_status(PluginStatus::Enabled);
                None
            }
            None => Some((instance, boundary)),
        };
        if let Some((instance, boundary)) = orphaned {
            warn!(plugin = %id, "plugin vanished while loading");
            release(id, Some(instance), boundary).await;
            return Err(PluginError::NotFound(id.clone()));
        }

        for provider in localization {
            self.localization.register(id, provider);
        }

        info!(plugin = %id, localization = contributions, "plugin loaded");
        let _ = self.events.send(PluginEvent::Loaded {
            plugin_id: id.clone(),
            status: PluginStatus::Enabled,
        });
        Ok(())
    }

    async fn instantiate(&self, descriptor: PluginDescriptor) -> Result<Resident> {
        let (ok, missing) = self.validate_dependencies(&descriptor.id)?;
        if !ok {
            return Err(PluginError::dependency(&descriptor.id, missing.join("; ")));
        }

        let package_path = descriptor
            .install_path
            .clone()
            .ok_or_else(|| PluginError::load(&descriptor.id, "plugin has no installed package"))?;
        let init = PluginInit {
            plugin_id: descriptor.id.clone(),
            data_dir: self.paths.plugin_data_dir(&descriptor.id),
        };
        let host = Arc::clone(&self.host);
        let shared = Arc::clone(&self.shared);

        tokio::task::spawn_blocking(move || {
            build_resident(&descriptor, &package_path, &init, host.as_ref(), &shared)
        })
        .await
        .map_err(PluginError::module)?
    }

    /// Takes a plugin out of the host process.
    ///
    /// Refused while another loaded plugin requires this one. Afterwards the
    /// plugin is still enabled, just not resident.
    pub async fn unload(&self, id: &PluginId, cancel: &CancellationToken) -> Result<()> {
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let (instance, boundary) = {
            let mut index = self.index.write();
            let context = index
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.clone()))?;
            if !context.is_loaded() {
                return Ok(());
            }

            let dependents = loaded_dependents(&index, id);
            if !dependents.is_empty() {
                return Err(PluginError::concurrency(
                    id,
                    format!(
                        "still required by loaded plugin(s) {}; unload them first",
                        dependents.join(", ")
                    ),
                ));
            }

            let Some(context) = index.get_mut(id) else {
                return Err(PluginError::NotFound(id.clone()));
            };
            context.set_status(PluginStatus::Unloading);
            (context.instance.take(), context.boundary.take())
        };

        self.localization.unregister(id);
        if let Some(boundary) = boundary {
            release(id, instance, boundary).await;
        }

        if let Some(context) = self.index.write().get_mut(id) {
            context.set_status(PluginStatus::Enabled);
        }
        info!(plugin = %id, "plugin unloaded");
        let _ = self.events.send(PluginEvent::Unloaded {
            plugin_id: id.clone(),
            status: PluginStatus::Enabled,
        });
        Ok(())
    }

    /// Tears a plugin down without waiting for its lock or its dispose hook.
    fn force_unload(&self, id: &PluginId) {
        let taken = {
            let mut index = self.index.write();
            index.get_mut(id).map(|context| {
                let taken = (context.instance.take(), context.boundary.take());
                context.set_status(PluginStatus::Enabled);
                taken
            })
        };
        self.localization.unregister(id);

        if let Some((instance, boundary)) = taken {
            drop(instance);
            if let Some(boundary) = boundary
                && !boundary.unload()
            {
                warn!(plugin = %id, "module still referenced after forced unload");
            }
        }

        warn!(plugin = %id, "plugin forcibly unloaded");
        let _ = self.events.send(PluginEvent::Unloaded {
            plugin_id: id.clone(),
            status: PluginStatus::Enabled,
        });
    }

    /// Adds `id` to the enabled set. A no-op when already enabled.
    pub async fn enable(&self, id: &PluginId) -> Result<()> {
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;

        if !self.enabled.insert(id.clone()) {
            debug!(plugin = %id, "plugin already enabled");
            return Ok(());
        }
        self.enabled.persist().await?;
        info!(plugin = %id, "plugin enabled");

        self.notify(id, PluginStatus::Enabled, |instance| instance.on_enable())
            .await;
        Ok(())
    }

    /// Removes `id` from the enabled set. A no-op when already disabled.
    pub async fn disable(&self, id: &PluginId) -> Result<()> {
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;

        if !self.enabled.remove(id) {
            debug!(plugin = %id, "plugin already disabled");
            return Ok(());
        }
        self.enabled.persist().await?;
        info!(plugin = %id, "plugin disabled");

        self.notify(id, PluginStatus::Disabled, |instance| instance.on_disable())
            .await;
        Ok(())
    }

    /// Applies `status` and, when the plugin is resident, runs `callback`
    /// on its instance. A failing callback faults the plugin.
    async fn notify<F>(&self, id: &PluginId, status: PluginStatus, callback: F)
    where
        F: FnOnce(&dyn PluginInstance) -> Result<()> + Send + 'static,
    {
        let instance = {
            let mut index = self.index.write();
            let Some(context) = index.get_mut(id) else {
                return;
            };
            context.set_status(status);
            context.instance.take()
        };
        let Some(instance) = instance else {
            return;
        };

        let outcome = tokio::task::spawn_blocking(move || {
            let result = callback(&*instance);
            (instance, result)
        })
        .await;

        let mut index = self.index.write();
        let Some(context) = index.get_mut(id) else {
            return;
        };
        match outcome {
            Ok((instance, result)) => {
                context.instance = Some(instance);
                if let Err(err) = result {
                    error!(plugin = %id, "{status} callback failed: {err}");
                    context.fault(err.to_string());
                }
            }
            Err(err) => {
                error!(plugin = %id, "{status} callback panicked: {err}");
                context.fault(err.to_string());
            }
        }
    }

    /// Checks every required dependency against the discovered plugins.
    pub fn validate_dependencies(&self, id: &PluginId) -> Result<(bool, Vec<String>)> {
        let index = self.index.read();
        let context = index
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        Ok(check_dependencies(&context.descriptor, |dependency| {
            index
                .get(dependency)
                .map(|found| found.descriptor.version.clone())
        }))
    }

    /// Stages `package_path` for installation at the next replay. Live
    /// plugin state is untouched.
    pub async fn schedule_install(&self, package_path: &Path) -> Result<InstallerOperation> {
        let path = package_path.to_path_buf();
        let descriptor = tokio::task::spawn_blocking(move || package::read_manifest(&path))
            .await
            .map_err(PluginError::module)??;

        let staging = self.paths.staging_dir();
        tokio::fs::create_dir_all(&staging).await.at(&staging)?;
        let staged = staging.join(format!("{}.{PACKAGE_EXTENSION}", Uuid::new_v4()));
        tokio::fs::copy(package_path, &staged).await.at(&staged)?;

        let destination = self
            .paths
            .plugin_dir()
            .join(format!("{}.{PACKAGE_EXTENSION}", descriptor.id));

        let operation = match self.installer.schedule_install(&staged, &destination).await {
            Ok(operation) => operation,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&staged).await {
                    warn!(path = %staged.display(), "failed to remove staged package: {cleanup}");
                }
                return Err(err);
            }
        };

        let status = self.get_status(&descriptor.id).ok();
        let _ = self.events.send(PluginEvent::InstallScheduled {
            plugin_id: descriptor.id,
            status,
        });
        Ok(operation)
    }

    /// Unloads if resident, disables, then stages removal of the package
    /// and the plugin's data directory.
    pub async fn uninstall(
        &self,
        id: &PluginId,
        cancel: &CancellationToken,
    ) -> Result<InstallerOperation> {
        let package_path = {
            let index = self.index.read();
            let context = index
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.clone()))?;
            context.descriptor.install_path.clone()
        }
        .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        if self.is_loaded(id) {
            self.unload(id, cancel).await?;
        }
        self.disable(id).await?;

        self.installer
            .schedule_uninstall(id, &package_path, &self.paths.plugin_data_dir(id))
            .await
    }

    /// Unloads every resident plugin, dependents first. A plugin that does
    /// not unload within `timeout` is torn down forcibly.
    pub async fn shutdown(&self, timeout: Duration) {
        let order = self.unload_order();
        if order.is_empty() {
            return;
        }
        info!(count = order.len(), "unloading plugins");

        for id in order {
            let cancel = CancellationToken::new();
            match tokio::time::timeout(timeout, self.unload(&id, &cancel)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(plugin = %id, "unload failed during shutdown: {err}");
                    self.force_unload(&id);
                }
                Err(_) => {
                    cancel.cancel();
                    warn!(plugin = %id, timeout_ms = timeout.as_millis() as u64, "unload timed out");
                    self.force_unload(&id);
                }
            }
        }
    }

    /// Resident plugins, each after every resident plugin requiring it.
    fn unload_order(&self) -> Vec<PluginId> {
        let index = self.index.read();
        let mut loaded: Vec<&PluginDescriptor> = index
            .values()
            .filter(|context| context.is_loaded())
            .map(|context| &context.descriptor)
            .collect();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));

        let resident: HashSet<&PluginId> = loaded.iter().map(|descriptor| &descriptor.id).collect();
        let trimmed: Vec<PluginDescriptor> = loaded
            .iter()
            .map(|&descriptor| {
                let mut descriptor = descriptor.clone();
                descriptor
                    .dependencies
                    .retain(|dependency| resident.contains(&dependency.id));
                descriptor
            })
            .collect();
        let refs: Vec<&PluginDescriptor> = trimmed.iter().collect();

        match dependency_order(&refs) {
            Ok(mut order) => {
                order.reverse();
                order
            }
            Err(err) => {
                warn!("cannot order resident plugins for unload: {err}");
                loaded.iter().map(|descriptor| descriptor.id.clone()).collect()
            }
        }
    }

    /// Descriptor snapshot when resident, `None` when known but not loaded.
    pub fn get_loaded(&self, id: &PluginId) -> Result<Option<PluginDescriptor>> {
        let index = self.index.read();
        let context = index
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        Ok(context.is_loaded().then(|| context.descriptor.clone()))
    }

    pub fn get_status(&self, id: &PluginId) -> Result<PluginStatus> {
        self.index
            .read()
            .get(id)
            .map(PluginContext::status)
            .ok_or_else(|| PluginError::NotFound(id.clone()))
    }

    pub fn get_load_boundary(&self, id: &PluginId) -> Result<Option<BoundaryInfo>> {
        let index = self.index.read();
        let context = index
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        Ok(context.boundary.as_ref().map(LoadBoundary::info))
    }

    /// All indexed plugins, sorted by id.
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        let mut plugins: Vec<PluginDescriptor> = self
            .index
            .read()
            .values()
            .map(|context| context.descriptor.clone())
            .collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    pub fn is_loaded(&self, id: &PluginId) -> bool {
        self.index
            .read()
            .get(id)
            .is_some_and(PluginContext::is_loaded)
    }

    pub fn is_enabled(&self, id: &PluginId) -> bool {
        self.enabled.contains(id)
    }

    pub fn enabled_ids(&self) -> Vec<PluginId> {
        self.enabled.ids()
    }

    pub fn plugin_data_dir(&self, id: &PluginId) -> PathBuf {
        self.paths.plugin_data_dir(id)
    }

    pub fn last_error(&self, id: &PluginId) -> Option<String> {
        self.index
            .read()
            .get(id)
            .and_then(|context| context.last_error.clone())
    }

    pub fn summary_notification(&self) -> String {
        let index = self.index.read();
        let loaded = index.values().filter(|context| context.is_loaded()).count();
        let faulted = index
            .values()
            .filter(|context| context.status() == PluginStatus::Faulted)
            .count();
        format!(
            "plugins: {} discovered, {loaded} loaded, {faulted} faulted",
            index.len()
        )
    }

    pub fn error_notifications(&self) -> Vec<String> {
        let index = self.index.read();
        let mut notices: Vec<String> = index
            .values()
            .filter(|context| context.status() == PluginStatus::Faulted)
            .map(|context| {
                let reason = context.last_error.as_deref().unwrap_or("unknown error");
                format!("plugin {} ({}): {reason}", context.display_name(), context.id())
            })
            .collect();
        notices.sort();
        notices
    }

    fn plugin_lock(&self, id: &PluginId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(id.clone()).or_default())
    }
}

/// Reads every package in `dir`, sorted by file name. Unreadable packages
/// are logged and skipped.
fn scan_packages(dir: &Path) -> Result<Vec<PluginDescriptor>> {
    if !dir.is_dir() {
        debug!(path = %dir.display(), "plugin directory does not exist");
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .at(dir)?
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(err) => {
                warn!(path = %dir.display(), "skipping unreadable entry: {err}");
                None
            }
        })
        .filter(|path| package::is_package(path))
        .collect();
    paths.sort();

    let mut descriptors = Vec::with_capacity(paths.len());
    for path in paths {
        match package::read_manifest(&path) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(err) => warn!(path = %path.display(), "skipping malformed package: {err}"),
        }
    }
    Ok(descriptors)
}

/// Splits the enabled plugins into a load order and the ones excluded
/// because a required dependency will not be loaded.
fn plan_load(
    index: &HashMap<PluginId, PluginContext>,
) -> Result<(Vec<PluginId>, Vec<(PluginId, String)>)> {
    let mut candidates: HashMap<&PluginId, &PluginDescriptor> = index
        .values()
        .filter(|context| !context.is_loaded() && context.status() == PluginStatus::Enabled)
        .map(|context| (context.id(), &context.descriptor))
        .collect();
    let resident: HashSet<&PluginId> = index
        .values()
        .filter(|context| context.is_loaded())
        .map(PluginContext::id)
        .collect();

    let mut excluded = Vec::new();
    loop {
        let blocked: Vec<(PluginId, String)> = candidates
            .values()
            .filter_map(|descriptor| {
                descriptor
                    .required_dependencies()
                    .find(|dependency| {
                        !candidates.contains_key(&dependency.id)
                            && !resident.contains(&dependency.id)
                    })
                    .map(|dependency| {
                        (
                            descriptor.id.clone(),
                            format!(
                                "plugin {}: requires {} which is not installed or not enabled",
                                descriptor.id, dependency.id
                            ),
                        )
                    })
            })
            .collect();
        if blocked.is_empty() {
            break;
        }
        for (id, _) in &blocked {
            candidates.remove(id);
        }
        excluded.extend(blocked);
    }

    // Resident dependencies are already satisfied; only order the rest.
    let trimmed: Vec<PluginDescriptor> = candidates
        .values()
        .map(|&descriptor| {
            let mut descriptor = descriptor.clone();
            descriptor
                .dependencies
                .retain(|dependency| !resident.contains(&dependency.id));
            descriptor
        })
        .collect();
    let mut refs: Vec<&PluginDescriptor> = trimmed.iter().collect();
    refs.sort_by(|a, b| a.id.cmp(&b.id));

    let order = dependency_order(&refs).inspect_err(|err| {
        error!("cannot order enabled plugins: {err}");
    })?;
    Ok((order, excluded))
}

fn loaded_dependents(index: &HashMap<PluginId, PluginContext>, id: &PluginId) -> Vec<String> {
    let mut dependents: Vec<String> = index
        .values()
        .filter(|context| context.id() != id && context.is_loaded())
        .filter(|context| {
            context
                .descriptor
                .required_dependencies()
                .any(|dependency| &dependency.id == id)
        })
        .map(|context| context.id().to_string())
        .collect();
    dependents.sort();
    dependents
}

fn build_resident(
    descriptor: &PluginDescriptor,
    package_path: &Path,
    init: &PluginInit,
    host: &dyn ModuleHost,
    shared: &SharedModules,
) -> Result<Resident> {
    let id = &descriptor.id;
    let mut boundary = LoadBoundary::open(id.clone(), package_path)?;
    let linked = boundary.link(&descriptor.entry, shared)?;
    let module = host.instantiate(linked)?;

    let exports = module.exports()?;
    let entry = module::entry_type(&exports).map_err(|message| PluginError::load(id, message))?;
    let instance = Arc::clone(&module).create_plugin(&entry.name, init)?;

    let localization = module::localization_types(&exports)
        .map(|export| Arc::clone(&module).localized_strings(&export.name))
        .collect::<Result<Vec<_>>>()?;

    boundary.attach(module);
    Ok(Resident {
        boundary,
        instance,
        localization,
    })
}

/// Disposes the instance, then drops the boundary and checks that no
/// handle into the module survived.
async fn release(id: &PluginId, instance: Option<Box<dyn PluginInstance>>, boundary: LoadBoundary) {
    if let Some(instance) = instance {
        let disposed = tokio::task::spawn_blocking(move || instance.dispose()).await;
        match disposed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(plugin = %id, "dispose failed: {err}"),
            Err(err) => warn!(plugin = %id, "dispose panicked: {err}"),
        }
    }

    if !boundary.unload() {
        warn!(plugin = %id, "module still referenced after unload, possible leak");
    }
}
