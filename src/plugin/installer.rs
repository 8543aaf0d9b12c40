use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IoContext, PluginError, Result};
use crate::paths::{self, PathProvider};
use crate::plugin::events::InstallerEvent;
use crate::plugin::manifest::PluginId;
use crate::plugin::package;

const EVENT_CAPACITY: usize = 64;

/// One lock per manifest file, shared by every `Installer` in the process.
static MANIFEST_LOCKS: LazyLock<parking_lot::Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>> =
    LazyLock::new(Default::default);

fn manifest_lock(path: &Path) -> Arc<AsyncMutex<()>> {
    let mut locks = MANIFEST_LOCKS.lock();
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Install,
    Uninstall,
}

/// A durable install or uninstall request, applied at the next replay.
///
/// For uninstalls `source_path` is the installed package and
/// `destination_path` the plugin's private data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub plugin_id: PluginId,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub scheduled_at_utc: DateTime<Utc>,
}

/// Staged install/uninstall pipeline backed by a JSON manifest.
///
/// Every read-modify-write of the manifest happens under the process-wide
/// lock for its path, so concurrent schedules never lose an entry.
#[derive(Debug)]
pub struct Installer {
    manifest_path: PathBuf,
    root: PathBuf,
    lock: Arc<AsyncMutex<()>>,
    events: broadcast::Sender<InstallerEvent>,
}

impl Installer {
    /// `root` bounds the package paths accepted by `schedule_uninstall`.
    pub fn new(manifest_path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let manifest_path = manifest_path.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            lock: manifest_lock(&manifest_path),
            manifest_path,
            root: root.into(),
            events,
        }
    }

    pub fn from_paths(paths: &dyn PathProvider) -> Self {
        Self::new(paths.pending_operations_file(), paths.root())
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallerEvent> {
        self.events.subscribe()
    }

    /// Appends an install of the package at `source`. The package manifest
    /// must parse, otherwise scheduling is refused.
    pub async fn schedule_install(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<InstallerOperation> {
        let package_path = source.to_path_buf();
        let descriptor =
            tokio::task::spawn_blocking(move || package::read_manifest(&package_path))
                .await
                .map_err(PluginError::module)??;

        info!(
            plugin = %descriptor.id,
            version = %descriptor.version,
            source = %source.display(),
            "scheduling install"
        );

        let operation = InstallerOperation {
            kind: OperationKind::Install,
            plugin_id: descriptor.id,
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            scheduled_at_utc: Utc::now(),
        };
        self.append(operation.clone()).await?;
        Ok(operation)
    }

    /// Appends an uninstall of `plugin_id`. The package must exist and lie
    /// within the host root.
    pub async fn schedule_uninstall(
        &self,
        plugin_id: &PluginId,
        package_path: &Path,
        data_dir: &Path,
    ) -> Result<InstallerOperation> {
        // Symlinks are resolved so a link under the root cannot reach outside it.
        let resolved = fs::canonicalize(package_path).await.at(package_path)?;
        let root = match fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(_) => paths::normalize(&self.root),
        };
        if !paths::is_within(&resolved, &root) {
            return Err(PluginError::io(
                package_path,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("package lies outside {}", self.root.display()),
                ),
            ));
        }

        info!(plugin = %plugin_id, package = %package_path.display(), "scheduling uninstall");

        let operation = InstallerOperation {
            kind: OperationKind::Uninstall,
            plugin_id: plugin_id.clone(),
            source_path: package_path.to_path_buf(),
            destination_path: data_dir.to_path_buf(),
            scheduled_at_utc: Utc::now(),
        };
        self.append(operation.clone()).await?;
        Ok(operation)
    }

    /// Operations waiting for replay, in the order they will be applied.
    pub async fn pending(&self) -> Result<Vec<InstallerOperation>> {
        let _guard = self.lock.lock().await;
        let mut operations = self.read_operations().await?;
        operations.sort_by_key(|operation| operation.scheduled_at_utc);
        Ok(operations)
    }

    /// Applies every pending operation in timestamp order. Returns the
    /// number applied.
    ///
    /// Each applied operation is dropped from the manifest before the next
    /// one runs, and the manifest is deleted once it is empty. On failure or
    /// cancellation the operations not yet applied stay in place and retry
    /// on the next call.
    pub async fn execute_pending(&self, cancel: &CancellationToken) -> Result<usize> {
        let _guard = self.lock.lock().await;
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let mut operations = self.read_operations().await?;
        if operations.is_empty() {
            self.remove_manifest().await?;
            return Ok(0);
        }
        operations.sort_by_key(|operation| operation.scheduled_at_utc);

        for (index, operation) in operations.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(path = %self.manifest_path.display(), "pending operations interrupted");
                return Err(PluginError::Cancelled);
            }

            let _ = self
                .events
                .send(InstallerEvent::OperationExecuting(operation.clone()));

            let applied = match operation.kind {
                OperationKind::Install => apply_install(operation).await,
                OperationKind::Uninstall => apply_uninstall(operation).await,
            };
            if let Err(err) = applied {
                error!(
                    plugin = %operation.plugin_id,
                    kind = ?operation.kind,
                    "pending operation failed, batch will retry: {err}"
                );
                return Err(err);
            }

            let remaining = &operations[index + 1..];
            if remaining.is_empty() {
                self.remove_manifest().await?;
            } else {
                self.write_operations(remaining).await?;
            }
        }

        info!(count = operations.len(), "pending operations applied");
        Ok(operations.len())
    }

    async fn append(&self, operation: InstallerOperation) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut operations = self.read_operations().await?;
        operations.push(operation);
        self.write_operations(&operations).await
    }

    async fn read_operations(&self) -> Result<Vec<InstallerOperation>> {
        let path = &self.manifest_path;
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PluginError::io(path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&raw).map_err(|err| PluginError::parse(path.display().to_string(), err))
    }

    async fn write_operations(&self, operations: &[InstallerOperation]) -> Result<()> {
        let path = &self.manifest_path;
        let json = serde_json::to_string_pretty(operations)
            .map_err(|err| PluginError::parse(path.display().to_string(), err))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.at(parent)?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json).await.at(&temp)?;
        fs::rename(&temp, path).await.at(path)?;

        debug!(path = %path.display(), count = operations.len(), "pending operations persisted");
        Ok(())
    }

    async fn remove_manifest(&self) -> Result<()> {
        match fs::remove_file(&self.manifest_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PluginError::io(&self.manifest_path, err)),
        }
    }
}

async fn apply_install(operation: &InstallerOperation) -> Result<()> {
    let source = &operation.source_path;
    let destination = &operation.destination_path;

    if !fs::try_exists(source).await.at(source)? {
        warn!(
            plugin = %operation.plugin_id,
            source = %source.display(),
            "staged package already gone, skipping install"
        );
        return Ok(());
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await.at(parent)?;
    }
    if fs::try_exists(destination).await.at(destination)? {
        fs::remove_file(destination).await.at(destination)?;
    }

    if let Err(err) = fs::rename(source, destination).await {
        debug!(source = %source.display(), "rename failed ({err}), copying instead");
        fs::copy(source, destination).await.at(destination)?;
        fs::remove_file(source).await.at(source)?;
    }

    info!(
        plugin = %operation.plugin_id,
        destination = %destination.display(),
        "plugin installed"
    );
    Ok(())
}

async fn apply_uninstall(operation: &InstallerOperation) -> Result<()> {
    let package = &operation.source_path;
    let data_dir = &operation.destination_path;
    let mut removed = false;

    if fs::try_exists(package).await.at(package)? {
        fs::remove_file(package).await.at(package)?;
        removed = true;
    }
    if fs::try_exists(data_dir).await.at(data_dir)? {
        fs::remove_dir_all(data_dir).await.at(data_dir)?;
        removed = true;
    }

    if removed {
        info!(plugin = %operation.plugin_id, "plugin uninstalled");
    } else {
        warn!(
            plugin = %operation.plugin_id,
            package = %package.display(),
            "plugin already gone, skipping uninstall"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::Duration;
    use tempfile::{TempDir, tempdir};
    use zip::ZipWriter;
    use zip::write::FileOptions;

    use super::*;

    fn write_package(path: &Path, id: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());
        zip.start_file("manifest.json", FileOptions::default()).unwrap();
        write!(
            zip,
            r#"{{"id":"{id}","name":"{id}","version":"1.0.0","entry":"plugin.wasm"}}"#
        )
        .unwrap();
        zip.finish().unwrap();
    }

    fn installer(dir: &TempDir) -> Installer {
        Installer::new(
            dir.path().join("staging").join("pending-operations.json"),
            dir.path(),
        )
    }

    #[tokio::test]
    async fn replay_applies_exactly_once() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staging").join("one.afp");
        let installed = dir.path().join("plugins").join("spell.afp");
        write_package(&staged, "spell");

        let operation = installer(&dir)
            .schedule_install(&staged, &installed)
            .await
            .unwrap();
        assert_eq!(operation.plugin_id, PluginId::from("spell"));

        // A fresh installer stands in for the next process.
        let restarted = installer(&dir);
        let cancel = CancellationToken::new();
        assert_eq!(restarted.execute_pending(&cancel).await.unwrap(), 1);
        assert!(installed.is_file());
        assert!(!staged.exists());
        assert!(!restarted.manifest_path().exists());

        assert_eq!(restarted.execute_pending(&cancel).await.unwrap(), 0);
        assert!(installed.is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_schedules_keep_every_entry() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("staging").join("a.afp");
        let second = dir.path().join("staging").join("b.afp");
        write_package(&first, "alpha");
        write_package(&second, "beta");

        let left = installer(&dir);
        let right = installer(&dir);
        let plugins = dir.path().join("plugins");
        let alpha_dest = plugins.join("alpha.afp");
        let beta_dest = plugins.join("beta.afp");
        let (a, b) = tokio::join!(
            left.schedule_install(&first, &alpha_dest),
            right.schedule_install(&second, &beta_dest),
        );
        a.unwrap();
        b.unwrap();

        let pending = left.pending().await.unwrap();
        let mut ids: Vec<&str> = pending.iter().map(|op| op.plugin_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["alpha", "beta"]);

        let applied = right
            .execute_pending(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(applied, 2);
    }

    #[tokio::test]
    async fn replays_in_timestamp_order() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        let staged = dir.path().join("staging").join("new.afp");
        let installed = dir.path().join("plugins").join("spell.afp");
        let data = dir.path().join("data").join("spell");
        write_package(&staged, "spell");
        write_package(&installed, "spell");
        std::fs::create_dir_all(&data).unwrap();

        // Appended install first, but the uninstall is older.
        let now = Utc::now();
        let operations = vec![
            InstallerOperation {
                kind: OperationKind::Install,
                plugin_id: PluginId::from("spell"),
                source_path: staged.clone(),
                destination_path: installed.clone(),
                scheduled_at_utc: now,
            },
            InstallerOperation {
                kind: OperationKind::Uninstall,
                plugin_id: PluginId::from("spell"),
                source_path: installed.clone(),
                destination_path: data.clone(),
                scheduled_at_utc: now - Duration::seconds(5),
            },
        ];
        installer.write_operations(&operations).await.unwrap();

        let mut events = installer.subscribe();
        installer
            .execute_pending(&CancellationToken::new())
            .await
            .unwrap();

        let InstallerEvent::OperationExecuting(first) = events.recv().await.unwrap();
        let InstallerEvent::OperationExecuting(second) = events.recv().await.unwrap();
        assert_eq!(first.kind, OperationKind::Uninstall);
        assert_eq!(second.kind, OperationKind::Install);
        assert!(installed.is_file());
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn vanished_targets_are_skipped() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        let now = Utc::now();
        installer
            .write_operations(&[
                InstallerOperation {
                    kind: OperationKind::Install,
                    plugin_id: PluginId::from("ghost"),
                    source_path: dir.path().join("staging").join("gone.afp"),
                    destination_path: dir.path().join("plugins").join("ghost.afp"),
                    scheduled_at_utc: now,
                },
                InstallerOperation {
                    kind: OperationKind::Uninstall,
                    plugin_id: PluginId::from("ghost"),
                    source_path: dir.path().join("plugins").join("ghost.afp"),
                    destination_path: dir.path().join("data").join("ghost"),
                    scheduled_at_utc: now,
                },
            ])
            .await
            .unwrap();

        let applied = installer
            .execute_pending(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(applied, 2);
        assert!(!installer.manifest_path().exists());
    }

    #[tokio::test]
    async fn retry_after_partial_failure_does_not_reapply() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        let installed = dir.path().join("plugins").join("spell.afp");
        let data = dir.path().join("data").join("spell");
        let upgrade = dir.path().join("staging").join("spell-2.afp");
        let other = dir.path().join("staging").join("other.afp");
        write_package(&installed, "spell");
        write_package(&upgrade, "spell");
        write_package(&other, "other");
        // A regular file where the last destination needs a directory.
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();

        let now = Utc::now();
        installer
            .write_operations(&[
                InstallerOperation {
                    kind: OperationKind::Uninstall,
                    plugin_id: PluginId::from("spell"),
                    source_path: installed.clone(),
                    destination_path: data.clone(),
                    scheduled_at_utc: now - Duration::seconds(10),
                },
                InstallerOperation {
                    kind: OperationKind::Install,
                    plugin_id: PluginId::from("spell"),
                    source_path: upgrade.clone(),
                    destination_path: installed.clone(),
                    scheduled_at_utc: now - Duration::seconds(5),
                },
                InstallerOperation {
                    kind: OperationKind::Install,
                    plugin_id: PluginId::from("other"),
                    source_path: other.clone(),
                    destination_path: blocker.join("other.afp"),
                    scheduled_at_utc: now,
                },
            ])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        assert!(installer.execute_pending(&cancel).await.is_err());
        assert!(installed.is_file());
        let left = installer.pending().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].plugin_id, PluginId::from("other"));

        std::fs::remove_file(&blocker).unwrap();
        assert_eq!(installer.execute_pending(&cancel).await.unwrap(), 1);
        assert!(installed.is_file());
        assert!(blocker.join("other.afp").is_file());
        assert!(!installer.manifest_path().exists());
    }

    #[tokio::test]
    async fn cancelled_replay_keeps_the_manifest() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staging").join("one.afp");
        write_package(&staged, "spell");
        let installer = installer(&dir);
        installer
            .schedule_install(&staged, &dir.path().join("plugins").join("spell.afp"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            installer.execute_pending(&cancel).await,
            Err(PluginError::Cancelled)
        ));
        assert_eq!(installer.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_package_is_refused() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("bogus.afp");
        std::fs::write(&bogus, b"not a zip").unwrap();
        let installer = installer(&dir);

        let result = installer
            .schedule_install(&bogus, &dir.path().join("plugins").join("x.afp"))
            .await;
        assert!(matches!(result, Err(PluginError::Parse { .. })));
        assert!(!installer.manifest_path().exists());
    }

    #[tokio::test]
    async fn uninstall_requires_a_package_inside_the_root() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let foreign = outside.path().join("spell.afp");
        write_package(&foreign, "spell");
        let installer = installer(&dir);
        let id = PluginId::from("spell");
        let data = dir.path().join("data").join("spell");

        assert!(
            installer
                .schedule_uninstall(&id, &foreign, &data)
                .await
                .is_err()
        );
        assert!(
            installer
                .schedule_uninstall(&id, &dir.path().join("plugins").join("spell.afp"), &data)
                .await
                .is_err()
        );

        let installed = dir.path().join("plugins").join("spell.afp");
        write_package(&installed, "spell");
        let operation = installer
            .schedule_uninstall(&id, &installed, &data)
            .await
            .unwrap();
        assert_eq!(operation.kind, OperationKind::Uninstall);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uninstall_rejects_links_that_leave_the_root() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let foreign = outside.path().join("spell.afp");
        write_package(&foreign, "spell");
        let link = dir.path().join("plugins").join("spell.afp");
        std::fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&foreign, &link).unwrap();

        let installer = installer(&dir);
        let result = installer
            .schedule_uninstall(
                &PluginId::from("spell"),
                &link,
                &dir.path().join("data").join("spell"),
            )
            .await;
        assert!(matches!(result, Err(PluginError::Io { .. })));
        assert!(installer.pending().await.unwrap().is_empty());
    }

    #[test]
    fn operation_json_shape() {
        let operation = InstallerOperation {
            kind: OperationKind::Uninstall,
            plugin_id: PluginId::from("spell"),
            source_path: PathBuf::from("/p/spell.afp"),
            destination_path: PathBuf::from("/d/spell"),
            scheduled_at_utc: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let value = serde_json::to_value(&operation).unwrap();
        assert_eq!(value["type"], "uninstall");
        assert_eq!(value["plugin_id"], "spell");
        assert_eq!(value["scheduled_at_utc"], "2024-05-01T10:00:00Z");
    }
}
