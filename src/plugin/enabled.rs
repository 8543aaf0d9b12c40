use std::collections::HashSet;
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{IoContext, PluginError, Result};
use crate::plugin::manifest::PluginId;

/// Thread-safe set of unique values.
#[derive(Debug)]
pub struct ConcurrentSet<T> {
    items: RwLock<HashSet<T>>,
}

impl<T> Default for ConcurrentSet<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashSet::new()),
        }
    }
}

impl<T: Eq + Hash + Clone> ConcurrentSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the value was already present.
    pub fn insert(&self, value: T) -> bool {
        self.items.write().insert(value)
    }

    /// Returns `false` if the value was absent.
    pub fn remove(&self, value: &T) -> bool {
        self.items.write().remove(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.read().contains(value)
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().iter().cloned().collect()
    }
}

impl<T: Eq + Hash + Clone> FromIterator<T> for ConcurrentSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: RwLock::new(iter.into_iter().collect()),
        }
    }
}

/// The persisted set of plugin ids that should be loaded at startup.
///
/// Mutation and persistence are separate steps; a crash between them loses
/// the mutation. Concurrent writers are serialized, and each writes the
/// snapshot current when it gets the file.
#[derive(Debug)]
pub struct EnabledSet {
    path: PathBuf,
    ids: ConcurrentSet<PluginId>,
    write: AsyncMutex<()>,
}

impl EnabledSet {
    /// Reads the set from `path`; a missing file is an empty set.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let ids = if path.exists() {
            let raw = fs::read_to_string(&path).at(&path)?;
            let ids: Vec<PluginId> = serde_json::from_str(&raw)
                .map_err(|err| PluginError::parse(path.display().to_string(), err))?;
            ids.into_iter().collect()
        } else {
            ConcurrentSet::new()
        };

        debug!(path = %path.display(), count = ids.len(), "loaded enabled plugin set");
        Ok(Self {
            path,
            ids,
            write: AsyncMutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, id: PluginId) -> bool {
        self.ids.insert(id)
    }

    pub fn remove(&self, id: &PluginId) -> bool {
        self.ids.remove(id)
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> Vec<PluginId> {
        let mut ids = self.ids.snapshot();
        ids.sort();
        ids
    }

    /// Writes the current snapshot via a temp file and rename.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.write.lock().await;
        let json = serde_json::to_string_pretty(&self.ids())
            .map_err(|err| PluginError::parse(self.path.display().to_string(), err))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.at(parent)?;
        }
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, json).await.at(&temp)?;
        tokio::fs::rename(&temp, &self.path).await.at(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn insert_and_remove_are_idempotent() {
        let set = ConcurrentSet::new();

        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.contains(&"a"));
        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert!(set.is_empty());
    }

    #[test]
    fn concurrent_inserts_keep_every_value() {
        let set = Arc::new(ConcurrentSet::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for i in 0..100 {
                        set.insert(worker * 100 + i);
                        set.insert(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(set.len(), 800);
    }

    #[tokio::test]
    async fn persists_sorted_ids_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("enabled.json");

        let set = EnabledSet::open(&path).unwrap();
        set.insert(PluginId::from("zeta"));
        set.insert(PluginId::from("alpha"));
        set.persist().await.unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let stored: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, vec!["alpha", "zeta"]);

        let reloaded = EnabledSet::open(&path).unwrap();
        assert!(reloaded.contains(&PluginId::from("zeta")));
        assert_eq!(reloaded.ids().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_persists_keep_every_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enabled.json");
        let set = Arc::new(EnabledSet::open(&path).unwrap());

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let set = Arc::clone(&set);
                tokio::spawn(async move {
                    set.insert(PluginId::new(format!("p{i}")));
                    set.persist().await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored: Vec<String> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.len(), 64);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enabled.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(EnabledSet::open(&path), Err(PluginError::Parse { .. })));
    }
}
