use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::plugin::manifest::PluginId;
use crate::plugin::module::LocalizationProvider;

/// Host registry that plugins contribute localized strings to.
pub trait LocalizationRegistry: Send + Sync {
    fn register(&self, owner: &PluginId, provider: Arc<dyn LocalizationProvider>);

    /// Drops every provider `owner` registered.
    fn unregister(&self, owner: &PluginId);
}

/// In-memory registry resolving keys across plugin-supplied providers.
#[derive(Default)]
pub struct LocalizationCatalog {
    providers: RwLock<HashMap<PluginId, Vec<Arc<dyn LocalizationProvider>>>>,
}

impl LocalizationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().values().map(Vec::len).sum()
    }

    pub fn owners(&self) -> Vec<PluginId> {
        let mut owners: Vec<PluginId> = self.providers.read().keys().cloned().collect();
        owners.sort();
        owners
    }

    /// Looks `key` up for `culture`, falling back from `de-AT` to `de` to
    /// `en`. Owners are consulted in id order.
    pub fn lookup(&self, culture: &str, key: &str) -> Option<String> {
        let providers = self.providers.read();
        let mut owners: Vec<&PluginId> = providers.keys().collect();
        owners.sort();

        for candidate in fallback_cultures(culture) {
            for owner in &owners {
                for provider in &providers[*owner] {
                    match provider.strings(&candidate) {
                        Ok(strings) => {
                            if let Some(value) = strings.get(key) {
                                return Some(value.clone());
                            }
                        }
                        Err(err) => {
                            warn!(plugin = %owner, culture = %candidate, "localized strings failed: {err}");
                        }
                    }
                }
            }
        }

        None
    }
}

impl LocalizationRegistry for LocalizationCatalog {
    fn register(&self, owner: &PluginId, provider: Arc<dyn LocalizationProvider>) {
        self.providers
            .write()
            .entry(owner.clone())
            .or_default()
            .push(provider);
    }

    fn unregister(&self, owner: &PluginId) {
        self.providers.write().remove(owner);
    }
}

fn fallback_cultures(culture: &str) -> Vec<String> {
    let mut cultures = vec![culture.to_string()];
    if let Some((language, _)) = culture.split_once(['-', '_']) {
        cultures.push(language.to_string());
    }
    if !cultures.iter().any(|c| c == "en") {
        cultures.push("en".to_string());
    }
    cultures
}
