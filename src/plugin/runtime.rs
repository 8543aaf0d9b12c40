use std::fmt;

use crate::plugin::boundary::LoadBoundary;
use crate::plugin::manifest::{PluginDescriptor, PluginId};
use crate::plugin::module::PluginInstance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PluginStatus {
    #[default]
    Disabled,
    /// Enabled; resident or not is tracked by the context's boundary.
    Enabled,
    Loading,
    Unloading,
    Faulted,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PluginStatus::Disabled => "disabled",
            PluginStatus::Enabled => "enabled",
            PluginStatus::Loading => "loading",
            PluginStatus::Unloading => "unloading",
            PluginStatus::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Registry record binding a descriptor to its resident state.
///
/// `boundary` is `Some` exactly while the plugin's module is resident.
pub struct PluginContext {
    pub descriptor: PluginDescriptor,
    pub boundary: Option<LoadBoundary>,
    pub instance: Option<Box<dyn PluginInstance>>,
    pub last_error: Option<String>,
}

impl PluginContext {
    pub fn discover(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            boundary: None,
            instance: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &PluginId {
        &self.descriptor.id
    }

    pub fn status(&self) -> PluginStatus {
        self.descriptor.status
    }

    /// Path of the entry module relative to the package root.
    pub fn entry(&self) -> &str {
        &self.descriptor.entry
    }

    pub fn is_loaded(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn set_status(&mut self, status: PluginStatus) {
        self.descriptor.status = status;
        if status != PluginStatus::Faulted {
            self.last_error = None;
        }
    }

    pub fn fault(&mut self, message: impl Into<String>) {
        self.descriptor.status = PluginStatus::Faulted;
        self.last_error = Some(message.into());
    }

    pub fn display_name(&self) -> String {
        if self.descriptor.name.is_empty() {
            self.descriptor.id.to_string()
        } else {
            self.descriptor.name.clone()
        }
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("id", &self.descriptor.id)
            .field("status", &self.descriptor.status)
            .field("loaded", &self.is_loaded())
            .field("last_error", &self.last_error)
            .finish()
    }
}
