use crate::plugin::installer::InstallerOperation;
use crate::plugin::manifest::PluginId;
use crate::plugin::runtime::PluginStatus;

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Loaded {
        plugin_id: PluginId,
        status: PluginStatus,
    },
    Unloaded {
        plugin_id: PluginId,
        status: PluginStatus,
    },
    /// `status` is that of the currently installed version, if any.
    InstallScheduled {
        plugin_id: PluginId,
        status: Option<PluginStatus>,
    },
}

impl PluginEvent {
    pub fn plugin_id(&self) -> &PluginId {
        match self {
            PluginEvent::Loaded { plugin_id, .. }
            | PluginEvent::Unloaded { plugin_id, .. }
            | PluginEvent::InstallScheduled { plugin_id, .. } => plugin_id,
        }
    }
}

/// Progress notifications published while pending operations replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerEvent {
    OperationExecuting(InstallerOperation),
}
