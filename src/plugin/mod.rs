pub mod boundary;
pub mod dependency;
pub mod enabled;
pub mod events;
#[cfg(feature = "wasm")]
pub mod extism_host;
#[cfg(feature = "wasm")]
pub mod host_fns;
pub mod installer;
pub mod localization;
pub mod manager;
pub mod manifest;
pub mod module;
pub mod package;
pub mod runtime;
pub mod wasm;

pub use events::{InstallerEvent, PluginEvent};
pub use installer::{Installer, InstallerOperation, OperationKind};
pub use localization::{LocalizationCatalog, LocalizationRegistry};
pub use manager::PluginManager;
pub use manifest::{DependencyDeclaration, PluginDescriptor, PluginId, VersionRange};
pub use runtime::PluginStatus;
