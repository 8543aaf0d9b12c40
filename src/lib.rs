//! Plugin runtime for long-lived host processes.
//!
//! Plugins ship as `.afp` packages, load into isolated WASM boundaries in
//! dependency order, and are installed or removed through a staged pipeline
//! that replays at the next startup.

pub mod config;
pub mod error;
pub mod paths;
pub mod plugin;

pub use error::{PluginError, Result};
pub use paths::PathProvider;
pub use plugin::PluginManager;
