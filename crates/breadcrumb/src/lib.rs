//! Breadcrumb extension host
//!
//! Runs third-party extensions in an isolated worker process
//! (`breadcrumb-ext-worker`) and manages their lifecycle from the shell side.
//!
//! # Layers
//!
//! - [`manifest`]: `extension.json` parsing and the host API compatibility check
//! - [`host`]: the [`HostSupervisor`](host::HostSupervisor) that owns the worker
//!   process (spawn, request correlation, timeouts, restart with backoff)
//! - [`extensions`]: the [`ExtensionManager`](extensions::ExtensionManager) that
//!   discovers extensions and drives activation in dependency order
//! - [`config`]: layered host settings

pub mod config;
pub mod extensions;
pub mod host;
pub mod manifest;

pub use config::HostSettings;
pub use extensions::{ExtensionError, ExtensionInfo, ExtensionManager, ExtensionStatus};
pub use host::{HostError, HostSupervisor};
pub use manifest::Manifest;
