//! Extension lifecycle management.
//!
//! The [`ExtensionManager`] discovers extensions on disk, orders them by
//! declared dependencies, and drives activation through the
//! [`HostSupervisor`](crate::host::HostSupervisor).

mod discovery;
mod manager;
mod order;
mod services;
mod types;

pub use discovery::{DiscoveredExtension, scan_directory};
pub use manager::{ExtensionManager, ExtensionManagerBuilder, HOST_FAILED_MESSAGE};
pub use order::dependency_order;
pub use services::{ModalProvider, NoServices, TerminalProvider};
pub use types::{ExtensionError, ExtensionInfo, ExtensionSource, ExtensionStatus, ManagerEvent};
