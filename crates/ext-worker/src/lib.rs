//! Breadcrumb extension worker.
//!
//! The worker is the isolated process that hosts every extension's code. It
//! reads [`HostMessage`]s from stdin, drives the extension lifecycle through
//! a [`PluginLoader`], and reports back with [`WorkerMessage`]s on stdout.
//!
//! [`HostMessage`]: breadcrumb_ext_protocol::HostMessage
//! [`WorkerMessage`]: breadcrumb_ext_protocol::WorkerMessage

pub mod error;
pub mod js;
pub mod loader;
pub mod registry;
pub mod runtime;
pub mod services;

pub use error::{LoadError, PluginError};
pub use js::JsLoader;
pub use loader::{
    ActivationContext, Disposable, PluginLoader, PluginModule, Registration, SourceCache,
    Subscription, qualify_command, resolve_entry,
};
pub use registry::{CommandBinding, CommandRegistry};
pub use runtime::{Flow, LoadedExtension, WorkerRuntime};
pub use services::{Outbox, ServiceBroker, ServiceError};
