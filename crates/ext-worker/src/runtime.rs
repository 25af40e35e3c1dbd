//! The worker runtime: loaded extensions, registered commands, and the
//! handlers for every host message.
//!
//! Handlers take `&self` so the message loop can run them side by side on
//! one thread. Lifecycle messages for the same extension are serialized by
//! a per-extension lock; everything else overlaps.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::rc::Rc;

use breadcrumb_ext_protocol::{HostMessage, WorkerMessage};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::error::PluginError;
use crate::loader::{ActivationContext, PluginLoader, PluginModule, Subscription, resolve_entry};
use crate::registry::{CommandBinding, CommandRegistry};
use crate::services::Outbox;

/// What the message loop should do after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// An activated extension.
pub struct LoadedExtension {
    pub id: String,
    pub path: PathBuf,
    module: Box<dyn PluginModule>,
    context: RefCell<ActivationContext>,
}

/// Hosts every extension loaded into this process.
pub struct WorkerRuntime<L> {
    loader: RefCell<L>,
    extensions: RefCell<HashMap<String, Rc<LoadedExtension>>>,
    lifecycle: RefCell<HashMap<String, Rc<AsyncMutex<()>>>>,
    commands: RefCell<CommandRegistry>,
    outbox: Outbox,
}

impl<L: PluginLoader> WorkerRuntime<L> {
    pub fn new(loader: L, outbox: Outbox) -> Self {
        Self {
            loader: RefCell::new(loader),
            extensions: RefCell::new(HashMap::new()),
            lifecycle: RefCell::new(HashMap::new()),
            commands: RefCell::new(CommandRegistry::new()),
            outbox,
        }
    }

    /// Handle one message, turning a panic anywhere below into an `error`
    /// report instead of taking the process down.
    pub async fn dispatch(&self, msg: HostMessage) -> Flow {
        let label = describe(&msg);
        let (id, request_id) = attribution(&msg);
        match AssertUnwindSafe(self.handle(msg)).catch_unwind().await {
            Ok(flow) => flow,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(message = label, "Panic while handling message: {}", message);
                self.send(WorkerMessage::error(
                    id,
                    request_id,
                    format!("Extension host panicked while handling {label}: {message}"),
                ));
                Flow::Continue
            }
        }
    }

    pub async fn handle(&self, msg: HostMessage) -> Flow {
        match msg {
            HostMessage::Activate {
                id,
                path,
                entry,
                initial_state,
            } => self.activate(id, path, entry, initial_state).await,
            HostMessage::Deactivate { id } => self.deactivate(&id).await,
            HostMessage::ExecuteCommand {
                request_id,
                command_id,
                args,
            } => self.execute_command(request_id, &command_id, args).await,
            HostMessage::Shutdown => {
                self.shutdown().await;
                return Flow::Exit;
            }
            other => debug!("Ignoring message {:?}", other),
        }
        Flow::Continue
    }

    fn lifecycle_lock(&self, id: &str) -> Rc<AsyncMutex<()>> {
        self.lifecycle
            .borrow_mut()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Load and activate an extension, reporting registrations then the
    /// outcome back to the host.
    pub async fn activate(
        &self,
        id: String,
        path: PathBuf,
        entry: String,
        initial_state: Option<Value>,
    ) {
        let lock = self.lifecycle_lock(&id);
        let _guard = lock.lock().await;

        let already = self.extensions.borrow().get(&id).map(|loaded| {
            loaded
                .context
                .borrow()
                .registrations()
                .iter()
                .map(|r| r.command_id.clone())
                .collect::<Vec<_>>()
        });
        if let Some(commands) = already {
            debug!(extension = %id, "Already active");
            self.report_activated(&id, commands);
            return;
        }

        match self.try_activate(&id, path, &entry, initial_state).await {
            Ok(commands) => {
                info!(extension = %id, commands = commands.len(), "Extension activated");
                self.report_activated(&id, commands);
            }
            Err(e) => {
                let error = PluginError::describe(&e);
                warn!(extension = %id, "Activation failed: {}", error.message);
                self.send(WorkerMessage::Error {
                    id: Some(id),
                    request_id: None,
                    message: error.message,
                    stack: error.stack,
                });
            }
        }
    }

    async fn try_activate(
        &self,
        id: &str,
        path: PathBuf,
        entry: &str,
        initial_state: Option<Value>,
    ) -> anyhow::Result<Vec<String>> {
        let entry_path = resolve_entry(&path, entry)?;
        let loaded = self.loader.borrow_mut().load(id, &path, &entry_path);
        let module = match loaded {
            Ok(module) => module,
            Err(e) => {
                self.loader.borrow_mut().purge(&path);
                return Err(e.into());
            }
        };
        let mut context = ActivationContext::new(id, path.clone(), initial_state);

        if let Err(e) = module.activate(&mut context).await {
            // Nothing was bound yet; release what the module acquired.
            for failure in module.dispose_subscriptions().await {
                debug!(extension = %id, "Disposer failed after activation error: {:#}", failure);
            }
            self.dispose_context(id, &mut context);
            self.loader.borrow_mut().purge(&path);
            return Err(e);
        }

        let mut commands = Vec::with_capacity(context.registrations().len());
        {
            let mut registry = self.commands.borrow_mut();
            for registration in context.registrations() {
                registry.bind(
                    registration.command_id.clone(),
                    CommandBinding {
                        extension_id: id.to_string(),
                        handler: registration.handler.clone(),
                    },
                );
                commands.push(registration.command_id.clone());
            }
        }

        self.extensions.borrow_mut().insert(
            id.to_string(),
            Rc::new(LoadedExtension {
                id: id.to_string(),
                path,
                module,
                context: RefCell::new(context),
            }),
        );
        Ok(commands)
    }

    fn report_activated(&self, id: &str, commands: Vec<String>) {
        for command_id in commands {
            self.send(WorkerMessage::RegisterCommand {
                id: id.to_string(),
                command_id,
            });
        }
        self.send(WorkerMessage::Activated { id: id.to_string() });
    }

    /// Tear an extension down. Always reports `deactivated`, whatever fails
    /// along the way.
    pub async fn deactivate(&self, id: &str) {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;

        let removed = self.extensions.borrow_mut().remove(id);
        let Some(loaded) = removed else {
            debug!(extension = %id, "Deactivate for extension that is not loaded");
            self.send(WorkerMessage::Deactivated { id: id.to_string() });
            return;
        };

        if let Err(e) = loaded.module.deactivate().await {
            let error = PluginError::describe(&e);
            warn!(extension = %id, "Teardown failed: {}", error.message);
            self.send(WorkerMessage::Error {
                id: Some(id.to_string()),
                request_id: None,
                message: format!("deactivate failed: {}", error.message),
                stack: error.stack,
            });
        }

        for failure in loaded.module.dispose_subscriptions().await {
            warn!(extension = %id, "Subscription disposer failed: {:#}", failure);
        }
        self.dispose_context(id, &mut loaded.context.borrow_mut());
        self.commands.borrow_mut().unbind_owner(id);

        let purged = self.loader.borrow_mut().purge(&loaded.path);
        debug!(extension = %id, purged, "Purged cached sources");

        info!(extension = %id, "Extension deactivated");
        self.send(WorkerMessage::Deactivated { id: id.to_string() });
    }

    /// Release every subscription in `context`, one at a time. A failing or
    /// panicking disposer does not stop the rest.
    fn dispose_context(&self, id: &str, context: &mut ActivationContext) {
        for subscription in context.subscriptions.drain(..) {
            match subscription {
                Subscription::Command(command_id) => {
                    self.commands.borrow_mut().unbind(&command_id, id);
                }
                Subscription::Custom(disposable) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| disposable.dispose())) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(extension = %id, "Disposer failed: {:#}", e),
                        Err(panic) => warn!(
                            extension = %id,
                            "Disposer panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    }
                }
            }
        }
    }

    pub async fn execute_command(&self, request_id: u64, command_id: &str, args: Vec<Value>) {
        let binding = self.commands.borrow().get(command_id).cloned();
        let Some(binding) = binding else {
            self.send(WorkerMessage::error(
                None,
                Some(request_id),
                format!("Command not found: {command_id}"),
            ));
            return;
        };

        let loaded = self.extensions.borrow().get(&binding.extension_id).cloned();
        let Some(loaded) = loaded else {
            self.send(WorkerMessage::error(
                Some(binding.extension_id),
                Some(request_id),
                format!("Command {command_id} belongs to an extension that is not loaded"),
            ));
            return;
        };

        match loaded.module.execute(&binding.handler, args).await {
            Ok(result) => self.send(WorkerMessage::CommandResult {
                request_id,
                command_id: command_id.to_string(),
                result,
            }),
            Err(e) => {
                let error = PluginError::describe(&e);
                self.send(WorkerMessage::Error {
                    id: Some(binding.extension_id),
                    request_id: Some(request_id),
                    message: error.message,
                    stack: error.stack,
                });
            }
        }
    }

    /// Deactivate every extension through the normal path, including ones
    /// whose activation is still running.
    pub async fn shutdown(&self) {
        let mut ids: Vec<String> = self.lifecycle.borrow().keys().cloned().collect();
        ids.sort();
        info!(count = self.loaded_ids().len(), "Shutting down extensions");
        for id in ids {
            if self.is_loaded(&id) || self.is_busy(&id) {
                self.deactivate(&id).await;
            }
        }
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.extensions.borrow().contains_key(id)
    }

    /// Whether a lifecycle operation for `id` is running.
    fn is_busy(&self, id: &str) -> bool {
        self.lifecycle
            .borrow()
            .get(id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Ids of the active extensions, sorted.
    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.extensions.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn commands(&self) -> Ref<'_, CommandRegistry> {
        self.commands.borrow()
    }

    pub fn loader(&self) -> Ref<'_, L> {
        self.loader.borrow()
    }

    fn send(&self, msg: WorkerMessage) {
        if self.outbox.send(msg).is_err() {
            debug!("Outbox closed, dropping message");
        }
    }
}

fn describe(msg: &HostMessage) -> &'static str {
    match msg {
        HostMessage::Activate { .. } => "activate",
        HostMessage::Deactivate { .. } => "deactivate",
        HostMessage::ExecuteCommand { .. } => "execute-command",
        HostMessage::Shutdown => "shutdown",
        HostMessage::ServiceCreated { .. }
        | HostMessage::ServiceCreateFailed { .. }
        | HostMessage::ModalResult { .. } => "service reply",
    }
}

fn attribution(msg: &HostMessage) -> (Option<String>, Option<u64>) {
    match msg {
        HostMessage::Activate { id, .. } | HostMessage::Deactivate { id } => {
            (Some(id.clone()), None)
        }
        HostMessage::ExecuteCommand { request_id, .. } => (None, Some(*request_id)),
        _ => (None, None),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
