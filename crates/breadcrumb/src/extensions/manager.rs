//! Extension Manager
//!
//! Tracks every discovered extension and its status, keeps the command index
//! in step with the worker, and relays host crashes to the extensions that
//! were running.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use breadcrumb_ext_protocol::HostMessage;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::host::{
    HostError, HostEvent, HostSupervisor, ProcessLauncher, ServiceRequest, SupervisorConfig,
    WorkerLauncher,
};
use crate::manifest::{Capability, CommandContribution};

use super::discovery::scan_directory;
use super::order::dependency_order;
use super::services::{ModalProvider, NoServices, TerminalProvider};
use super::types::{ExtensionError, ExtensionInfo, ExtensionSource, ExtensionStatus, ManagerEvent};

/// Error recorded on every running extension once the host gives up.
pub const HOST_FAILED_MESSAGE: &str =
    "Extension host crashed repeatedly and was stopped. Restart the application to recover.";

const EVENT_CAPACITY: usize = 64;

/// Builder for [`ExtensionManager`].
pub struct ExtensionManagerBuilder {
    directories: Vec<(ExtensionSource, PathBuf)>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    config: SupervisorConfig,
    terminals: Arc<dyn TerminalProvider>,
    modals: Arc<dyn ModalProvider>,
}

impl ExtensionManagerBuilder {
    /// Add a directory to scan. Directories are scanned in the order added;
    /// the first extension found with a given id wins.
    pub fn directory(mut self, source: ExtensionSource, path: impl Into<PathBuf>) -> Self {
        self.directories.push((source, path.into()));
        self
    }

    pub fn directories(
        mut self,
        directories: impl IntoIterator<Item = (ExtensionSource, PathBuf)>,
    ) -> Self {
        self.directories.extend(directories);
        self
    }

    /// Defaults to [`ProcessLauncher`] with the resolved worker binary.
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn terminal_provider(mut self, provider: Arc<dyn TerminalProvider>) -> Self {
        self.terminals = provider;
        self
    }

    pub fn modal_provider(mut self, provider: Arc<dyn ModalProvider>) -> Self {
        self.modals = provider;
        self
    }

    /// Build the manager. Must be called inside a Tokio runtime; the
    /// worker's events are processed on a background task.
    pub fn build(self) -> ExtensionManager {
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher::new(None)));
        let (supervisor, host_events) = HostSupervisor::new(launcher, self.config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            supervisor,
            directories: self.directories,
            extensions: Mutex::new(BTreeMap::new()),
            commands: DashMap::new(),
            state: DashMap::new(),
            events,
            host_failed: AtomicBool::new(false),
            terminals: self.terminals,
            modals: self.modals,
        });
        tokio::spawn(relay_host_events(Arc::downgrade(&inner), host_events));
        ExtensionManager { inner }
    }
}

struct Inner {
    supervisor: HostSupervisor,
    directories: Vec<(ExtensionSource, PathBuf)>,
    extensions: Mutex<BTreeMap<String, ExtensionInfo>>,
    /// Fully qualified command id -> owning extension.
    commands: DashMap<String, String>,
    /// Persisted extension state, handed back on every activation.
    state: DashMap<String, Map<String, Value>>,
    events: broadcast::Sender<ManagerEvent>,
    host_failed: AtomicBool,
    terminals: Arc<dyn TerminalProvider>,
    modals: Arc<dyn ModalProvider>,
}

/// Discovers extensions and drives their lifecycle through the host
/// supervisor. Cheap to clone.
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<Inner>,
}

impl ExtensionManager {
    pub fn builder() -> ExtensionManagerBuilder {
        ExtensionManagerBuilder {
            directories: Vec::new(),
            launcher: None,
            config: SupervisorConfig::default(),
            terminals: Arc::new(NoServices),
            modals: Arc::new(NoServices),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────

    /// Scan the configured directories. Returns the ids seen for the first
    /// time; extensions already known keep their status.
    pub async fn discover(&self) -> Vec<String> {
        let mut found = Vec::new();
        for (source, dir) in &self.inner.directories {
            found.extend(scan_directory(dir, *source).await);
        }

        let mut added = Vec::new();
        {
            let mut extensions = self.inner.extensions.lock();
            for ext in found {
                let id = ext.manifest.id().to_string();
                if let Some(existing) = extensions.get(&id) {
                    if existing.path != ext.path {
                        debug!(
                            extension = %id,
                            "Ignoring {}, already discovered at {}",
                            ext.path.display(),
                            existing.path.display()
                        );
                    }
                    continue;
                }
                extensions.insert(
                    id.clone(),
                    ExtensionInfo::new(ext.manifest, ext.path, ext.source),
                );
                added.push(id);
            }
        }

        info!(new = added.len(), total = self.len(), "Extension discovery complete");
        self.emit(ManagerEvent::Changed);
        added
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Start the host and activate every startup extension in dependency
    /// order. Does nothing when no extensions were discovered.
    pub async fn start_all(&self) -> Result<(), ExtensionError> {
        let eager: Vec<String> = {
            let extensions = self.inner.extensions.lock();
            if extensions.is_empty() {
                info!("No extensions discovered, extension host not started");
                return Ok(());
            }
            dependency_order(&extensions)
                .into_iter()
                .filter(|id| extensions[id].manifest.activates_on_startup())
                .collect()
        };

        self.inner.supervisor.start().await?;

        info!(count = eager.len(), "Activating startup extensions");
        let mut visited = HashSet::new();
        for id in eager {
            self.activate_tree(id, &mut visited).await;
        }
        Ok(())
    }

    /// Activate an extension and its dependencies.
    ///
    /// Failures are recorded on the extension rather than returned; the
    /// resulting status is returned instead. Calling this while the extension
    /// is active or activating is a no-op.
    pub async fn activate_extension(&self, id: &str) -> Result<ExtensionStatus, ExtensionError> {
        if !self.inner.extensions.lock().contains_key(id) {
            return Err(ExtensionError::NotFound(id.to_string()));
        }
        let mut visited = HashSet::new();
        self.activate_tree(id.to_string(), &mut visited).await;
        self.status(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    /// Activate every extension that is not running and declares an
    /// activation event matching `event`. Returns the ids that were triggered.
    pub async fn activate_by_event(&self, event: &str) -> Vec<String> {
        let triggered: Vec<String> = {
            let extensions = self.inner.extensions.lock();
            dependency_order(&extensions)
                .into_iter()
                .filter(|id| {
                    let info = &extensions[id];
                    matches!(
                        info.status,
                        ExtensionStatus::Dormant
                            | ExtensionStatus::Inactive
                            | ExtensionStatus::Failed
                    ) && info.manifest.activates_on(event)
                })
                .collect()
        };

        if !triggered.is_empty() {
            debug!(event, count = triggered.len(), "Activation event fired");
        }
        let mut visited = HashSet::new();
        for id in &triggered {
            self.activate_tree(id.clone(), &mut visited).await;
        }
        triggered
    }

    /// Deactivate an extension. A no-op unless it is active.
    ///
    /// Always ends with the extension inactive and its commands unregistered,
    /// even when the worker reports a teardown failure.
    pub async fn deactivate_extension(&self, id: &str) -> Result<(), ExtensionError> {
        {
            let mut extensions = self.inner.extensions.lock();
            let info = extensions
                .get_mut(id)
                .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
            if info.status != ExtensionStatus::Active {
                debug!(extension = %id, status = ?info.status, "Not active, skipping deactivation");
                return Ok(());
            }
            info.status = ExtensionStatus::Deactivating;
        }
        self.emit_status(id, ExtensionStatus::Deactivating);

        if let Err(e) = self.inner.supervisor.deactivate(id).await {
            warn!(extension = %id, "Deactivation failed: {}", e);
        }

        if let Some(info) = self.inner.extensions.lock().get_mut(id) {
            info.status = ExtensionStatus::Inactive;
            info.activated_at = None;
        }
        self.inner.commands.retain(|_, owner| owner.as_str() != id);
        info!(extension = %id, "Extension deactivated");
        self.emit_status(id, ExtensionStatus::Inactive);
        Ok(())
    }

    /// Deactivate every active extension, dependents first.
    pub async fn deactivate_all(&self) {
        let active: Vec<String> = {
            let extensions = self.inner.extensions.lock();
            dependency_order(&extensions)
                .into_iter()
                .rev()
                .filter(|id| extensions[id].status == ExtensionStatus::Active)
                .collect()
        };
        for id in active {
            if let Err(e) = self.deactivate_extension(&id).await {
                warn!(extension = %id, "Deactivation failed: {}", e);
            }
        }
    }

    /// Deactivate everything and stop the host.
    pub async fn shutdown(&self) {
        info!("Shutting down extension manager");
        self.deactivate_all().await;
        self.inner.supervisor.shutdown().await;
    }

    /// Run a registered command.
    pub async fn execute_command(
        &self,
        command_id: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExtensionError> {
        if !self.inner.commands.contains_key(command_id) {
            return Err(ExtensionError::CommandNotFound(command_id.to_string()));
        }
        Ok(self
            .inner
            .supervisor
            .execute_command(command_id, args)
            .await?)
    }

    fn activate_tree<'a>(
        &'a self,
        id: String,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, ()> {
        async move {
            if !visited.insert(id.clone()) {
                return;
            }
            let dependencies = match self.inner.extensions.lock().get(&id) {
                Some(info) => info.manifest.dependencies.clone(),
                None => {
                    debug!(extension = %id, "Skipping unknown dependency");
                    return;
                }
            };
            for dependency in dependencies {
                self.activate_tree(dependency, visited).await;
            }
            self.activate_one(&id).await;
        }
        .boxed()
    }

    async fn activate_one(&self, id: &str) {
        let (path, entry, attempt) = {
            let mut extensions = self.inner.extensions.lock();
            let Some(info) = extensions.get_mut(id) else {
                return;
            };
            if info.status.is_live() {
                debug!(extension = %id, status = ?info.status, "Already activating or active");
                return;
            }
            info.status = ExtensionStatus::Activating;
            info.error = None;
            info.awaiting_restart = false;
            info.attempt += 1;
            (info.path.clone(), info.manifest.main.clone(), info.attempt)
        };
        self.emit_status(id, ExtensionStatus::Activating);
        debug!(extension = %id, "Activating extension");

        let initial_state = self
            .inner
            .state
            .get(id)
            .map(|state| Value::Object(state.clone()));
        let result = match self.claim_worker(id, attempt).await {
            Ok(true) => {
                self.inner
                    .supervisor
                    .activate(id, path, &entry, initial_state)
                    .await
            }
            Ok(false) => {
                debug!(extension = %id, "Activation taken over by restart replay");
                return;
            }
            Err(e) => Err(e),
        };

        let status = {
            let mut extensions = self.inner.extensions.lock();
            let Some(info) = extensions.get_mut(id) else {
                return;
            };
            if info.attempt != attempt || info.status != ExtensionStatus::Activating {
                debug!(extension = %id, "Activation result superseded");
                return;
            }
            match &result {
                Ok(commands) => {
                    for command in commands {
                        self.inner.commands.insert(command.clone(), id.to_string());
                    }
                    info.status = ExtensionStatus::Active;
                    info.activated_at = Some(Utc::now());
                }
                Err(e) => {
                    info.status = ExtensionStatus::Failed;
                    info.error = Some(e.to_string());
                    info.awaiting_restart = *e == HostError::Crashed;
                }
            }
            info.status
        };

        match result {
            Ok(commands) => {
                info!(extension = %id, commands = commands.len(), "Extension activated")
            }
            Err(e) => {
                warn!(extension = %id, "Extension activation failed: {}", e);
                self.emit(ManagerEvent::Error {
                    id: id.to_string(),
                    message: e.to_string(),
                });
            }
        }
        self.emit_status(id, status);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// All known extensions, sorted by id.
    pub fn list(&self) -> Vec<ExtensionInfo> {
        self.inner.extensions.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<ExtensionInfo> {
        self.inner.extensions.lock().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<ExtensionStatus> {
        self.inner.extensions.lock().get(id).map(|info| info.status)
    }

    pub fn len(&self) -> usize {
        self.inner.extensions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered commands mapped to the extension that owns them.
    pub fn commands(&self) -> BTreeMap<String, String> {
        self.inner
            .commands
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Commands declared in manifests, with the declaring extension's id.
    pub fn contributed_commands(&self) -> Vec<(String, CommandContribution)> {
        self.inner
            .extensions
            .lock()
            .values()
            .flat_map(|info| {
                info.manifest
                    .commands
                    .iter()
                    .map(|command| (info.id.clone(), command.clone()))
            })
            .collect()
    }

    /// Persisted state of an extension.
    pub fn state(&self, id: &str) -> Option<Value> {
        self.inner
            .state
            .get(id)
            .map(|state| Value::Object(state.clone()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// True once the host exhausted its restarts.
    pub fn host_failed(&self) -> bool {
        self.inner.host_failed.load(Ordering::SeqCst)
    }

    pub fn supervisor(&self) -> &HostSupervisor {
        &self.inner.supervisor
    }

    // ─────────────────────────────────────────────────────────────────────
    // Host events
    // ─────────────────────────────────────────────────────────────────────

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_status(&self, id: &str, status: ExtensionStatus) {
        self.emit(ManagerEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
    }

    fn on_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Activated { id } => debug!(extension = %id, "Worker activated extension"),
            HostEvent::Deactivated { id } => {
                debug!(extension = %id, "Worker deactivated extension")
            }
            HostEvent::CommandRegistered { id, command_id } => {
                let live = self
                    .inner
                    .extensions
                    .lock()
                    .get(&id)
                    .is_some_and(|info| info.status.is_live());
                if live {
                    self.inner.commands.insert(command_id, id);
                }
            }
            HostEvent::Error { id, message, .. } => {
                if let Some(id) = id {
                    self.emit(ManagerEvent::Error { id, message });
                }
            }
            HostEvent::StateChanged { id, key, value } => {
                let mut state = self.inner.state.entry(id).or_default();
                if value.is_null() {
                    state.remove(&key);
                } else {
                    state.insert(key, value);
                }
            }
            HostEvent::ServiceRequest(request) => self.bridge_service(request),
            HostEvent::Restarted { attempt } => self.replay_after_restart(attempt),
            HostEvent::BudgetExhausted => self.fail_all(),
        }
    }

    /// Make sure a worker is running and record which one this activation
    /// goes to. Returns false when a restart replay superseded the attempt
    /// while the worker was starting.
    async fn claim_worker(&self, id: &str, attempt: u64) -> Result<bool, HostError> {
        self.inner.supervisor.start().await?;
        let generation = self.inner.supervisor.worker_generation();
        let mut extensions = self.inner.extensions.lock();
        match extensions.get_mut(id) {
            Some(info) if info.attempt == attempt => {
                info.sent_to = generation;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn replay_after_restart(&self, attempt: u32) {
        let current = self.inner.supervisor.worker_generation();
        let replay: Vec<String> = {
            let mut extensions = self.inner.extensions.lock();
            let order = dependency_order(&extensions);
            order
                .into_iter()
                .filter(|id| {
                    let Some(info) = extensions.get_mut(id) else {
                        return false;
                    };
                    if !(info.status.is_live() || info.awaiting_restart) {
                        return false;
                    }
                    // Already on its way to the new worker.
                    if info.status == ExtensionStatus::Activating
                        && current.is_some()
                        && info.sent_to == current
                    {
                        return false;
                    }
                    info.status = ExtensionStatus::Dormant;
                    info.activated_at = None;
                    info.attempt += 1;
                    true
                })
                .collect()
        };
        self.inner
            .commands
            .retain(|_, owner| !replay.contains(owner));

        info!(attempt, count = replay.len(), "Extension host restarted, reactivating extensions");
        for id in &replay {
            self.emit_status(id, ExtensionStatus::Dormant);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let mut visited = HashSet::new();
            for id in replay {
                manager.activate_tree(id, &mut visited).await;
            }
        });
    }

    fn fail_all(&self) {
        self.inner.host_failed.store(true, Ordering::SeqCst);
        let failed: Vec<String> = {
            let mut extensions = self.inner.extensions.lock();
            extensions
                .values_mut()
                .filter(|info| info.status.is_live() || info.awaiting_restart)
                .map(|info| {
                    info.status = ExtensionStatus::Failed;
                    info.error = Some(HOST_FAILED_MESSAGE.to_string());
                    info.activated_at = None;
                    info.awaiting_restart = false;
                    info.attempt += 1;
                    info.id.clone()
                })
                .collect()
        };
        self.inner.commands.clear();

        error!(extensions = failed.len(), "{}", HOST_FAILED_MESSAGE);
        for id in &failed {
            self.emit_status(id, ExtensionStatus::Failed);
        }
        self.emit(ManagerEvent::HostFailed);
    }

    fn bridge_service(&self, request: ServiceRequest) {
        let manager = self.clone();
        match request {
            ServiceRequest::CreateTerminal {
                request_id,
                extension_id,
                options,
            } => {
                let allowed = self
                    .inner
                    .extensions
                    .lock()
                    .get(&extension_id)
                    .is_some_and(|info| info.manifest.has_capability(Capability::Terminal));
                tokio::spawn(async move {
                    let reply = if !allowed {
                        warn!(extension = %extension_id, "Terminal requested without the terminal capability");
                        HostMessage::ServiceCreateFailed {
                            request_id,
                            message: format!(
                                "Extension {extension_id} did not declare the terminal capability"
                            ),
                        }
                    } else {
                        match manager
                            .inner
                            .terminals
                            .create_terminal(&extension_id, options)
                            .await
                        {
                            Ok(service_id) => HostMessage::ServiceCreated {
                                request_id,
                                service_id,
                            },
                            Err(e) => HostMessage::ServiceCreateFailed {
                                request_id,
                                message: e.to_string(),
                            },
                        }
                    };
                    manager.respond(reply);
                });
            }
            ServiceRequest::ShowInputModal {
                request_id,
                extension_id,
                options,
            } => {
                tokio::spawn(async move {
                    let value = match manager
                        .inner
                        .modals
                        .show_input(&extension_id, options)
                        .await
                    {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(extension = %extension_id, "Input modal failed: {}", e);
                            None
                        }
                    };
                    manager.respond(HostMessage::ModalResult { request_id, value });
                });
            }
        }
    }

    fn respond(&self, reply: HostMessage) {
        if let Err(e) = self.inner.supervisor.respond(reply) {
            debug!("Could not deliver service reply: {}", e);
        }
    }
}

async fn relay_host_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<HostEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ExtensionManager { inner }.on_host_event(event);
    }
}
