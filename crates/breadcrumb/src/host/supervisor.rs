//! Worker process supervision.
//!
//! [`HostSupervisor`] owns the single extension worker: it spawns it, pumps
//! frames in both directions, correlates replies with callers, enforces
//! per-operation timeouts, and restarts the worker with exponential backoff
//! when it dies unexpectedly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use breadcrumb_ext_protocol::{
    FrameReader, FrameWriter, HostMessage, InputModalOptions, LogLevel, TerminalOptions,
    WorkerMessage,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::launcher::{BoxedReader, BoxedWriter, WorkerChild, WorkerLauncher};
use super::pending::{PendingKey, PendingRequests, Reply};
use super::restart::{RestartBudget, RestartPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Errors & events
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by supervisor operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Failed to start extension worker: {0}")]
    Spawn(String),

    #[error("Extension worker is not running")]
    NotRunning,

    #[error("Extension worker crashed")]
    Crashed,

    #[error("Extension host is shutting down")]
    ShuttingDown,

    #[error("Extension host failed permanently after repeated crashes")]
    PermanentlyFailed,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("{message}")]
    ActivationFailed {
        message: String,
        stack: Option<String>,
    },

    #[error("{message}")]
    CommandFailed {
        message: String,
        stack: Option<String>,
    },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(String),
}

/// Requests the worker makes on behalf of an extension.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    CreateTerminal {
        request_id: u64,
        extension_id: String,
        options: TerminalOptions,
    },
    ShowInputModal {
        request_id: u64,
        extension_id: String,
        options: InputModalOptions,
    },
}

/// Notifications for the extension manager.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Activated {
        id: String,
    },
    Deactivated {
        id: String,
    },
    /// An error not tied to an outstanding request.
    Error {
        id: Option<String>,
        message: String,
        stack: Option<String>,
    },
    CommandRegistered {
        id: String,
        command_id: String,
    },
    ServiceRequest(ServiceRequest),
    StateChanged {
        id: String,
        key: String,
        value: Value,
    },
    /// A fresh worker replaced a crashed one.
    Restarted {
        attempt: u32,
    },
    /// The restart budget is spent; the supervisor will not recover.
    BudgetExhausted,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub restart: RestartPolicy,
    pub activate_timeout: Duration,
    pub deactivate_timeout: Duration,
    pub command_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            activate_timeout: Duration::from_secs(10),
            deactivate_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

struct WorkerHandle {
    generation: u64,
    outbox: mpsc::UnboundedSender<HostMessage>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct State {
    worker: Option<WorkerHandle>,
    budget: RestartBudget,
    generation: u64,
    shutting_down: bool,
    restart_task: Option<JoinHandle<()>>,
    exhausted: bool,
}

struct Inner {
    launcher: Arc<dyn WorkerLauncher>,
    config: SupervisorConfig,
    state: Mutex<State>,
    /// Serializes spawning so concurrent callers never start two workers.
    spawn_lock: tokio::sync::Mutex<()>,
    pending: PendingRequests,
    events: mpsc::UnboundedSender<HostEvent>,
    next_request_id: AtomicU64,
}

/// Supervises the extension worker process.
#[derive(Clone)]
pub struct HostSupervisor {
    inner: Arc<Inner>,
}

impl HostSupervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        config: SupervisorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(Inner {
                launcher,
                state: Mutex::new(State {
                    worker: None,
                    budget: RestartBudget::new(config.restart.clone()),
                    generation: 0,
                    shutting_down: false,
                    restart_task: None,
                    exhausted: false,
                }),
                config,
                spawn_lock: tokio::sync::Mutex::new(()),
                pending: PendingRequests::new(),
                events,
                next_request_id: AtomicU64::new(1),
            }),
        };
        (supervisor, rx)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Start the worker. A no-op when one is already running.
    ///
    /// A clean start resets the restart counter. When a restart is already
    /// scheduled, the worker is brought up immediately instead of waiting out
    /// the backoff.
    pub async fn start(&self) -> Result<(), HostError> {
        let _guard = self.inner.spawn_lock.lock().await;

        let brought_forward = {
            let mut state = self.inner.state.lock();
            if state.exhausted {
                return Err(HostError::PermanentlyFailed);
            }
            if state.worker.is_some() {
                return Ok(());
            }
            state.shutting_down = false;
            match state.restart_task.take() {
                Some(task) => {
                    task.abort();
                    Some(state.budget.restart_count())
                }
                None => {
                    state.budget.reset();
                    None
                }
            }
        };

        self.spawn_worker().await?;
        if let Some(attempt) = brought_forward {
            info!(attempt, "Extension worker restarted early on demand");
            self.emit(HostEvent::Restarted { attempt });
        }
        Ok(())
    }

    /// Generation of the running worker; each spawn gets a new one.
    pub fn worker_generation(&self) -> Option<u64> {
        self.inner.state.lock().worker.as_ref().map(|w| w.generation)
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().worker.is_some()
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.inner.state.lock().exhausted
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.state.lock().budget.restart_count()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Activate an extension. Returns the commands it registered.
    pub async fn activate(
        &self,
        id: &str,
        path: PathBuf,
        entry: &str,
        initial_state: Option<Value>,
    ) -> Result<Vec<String>, HostError> {
        self.start().await?;
        let reply = self
            .request(
                PendingKey::Activate(id.to_string()),
                HostMessage::Activate {
                    id: id.to_string(),
                    path,
                    entry: entry.to_string(),
                    initial_state,
                },
                self.inner.config.activate_timeout,
                format!("Activation of {id}"),
            )
            .await?;
        match reply {
            Reply::Activated(commands) => Ok(commands),
            _ => Err(HostError::UnexpectedReply(format!("activate {id}"))),
        }
    }

    /// Deactivate an extension.
    ///
    /// Resolves successfully when the deactivation timeout expires.
    pub async fn deactivate(&self, id: &str) -> Result<(), HostError> {
        if !self.is_running() {
            debug!(extension = %id, "No worker running, nothing to deactivate");
            return Ok(());
        }
        let timeout = self.inner.config.deactivate_timeout;
        let result = self
            .request(
                PendingKey::Deactivate(id.to_string()),
                HostMessage::Deactivate { id: id.to_string() },
                timeout,
                format!("Deactivation of {id}"),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(HostError::Timeout { .. }) => {
                // Accepted leak risk: the worker may still be tearing the
                // extension down and keeps whatever it holds until it finishes.
                warn!(extension = %id, ?timeout, "Deactivation timed out; treating as complete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Execute a registered command in the worker.
    pub async fn execute_command(
        &self,
        command_id: &str,
        args: Vec<Value>,
    ) -> Result<Value, HostError> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .request(
                PendingKey::Command(request_id),
                HostMessage::ExecuteCommand {
                    request_id,
                    command_id: command_id.to_string(),
                    args,
                },
                self.inner.config.command_timeout,
                format!("Command {command_id}"),
            )
            .await?;
        match reply {
            Reply::CommandResult(value) => Ok(value),
            _ => Err(HostError::UnexpectedReply(format!("command {command_id}"))),
        }
    }

    /// Send a reply to a worker-initiated service request.
    pub fn respond(&self, msg: HostMessage) -> Result<(), HostError> {
        self.send(msg)
    }

    /// Stop the worker: ask it to exit, wait out the grace period, then kill.
    pub async fn shutdown(&self) {
        let worker = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            if let Some(task) = state.restart_task.take() {
                task.abort();
            }
            state
                .worker
                .as_mut()
                .map(|w| (w.outbox.clone(), w.exited.clone(), w.kill.take()))
        };
        self.inner.pending.reject_all(HostError::ShuttingDown);

        let Some((outbox, mut exited, kill)) = worker else {
            return;
        };

        info!("Shutting down extension worker");
        let _ = outbox.send(HostMessage::Shutdown);
        drop(outbox);

        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(?grace, "Extension worker did not exit in time, killing");
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            let _ = exited.wait_for(|done| *done).await;
        }
        info!("Extension worker stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn emit(&self, event: HostEvent) {
        let _ = self.inner.events.send(event);
    }

    fn send(&self, msg: HostMessage) -> Result<(), HostError> {
        let state = self.inner.state.lock();
        if state.exhausted {
            return Err(HostError::PermanentlyFailed);
        }
        if state.shutting_down {
            return Err(HostError::ShuttingDown);
        }
        let worker = state.worker.as_ref().ok_or(HostError::NotRunning)?;
        worker.outbox.send(msg).map_err(|_| HostError::NotRunning)
    }

    async fn request(
        &self,
        key: PendingKey,
        msg: HostMessage,
        timeout: Duration,
        operation: String,
    ) -> Result<Reply, HostError> {
        let rx = self.inner.pending.register(key.clone());
        if let Err(e) = self.send(msg) {
            self.inner.pending.remove(&key);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::Cancelled),
            Err(_) => {
                self.inner.pending.remove(&key);
                Err(HostError::Timeout { operation, timeout })
            }
        }
    }

    /// Launch a worker and wire up its tasks. Callers hold `spawn_lock`.
    async fn spawn_worker(&self) -> Result<(), HostError> {
        let process = match self.inner.launcher.launch().await {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to spawn extension worker: {}", e);
                self.handle_crash();
                return Err(HostError::Spawn(e.to_string()));
            }
        };

        let mut state = self.inner.state.lock();
        if state.shutting_down {
            // Dropping the process handle kills it.
            return Err(HostError::ShuttingDown);
        }
        state.generation += 1;
        state.budget.on_start();
        let generation = state.generation;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);

        let mut tasks = vec![
            tokio::spawn(write_loop(process.stdin, outbox_rx)),
            tokio::spawn(read_loop(weak.clone(), generation, process.stdout)),
        ];
        if let Some(stderr) = process.stderr {
            tasks.push(tokio::spawn(stderr_loop(stderr)));
        }
        let child_id = process.child.id();
        tokio::spawn(monitor(weak, generation, process.child, kill_rx, exited_tx));

        state.worker = Some(WorkerHandle {
            generation,
            outbox,
            kill: Some(kill_tx),
            exited: exited_rx,
            tasks,
        });
        info!(generation, pid = ?child_id, "Extension worker started");
        Ok(())
    }

    fn dispatch(&self, generation: u64, msg: WorkerMessage) {
        let current = self
            .inner
            .state
            .lock()
            .worker
            .as_ref()
            .is_some_and(|w| w.generation == generation);
        if !current {
            debug!(generation, "Dropping message from a previous worker");
            return;
        }

        let pending = &self.inner.pending;
        match msg {
            WorkerMessage::Ready => debug!(generation, "Extension worker ready"),
            WorkerMessage::Activated { id } => {
                pending.resolve_activation(&id, Ok(()));
                self.emit(HostEvent::Activated { id });
            }
            WorkerMessage::Deactivated { id } => {
                pending.resolve(&PendingKey::Deactivate(id.clone()), Ok(Reply::Done));
                self.emit(HostEvent::Deactivated { id });
            }
            WorkerMessage::CommandResult {
                request_id, result, ..
            } => {
                if !pending.resolve(&PendingKey::Command(request_id), Ok(Reply::CommandResult(result))) {
                    debug!(request_id, "Late command result ignored");
                }
            }
            WorkerMessage::Error {
                id,
                request_id,
                message,
                stack,
            } => {
                if let Some(request_id) = request_id {
                    let failed = HostError::CommandFailed {
                        message: message.clone(),
                        stack: stack.clone(),
                    };
                    if pending.resolve(&PendingKey::Command(request_id), Err(failed)) {
                        return;
                    }
                } else if let Some(id) = &id {
                    let failed = HostError::ActivationFailed {
                        message: message.clone(),
                        stack: stack.clone(),
                    };
                    if pending.resolve_activation(id, Err(failed)) {
                        return;
                    }
                }
                warn!(extension = ?id, "Extension error: {}", message);
                self.emit(HostEvent::Error { id, message, stack });
            }
            WorkerMessage::RegisterCommand { id, command_id } => {
                pending.note_command(&id, &command_id);
                self.emit(HostEvent::CommandRegistered { id, command_id });
            }
            WorkerMessage::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!(target: "extension_host", "{}", message),
                LogLevel::Debug => tracing::debug!(target: "extension_host", "{}", message),
                LogLevel::Info => tracing::info!(target: "extension_host", "{}", message),
                LogLevel::Warn => tracing::warn!(target: "extension_host", "{}", message),
                LogLevel::Error => tracing::error!(target: "extension_host", "{}", message),
            },
            WorkerMessage::TerminalCreate {
                request_id,
                id,
                options,
            } => self.emit(HostEvent::ServiceRequest(ServiceRequest::CreateTerminal {
                request_id,
                extension_id: id,
                options,
            })),
            WorkerMessage::ShowInputModal {
                request_id,
                id,
                options,
            } => self.emit(HostEvent::ServiceRequest(ServiceRequest::ShowInputModal {
                request_id,
                extension_id: id,
                options,
            })),
            WorkerMessage::StateSet { id, key, value } => {
                self.emit(HostEvent::StateChanged { id, key, value })
            }
        }
    }

    /// The worker's stdout closed; make sure the process goes away too.
    fn on_stream_closed(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if let Some(worker) = state.worker.as_mut().filter(|w| w.generation == generation) {
            if let Some(kill) = worker.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    fn on_exit(&self, generation: u64, code: Option<i32>) {
        let crashed = {
            let mut state = self.inner.state.lock();
            match state.worker.take() {
                Some(worker) if worker.generation == generation => {
                    for task in worker.tasks {
                        task.abort();
                    }
                }
                other => {
                    state.worker = other;
                    return;
                }
            }
            !state.shutting_down
        };

        if crashed {
            warn!(generation, ?code, "Extension worker exited unexpectedly");
            self.handle_crash();
        } else {
            info!(generation, ?code, "Extension worker exited");
            self.inner.pending.reject_all(HostError::ShuttingDown);
        }
    }

    fn handle_crash(&self) {
        let rejected = self.inner.pending.reject_all(HostError::Crashed);
        if rejected > 0 {
            debug!(rejected, "Rejected outstanding requests after crash");
        }

        let mut state = self.inner.state.lock();
        if state.shutting_down || state.restart_task.is_some() || state.exhausted {
            return;
        }
        match state.budget.on_crash() {
            Some(delay) => {
                let attempt = state.budget.restart_count();
                warn!(attempt, ?delay, "Scheduling extension worker restart");
                let weak = Arc::downgrade(&self.inner);
                state.restart_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        HostSupervisor { inner }.restart(attempt).await;
                    }
                }));
            }
            None => {
                state.exhausted = true;
                error!(
                    restarts = state.budget.policy().max_restarts,
                    "Extension worker restart budget exhausted; giving up"
                );
                drop(state);
                self.emit(HostEvent::BudgetExhausted);
            }
        }
    }

    async fn restart(&self, attempt: u32) {
        let _guard = self.inner.spawn_lock.lock().await;
        {
            let mut state = self.inner.state.lock();
            state.restart_task = None;
            if state.shutting_down || state.worker.is_some() {
                return;
            }
        }
        if self.spawn_worker().await.is_ok() {
            info!(attempt, "Extension worker restarted");
            self.emit(HostEvent::Restarted { attempt });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn write_loop(stdin: BoxedWriter, mut rx: mpsc::UnboundedReceiver<HostMessage>) {
    let mut writer = FrameWriter::new(stdin);
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.send(&msg).await {
            warn!("Failed to write to extension worker: {}", e);
            break;
        }
    }
}

async fn read_loop(inner: Weak<Inner>, generation: u64, stdout: BoxedReader) {
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.recv::<WorkerMessage>().await {
            Ok(Some(msg)) => match inner.upgrade() {
                Some(inner) => HostSupervisor { inner }.dispatch(generation, msg),
                None => return,
            },
            Ok(None) => {
                debug!(generation, "Extension worker closed its output");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(generation, "Skipping malformed frame from worker: {}", e);
            }
            Err(e) => {
                warn!(generation, "Error reading from extension worker: {}", e);
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        HostSupervisor { inner }.on_stream_closed(generation);
    }
}

async fn stderr_loop(stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "extension_host::stderr", "{}", line);
    }
}

enum Exit {
    Exited(std::io::Result<Option<i32>>),
    Kill,
}

async fn monitor(
    inner: Weak<Inner>,
    generation: u64,
    mut child: Box<dyn WorkerChild>,
    mut kill: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
) {
    let outcome = tokio::select! {
        status = child.wait() => Exit::Exited(status),
        _ = &mut kill => Exit::Kill,
    };
    let status = match outcome {
        Exit::Exited(status) => status,
        Exit::Kill => {
            if let Err(e) = child.kill().await {
                warn!(generation, "Failed to kill extension worker: {}", e);
            }
            child.wait().await
        }
    };
    let code = status.unwrap_or_else(|e| {
        warn!(generation, "Failed to wait for extension worker: {}", e);
        None
    });

    if let Some(inner) = inner.upgrade() {
        HostSupervisor { inner }.on_exit(generation, code);
    }
    let _ = exited.send(true);
}
