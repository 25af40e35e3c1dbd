//! In-process fake of the extension worker.
//!
//! [`FakeLauncher`] hands the supervisor a pair of in-memory pipes with a
//! scripted worker task on the other end, so supervisor and manager behavior
//! can be exercised with paused time and without a real child process.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use breadcrumb::host::{WorkerChild, WorkerLauncher, WorkerProcess};
use breadcrumb_ext_protocol::{FrameReader, FrameWriter, HostMessage, TerminalOptions, WorkerMessage};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the fake worker reacts, per extension id.
#[derive(Clone, Default)]
pub struct Script {
    /// Local command names registered on activation (namespaced by the fake).
    pub commands: HashMap<String, Vec<String>>,
    pub fail_activate: HashSet<String>,
    pub hang_activate: HashSet<String>,
    pub activate_delay: HashMap<String, Duration>,
    /// `state-set` messages sent during activation.
    pub state_on_activate: HashMap<String, Vec<(String, serde_json::Value)>>,
    /// Ask the host for a terminal during activation.
    pub terminal_on_activate: HashSet<String>,
    pub fail_deactivate: HashSet<String>,
    pub hang_deactivate: HashSet<String>,
    /// Command ids that never answer.
    pub hang_commands: HashSet<String>,
    pub ignore_shutdown: bool,
}

struct Shared {
    script: Mutex<Script>,
    received: Mutex<Vec<HostMessage>>,
    launches: AtomicUsize,
    fail_launch: AtomicBool,
    crash: Notify,
}

/// Handle the test keeps to script and observe the fake worker.
#[derive(Clone)]
pub struct FakeWorker {
    shared: Arc<Shared>,
}

impl FakeWorker {
    pub fn new() -> (Self, Arc<dyn WorkerLauncher>) {
        let shared = Arc::new(Shared {
            script: Mutex::new(Script::default()),
            received: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            fail_launch: AtomicBool::new(false),
            crash: Notify::new(),
        });
        let launcher = Arc::new(FakeLauncher {
            shared: shared.clone(),
        });
        (Self { shared }, launcher)
    }

    pub fn script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.shared.script.lock());
    }

    pub fn commands(&self, id: &str, commands: &[&str]) {
        self.script(|s| {
            s.commands
                .insert(id.to_string(), commands.iter().map(|c| c.to_string()).collect());
        });
    }

    /// Make the running worker exit with a non-zero code. If none is running,
    /// the next one to start exits immediately.
    pub fn crash(&self) {
        self.shared.crash.notify_one();
    }

    pub fn fail_launch(&self, fail: bool) {
        self.shared.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<HostMessage> {
        self.shared.received.lock().clone()
    }

    /// Ids of the `activate` messages received, in order.
    pub fn activations(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|msg| match msg {
                HostMessage::Activate { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn deactivations(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|msg| match msg {
                HostMessage::Deactivate { id } => Some(id),
                _ => None,
            })
            .collect()
    }
}

struct FakeLauncher {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> io::Result<WorkerProcess> {
        if self.shared.fail_launch.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such worker"));
        }
        self.shared.launches.fetch_add(1, Ordering::SeqCst);

        let (host_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, host_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(run_worker(self.shared.clone(), worker_stdin, worker_stdout));

        Ok(WorkerProcess {
            stdin: Box::new(host_stdin),
            stdout: Box::new(host_stdout),
            stderr: None,
            child: Box::new(FakeChild {
                task: Some(task),
                code: None,
            }),
        })
    }
}

struct FakeChild {
    task: Option<JoinHandle<Option<i32>>>,
    code: Option<Option<i32>>,
}

#[async_trait]
impl WorkerChild for FakeChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.code {
            return Ok(code);
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(None);
        };
        // An aborted task is a killed process: no exit code.
        let code = task.await.unwrap_or(None);
        self.task = None;
        self.code = Some(code);
        Ok(code)
    }

    async fn kill(&mut self) -> io::Result<()> {
        if let Some(task) = &self.task {
            task.abort();
        }
        Ok(())
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    stdin: DuplexStream,
    stdout: DuplexStream,
) -> Option<i32> {
    let mut reader = FrameReader::new(stdin);
    let mut writer = FrameWriter::new(stdout);
    writer.send(&WorkerMessage::Ready).await.ok()?;

    loop {
        let next = tokio::select! {
            _ = shared.crash.notified() => return Some(1),
            next = reader.recv::<HostMessage>() => next,
        };
        let Ok(Some(msg)) = next else {
            return Some(0);
        };
        shared.received.lock().push(msg.clone());
        let script = shared.script.lock().clone();

        match msg {
            HostMessage::Activate { id, .. } => {
                if let Some(delay) = script.activate_delay.get(&id) {
                    tokio::time::sleep(*delay).await;
                }
                if script.hang_activate.contains(&id) {
                    continue;
                }
                if script.terminal_on_activate.contains(&id) {
                    let request = WorkerMessage::TerminalCreate {
                        request_id: 1,
                        id: id.clone(),
                        options: TerminalOptions {
                            name: Some(format!("{id} shell")),
                            ..Default::default()
                        },
                    };
                    writer.send(&request).await.ok()?;
                    await_service_reply(&shared, &mut reader).await?;
                }
                if script.fail_activate.contains(&id) {
                    let error = WorkerMessage::Error {
                        id: Some(id),
                        request_id: None,
                        message: "activate() threw: boom".to_string(),
                        stack: Some("Error: boom\n    at activate (main.js:3:9)".to_string()),
                    };
                    writer.send(&error).await.ok()?;
                    continue;
                }
                for (key, value) in script.state_on_activate.get(&id).into_iter().flatten() {
                    let state = WorkerMessage::StateSet {
                        id: id.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    };
                    writer.send(&state).await.ok()?;
                }
                for command in script.commands.get(&id).into_iter().flatten() {
                    let register = WorkerMessage::RegisterCommand {
                        id: id.clone(),
                        command_id: format!("{id}.{command}"),
                    };
                    writer.send(&register).await.ok()?;
                }
                writer.send(&WorkerMessage::Activated { id }).await.ok()?;
            }
            HostMessage::Deactivate { id } => {
                if script.hang_deactivate.contains(&id) {
                    continue;
                }
                if script.fail_deactivate.contains(&id) {
                    let error = WorkerMessage::error(
                        Some(id.clone()),
                        None,
                        "deactivate failed: teardown threw",
                    );
                    writer.send(&error).await.ok()?;
                }
                writer.send(&WorkerMessage::Deactivated { id }).await.ok()?;
            }
            HostMessage::ExecuteCommand {
                request_id,
                command_id,
                args,
            } => {
                if script.hang_commands.contains(&command_id) {
                    continue;
                }
                let result = WorkerMessage::CommandResult {
                    request_id,
                    command_id,
                    result: json!({ "echo": args }),
                };
                writer.send(&result).await.ok()?;
            }
            HostMessage::Shutdown => {
                if !script.ignore_shutdown {
                    return Some(0);
                }
            }
            HostMessage::ServiceCreated { .. }
            | HostMessage::ServiceCreateFailed { .. }
            | HostMessage::ModalResult { .. } => {}
        }
    }
}

/// Read frames until the host answers a service request, recording them all.
async fn await_service_reply(
    shared: &Shared,
    reader: &mut FrameReader<DuplexStream>,
) -> Option<()> {
    loop {
        let msg = reader.recv::<HostMessage>().await.ok()??;
        shared.received.lock().push(msg.clone());
        if matches!(
            msg,
            HostMessage::ServiceCreated { .. } | HostMessage::ServiceCreateFailed { .. }
        ) {
            return Some(());
        }
    }
}

/// Write an `extension.json` for `name` under `root/name`.
pub fn write_extension(root: &Path, name: &str, extra: serde_json::Value) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut manifest = json!({
        "name": name,
        "version": "1.0.0",
        "main": "main.js",
        "engines": { "breadcrumb": "^1.0.0" },
    });
    if let (Some(manifest), Some(extra)) = (manifest.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            manifest.insert(key.clone(), value.clone());
        }
    }
    std::fs::write(
        dir.join(breadcrumb::manifest::MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join("main.js"), "exports.activate = () => {};\n").unwrap();
}
