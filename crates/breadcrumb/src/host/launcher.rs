//! Spawning the worker process.
//!
//! The supervisor only sees a [`WorkerProcess`]: two framed byte streams, an
//! optional stderr stream, and a handle to wait on or kill. Production code
//! uses [`ProcessLauncher`]; tests plug in an in-process fake.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::info;

/// Name of the worker executable.
pub const WORKER_BINARY: &str = "breadcrumb-ext-worker";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running worker.
pub struct WorkerProcess {
    /// Host -> worker frames.
    pub stdin: BoxedWriter,
    /// Worker -> host frames.
    pub stdout: BoxedReader,
    /// Diagnostic output, logged line by line.
    pub stderr: Option<BoxedReader>,
    pub child: Box<dyn WorkerChild>,
}

/// Lifetime handle of a worker.
#[async_trait]
pub trait WorkerChild: Send {
    fn id(&self) -> Option<u32> {
        None
    }

    /// Wait for exit. Returns the exit code when there is one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    async fn kill(&mut self) -> io::Result<()>;
}

/// Starts worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> io::Result<WorkerProcess>;
}

/// Launches the worker executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Use `binary` when given, otherwise [`resolve_worker_binary`].
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self {
            binary: binary.unwrap_or_else(resolve_worker_binary),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

/// Find the worker executable: next to the current executable first, then
/// by name on `PATH`.
pub fn resolve_worker_binary() -> PathBuf {
    let file_name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        if let Some(sibling) = exe.parent().map(|dir| dir.join(&file_name)) {
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from(file_name)
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> io::Result<WorkerProcess> {
        info!(binary = %self.binary.display(), "Spawning extension worker");

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing = |stream: &str| io::Error::other(format!("worker {stream} was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Box::new(ChildHandle(child)),
        })
    }
}

struct ChildHandle(Child);

#[async_trait]
impl WorkerChild for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.0.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}
