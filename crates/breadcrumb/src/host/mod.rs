//! Host side of the process boundary: launching, supervising, and talking to
//! the extension worker.

mod launcher;
mod pending;
mod restart;
mod supervisor;

pub use launcher::{
    BoxedReader, BoxedWriter, ProcessLauncher, WORKER_BINARY, WorkerChild, WorkerLauncher,
    WorkerProcess, resolve_worker_binary,
};
pub use pending::{PendingKey, PendingRequests, Reply};
pub use restart::{RestartBudget, RestartPolicy};
pub use supervisor::{HostError, HostEvent, HostSupervisor, ServiceRequest, SupervisorConfig};
