//! Worker-initiated service requests.
//!
//! Extension code can ask the host for a terminal session or an input modal.
//! The request goes out through the outbox and the caller parks on a oneshot
//! until the stdin reader routes the matching completion back here. The
//! completions never pass through the runtime's message loop, so an extension
//! awaiting one inside `activate` cannot stall the loop that is running it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use breadcrumb_ext_protocol::{HostMessage, InputModalOptions, TerminalOptions, WorkerMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// Channel of messages bound for the host.
pub type Outbox = mpsc::UnboundedSender<WorkerMessage>;

/// Errors returned to extension code for service requests.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Host refused the request: {0}")]
    Refused(String),

    #[error("Host connection closed")]
    Closed,

    #[error("Unexpected reply for request {0}")]
    UnexpectedReply(u64),
}

#[derive(Debug)]
enum ServiceReply {
    Created(String),
    Failed(String),
    Modal(Option<String>),
}

/// Sends messages to the host and correlates service replies.
#[derive(Clone)]
pub struct ServiceBroker {
    outbox: Outbox,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<ServiceReply>>>>,
    next_id: Arc<AtomicU64>,
}

impl ServiceBroker {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a message for the host. Dropped silently once the writer is gone.
    pub fn send(&self, msg: WorkerMessage) {
        let _ = self.outbox.send(msg);
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Ask the host to open a terminal for `extension_id`. Returns the session id.
    pub async fn create_terminal(
        &self,
        extension_id: &str,
        options: TerminalOptions,
    ) -> Result<String, ServiceError> {
        let (request_id, rx) = self.register();
        self.send(WorkerMessage::TerminalCreate {
            request_id,
            id: extension_id.to_string(),
            options,
        });
        match self.wait(request_id, rx).await? {
            ServiceReply::Created(service_id) => Ok(service_id),
            ServiceReply::Failed(message) => Err(ServiceError::Refused(message)),
            ServiceReply::Modal(_) => Err(ServiceError::UnexpectedReply(request_id)),
        }
    }

    /// Ask the host to show an input modal. `None` means the user dismissed it.
    pub async fn show_input_modal(
        &self,
        extension_id: &str,
        options: InputModalOptions,
    ) -> Result<Option<String>, ServiceError> {
        let (request_id, rx) = self.register();
        self.send(WorkerMessage::ShowInputModal {
            request_id,
            id: extension_id.to_string(),
            options,
        });
        match self.wait(request_id, rx).await? {
            ServiceReply::Modal(value) => Ok(value),
            ServiceReply::Failed(message) => Err(ServiceError::Refused(message)),
            ServiceReply::Created(_) => Err(ServiceError::UnexpectedReply(request_id)),
        }
    }

    /// Consume service completions; pass every other message through.
    pub fn intercept(&self, msg: HostMessage) -> Option<HostMessage> {
        let (request_id, reply) = match msg {
            HostMessage::ServiceCreated {
                request_id,
                service_id,
            } => (request_id, ServiceReply::Created(service_id)),
            HostMessage::ServiceCreateFailed {
                request_id,
                message,
            } => (request_id, ServiceReply::Failed(message)),
            HostMessage::ModalResult { request_id, value } => {
                (request_id, ServiceReply::Modal(value))
            }
            other => return Some(other),
        };

        match self.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(request_id, "Reply for unknown service request"),
        }
        None
    }

    /// Fail every outstanding request; used when the host connection closes.
    pub fn close(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self) -> (u64, oneshot::Receiver<ServiceReply>) {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        (request_id, rx)
    }

    async fn wait(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<ServiceReply>,
    ) -> Result<ServiceReply, ServiceError> {
        rx.await.map_err(|_| {
            self.pending.lock().remove(&request_id);
            ServiceError::Closed
        })
    }
}
