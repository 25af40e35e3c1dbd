//! Correlation of outstanding worker requests.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use super::supervisor::HostError;

/// Correlation key of an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKey {
    Activate(String),
    Deactivate(String),
    Command(u64),
}

/// Successful completion of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    /// Activation finished; carries the commands registered on the way.
    Activated(Vec<String>),
    CommandResult(Value),
}

pub type ReplyResult = Result<Reply, HostError>;

#[derive(Default)]
struct Pending {
    waiters: Vec<oneshot::Sender<ReplyResult>>,
    commands: Vec<String>,
}

/// Outstanding requests keyed by [`PendingKey`]. Several callers may wait on
/// the same key; all of them receive the same outcome.
#[derive(Default)]
pub struct PendingRequests {
    requests: DashMap<PendingKey, Pending>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: PendingKey) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        self.requests.entry(key).or_default().waiters.push(tx);
        rx
    }

    /// Record a command registered while `extension_id` is activating.
    pub fn note_command(&self, extension_id: &str, command_id: &str) -> bool {
        match self
            .requests
            .get_mut(&PendingKey::Activate(extension_id.to_string()))
        {
            Some(mut pending) => {
                pending.commands.push(command_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Complete `key`. Returns false when nobody was waiting, which happens
    /// for replies that arrive after a timeout.
    pub fn resolve(&self, key: &PendingKey, result: ReplyResult) -> bool {
        let Some((_, pending)) = self.requests.remove(key) else {
            return false;
        };
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
        true
    }

    /// Complete an activation, attaching the commands noted for it.
    pub fn resolve_activation(&self, extension_id: &str, outcome: Result<(), HostError>) -> bool {
        let key = PendingKey::Activate(extension_id.to_string());
        let Some((_, pending)) = self.requests.remove(&key) else {
            return false;
        };
        let result = outcome.map(|()| Reply::Activated(pending.commands));
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
        true
    }

    pub fn remove(&self, key: &PendingKey) {
        self.requests.remove(key);
    }

    /// Fail every outstanding request with `error`.
    pub fn reject_all(&self, error: HostError) -> usize {
        let keys: Vec<PendingKey> = self.requests.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for key in keys {
            if self.resolve(&key, Err(error.clone())) {
                rejected += 1;
            }
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
