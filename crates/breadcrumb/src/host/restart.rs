//! Restart budget with exponential backoff.

use std::time::Duration;

use tokio::time::Instant;

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Maximum number of restarts before giving up
    pub max_restarts: u32,
    /// Delay before the first restart
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Uptime after which the crash counter resets. `None` never resets.
    pub restart_window: Option<Duration>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            restart_window: None,
        }
    }
}

/// Tracks consecutive crashes against a [`RestartPolicy`].
#[derive(Debug)]
pub struct RestartBudget {
    policy: RestartPolicy,
    restart_count: u32,
    current_backoff: Duration,
    last_start: Option<Instant>,
}

impl RestartBudget {
    pub fn new(policy: RestartPolicy) -> Self {
        let initial_backoff = policy.initial_backoff;
        Self {
            policy,
            restart_count: 0,
            current_backoff: initial_backoff,
            last_start: None,
        }
    }

    /// Called when a worker starts.
    pub fn on_start(&mut self) {
        self.last_start = Some(Instant::now());
    }

    /// Called when the worker crashes. Returns the delay before the next
    /// restart, or `None` once the budget is spent.
    pub fn on_crash(&mut self) -> Option<Duration> {
        if let (Some(window), Some(started)) = (self.policy.restart_window, self.last_start) {
            if started.elapsed() >= window {
                self.reset();
            }
        }

        self.restart_count += 1;
        if self.restart_count > self.policy.max_restarts {
            return None;
        }

        let delay = self.current_backoff;
        self.current_backoff = Duration::from_secs_f64(
            (self.current_backoff.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_backoff.as_secs_f64()),
        );
        Some(delay)
    }

    /// Forget previous crashes.
    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.current_backoff = self.policy.initial_backoff;
    }

    /// Restarts consumed so far.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// True once a crash has been refused a restart.
    pub fn is_exhausted(&self) -> bool {
        self.restart_count > self.policy.max_restarts
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}
