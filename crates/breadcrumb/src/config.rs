//! Host settings.
//!
//! Layered with figment: built-in defaults, then `breadcrumb.toml` when
//! present, then `BREADCRUMB_*` environment variables (`__` separates
//! nested keys, e.g. `BREADCRUMB_WORKER__COMMAND_TIMEOUT_MS=60000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::host::{RestartPolicy, SupervisorConfig};

/// Default settings file, looked up in the working directory.
pub const SETTINGS_FILE: &str = "breadcrumb.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid settings: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("restart.backoff_multiplier must be at least 1.0, got {0}")]
    BadMultiplier(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub extensions: ExtensionDirs,
    pub worker: WorkerSettings,
    pub restart: RestartSettings,
}

/// Where extensions are discovered, in precedence order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionDirs {
    pub user: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub bundled: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker executable. Defaults to a sibling of the current executable,
    /// then `PATH`.
    pub binary: Option<PathBuf>,
    pub activate_timeout_ms: u64,
    pub deactivate_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            binary: None,
            activate_timeout_ms: 10_000,
            deactivate_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            shutdown_grace_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Uptime after which the crash counter resets. Unset keeps counting.
    pub stable_window_ms: Option<u64>,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            stable_window_ms: None,
        }
    }
}

impl HostSettings {
    /// Load defaults, `breadcrumb.toml` from the working directory, and the
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(SETTINGS_FILE))
    }

    /// Like [`HostSettings::load`] with an explicit settings file. A missing
    /// file is not an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings: HostSettings = Figment::from(Serialized::defaults(HostSettings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BREADCRUMB_").split("__"))
            .extract()
            .map_err(Box::new)?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.restart.backoff_multiplier < 1.0 {
            return Err(ConfigError::BadMultiplier(self.restart.backoff_multiplier));
        }
        Ok(())
    }

    /// Configured extension directories with their discovery source.
    pub fn directories(&self) -> Vec<(crate::extensions::ExtensionSource, PathBuf)> {
        use crate::extensions::ExtensionSource;
        [
            (ExtensionSource::User, &self.extensions.user),
            (ExtensionSource::Workspace, &self.extensions.workspace),
            (ExtensionSource::Bundled, &self.extensions.bundled),
        ]
        .into_iter()
        .filter_map(|(source, dir)| dir.clone().map(|dir| (source, dir)))
        .collect()
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.restart.max_restarts,
            initial_backoff: Duration::from_millis(self.restart.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.restart.max_backoff_ms),
            backoff_multiplier: self.restart.backoff_multiplier,
            restart_window: self.restart.stable_window_ms.map(Duration::from_millis),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            restart: self.restart_policy(),
            activate_timeout: Duration::from_millis(self.worker.activate_timeout_ms),
            deactivate_timeout: Duration::from_millis(self.worker.deactivate_timeout_ms),
            command_timeout: Duration::from_millis(self.worker.command_timeout_ms),
            shutdown_grace: Duration::from_millis(self.worker.shutdown_grace_ms),
        }
    }
}
