//! Message vocabulary exchanged across the process boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the host supervisor to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Load and activate an extension.
    #[serde(rename_all = "camelCase")]
    Activate {
        id: String,
        /// Absolute install directory of the extension.
        path: PathBuf,
        /// Entry point, relative to `path`.
        entry: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_state: Option<Value>,
    },

    /// Run an extension's teardown and unload it.
    Deactivate { id: String },

    /// Invoke a registered command.
    #[serde(rename_all = "camelCase")]
    ExecuteCommand {
        request_id: u64,
        command_id: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Deactivate everything and exit.
    Shutdown,

    /// Completion of a worker-initiated [`WorkerMessage::TerminalCreate`].
    #[serde(rename_all = "camelCase")]
    ServiceCreated { request_id: u64, service_id: String },

    /// Failure of a worker-initiated [`WorkerMessage::TerminalCreate`].
    #[serde(rename_all = "camelCase")]
    ServiceCreateFailed { request_id: u64, message: String },

    /// Completion of a worker-initiated [`WorkerMessage::ShowInputModal`].
    /// `value` is `None` when the user dismissed the modal.
    #[serde(rename_all = "camelCase")]
    ModalResult {
        request_id: u64,
        #[serde(default)]
        value: Option<String>,
    },
}

/// Messages sent from the worker to the host supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// The worker finished booting and is reading messages.
    Ready,

    Activated { id: String },

    Deactivated { id: String },

    #[serde(rename_all = "camelCase")]
    CommandResult {
        request_id: u64,
        command_id: String,
        #[serde(default)]
        result: Value,
    },

    /// An error, optionally attributed to an extension and/or a command request.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    /// A command registered by extension `id` during activation.
    /// `command_id` is already namespaced.
    #[serde(rename_all = "camelCase")]
    RegisterCommand { id: String, command_id: String },

    Log { level: LogLevel, message: String },

    /// Ask the host to open a terminal session on behalf of extension `id`.
    #[serde(rename_all = "camelCase")]
    TerminalCreate {
        request_id: u64,
        id: String,
        #[serde(default)]
        options: TerminalOptions,
    },

    /// Ask the host to show a text input modal on behalf of extension `id`.
    #[serde(rename_all = "camelCase")]
    ShowInputModal {
        request_id: u64,
        id: String,
        options: InputModalOptions,
    },

    /// Persist one key of extension `id`'s state. A `null` value removes the key.
    StateSet { id: String, key: String, value: Value },
}

impl WorkerMessage {
    /// Build an error message with no stack.
    pub fn error(id: Option<String>, request_id: Option<u64>, message: impl Into<String>) -> Self {
        WorkerMessage::Error {
            id,
            request_id,
            message: message.into(),
            stack: None,
        }
    }
}

/// Severity of a forwarded log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lenient parse used for levels coming from extension code.
    pub fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Options for a terminal session requested by an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Options for a text input modal requested by an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputModalOptions {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub password: bool,
}
