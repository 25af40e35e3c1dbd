//! Error types for the worker runtime.

use std::path::PathBuf;

/// Errors that can occur while locating and loading extension code.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Extension directory {path} is not accessible: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Entry point not found: {0}")]
    EntryNotFound(PathBuf),

    #[error("Entry point {entry} resolves outside of the extension directory {root}")]
    OutsideExtension { entry: String, root: PathBuf },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extension module {0} does not export an activate function")]
    MissingActivate(PathBuf),

    #[error("Failed to evaluate {path}: {source}")]
    Evaluate {
        path: PathBuf,
        #[source]
        source: PluginError,
    },
}

/// An error raised by extension code, with its stack when one was captured.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
    pub stack: Option<String>,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            message: message.into(),
            stack,
        }
    }

    /// Pull a message and stack out of an arbitrary error chain.
    pub fn describe(error: &anyhow::Error) -> Self {
        if let Some(plugin) = error.downcast_ref::<PluginError>() {
            return plugin.clone();
        }
        if let Some(LoadError::Evaluate { source, .. }) = error.downcast_ref::<LoadError>() {
            return PluginError::with_stack(error.to_string(), source.stack.clone());
        }
        PluginError::new(format!("{error:#}"))
    }
}
