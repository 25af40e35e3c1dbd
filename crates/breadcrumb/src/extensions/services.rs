//! Shell services extensions can request through the worker.

use async_trait::async_trait;
use breadcrumb_ext_protocol::{InputModalOptions, TerminalOptions};

/// Opens terminal sessions for extensions.
#[async_trait]
pub trait TerminalProvider: Send + Sync {
    /// Returns the id of the new session.
    async fn create_terminal(
        &self,
        extension_id: &str,
        options: TerminalOptions,
    ) -> anyhow::Result<String>;
}

/// Presents modals for extensions.
#[async_trait]
pub trait ModalProvider: Send + Sync {
    /// Returns `None` when the user dismissed the modal.
    async fn show_input(
        &self,
        extension_id: &str,
        options: InputModalOptions,
    ) -> anyhow::Result<Option<String>>;
}

/// Stand-in for shells without a UI: terminals are refused and modals are
/// dismissed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServices;

#[async_trait]
impl TerminalProvider for NoServices {
    async fn create_terminal(
        &self,
        extension_id: &str,
        _options: TerminalOptions,
    ) -> anyhow::Result<String> {
        anyhow::bail!("No terminal provider available for {extension_id}")
    }
}

#[async_trait]
impl ModalProvider for NoServices {
    async fn show_input(
        &self,
        _extension_id: &str,
        _options: InputModalOptions,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
