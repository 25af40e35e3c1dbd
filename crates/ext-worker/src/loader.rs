//! Plugin loading seam.
//!
//! A [`PluginLoader`] turns a validated extension directory plus entry point
//! into a [`PluginModule`] handle. The loader only ever sees paths that
//! [`resolve_entry`] has confined to the extension's own directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LoadError;

/// Loads extension code.
pub trait PluginLoader {
    /// Load the module at `entry` (already resolved inside `extension_dir`).
    ///
    /// Fails with [`LoadError::MissingActivate`] when the module has no
    /// activation entry point.
    fn load(
        &mut self,
        extension_id: &str,
        extension_dir: &Path,
        entry: &Path,
    ) -> Result<Box<dyn PluginModule>, LoadError>;

    /// Drop every cached source under `extension_dir` so the next load reads
    /// fresh code. Returns the number of entries removed.
    fn purge(&mut self, extension_dir: &Path) -> usize;
}

/// A loaded extension module.
///
/// Methods take `&self`: commands for one module may be in flight while
/// another is still running.
#[async_trait(?Send)]
pub trait PluginModule {
    /// Run the module's activation entry point.
    async fn activate(&self, ctx: &mut ActivationContext) -> anyhow::Result<()>;

    /// Run the module's teardown entry point, if it has one.
    async fn deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Dispose subscriptions held on the module's side of the boundary.
    /// Returns one error per disposer that failed.
    async fn dispose_subscriptions(&self) -> Vec<anyhow::Error> {
        Vec::new()
    }

    /// Invoke the handler registered under `handler` (the un-namespaced id the
    /// module passed to [`ActivationContext::register_command`]).
    async fn execute(&self, handler: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// Something that must be released when its extension deactivates.
pub trait Disposable {
    fn dispose(self: Box<Self>) -> anyhow::Result<()>;
}

impl<F> Disposable for F
where
    F: FnOnce() -> anyhow::Result<()>,
{
    fn dispose(self: Box<Self>) -> anyhow::Result<()> {
        (*self)()
    }
}

/// One entry of an activation context's subscription list.
pub enum Subscription {
    /// A registered command; disposing unbinds it.
    Command(String),
    Custom(Box<dyn Disposable>),
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subscription::Command(id) => f.debug_tuple("Command").field(id).finish(),
            Subscription::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A command registered during activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Namespaced id, `<extensionId>.<commandId>`.
    pub command_id: String,
    /// The id the module registered, used to find its handler again.
    pub handler: String,
}

/// Per-activation context handed to [`PluginModule::activate`].
///
/// The acting extension's id is part of the context, so every registration is
/// namespaced without touching any shared state.
#[derive(Debug)]
pub struct ActivationContext {
    extension_id: String,
    extension_path: PathBuf,
    initial_state: Option<Value>,
    registrations: Vec<Registration>,
    pub(crate) subscriptions: Vec<Subscription>,
}

impl ActivationContext {
    pub fn new(
        extension_id: impl Into<String>,
        extension_path: impl Into<PathBuf>,
        initial_state: Option<Value>,
    ) -> Self {
        Self {
            extension_id: extension_id.into(),
            extension_path: extension_path.into(),
            initial_state,
            registrations: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn extension_path(&self) -> &Path {
        &self.extension_path
    }

    pub fn initial_state(&self) -> Option<&Value> {
        self.initial_state.as_ref()
    }

    /// Register a command handler. Returns the namespaced command id.
    pub fn register_command(&mut self, command_id: &str) -> String {
        let qualified = qualify_command(&self.extension_id, command_id);
        self.registrations
            .retain(|existing| existing.command_id != qualified);
        self.registrations.push(Registration {
            command_id: qualified.clone(),
            handler: command_id.to_string(),
        });
        self.subscriptions
            .push(Subscription::Command(qualified.clone()));
        qualified
    }

    /// Track a disposable to release on deactivation.
    pub fn subscribe(&mut self, disposable: impl Disposable + 'static) {
        self.subscriptions
            .push(Subscription::Custom(Box::new(disposable)));
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Namespace `command_id` under `extension_id` unless it already is.
pub fn qualify_command(extension_id: &str, command_id: &str) -> String {
    let prefix = format!("{extension_id}.");
    if command_id.starts_with(&prefix) {
        command_id.to_string()
    } else {
        format!("{prefix}{command_id}")
    }
}

/// Resolve `entry` against the extension's own directory.
///
/// The result is canonical and guaranteed to live under `extension_dir`.
/// An entry without an extension falls back to `<entry>.js`.
pub fn resolve_entry(extension_dir: &Path, entry: &str) -> Result<PathBuf, LoadError> {
    let root = extension_dir
        .canonicalize()
        .map_err(|source| LoadError::Directory {
            path: extension_dir.to_path_buf(),
            source,
        })?;

    let candidate = root.join(entry);
    let resolved = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) if candidate.extension().is_none() => candidate
            .with_extension("js")
            .canonicalize()
            .map_err(|_| LoadError::EntryNotFound(candidate.clone()))?,
        Err(_) => return Err(LoadError::EntryNotFound(candidate)),
    };

    if !resolved.starts_with(&root) {
        return Err(LoadError::OutsideExtension {
            entry: entry.to_string(),
            root,
        });
    }
    if !resolved.is_file() {
        return Err(LoadError::EntryNotFound(resolved));
    }
    Ok(resolved)
}

/// Cache of loaded source text keyed by canonical path.
#[derive(Debug, Default)]
pub struct SourceCache {
    entries: HashMap<PathBuf, String>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached source for `path`, reading it on first use.
    pub fn read(&mut self, path: &Path) -> Result<&str, LoadError> {
        if !self.entries.contains_key(path) {
            let source = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            self.entries.insert(path.to_path_buf(), source);
        }
        Ok(self.entries.get(path).map(String::as_str).unwrap_or_default())
    }

    /// Forget one file.
    pub fn remove(&mut self, path: &Path) -> bool {
        self.entries.remove(path).is_some()
    }

    /// Remove every entry under `dir`.
    pub fn purge(&mut self, dir: &Path) -> usize {
        let root = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let before = self.entries.len();
        self.entries.retain(|path, _| !path.starts_with(&root));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
