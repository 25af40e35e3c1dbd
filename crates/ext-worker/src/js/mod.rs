//! JavaScript plugin loader backed by `deno_core`.
//!
//! All extensions share one isolate. Each module is evaluated inside its own
//! function scope and tracked in the bootstrap's module table under its
//! extension id; calls from Rust go through `globalThis.__breadcrumb` and
//! come back as a settled JSON string.
//!
//! The isolate is driven by a local task, so loading must happen inside a
//! Tokio `LocalSet`.

mod engine;
mod ops;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use async_trait::async_trait;
use deno_core::error::JsError;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{LoadError, PluginError};
use crate::loader::{ActivationContext, PluginLoader, PluginModule, SourceCache};
use crate::services::ServiceBroker;

use engine::Engine;

/// Loads extension modules into a shared `JsRuntime`.
pub struct JsLoader {
    broker: ServiceBroker,
    engine: Option<Rc<Engine>>,
    cache: SourceCache,
    /// Extension id -> canonical extension directory.
    modules: HashMap<String, PathBuf>,
}

impl JsLoader {
    pub fn new(broker: ServiceBroker) -> Self {
        Self {
            broker,
            engine: None,
            cache: SourceCache::new(),
            modules: HashMap::new(),
        }
    }

    /// The runtime is created on first load.
    fn engine(&mut self) -> Rc<Engine> {
        let broker = self.broker.clone();
        self.engine
            .get_or_insert_with(|| Engine::spawn(broker))
            .clone()
    }

    /// Number of extension modules currently defined in the isolate.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Calls waiting on the isolate right now.
    pub fn calls_in_flight(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.in_flight())
    }

    fn forget(&mut self, extension_id: &str) {
        self.modules.remove(extension_id);
        if let Some(engine) = &self.engine {
            let script = format!("globalThis.__breadcrumb.forget({})", js_string(extension_id));
            if let Err(e) = engine.execute("<breadcrumb:forget>", script) {
                tracing::warn!(extension = %extension_id, "Failed to drop module record: {}", e);
            }
        }
    }

    fn define(
        &mut self,
        extension_id: &str,
        entry: &Path,
    ) -> Result<Rc<Engine>, LoadError> {
        let source = self.cache.read(entry)?.to_string();
        let engine = self.engine();
        let evaluate = |source: PluginError| LoadError::Evaluate {
            path: entry.to_path_buf(),
            source,
        };

        let script = format!(
            "globalThis.__breadcrumb.define({}, function (module, exports) {{\n{}\n}});",
            js_string(extension_id),
            source
        );
        engine
            .execute("<breadcrumb:define>", script)
            .map_err(&evaluate)?;

        let check = format!(
            "globalThis.__breadcrumb.hasActivate({})",
            js_string(extension_id)
        );
        let has_activate = engine
            .execute("<breadcrumb:has-activate>", check)
            .map_err(&evaluate)?;
        if !engine.is_true(&has_activate) {
            return Err(LoadError::MissingActivate(entry.to_path_buf()));
        }
        Ok(engine)
    }
}

impl PluginLoader for JsLoader {
    fn load(
        &mut self,
        extension_id: &str,
        extension_dir: &Path,
        entry: &Path,
    ) -> Result<Box<dyn PluginModule>, LoadError> {
        let engine = match self.define(extension_id, entry) {
            Ok(engine) => engine,
            Err(e) => {
                // A fixed file must be read again on the next attempt.
                self.cache.remove(entry);
                self.forget(extension_id);
                return Err(e);
            }
        };

        let root = extension_dir
            .canonicalize()
            .unwrap_or_else(|_| extension_dir.to_path_buf());
        self.modules.insert(extension_id.to_string(), root);

        Ok(Box::new(JsModule {
            id: extension_id.to_string(),
            engine,
        }))
    }

    fn purge(&mut self, extension_dir: &Path) -> usize {
        let root = extension_dir
            .canonicalize()
            .unwrap_or_else(|_| extension_dir.to_path_buf());
        let stale: Vec<String> = self
            .modules
            .iter()
            .filter(|(_, dir)| dir.starts_with(&root))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.forget(&id);
        }
        self.cache.purge(extension_dir)
    }
}

impl Drop for JsLoader {
    fn drop(&mut self) {
        if let Some(engine) = &self.engine {
            engine.close();
        }
    }
}

/// Handle to one extension's module inside the shared runtime.
pub struct JsModule {
    id: String,
    engine: Rc<Engine>,
}

impl JsModule {
    /// Run `__breadcrumb.<function>(id, ...args)` to completion.
    async fn call(&self, function: &str, args: &[Value]) -> anyhow::Result<Value> {
        let mut call_args = vec![js_string(&self.id)];
        call_args.extend(args.iter().map(Value::to_string));
        let script = format!(
            "globalThis.__breadcrumb.{}({})",
            function,
            call_args.join(", ")
        );

        let settled = self.engine.call(function, script).await?;
        serde_json::from_str::<Settled>(&settled)?.into_result()
    }
}

#[async_trait(?Send)]
impl PluginModule for JsModule {
    async fn activate(&self, ctx: &mut ActivationContext) -> anyhow::Result<()> {
        let path = Value::String(ctx.extension_path().display().to_string());
        let state = ctx.initial_state().cloned().unwrap_or(Value::Null);

        self.engine.registrations(|window| window.open(&self.id));
        let result = self.call("activate", &[path, state]).await;
        let registered = self
            .engine
            .registrations(|window| window.close(&self.id));

        for command_id in registered {
            ctx.register_command(&command_id);
        }
        result.map(|_| ())
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        self.call("deactivate", &[]).await.map(|_| ())
    }

    async fn dispose_subscriptions(&self) -> Vec<anyhow::Error> {
        let failures = match self.call("dispose", &[]).await {
            Ok(value) => value,
            Err(e) => return vec![e],
        };
        serde_json::from_value::<Vec<Failure>>(failures)
            .map(|failures| {
                failures
                    .into_iter()
                    .map(|f| PluginError::with_stack(f.message, f.stack).into())
                    .collect()
            })
            .unwrap_or_else(|e| vec![e.into()])
    }

    async fn execute(&self, handler: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        self.call("execute", &[Value::String(handler.to_string()), Value::Array(args)])
            .await
    }
}

/// Outcome of a bootstrap call.
#[derive(Debug, Deserialize)]
struct Settled {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack: Option<String>,
}

impl Settled {
    fn into_result(self) -> anyhow::Result<Value> {
        if self.ok {
            Ok(self.value)
        } else {
            let message = self
                .message
                .unwrap_or_else(|| "Extension code failed".to_string());
            Err(PluginError::with_stack(message, self.stack).into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct Failure {
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

/// Turn a runtime error into a [`PluginError`], keeping the JS stack when
/// the error came from script.
fn js_error(error: &anyhow::Error) -> PluginError {
    match error.downcast_ref::<JsError>() {
        Some(js) => PluginError::with_stack(js.exception_message.clone(), js.stack.clone()),
        None => PluginError::new(format!("{error:#}")),
    }
}

/// Quote `s` as a JavaScript string literal.
fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_failure_keeps_stack() {
        let settled: Settled = serde_json::from_str(
            r#"{"ok":false,"message":"boom","stack":"Error: boom\n    at activate"}"#,
        )
        .unwrap();
        let err = settled.into_result().unwrap_err();
        let plugin = err.downcast_ref::<PluginError>().unwrap();
        assert_eq!(plugin.message, "boom");
        assert!(plugin.stack.as_deref().unwrap().contains("at activate"));
    }

    #[test]
    fn test_settled_success_defaults_to_null() {
        let settled: Settled = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(settled.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string("a\"b"), r#""a\"b""#);
        assert_eq!(js_string("line\nbreak"), r#""line\nbreak""#);
    }
}
