//! The JavaScript loader end to end: real modules on disk, one shared isolate.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use breadcrumb_ext_protocol::{HostMessage, WorkerMessage};
use breadcrumb_ext_worker::{JsLoader, ServiceBroker, WorkerRuntime};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    dir: TempDir,
    runtime: Rc<WorkerRuntime<JsLoader>>,
    broker: ServiceBroker,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl Harness {
    fn new() -> Self {
        let (outbox, rx) = mpsc::unbounded_channel();
        let broker = ServiceBroker::new(outbox.clone());
        let runtime = WorkerRuntime::new(JsLoader::new(broker.clone()), outbox);
        Self {
            dir: TempDir::new().unwrap(),
            runtime: Rc::new(runtime),
            broker,
            rx,
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.path().join(id)
    }

    fn write(&self, id: &str, source: &str) {
        std::fs::create_dir_all(self.path(id)).unwrap();
        std::fs::write(self.path(id).join("main.js"), source).unwrap();
    }

    fn activate_message(&self, id: &str) -> HostMessage {
        HostMessage::Activate {
            id: id.into(),
            path: self.path(id),
            entry: "main.js".into(),
            initial_state: None,
        }
    }

    async fn send(&mut self, msg: HostMessage) -> Vec<WorkerMessage> {
        self.runtime.dispatch(msg).await;
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn activate(&mut self, id: &str) -> Vec<WorkerMessage> {
        let msg = self.activate_message(id);
        self.send(msg).await
    }

    async fn execute(&mut self, request_id: u64, command_id: &str, args: Vec<Value>) -> WorkerMessage {
        let mut out = self
            .send(HostMessage::ExecuteCommand {
                request_id,
                command_id: command_id.into(),
                args,
            })
            .await;
        assert_eq!(out.len(), 1, "unexpected replies: {out:?}");
        out.remove(0)
    }

    /// Handle `msg` on its own task, the way the worker's message loop does.
    fn spawn(&self, msg: HostMessage) {
        let runtime = self.runtime.clone();
        tokio::task::spawn_local(async move {
            runtime.dispatch(msg).await;
        });
    }

    async fn next(&mut self) -> WorkerMessage {
        tokio::time::timeout(REPLY_TIMEOUT, self.rx.recv())
            .await
            .expect("no reply from the worker")
            .expect("outbox closed")
    }
}

fn error_message(msg: &WorkerMessage) -> &str {
    match msg {
        WorkerMessage::Error { message, .. } => message.as_str(),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_commands_are_namespaced_per_extension() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write(
                "a",
                r#"exports.activate = (ctx) => {
                    ctx.registerCommand("run", (n) => ({ doubled: n * 2 }));
                };"#,
            );

            let out = h.activate("a").await;
            assert_eq!(
                out,
                vec![
                    WorkerMessage::RegisterCommand {
                        id: "a".into(),
                        command_id: "a.run".into()
                    },
                    WorkerMessage::Activated { id: "a".into() },
                ]
            );

            assert_eq!(
                h.execute(1, "a.run", vec![json!(21)]).await,
                WorkerMessage::CommandResult {
                    request_id: 1,
                    command_id: "a.run".into(),
                    result: json!({ "doubled": 42 }),
                }
            );

            let reply = h.execute(2, "run", vec![]).await;
            assert!(error_message(&reply).contains("Command not found: run"));
        })
        .await;
}

#[tokio::test]
async fn test_registration_outside_activate_is_rejected() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write(
                "a",
                r#"exports.activate = (ctx) => {
                    ctx.registerCommand("late", () => {
                        ctx.registerCommand("later", () => 1);
                    });
                };"#,
            );
            h.activate("a").await;

            let reply = h.execute(1, "a.late", vec![]).await;
            assert!(matches!(
                reply,
                WorkerMessage::Error {
                    request_id: Some(1),
                    ..
                }
            ));
            assert!(error_message(&reply).contains("Cannot register a.later outside of activate()"));
            assert!(h.runtime.commands().get("a.later").is_none());
        })
        .await;
}

#[tokio::test]
async fn test_throwing_teardown_and_disposer_still_deactivate() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write(
                "a",
                r#"exports.activate = (ctx) => {
                    ctx.registerCommand("run", () => "ok");
                    ctx.subscriptions.push({ dispose() { throw new Error("disposer broke"); } });
                    ctx.subscriptions.push({
                        dispose() { globalThis.__disposed = (globalThis.__disposed ?? 0) + 1; },
                    });
                };
                exports.deactivate = () => { throw new Error("teardown threw"); };"#,
            );
            h.write(
                "b",
                r#"exports.activate = (ctx) => {
                    ctx.registerCommand("disposed", () => globalThis.__disposed ?? 0);
                };"#,
            );
            h.activate("a").await;
            h.activate("b").await;

            let out = h.send(HostMessage::Deactivate { id: "a".into() }).await;
            match &out[..] {
                [
                    WorkerMessage::Error {
                        id: Some(id),
                        message,
                        ..
                    },
                    WorkerMessage::Deactivated { id: deactivated },
                ] => {
                    assert_eq!(id, "a");
                    assert_eq!(deactivated, "a");
                    assert!(message.contains("deactivate failed: teardown threw"));
                }
                other => panic!("unexpected replies: {other:?}"),
            }

            // The disposer after the throwing one still ran.
            let reply = h.execute(1, "b.disposed", vec![]).await;
            assert!(matches!(
                reply,
                WorkerMessage::CommandResult { result, .. } if result == json!(1)
            ));

            let reply = h.execute(2, "a.run", vec![]).await;
            assert!(error_message(&reply).contains("Command not found: a.run"));
            assert!(!h.runtime.is_loaded("a"));
        })
        .await;
}

#[tokio::test]
async fn test_module_without_activate_fails() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write("a", "exports.deactivate = () => {};");

            let out = h.activate("a").await;
            match &out[..] {
                [WorkerMessage::Error { id: Some(id), message, .. }] => {
                    assert_eq!(id, "a");
                    assert!(message.contains("does not export an activate function"));
                }
                other => panic!("unexpected replies: {other:?}"),
            }
            assert!(!h.runtime.is_loaded("a"));
            assert_eq!(h.runtime.loader().module_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_fixed_file_activates_after_syntax_error() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write("a", "exports.activate = (ctx) => {");

            let out = h.activate("a").await;
            assert_eq!(out.len(), 1);
            assert!(error_message(&out[0]).contains("Failed to evaluate"));

            h.write(
                "a",
                r#"exports.activate = (ctx) => { ctx.registerCommand("run", () => "fixed"); };"#,
            );
            let out = h.activate("a").await;
            assert_eq!(out.last(), Some(&WorkerMessage::Activated { id: "a".into() }));

            assert!(matches!(
                h.execute(1, "a.run", vec![]).await,
                WorkerMessage::CommandResult { result, .. } if result == json!("fixed")
            ));
        })
        .await;
}

#[tokio::test]
async fn test_top_level_throw_is_reported_then_recoverable() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write("a", r#"throw new Error("not ready yet");"#);

            let out = h.activate("a").await;
            assert!(error_message(&out[0]).contains("not ready yet"));

            h.write("a", "exports.activate = () => {};");
            let out = h.activate("a").await;
            assert_eq!(out, vec![WorkerMessage::Activated { id: "a".into() }]);
        })
        .await;
}

#[tokio::test]
async fn test_reactivation_reads_edited_source() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write(
                "a",
                r#"exports.activate = (ctx) => { ctx.registerCommand("version", () => 1); };"#,
            );
            h.activate("a").await;
            assert!(matches!(
                h.execute(1, "a.version", vec![]).await,
                WorkerMessage::CommandResult { result, .. } if result == json!(1)
            ));

            h.send(HostMessage::Deactivate { id: "a".into() }).await;
            assert_eq!(h.runtime.loader().module_count(), 0);

            h.write(
                "a",
                r#"exports.activate = (ctx) => { ctx.registerCommand("version", () => 2); };"#,
            );
            h.activate("a").await;
            assert!(matches!(
                h.execute(2, "a.version", vec![]).await,
                WorkerMessage::CommandResult { result, .. } if result == json!(2)
            ));
        })
        .await;
}

#[tokio::test]
async fn test_command_waiting_on_host_does_not_block_others() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write(
                "slow",
                r#"exports.activate = (ctx) => {
                    ctx.registerCommand("ask", async () => {
                        const answer = await ctx.showInputModal({ title: "Name?" });
                        return `hello ${answer}`;
                    });
                };"#,
            );
            h.write(
                "fast",
                r#"exports.activate = (ctx) => { ctx.registerCommand("ping", () => "pong"); };"#,
            );
            h.activate("slow").await;
            h.activate("fast").await;

            h.spawn(HostMessage::ExecuteCommand {
                request_id: 1,
                command_id: "slow.ask".into(),
                args: vec![],
            });
            let request_id = match h.next().await {
                WorkerMessage::ShowInputModal {
                    request_id,
                    id,
                    options,
                } => {
                    assert_eq!(id, "slow");
                    assert_eq!(options.title, "Name?");
                    request_id
                }
                other => panic!("expected a modal request, got {other:?}"),
            };

            // The modal is still open; the other extension answers anyway.
            assert_eq!(
                h.execute(2, "fast.ping", vec![]).await,
                WorkerMessage::CommandResult {
                    request_id: 2,
                    command_id: "fast.ping".into(),
                    result: json!("pong"),
                }
            );

            let passthrough = h.broker.intercept(HostMessage::ModalResult {
                request_id,
                value: Some("Ada".into()),
            });
            assert!(passthrough.is_none());
            assert_eq!(
                h.next().await,
                WorkerMessage::CommandResult {
                    request_id: 1,
                    command_id: "slow.ask".into(),
                    result: json!("hello Ada"),
                }
            );
            assert_eq!(h.runtime.loader().calls_in_flight(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_activation_waiting_on_host_does_not_block_others() {
    LocalSet::new()
        .run_until(async {
            let mut h = Harness::new();
            h.write(
                "greeter",
                r#"exports.activate = async (ctx) => {
                    const name = await ctx.showInputModal({ title: "Who?" });
                    ctx.registerCommand("hello", () => `hi ${name}`);
                };"#,
            );
            h.write(
                "fast",
                r#"exports.activate = (ctx) => { ctx.registerCommand("ping", () => "pong"); };"#,
            );

            h.spawn(h.activate_message("greeter"));
            let request_id = match h.next().await {
                WorkerMessage::ShowInputModal { request_id, .. } => request_id,
                other => panic!("expected a modal request, got {other:?}"),
            };

            let out = h.activate("fast").await;
            assert_eq!(
                out,
                vec![
                    WorkerMessage::RegisterCommand {
                        id: "fast".into(),
                        command_id: "fast.ping".into()
                    },
                    WorkerMessage::Activated { id: "fast".into() },
                ]
            );
            assert!(!h.runtime.is_loaded("greeter"));

            h.broker.intercept(HostMessage::ModalResult {
                request_id,
                value: Some("Ada".into()),
            });
            assert_eq!(
                h.next().await,
                WorkerMessage::RegisterCommand {
                    id: "greeter".into(),
                    command_id: "greeter.hello".into()
                }
            );
            assert_eq!(
                h.next().await,
                WorkerMessage::Activated {
                    id: "greeter".into()
                }
            );
            assert!(matches!(
                h.execute(1, "greeter.hello", vec![]).await,
                WorkerMessage::CommandResult { result, .. } if result == json!("hi Ada")
            ));
        })
        .await;
}
