//! The shared isolate and the task that drives it.
//!
//! One local task owns the event loop. A call runs its script right away,
//! parks the returned promise here, and waits on a oneshot that the driver
//! completes as soon as that promise settles. Calls from different
//! extensions overlap; a call waiting on a host service does not hold up
//! anyone else.

use std::cell::{Cell, RefCell};
use std::future::poll_fn;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use deno_core::{JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions, v8};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::services::ServiceBroker;

use super::js_error;
use super::ops::{RegisteredCommands, breadcrumb_ext};

type CallResult = Result<String, PluginError>;

/// V8 does not tolerate isolates being created concurrently.
static ISOLATE_CREATE_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

struct PendingCall {
    function: String,
    promise: v8::Global<v8::Value>,
    reply: oneshot::Sender<CallResult>,
}

pub(crate) struct Engine {
    runtime: RefCell<JsRuntime>,
    op_state: Rc<RefCell<OpState>>,
    calls: RefCell<Vec<PendingCall>>,
    waker: RefCell<Option<Waker>>,
    wake: Notify,
    closed: Cell<bool>,
}

impl Engine {
    /// Create the runtime and spawn its driver on the current `LocalSet`.
    pub(crate) fn spawn(broker: ServiceBroker) -> Rc<Self> {
        let mut runtime = {
            let _lock = ISOLATE_CREATE_LOCK.lock();
            JsRuntime::new(RuntimeOptions {
                extensions: vec![breadcrumb_ext::init_ops_and_esm()],
                ..Default::default()
            })
        };
        let op_state = runtime.op_state();
        {
            let mut state = op_state.borrow_mut();
            state.put(broker);
            state.put(RegisteredCommands::default());
        }

        let engine = Rc::new(Self {
            runtime: RefCell::new(runtime),
            op_state,
            calls: RefCell::new(Vec::new()),
            waker: RefCell::new(None),
            wake: Notify::new(),
            closed: Cell::new(false),
        });
        tokio::task::spawn_local(drive(engine.clone()));
        debug!("JavaScript runtime created");
        engine
    }

    /// Run a script synchronously; no call is awaited.
    pub(crate) fn execute(
        &self,
        name: &'static str,
        script: String,
    ) -> Result<v8::Global<v8::Value>, PluginError> {
        self.runtime
            .borrow_mut()
            .execute_script(name, script)
            .map_err(|e| js_error(&e))
    }

    /// Whether `value` is the JS `true`.
    pub(crate) fn is_true(&self, value: &v8::Global<v8::Value>) -> bool {
        let mut js = self.runtime.borrow_mut();
        let scope = &mut js.handle_scope();
        v8::Local::new(scope, value).is_true()
    }

    pub(crate) fn registrations<T>(&self, f: impl FnOnce(&mut RegisteredCommands) -> T) -> T {
        let mut state = self.op_state.borrow_mut();
        f(state.borrow_mut::<RegisteredCommands>())
    }

    /// Run `script`, which must evaluate to a promise of a string, and wait
    /// for that promise alone to settle.
    pub(crate) async fn call(&self, function: &str, script: String) -> CallResult {
        if self.closed.get() {
            return Err(PluginError::new("JavaScript runtime stopped"));
        }
        let promise = self.execute("<breadcrumb:call>", script)?;
        let (reply, rx) = oneshot::channel();
        self.calls.borrow_mut().push(PendingCall {
            function: function.to_string(),
            promise,
            reply,
        });
        self.notify();

        rx.await
            .unwrap_or_else(|_| Err(PluginError::new("JavaScript runtime stopped")))
    }

    pub(crate) fn close(&self) {
        self.closed.set(true);
        self.notify();
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.calls.borrow().len()
    }

    fn notify(&self) {
        self.wake.notify_one();
        if let Some(waker) = self.waker.borrow().as_ref() {
            waker.wake_by_ref();
        }
    }

    /// One turn of the event loop. Ready once the loop has nothing left to
    /// wait on.
    fn poll(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.closed.get() {
            return Poll::Ready(());
        }
        *self.waker.borrow_mut() = Some(cx.waker().clone());

        let mut js = self.runtime.borrow_mut();
        let idle = match js.poll_event_loop(cx, PollEventLoopOptions::default()) {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(e)) => {
                // Uncaught errors from fire-and-forget work belong to no call.
                warn!("Uncaught error in extension code: {}", js_error(&e));
                cx.waker().wake_by_ref();
                false
            }
            Poll::Pending => false,
        };
        self.settle(&mut js, idle);

        if idle { Poll::Ready(()) } else { Poll::Pending }
    }

    /// Complete every call whose promise is no longer pending. Once the loop
    /// is idle a pending promise can never settle.
    fn settle(&self, js: &mut JsRuntime, idle: bool) {
        let waiting = std::mem::take(&mut *self.calls.borrow_mut());
        if waiting.is_empty() {
            return;
        }
        let scope = &mut js.handle_scope();
        let mut still_pending = Vec::new();

        for call in waiting {
            let value = v8::Local::new(scope, &call.promise);
            let outcome = match v8::Local::<v8::Promise>::try_from(value) {
                Err(_) => Some(Err(PluginError::new(format!(
                    "{} did not return a promise",
                    call.function
                )))),
                Ok(promise) => match promise.state() {
                    v8::PromiseState::Fulfilled => {
                        let value = promise.result(scope);
                        Some(Ok(value.to_rust_string_lossy(scope)))
                    }
                    v8::PromiseState::Rejected => {
                        let reason = promise.result(scope);
                        Some(Err(PluginError::new(reason.to_rust_string_lossy(scope))))
                    }
                    v8::PromiseState::Pending if idle => Some(Err(PluginError::new(format!(
                        "{} never settled",
                        call.function
                    )))),
                    v8::PromiseState::Pending => None,
                },
            };
            match outcome {
                Some(result) => {
                    let _ = call.reply.send(result);
                }
                None => still_pending.push(call),
            }
        }

        self.calls.borrow_mut().extend(still_pending);
    }
}

async fn drive(engine: Rc<Engine>) {
    while !engine.closed.get() {
        poll_fn(|cx| engine.poll(cx)).await;
        if engine.closed.get() {
            break;
        }
        engine.wake.notified().await;
    }
    // Dropping the senders fails whoever is still waiting.
    engine.calls.borrow_mut().clear();
    debug!("JavaScript runtime stopped");
}
