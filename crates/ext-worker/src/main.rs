use std::io;
use std::rc::Rc;

use anyhow::Result;
use breadcrumb_ext_protocol::{FrameReader, FrameWriter, HostMessage, WorkerMessage};
use breadcrumb_ext_worker::{Flow, JsLoader, ServiceBroker, WorkerRuntime};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Spawn a background task that reads frames from stdin.
///
/// Service completions are handed straight to the broker; everything else is
/// forwarded to the message loop. The channel closes on EOF or a broken frame.
fn spawn_stdin_reader(
    broker: ServiceBroker,
) -> (mpsc::UnboundedReceiver<HostMessage>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut reader = FrameReader::new(tokio::io::stdin());
        loop {
            match reader.recv::<HostMessage>().await {
                Ok(Some(msg)) => {
                    if let Some(msg) = broker.intercept(msg) {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("Host closed connection");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping malformed frame: {}", e);
                }
                Err(e) => {
                    error!("Error reading message: {}", e);
                    break;
                }
            }
        }
        broker.close();
    });

    (rx, handle)
}

/// Spawn the task that owns stdout and writes every outgoing message.
fn spawn_stdout_writer(
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(tokio::io::stdout());
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(&msg).await {
                error!("Failed to write message: {}", e);
                break;
            }
        }
    })
}

fn main() -> Result<()> {
    // stdout carries frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        error!("Worker panic: {}", panic);
        default_hook(panic);
    }));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // The isolate and every handler stay on this thread.
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let writer = spawn_stdout_writer(outbox_rx);

        let broker = ServiceBroker::new(outbox.clone());
        let (mut inbox, reader) = spawn_stdin_reader(broker.clone());
        let runtime = Rc::new(WorkerRuntime::new(JsLoader::new(broker), outbox.clone()));

        outbox.send(WorkerMessage::Ready)?;
        info!(pid = std::process::id(), "Extension worker ready");

        // Shutdown runs inline so nothing is read after it; every other
        // message gets its own task and may overlap with the rest.
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                msg = inbox.recv() => {
                    let Some(msg) = msg else { break };
                    if msg == HostMessage::Shutdown {
                        if runtime.dispatch(msg).await == Flow::Exit {
                            info!("Shutdown requested");
                        }
                        break;
                    }
                    let runtime = runtime.clone();
                    handlers.spawn_local(async move {
                        runtime.dispatch(msg).await;
                    });
                }
            }
        }
        handlers.shutdown().await;

        // Drop every sender so the writer drains and exits.
        reader.abort();
        drop(runtime);
        drop(outbox);
        if writer.await.is_err() {
            debug!("Writer task ended abnormally");
        }
        Ok::<_, anyhow::Error>(())
    })?;

    // A blocking stdin read may still be parked on the runtime's pool.
    rt.shutdown_background();
    Ok(())
}
