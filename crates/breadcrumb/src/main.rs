//! Breadcrumb extension host CLI
//!
//! Discovers extensions and runs them in the extension worker without the
//! rest of the shell.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use breadcrumb::config::HostSettings;
use breadcrumb::extensions::{ExtensionManager, ExtensionSource};
use breadcrumb::host::ProcessLauncher;

/// Breadcrumb extension host
#[derive(Parser, Debug)]
#[command(name = "breadcrumb")]
#[command(about = "Breadcrumb extension host", long_about = None)]
struct Args {
    /// Settings file
    #[arg(long, global = true, default_value = breadcrumb::config::SETTINGS_FILE)]
    config: PathBuf,

    /// User extensions directory
    #[arg(long, global = true)]
    user_dir: Option<PathBuf>,

    /// Workspace extensions directory
    #[arg(long, global = true)]
    workspace_dir: Option<PathBuf>,

    /// Bundled extensions directory
    #[arg(long, global = true)]
    bundled_dir: Option<PathBuf>,

    /// Path to the extension worker executable
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover extensions and print them
    List,

    /// Start all startup extensions, optionally run one command, then exit
    Run {
        /// Command to execute once extensions are up
        #[arg(long)]
        command: Option<String>,

        /// Command arguments as a JSON array (a single value is wrapped)
        #[arg(long, default_value = "[]")]
        args: String,
    },

    /// Activate a single extension and its dependencies
    Activate {
        /// Extension id
        id: String,
    },
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("breadcrumb=info,extension_host=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut settings = HostSettings::load_from(&args.config)?;
    apply_overrides(&mut settings, &args);

    info!("Starting Breadcrumb extension host v{}", env!("CARGO_PKG_VERSION"));

    let launcher = ProcessLauncher::new(settings.worker.binary.clone());
    info!(worker = %launcher.binary().display(), "Using extension worker");

    let manager = ExtensionManager::builder()
        .directories(settings.directories())
        .launcher(Arc::new(launcher))
        .config(settings.supervisor_config())
        .build();

    manager.discover().await;

    match args.command {
        Command::List => {
            print_json(&json!({ "extensions": manager.list() }))?;
        }
        Command::Run { command, args } => {
            manager.start_all().await?;
            let result = match command {
                Some(command) => {
                    let args = parse_args(&args)?;
                    Some(manager.execute_command(&command, args).await)
                }
                None => None,
            };
            print_json(&json!({
                "extensions": manager.list(),
                "commands": manager.commands(),
                "hostFailed": manager.host_failed(),
            }))?;
            manager.shutdown().await;
            if let Some(result) = result {
                print_json(&result?)?;
            }
        }
        Command::Activate { id } => {
            let status = manager.activate_extension(&id).await?;
            print_json(&json!({
                "id": id,
                "status": status,
                "extension": manager.get(&id),
                "commands": manager.commands(),
            }))?;
            manager.shutdown().await;
        }
    }

    Ok(())
}

fn apply_overrides(settings: &mut HostSettings, args: &Args) {
    let dirs = &mut settings.extensions;
    for (source, dir) in [
        (ExtensionSource::User, &args.user_dir),
        (ExtensionSource::Workspace, &args.workspace_dir),
        (ExtensionSource::Bundled, &args.bundled_dir),
    ] {
        let Some(dir) = dir.clone() else { continue };
        match source {
            ExtensionSource::User => dirs.user = Some(dir),
            ExtensionSource::Workspace => dirs.workspace = Some(dir),
            ExtensionSource::Bundled => dirs.bundled = Some(dir),
        }
    }
    if let Some(worker) = &args.worker {
        settings.worker.binary = Some(worker.clone());
    }
}

fn parse_args(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
    Ok(match value {
        Value::Array(values) => values,
        other => vec![other],
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
