//! CLI entry point for camstack
//!
//! # Usage
//!
//! Supervise a camera, serving the op table over TCP and/or stdin:
//! ```bash
//! camstack serve --config config/simcam.toml --mode HALF
//! ```
//!
//! List the mode table of a configuration:
//! ```bash
//! camstack modes --config config/simcam.toml
//! ```
//!
//! Call one operation on a running supervisor:
//! ```bash
//! camstack call 127.0.0.1:7201 set_camera_mode HALF
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use camstack::camera::CameraSupervisor;
use camstack::config::CamstackConfig;
use camstack::logging;
use camstack::modes::ModeId;
use camstack::rpc::{self, RpcServer};

#[derive(Parser)]
#[command(name = "camstack")]
#[command(about = "Camera supervisor and dependent-process orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the camera and serve operator requests until Ctrl-C
    Serve {
        /// Configuration file
        #[arg(long)]
        config: PathBuf,

        /// Mode to start in (defaults to camera.initial_mode, then FULL)
        #[arg(long)]
        mode: Option<String>,

        /// Configure the backend but do not start the worker
        #[arg(long)]
        no_start: bool,
    },

    /// Print the mode table of a configuration
    Modes {
        #[arg(long)]
        config: PathBuf,
    },

    /// Send one operation to a running supervisor
    Call {
        /// host:port of the supervisor
        addr: String,
        op: String,
        /// Arguments, each parsed as JSON and falling back to a string
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            mode,
            no_start,
        } => serve(config, mode, no_start).await,
        Commands::Modes { config } => list_modes(config),
        Commands::Call { addr, op, args } => call(addr, op, args).await,
    }
}

async fn serve(path: PathBuf, mode: Option<String>, no_start: bool) -> Result<()> {
    let config = CamstackConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    logging::init_from_config(&config)?;
    info!(config = %path.display(), camera = %config.camera.name, "starting camstack");

    let rpc_config = config.rpc.clone();
    let no_start = no_start || config.camera.no_start;
    let sup = CameraSupervisor::from_config(config)?;
    let cancel = CancellationToken::new();

    let server = match &rpc_config.bind {
        Some(bind) => {
            let server = RpcServer::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            Some(tokio::spawn(server.run(sup.clone(), cancel.clone())))
        }
        None => None,
    };

    if let Err(e) = sup.initialize(mode.as_deref().map(ModeId::parse), no_start).await {
        error!("initialization failed: {e}");
    }

    if rpc_config.shell {
        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            res = rpc::shell::run(&sup, stdin, tokio::io::stdout(), cancel.clone()) => res?,
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    cancel.cancel();
    sup.release().await;
    if let Some(server) = server {
        server.await??;
    }
    Ok(())
}

fn list_modes(path: PathBuf) -> Result<()> {
    let config = CamstackConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    for (id, mode) in config.mode_table().iter() {
        println!("{id:>8}  {mode}");
    }
    Ok(())
}

async fn call(addr: String, op: String, args: Vec<String>) -> Result<()> {
    let args = args
        .iter()
        .map(|a| serde_json::from_str(a).unwrap_or_else(|_| serde_json::Value::String(a.clone())))
        .collect();
    let response = rpc::call(&addr, &op, args)
        .await
        .with_context(|| format!("calling {op} on {addr}"))?;
    match response.error {
        Some(e) => anyhow::bail!("{op}: {e}"),
        None => println!("{}", serde_json::to_string_pretty(&response.result)?),
    }
    Ok(())
}
