//! Simulated acquisition worker.
//!
//! ```bash
//! camstack-simworker -s simcam -u 0 -c 0 -l 0 -N 4 -W 320 -H 256
//! ```
//!
//! Publishes into `$MILK_SHM_DIR` until SIGINT, then exits 0.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use camstack::logging::{self, TracingConfig};
use camstack::shm::StreamDirectory;
use camstack::worker::sim::SimWorker;
use camstack::worker::WorkerCommand;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(TracingConfig::new(tracing::Level::INFO))?;
    let command = WorkerCommand::parse(std::env::args()).context("parsing the worker command line")?;
    let streams = StreamDirectory::from_env();
    info!(command = %command, root = %streams.root().display(), "simulated worker starting");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    SimWorker::new(command, streams, std::process::id())
        .run(cancel)
        .await?;
    Ok(())
}
