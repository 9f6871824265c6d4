//! Shared harness: a supervisor over mock sessions whose worker session runs
//! the simulated acquisition worker in-process.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use camstack::config::{CameraConfig, CameraFamily, CamstackConfig, TimingConfig};
use camstack::dependents::DependentProcess;
use camstack::keywords::MemoryStore;
use camstack::session::mock::{LaunchContext, MockProvider};
use camstack::shm::StreamDirectory;
use camstack::worker::sim::SimWorker;
use camstack::worker::WorkerCommand;
use camstack::CameraSupervisor;

pub const CAMERA: &str = "simcam";
pub const WORKER_SESSION: &str = "simcam_fgrab";

/// Knobs the launcher reads each time a worker starts.
#[derive(Default)]
pub struct Bench {
    /// Launches whose `-W` equals this width die before publishing
    pub crash_width: Mutex<Option<u32>>,
    /// Geometry forced onto commands that carry none (EDT heads)
    pub hardware_size: Mutex<Option<(u32, u32)>>,
}

pub struct TestRig {
    pub dir: TempDir,
    pub provider: Arc<MockProvider>,
    pub store: Arc<MemoryStore>,
    pub bench: Arc<Bench>,
    pub sup: CameraSupervisor,
}

impl TestRig {
    pub fn streams(&self) -> StreamDirectory {
        StreamDirectory::new(self.dir.path())
    }
}

pub fn camera_config(dir: &Path, family: CameraFamily) -> CamstackConfig {
    let mut camera = CameraConfig::new(CAMERA, CAMERA, family);
    camera.shm_dir = Some(dir.to_path_buf());
    camera.keyword_prefix = Some("x_S".to_string());
    let mut config = CamstackConfig::new(camera);
    config.timing = TimingConfig::fast();
    config
}

/// Run `camstack-simworker` semantics for every command sent to the worker
/// session. Lines that are not worker commands become jobs that idle until
/// interrupted.
pub fn install_sim_launcher(provider: &MockProvider, streams: StreamDirectory, bench: Arc<Bench>) {
    provider.set_launcher(
        WORKER_SESSION,
        Arc::new(move |ctx: LaunchContext| {
            let streams = streams.clone();
            let bench = bench.clone();
            tokio::spawn(async move {
                let Ok(mut command) = WorkerCommand::parse_line(&ctx.command) else {
                    ctx.cancel.cancelled().await;
                    ctx.exit();
                    return;
                };
                let crash_width = *bench.crash_width.lock();
                let hardware_size = *bench.hardware_size.lock();
                if command.width.is_some() && command.width == crash_width {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ctx.exit();
                    return;
                }
                if let (None, Some((w, h))) = (command.width, hardware_size) {
                    command = command.with_geometry(w, h);
                }
                let worker = SimWorker::new(command, streams, ctx.pid)
                    .with_period(Duration::from_millis(2));
                if let Err(e) = worker.run(ctx.cancel.clone()).await {
                    eprintln!("simulated worker failed: {e}");
                }
                ctx.exit();
            });
        }),
    );
}

pub fn rig_with(family: CameraFamily, dependents: Vec<DependentProcess>) -> TestRig {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = camera_config(dir.path(), family);
    config.dependents = dependents;
    rig_from(dir, config)
}

pub fn rig_from(dir: TempDir, config: CamstackConfig) -> TestRig {
    let provider = Arc::new(MockProvider::new());
    let store = Arc::new(MemoryStore::new());
    let bench = Arc::new(Bench::default());
    install_sim_launcher(&provider, StreamDirectory::new(dir.path()), bench.clone());
    let sup = CameraSupervisor::new(config, provider.clone(), store.clone())
        .expect("supervisor");
    TestRig {
        dir,
        provider,
        store,
        bench,
        sup,
    }
}

pub fn sim_rig() -> TestRig {
    rig_with(CameraFamily::Simulated, Vec::new())
}

/// Poll `check` every 20 ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
