//! Camera supervisor state machine.
//!
//! All public operations take the per-camera lock for their whole duration,
//! so no other operation ever observes a half-reconfigured camera. The
//! polling task only runs an iteration when it can take the lock without
//! waiting; a busy supervisor just skips that tick.
//!
//! A reconfiguration started from inside a polling iteration (auto-resize)
//! passes `bypass_polling` so that it does not try to stop and join the task
//! it is running in.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::backend_for;
use super::hooks::{CameraBackend, HookContext};
use super::params::{prm_setgetmultivalue, ParamCall};
use super::state::SupervisorState;
use crate::config::{CamstackConfig, CameraConfig, CameraFamily, TimingConfig};
use crate::dependents::{DependentGraph, DependentStatus, RenderContext, RtPlacement, StopStrategy};
use crate::error::{AppResult, CamstackError};
use crate::keywords::poller::Poller;
use crate::keywords::{KeywordPipeline, KeywordStore, KeywordValue, NullStore, RedisStore};
use crate::modes::{CameraMode, ModeId, ModeTable};
use crate::session::tmux::TmuxProvider;
use crate::session::SessionProvider;
use crate::shm::{ImageStream, StreamDirectory};
use crate::worker::{AcquisitionWorker, ParamRequest};

/// Snapshot served by the `health` operation.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// Camera name
    pub camera: String,
    /// Camera family
    pub family: CameraFamily,
    /// Supervisor state
    pub state: SupervisorState,
    /// Mode being served
    pub mode: Option<ModeId>,
    /// Binned frame width
    pub width: Option<u32>,
    /// Binned frame height
    pub height: Option<u32>,
    /// Pid of the acquisition worker, when known
    pub worker_pid: Option<u32>,
    /// Whether the worker process is alive
    pub worker_running: bool,
    /// Whether the polling task runs
    pub polling: bool,
    /// Liveness of every dependent
    pub dependents: Vec<DependentStatus>,
    /// Critical faults since the last initialization
    pub faults: Vec<String>,
}

/// What the hooks see of the supervisor.
struct Rig {
    camera: CameraConfig,
    timing: TimingConfig,
    streams: StreamDirectory,
    keywords: KeywordPipeline,
    worker: AcquisitionWorker,
}

impl Rig {
    fn hook_ctx<'a>(&'a self, mode_id: &'a ModeId, mode: &'a CameraMode) -> HookContext<'a> {
        HookContext {
            camera: &self.camera,
            timing: &self.timing,
            streams: &self.streams,
            keywords: &self.keywords,
            worker: &self.worker,
            mode_id,
            mode,
        }
    }

    fn detector<'a>(&'a self, backend: &'a dyn CameraBackend) -> &'a str {
        self.camera.detector.as_deref().unwrap_or(backend.detector())
    }
}

struct Core {
    rig: Rig,
    backend: Box<dyn CameraBackend>,
    modes: ModeTable,
    state: SupervisorState,
    current: Option<(ModeId, CameraMode)>,
    dependents: DependentGraph,
    store: Arc<dyn KeywordStore>,
    poller: Option<Poller>,
    faults: Vec<String>,
    this: Weak<Mutex<Core>>,
}

/// One camera: its worker, its dependents and its keyword pipeline.
#[derive(Clone)]
pub struct CameraSupervisor {
    name: String,
    core: Arc<Mutex<Core>>,
}

impl std::fmt::Debug for CameraSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSupervisor")
            .field("camera", &self.name)
            .finish()
    }
}

impl CameraSupervisor {
    /// Supervisor over tmux sessions, mirroring to Redis when enabled.
    pub fn from_config(config: CamstackConfig) -> AppResult<Self> {
        let provider: Arc<dyn SessionProvider> = Arc::new(TmuxProvider::new());
        let store: Arc<dyn KeywordStore> = if config.store.enabled {
            Arc::new(RedisStore::open(&config.store.url)?)
        } else {
            Arc::new(NullStore)
        };
        Self::new(config, provider, store)
    }

    /// Supervisor for the family named in the configuration.
    pub fn new(
        config: CamstackConfig,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn KeywordStore>,
    ) -> AppResult<Self> {
        let backend = backend_for(&config.camera);
        Self::with_backend(config, provider, store, backend)
    }

    /// Supervisor driving a caller-supplied family.
    pub fn with_backend(
        config: CamstackConfig,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn KeywordStore>,
        backend: Box<dyn CameraBackend>,
    ) -> AppResult<Self> {
        let camera = config.camera.clone();
        let modes = config.mode_table();
        let table = backend.keyword_table()?.with_wcs_sets(camera.n_wcs)?;
        let placement = camera
            .taker_rtprio
            .map(|prio| RtPlacement::new(camera.taker_cset.clone(), prio));
        let worker = AcquisitionWorker::new(
            provider.clone(),
            camera.worker_session(),
            config.timing.clone(),
        )
        .with_placement(placement)
        .with_start_attempts(camera.start_attempts);
        let dependents = DependentGraph::new(provider, config.dependents.clone(), config.timing.clone());

        info!(
            camera = %camera.name,
            family = %backend.family(),
            modes = modes.len(),
            dependents = dependents.len(),
            store = %store.describe(),
            "camera supervisor created"
        );

        let name = camera.name.clone();
        let rig = Rig {
            streams: camera.stream_directory(),
            camera,
            timing: config.timing,
            keywords: KeywordPipeline::new(table),
            worker,
        };
        let core = Arc::new_cyclic(|this| {
            Mutex::new(Core {
                rig,
                backend,
                modes,
                state: SupervisorState::Uninitialized,
                current: None,
                dependents,
                store,
                poller: None,
                faults: Vec::new(),
                this: this.clone(),
            })
        });
        Ok(Self { name, core })
    }

    /// Camera name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the camera up in `mode_id` (the configured initial mode, else
    /// the full frame). With `no_start` it stops at `BACKEND_READY`.
    #[instrument(skip(self), fields(camera = %self.name))]
    pub async fn initialize(&self, mode_id: Option<ModeId>, no_start: bool) -> AppResult<()> {
        self.core.lock().await.initialize(mode_id, no_start).await
    }

    /// Tear down the dependents, reconfigure for `mode_id` and restart everything.
    #[instrument(skip(self), fields(camera = %self.name))]
    pub async fn set_camera_mode(&self, mode_id: ModeId) -> AppResult<()> {
        self.core.lock().await.set_camera_mode(mode_id, false).await
    }

    /// Alias of [`set_camera_mode`](Self::set_camera_mode).
    pub async fn set_mode(&self, mode_id: ModeId) -> AppResult<()> {
        self.set_camera_mode(mode_id).await
    }

    /// Switch to an explicit window, stored as the `CUSTOM` mode.
    #[instrument(skip(self), fields(camera = %self.name))]
    pub async fn set_camera_size(
        &self,
        height: u32,
        width: u32,
        h_offset: u32,
        w_offset: u32,
    ) -> AppResult<()> {
        let mut core = self.core.lock().await;
        core.set_camera_size(height, width, h_offset, w_offset, false)
            .await
    }

    /// Current mode, once initialized.
    pub async fn get_camera_mode(&self) -> Option<(ModeId, CameraMode)> {
        self.core.lock().await.current.clone()
    }

    /// Alias of [`get_camera_mode`](Self::get_camera_mode).
    pub async fn get_mode(&self) -> Option<(ModeId, CameraMode)> {
        self.get_camera_mode().await
    }

    /// Every mode this camera can switch to.
    pub async fn modes(&self) -> Vec<(ModeId, CameraMode)> {
        let core = self.core.lock().await;
        core.modes
            .iter()
            .map(|(id, mode)| (id.clone(), mode.clone()))
            .collect()
    }

    /// Stop polling, dependents and worker. Never fails.
    #[instrument(skip(self), fields(camera = %self.name))]
    pub async fn release(&self) {
        self.core.lock().await.release().await
    }

    /// Alias of [`release`](Self::release).
    pub async fn close(&self) {
        self.release().await
    }

    /// Restart the worker on the same stream with a short exposure,
    /// leaving the dependents alone.
    #[instrument(skip(self), fields(camera = %self.name))]
    pub async fn abort_exposure(&self) -> AppResult<()> {
        self.core.lock().await.abort_exposure().await
    }

    /// Current state.
    pub async fn state(&self) -> SupervisorState {
        self.core.lock().await.state
    }

    /// Snapshot for operators.
    pub async fn health(&self) -> Health {
        let core = self.core.lock().await;
        let (mode, size) = match &core.current {
            Some((id, mode)) => (Some(id.clone()), Some(mode.binned_size())),
            None => (None, None),
        };
        Health {
            camera: core.rig.camera.name.clone(),
            family: core.backend.family(),
            state: core.state,
            mode,
            width: size.map(|(w, _)| w),
            height: size.map(|(_, h)| h),
            worker_pid: core.rig.worker.pid(),
            worker_running: core.rig.worker.is_running().await,
            polling: core.poller.as_ref().is_some_and(Poller::is_running),
            dependents: core.dependents.liveness().await,
            faults: core.faults.clone(),
        }
    }

    /// Liveness of every dependent.
    pub async fn dependents_status(&self) -> Vec<DependentStatus> {
        self.core.lock().await.dependents.liveness().await
    }

    /// Whether the acquisition worker is alive.
    pub async fn is_taker_running(&self) -> bool {
        self.core.lock().await.rig.worker.is_running().await
    }

    /// Write `value` into the header through the keyword's format.
    pub async fn set_keyword(&self, key: &str, value: KeywordValue) -> AppResult<KeywordValue> {
        let core = self.core.lock().await;
        core.rig.keywords.set_formatted_keyword(key, value)
    }

    /// Read a header keyword.
    pub async fn get_keyword(&self, key: &str) -> AppResult<Option<KeywordValue>> {
        self.core.lock().await.rig.keywords.get_keyword(key)
    }

    /// Every keyword of the current stream header.
    pub async fn keywords(&self) -> AppResult<BTreeMap<String, KeywordValue>> {
        let core = self.core.lock().await;
        let stream = core
            .rig
            .keywords
            .stream()
            .ok_or_else(|| CamstackError::Keyword("no image stream attached".into()))?;
        Ok(stream
            .keywords()
            .into_iter()
            .map(|(name, kw)| (name, kw.value))
            .collect())
    }

    /// Set one parameter; the accepted value is mirrored into `keyword`.
    pub async fn prm_setvalue(
        &self,
        keyword: Option<&str>,
        id: u32,
        value: KeywordValue,
    ) -> AppResult<KeywordValue> {
        self.prm_setmultivalue(vec![value], vec![keyword.map(str::to_string)], vec![id])
            .await?
            .pop()
            .unwrap_or_else(|| Err(CamstackError::Segment("empty control answer".into())))
    }

    /// Read one worker parameter.
    pub async fn prm_getvalue(&self, keyword: Option<&str>, id: u32) -> AppResult<KeywordValue> {
        self.prm_getmultivalue(vec![keyword.map(str::to_string)], vec![id])
            .await?
            .pop()
            .unwrap_or_else(|| Err(CamstackError::Segment("empty control answer".into())))
    }

    /// Set several parameters in one round trip; one outcome per parameter.
    pub async fn prm_setmultivalue(
        &self,
        values: Vec<KeywordValue>,
        keywords: Vec<Option<String>>,
        ids: Vec<u32>,
    ) -> AppResult<Vec<AppResult<KeywordValue>>> {
        if values.len() != ids.len() || keywords.len() != ids.len() {
            return Err(CamstackError::Configuration(format!(
                "prm_setmultivalue: {} values, {} keywords, {} ids",
                values.len(),
                keywords.len(),
                ids.len()
            )));
        }
        let core = self.core.lock().await;
        let calls = ids
            .into_iter()
            .zip(values)
            .zip(keywords)
            .map(|((id, value), keyword)| ParamCall {
                keyword,
                request: ParamRequest::set(id, core.backend.param_type(id), value),
            })
            .collect::<Vec<_>>();
        core.param_transaction("prm_setmultivalue", &calls).await
    }

    /// Read several parameters in one round trip; one outcome per parameter.
    pub async fn prm_getmultivalue(
        &self,
        keywords: Vec<Option<String>>,
        ids: Vec<u32>,
    ) -> AppResult<Vec<AppResult<KeywordValue>>> {
        if keywords.len() != ids.len() {
            return Err(CamstackError::Configuration(format!(
                "prm_getmultivalue: {} keywords, {} ids",
                keywords.len(),
                ids.len()
            )));
        }
        let core = self.core.lock().await;
        let calls = ids
            .into_iter()
            .zip(keywords)
            .map(|(id, keyword)| ParamCall {
                keyword,
                request: ParamRequest::get(id, core.backend.param_type(id)),
            })
            .collect::<Vec<_>>();
        core.param_transaction("prm_getmultivalue", &calls).await
    }

    /// Exposure time (s).
    pub async fn get_tint(&self) -> AppResult<f64> {
        let mut core = self.core.lock().await;
        let (id, mode) = core.current_mode("get_tint")?;
        let Core { rig, backend, .. } = &mut *core;
        backend.get_tint(&rig.hook_ctx(&id, &mode)).await
    }

    /// Set the exposure, returning the value the camera accepted.
    pub async fn set_tint(&self, tint: f64) -> AppResult<f64> {
        let mut core = self.core.lock().await;
        let (id, mode) = core.current_mode("set_tint")?;
        let Core { rig, backend, .. } = &mut *core;
        backend.set_tint(&rig.hook_ctx(&id, &mode), tint).await
    }

    /// Frame rate (Hz).
    pub async fn get_fps(&self) -> AppResult<f64> {
        let mut core = self.core.lock().await;
        let (id, mode) = core.current_mode("get_fps")?;
        let Core { rig, backend, .. } = &mut *core;
        backend.get_fps(&rig.hook_ctx(&id, &mode)).await
    }

    /// Set the frame rate, returning the value the camera accepted.
    pub async fn set_fps(&self, fps: f64) -> AppResult<f64> {
        let mut core = self.core.lock().await;
        let (id, mode) = core.current_mode("set_fps")?;
        let Core { rig, backend, .. } = &mut *core;
        backend.set_fps(&rig.hook_ctx(&id, &mode), fps).await
    }

    /// Serial dialogue with the camera head.
    pub async fn send_command(&self, command: &str, timeout: Duration) -> AppResult<String> {
        let core = self.core.lock().await;
        let (id, mode) = core.current_mode("send_command")?;
        core.backend
            .send_command(&core.rig.hook_ctx(&id, &mode), command, timeout)
            .await
    }
}

impl Core {
    fn current_mode(&self, op: &'static str) -> AppResult<(ModeId, CameraMode)> {
        self.current.clone().ok_or(CamstackError::InvalidState {
            op,
            state: self.state,
        })
    }

    fn render_context(&self) -> Option<RenderContext> {
        let (_, mode) = self.current.as_ref()?;
        let (width, height) = mode.binned_size();
        Some(RenderContext {
            width,
            height,
            stream: self.rig.camera.stream_name.clone(),
            camera: self.rig.camera.name.clone(),
        })
    }

    fn record_fault(&mut self, fault: String) {
        if !self.faults.contains(&fault) {
            self.faults.push(fault);
        }
    }

    fn start_polling(&mut self) {
        if self.poller.as_ref().is_some_and(Poller::is_running) {
            return;
        }
        let this = self.this.clone();
        let name = format!("{}-poll", self.rig.camera.name);
        self.poller = Some(Poller::spawn(name, self.rig.timing.poll_interval, move || {
            let this = this.clone();
            async move {
                let Some(core) = this.upgrade() else {
                    return;
                };
                let Ok(mut core) = core.try_lock() else {
                    debug!("supervisor busy, skipping polling iteration");
                    return;
                };
                core.poll_once().await;
            }
        }));
    }

    async fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
    }

    async fn initialize(&mut self, mode_id: Option<ModeId>, no_start: bool) -> AppResult<()> {
        let id = mode_id
            .or_else(|| self.rig.camera.initial_mode.clone())
            .unwrap_or_else(|| self.rig.camera.full_mode.clone());
        let mode = self.modes.lookup(&id)?.clone();
        info!(camera = %self.rig.camera.name, mode = %id, %mode, no_start, "initializing");

        self.stop_polling().await;
        if self.state != SupervisorState::Uninitialized {
            self.dependents.stop_all(false, StopStrategy::Batched).await;
        }
        self.dependents.initialize().await?;
        self.rig.worker.initialize().await?;
        self.rig.keywords.detach();
        self.faults.clear();
        self.state = SupervisorState::Uninitialized;
        self.current = Some((id, mode));

        self.configure_backend(&[]).await?;
        self.state = SupervisorState::BackendReady;
        if no_start {
            info!(camera = %self.rig.camera.name, "backend ready, worker not started");
            return Ok(());
        }

        let started = match self.start_worker(false).await {
            Ok(()) => self.start_dependents().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            error!(camera = %self.rig.camera.name, "initialization failed: {e}");
            self.teardown().await;
            self.state = SupervisorState::BackendReady;
            return Err(e);
        }
        self.finalize().await;
        self.start_polling();
        Ok(())
    }

    async fn set_camera_size(
        &mut self,
        height: u32,
        width: u32,
        h_offset: u32,
        w_offset: u32,
        bypass_polling: bool,
    ) -> AppResult<()> {
        if !self.state.can_reconfigure() {
            return Err(CamstackError::InvalidState {
                op: "set_camera_size",
                state: self.state,
            });
        }
        let id = self.modes.insert_custom(height, width, h_offset, w_offset)?;
        self.set_camera_mode(id, bypass_polling).await
    }

    async fn set_camera_mode(&mut self, id: ModeId, bypass_polling: bool) -> AppResult<()> {
        if !self.state.can_reconfigure() {
            return Err(CamstackError::InvalidState {
                op: "set_camera_mode",
                state: self.state,
            });
        }
        let mode = self.modes.lookup(&id)?.clone();
        let prior_state = self.state;
        let prior_mode = self.current.clone();
        info!(camera = %self.rig.camera.name, mode = %id, %mode, bypass_polling, "changing mode");

        self.state = SupervisorState::ModeChanging;
        if !bypass_polling {
            self.stop_polling().await;
        }
        self.dependents.stop_all(false, StopStrategy::Batched).await;
        if let Err(e) = self.rig.worker.kill().await {
            warn!(camera = %self.rig.camera.name, "cannot kill worker: {e}");
        }
        self.rig.keywords.detach();
        self.current = Some((id.clone(), mode));

        let outcome = match self.configure_backend(&[]).await {
            Ok(()) => match self.start_worker(false).await {
                Ok(()) => self.start_dependents().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.finalize().await;
                if !bypass_polling {
                    self.start_polling();
                }
                info!(camera = %self.rig.camera.name, mode = %id, "mode changed");
                Ok(())
            }
            Err(CamstackError::CannotReconfigureWhileRunning) => {
                warn!(camera = %self.rig.camera.name, mode = %id, "mode change rejected, worker still running");
                self.current = prior_mode;
                self.reattach_stream();
                if prior_state == SupervisorState::DependentsRunning {
                    if let Some(ctx) = self.render_context() {
                        if let Err(e) = self.dependents.start_all(&ctx).await {
                            error!(camera = %self.rig.camera.name, "cannot restart dependents: {e}");
                        }
                    }
                }
                self.state = prior_state;
                if !bypass_polling && prior_state.worker_expected() {
                    self.start_polling();
                }
                Err(CamstackError::CannotReconfigureWhileRunning)
            }
            Err(e) => {
                error!(camera = %self.rig.camera.name, mode = %id, "mode change failed: {e}");
                self.teardown().await;
                self.state = SupervisorState::ModeChanging;
                Err(e)
            }
        }
    }

    async fn abort_exposure(&mut self) -> AppResult<()> {
        let injection = self.backend.abort_injection().ok_or_else(|| {
            CamstackError::Unsupported(format!("abort_exposure on {}", self.backend.family()))
        })?;
        if !self.state.worker_expected() {
            return Err(CamstackError::InvalidState {
                op: "abort_exposure",
                state: self.state,
            });
        }
        let prior_state = self.state;
        info!(camera = %self.rig.camera.name, "aborting exposure");

        self.stop_polling().await;
        self.rig.worker.kill().await?;
        let restarted = match self.configure_backend(&injection).await {
            Ok(()) => self.start_worker(true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = restarted {
            error!(camera = %self.rig.camera.name, "abort failed: {e}");
            if let Err(kill) = self.rig.worker.kill().await {
                warn!(camera = %self.rig.camera.name, "cleanup after failed abort: {kill}");
            }
            self.state = SupervisorState::ModeChanging;
            return Err(e);
        }
        self.state = prior_state;
        self.finalize().await;
        self.start_polling();
        Ok(())
    }

    async fn release(&mut self) {
        info!(camera = %self.rig.camera.name, state = %self.state, "releasing");
        self.state = SupervisorState::ShuttingDown;
        self.stop_polling().await;
        self.teardown().await;
        self.backend.release().await;
        self.rig.keywords.detach();
        info!(camera = %self.rig.camera.name, "released");
    }

    /// Best-effort stop of dependents and worker.
    async fn teardown(&mut self) {
        self.dependents.stop_all(false, StopStrategy::Batched).await;
        if let Err(e) = self.rig.worker.kill().await {
            warn!(camera = %self.rig.camera.name, "cannot kill worker: {e}");
        }
    }

    fn reattach_stream(&mut self) {
        match self.rig.streams.open(&self.rig.camera.stream_name) {
            Ok(image) => self.rig.keywords.attach(Arc::new(image)),
            Err(e) => warn!(camera = %self.rig.camera.name, "cannot reopen stream: {e}"),
        }
    }

    /// `init_framegrab_backend` then `prepare_camera_for_size`.
    async fn configure_backend(&mut self, injection: &[ParamRequest]) -> AppResult<()> {
        let (id, mode) = self.current_mode("configure_backend")?;
        let ctx = self.rig.hook_ctx(&id, &mode);
        self.backend.init_framegrab_backend(&ctx).await?;
        self.backend.prepare_camera_for_size(&ctx, injection).await
    }

    /// Launch the worker, attach its stream and fill the header.
    async fn start_worker(&mut self, reuse_stream: bool) -> AppResult<()> {
        let (id, mode) = self.current_mode("start_worker")?;
        let (command, readiness) = {
            let ctx = self.rig.hook_ctx(&id, &mode);
            (
                self.backend.worker_command(&ctx, reuse_stream),
                self.backend.readiness(&self.rig.timing),
            )
        };
        let pid = self.rig.worker.start(&command, &readiness).await?;
        let image = self
            .rig
            .streams
            .wait_for_stream(
                &self.rig.camera.stream_name,
                Some(pid),
                self.rig.timing.stream_timeout,
            )
            .await?;
        let stream: Arc<dyn ImageStream> = Arc::new(image);
        self.rig.keywords.attach(stream);

        let cropped = self.rig.hook_ctx(&id, &mode).cropped();
        let detector = self.rig.detector(self.backend.as_ref()).to_string();
        self.rig.keywords.fill_keywords(&mode, &detector, cropped)?;
        self.state = SupervisorState::WorkerRunning;
        info!(camera = %self.rig.camera.name, pid, mode = %id, "worker running");
        Ok(())
    }

    async fn start_dependents(&mut self) -> AppResult<()> {
        let ctx = self
            .render_context()
            .ok_or(CamstackError::InvalidState {
                op: "start_dependents",
                state: self.state,
            })?;
        self.dependents.start_all(&ctx).await?;
        self.state = SupervisorState::DependentsRunning;
        Ok(())
    }

    /// `prepare_camera_finalize`; the camera stays up when it fails.
    async fn finalize(&mut self) {
        let Ok((id, mode)) = self.current_mode("finalize") else {
            return;
        };
        let ctx = self.rig.hook_ctx(&id, &mode);
        if let Err(e) = self.backend.prepare_camera_finalize(&ctx).await {
            error!(camera = %self.rig.camera.name, "prepare_camera_finalize failed: {e}");
        }
    }

    /// Round trip on the control segment of a running worker.
    async fn param_transaction(
        &self,
        op: &'static str,
        calls: &[ParamCall],
    ) -> AppResult<Vec<AppResult<KeywordValue>>> {
        if !self.state.worker_expected() {
            return Err(CamstackError::InvalidState {
                op,
                state: self.state,
            });
        }
        let control = self.backend.control().ok_or_else(|| {
            CamstackError::Unsupported(format!("{op} on {}", self.backend.family()))
        })?;
        prm_setgetmultivalue(control, &self.rig.keywords, calls).await
    }

    /// One iteration of the polling task.
    async fn poll_once(&mut self) {
        if !self.state.worker_expected() {
            return;
        }
        self.dependents.reassert_rt().await;

        if self.state == SupervisorState::DependentsRunning {
            if let Some(ctx) = self.render_context() {
                for fault in self.dependents.check_and_recover(&ctx).await {
                    if matches!(fault, CamstackError::DependentFailed { critical: true, .. }) {
                        self.record_fault(fault.to_string());
                    }
                }
            }
        }

        if !self.rig.worker.is_running().await {
            warn!(camera = %self.rig.camera.name, "acquisition worker is not running");
        }

        let Ok((id, mode)) = self.current_mode("poll") else {
            return;
        };
        let resize = {
            let ctx = self.rig.hook_ctx(&id, &mode);
            if let Err(e) = self.backend.poll_camera_for_keywords(&ctx).await {
                error!(camera = %self.rig.camera.name, "telemetry poll failed: {e}");
            }
            self.backend.detect_resize(&ctx)
        };

        if let Some((height, width)) = resize {
            info!(camera = %self.rig.camera.name, height, width, "following detector resize");
            if let Err(e) = self.set_camera_size(height, width, 0, 0, true).await {
                error!(camera = %self.rig.camera.name, "resize failed: {e}");
            }
        }

        if self.rig.camera.push_keywords {
            if let Some(prefix) = &self.rig.camera.keyword_prefix {
                self.rig
                    .keywords
                    .push_to_store(self.store.as_ref(), prefix, self.rig.timing.store_timeout)
                    .await;
            }
        }
    }
}
