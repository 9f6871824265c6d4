//! Acquisition-worker coupling.
//!
//! The worker is a separate executable that owns the vendor handle and pushes
//! frames into the image stream. The supervisor talks to it through two
//! transports:
//! - [`command::WorkerCommand`]: the command line typed into the worker's
//!   session at launch
//! - [`control::ControlSegment`]: the parameter mailbox used while it runs
//!
//! [`AcquisitionWorker`] launches the command, waits for the readiness signal
//! of the camera family and kills the worker again.

pub mod command;
pub mod control;
pub mod sim;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::dependents::{make_children_rt, RtPlacement};
use crate::error::{AppResult, CamstackError};
use crate::session::{Session, SessionProvider};

pub use command::WorkerCommand;
pub use control::{
    ControlResponder, ControlSegment, ParamOp, ParamRequest, ParamType, GET_MAGIC,
    INVALID_SENTINEL,
};

/// How the supervisor learns that a freshly launched worker is up.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Framegrabber workers: sleep, then check the process exists.
    FixedDelay(Duration),
    /// SDK workers: wait for the first post on the control segment.
    ControlPost {
        /// Segment the worker posts on
        control: Arc<ControlSegment>,
        /// Give up after this long
        timeout: Duration,
    },
}

/// Launch and kill of the worker in its dedicated session.
pub struct AcquisitionWorker {
    provider: Arc<dyn SessionProvider>,
    session_name: String,
    session: Option<Arc<dyn Session>>,
    pid: Option<u32>,
    timing: TimingConfig,
    placement: Option<RtPlacement>,
    start_attempts: u32,
}

impl std::fmt::Debug for AcquisitionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionWorker")
            .field("session", &self.session_name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl AcquisitionWorker {
    /// Worker hosted in `session_name`; nothing runs until [`start`](Self::start).
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        session_name: impl Into<String>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            provider,
            session_name: session_name.into(),
            session: None,
            pid: None,
            timing,
            placement: None,
            start_attempts: 1,
        }
    }

    /// cpuset and SCHED_FIFO priority applied to the worker tree after launch.
    pub fn with_placement(mut self, placement: Option<RtPlacement>) -> Self {
        self.placement = placement;
        self
    }

    /// Launch attempts before a start fails.
    pub fn with_start_attempts(mut self, attempts: u32) -> Self {
        self.start_attempts = attempts.max(1);
        self
    }

    /// Session hosting the worker.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Pid recorded at the last successful start.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The worker session, created on first use.
    pub async fn session(&mut self) -> AppResult<Arc<dyn Session>> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self.provider.find_or_create(&self.session_name, None).await?;
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Session handle, when it has been opened.
    pub fn session_handle(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    /// Open the session and kill whatever runs in it.
    pub async fn initialize(&mut self) -> AppResult<()> {
        let session = self.session().await?;
        if session.foreground_pid().await?.is_some() {
            info!(session = %self.session_name, "killing leftover worker");
            self.kill().await?;
        }
        Ok(())
    }

    /// Whether a worker process currently runs in the session.
    pub async fn is_running(&self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        match session.foreground_pid().await {
            Ok(Some(pid)) => session.is_pid_alive(pid).await.unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                warn!(session = %self.session_name, "cannot query worker pid: {e}");
                false
            }
        }
    }

    /// Launch `command` and wait for `readiness`, up to `start_attempts` times.
    pub async fn start(&mut self, command: &WorkerCommand, readiness: &Readiness) -> AppResult<u32> {
        let session = self.session().await?;
        let line = command.render();
        let mut last_error = None;

        for attempt in 1..=self.start_attempts {
            let baseline = match readiness {
                Readiness::ControlPost { control, .. } => Some(control.counter()),
                Readiness::FixedDelay(_) => None,
            };
            info!(session = %self.session_name, attempt, command = %line, "starting worker");

            let outcome = match session.send(&line).await {
                Ok(()) => self.wait_ready(session.as_ref(), readiness, baseline).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(pid) => {
                    self.pid = Some(pid);
                    if let Some(placement) = &self.placement {
                        make_children_rt(session.as_ref(), pid, placement).await?;
                    }
                    info!(session = %self.session_name, pid, "worker ready");
                    return Ok(pid);
                }
                Err(e) => {
                    error!(session = %self.session_name, attempt, "worker start failed: {e}");
                    if let Err(kill) = self.kill().await {
                        warn!(session = %self.session_name, "cleanup after failed start: {kill}");
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(CamstackError::BackendStartFailed(msg)) => CamstackError::BackendStartFailed(msg),
            Some(other) => CamstackError::BackendStartFailed(other.to_string()),
            None => CamstackError::BackendStartFailed("no start attempt".into()),
        })
    }

    async fn wait_ready(
        &self,
        session: &dyn Session,
        readiness: &Readiness,
        baseline: Option<u64>,
    ) -> AppResult<u32> {
        match readiness {
            Readiness::FixedDelay(delay) => {
                tokio::time::sleep(*delay).await;
                let pid = session.foreground_pid().await?.ok_or_else(|| {
                    CamstackError::BackendStartFailed(format!(
                        "no worker process in session {}",
                        self.session_name
                    ))
                })?;
                if !session.is_pid_alive(pid).await? {
                    return Err(CamstackError::BackendStartFailed(format!(
                        "worker {pid} exited during startup"
                    )));
                }
                Ok(pid)
            }
            Readiness::ControlPost { control, timeout } => {
                let t0 = Instant::now();
                let poll = Duration::from_millis(20);
                let mut seen: Option<u32> = None;
                loop {
                    match session.foreground_pid().await? {
                        Some(pid) if session.is_pid_alive(pid).await? => {
                            seen = Some(pid);
                            if Some(control.counter()) != baseline {
                                return Ok(pid);
                            }
                        }
                        _ => {
                            if let Some(pid) = seen {
                                return Err(CamstackError::BackendStartFailed(format!(
                                    "worker {pid} crashed during startup"
                                )));
                            }
                            if t0.elapsed() > self.timing.fixed_ready_delay {
                                return Err(CamstackError::BackendStartFailed(format!(
                                    "no worker process in session {}",
                                    self.session_name
                                )));
                            }
                        }
                    }
                    if t0.elapsed() >= *timeout {
                        return Err(CamstackError::BackendStartFailed(format!(
                            "worker did not post within {timeout:?}"
                        )));
                    }
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Interrupt the worker, escalate to suspend+kill after the grace period.
    pub async fn kill(&mut self) -> AppResult<()> {
        let session = self.session().await?;
        debug!(session = %self.session_name, pid = ?self.pid, "killing worker");
        session.kill_running(self.timing.interrupt_grace).await?;
        tokio::time::sleep(self.timing.kill_settle).await;
        if let Some(pid) = self.pid.take() {
            if session.is_pid_alive(pid).await.unwrap_or(false) {
                warn!(session = %self.session_name, pid, "worker survived kill");
            }
        }
        Ok(())
    }
}
