//! In-memory sessions for tests and dry runs.
//!
//! A command line sent to an idle mock session becomes a simulated foreground
//! job with a fresh pid. The job lives until it is interrupted, unless a
//! [`Launcher`] registered for that session takes over: the launcher receives
//! the job's pid, liveness flag and cancellation token, and is responsible for
//! clearing the flag when its work ends. Every operation is journaled with a
//! timestamp so tests can assert on ordering.
//!
//! ```
//! use camstack::session::mock::MockProvider;
//! use camstack::session::{Session, SessionProvider};
//! # tokio_test::block_on(async {
//! let provider = MockProvider::new();
//! let session = provider.find_or_create("kcam_fgrab", None).await.unwrap();
//! session.send("hwacq-edttake -s kcam").await.unwrap();
//! assert!(session.foreground_pid().await.unwrap().is_some());
//!
//! session.interrupt().await.unwrap();
//! assert!(session.foreground_pid().await.unwrap().is_none());
//! assert_eq!(provider.sent_to("kcam_fgrab"), vec!["hwacq-edttake -s kcam"]);
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Session, SessionProvider, SessionRegistry};
use crate::error::AppResult;

/// What a launcher gets when a command starts in its session.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    /// Session the command was sent to
    pub session: String,
    /// Command line as sent
    pub command: String,
    /// Pid assigned to the job
    pub pid: u32,
    /// Cleared when the job exits
    pub alive: Arc<AtomicBool>,
    /// Cancelled on interrupt or kill
    pub cancel: CancellationToken,
}

impl LaunchContext {
    /// Mark the job as exited.
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Stands in for the program a session runs.
pub type Launcher = Arc<dyn Fn(LaunchContext) + Send + Sync>;

/// What happened in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// Session created
    Created,
    /// Line sent
    Sent(String),
    /// A job started
    Started { pid: u32 },
    /// Ctrl-C
    Interrupt,
    /// Ctrl-Z then kill
    SuspendKill,
    /// Helper run on the session's host
    Helper(String),
}

/// One journal entry.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// When it happened
    pub at: Instant,
    /// Remote host
    pub host: Option<String>,
    /// Session name
    pub session: String,
    /// What happened
    pub kind: SessionEventKind,
}

#[derive(Debug)]
struct MockJob {
    pid: u32,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Shared {
    journal: Mutex<Vec<SessionEvent>>,
    pids: Mutex<HashMap<u32, Arc<AtomicBool>>>,
    launchers: Mutex<HashMap<String, Launcher>>,
    next_pid: AtomicU32,
}

impl Shared {
    fn record(&self, session: &MockSession, kind: SessionEventKind) {
        self.journal.lock().push(SessionEvent {
            at: Instant::now(),
            host: session.host.clone(),
            session: session.name.clone(),
            kind,
        });
    }
}

/// In-memory session.
pub struct MockSession {
    name: String,
    host: Option<String>,
    job: Mutex<Option<MockJob>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("job", &*self.job.lock())
            .finish()
    }
}

impl MockSession {
    fn running_job(&self) -> Option<u32> {
        let mut job = self.job.lock();
        match job.as_ref() {
            Some(j) if j.alive.load(Ordering::SeqCst) => Some(j.pid),
            Some(_) => {
                *job = None;
                None
            }
            None => None,
        }
    }

    fn start_job(&self, command: &str) {
        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        self.shared.pids.lock().insert(pid, alive.clone());
        *self.job.lock() = Some(MockJob {
            pid,
            alive: alive.clone(),
            cancel: cancel.clone(),
        });
        self.shared.record(self, SessionEventKind::Started { pid });

        let launcher = self.shared.launchers.lock().get(&self.name).cloned();
        if let Some(launch) = launcher {
            launch(LaunchContext {
                session: self.name.clone(),
                command: command.to_string(),
                pid,
                alive,
                cancel,
            });
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    async fn send_keys(&self, keys: &str, enter: bool, suppress_history: bool) -> AppResult<()> {
        let line = if suppress_history {
            format!(" {keys}")
        } else {
            keys.to_string()
        };
        self.shared.record(self, SessionEventKind::Sent(line));
        if enter && self.running_job().is_none() && !keys.trim().is_empty() {
            self.start_job(keys.trim());
        }
        Ok(())
    }

    async fn interrupt(&self) -> AppResult<()> {
        self.shared.record(self, SessionEventKind::Interrupt);
        let job = self.job.lock();
        if let Some(job) = job.as_ref() {
            job.cancel.cancel();
            // Plain jobs die on SIGINT; launched jobs report their own exit
            if !self.shared.launchers.lock().contains_key(&self.name) {
                job.alive.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn suspend_and_kill(&self) -> AppResult<()> {
        self.shared.record(self, SessionEventKind::SuspendKill);
        if let Some(job) = self.job.lock().take() {
            job.cancel.cancel();
            job.alive.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn foreground_pid(&self) -> AppResult<Option<u32>> {
        Ok(self.running_job())
    }

    async fn children_of(&self, _pid: u32) -> AppResult<Vec<u32>> {
        Ok(Vec::new())
    }

    async fn is_pid_alive(&self, pid: u32) -> AppResult<bool> {
        Ok(self
            .shared
            .pids
            .lock()
            .get(&pid)
            .map(|a| a.load(Ordering::SeqCst))
            .unwrap_or(false))
    }

    async fn run_helper(&self, program: &str, args: &[String]) -> AppResult<()> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.shared.record(self, SessionEventKind::Helper(line));
        Ok(())
    }
}

/// Provider of [`MockSession`]s with a shared journal.
pub struct MockProvider {
    registry: SessionRegistry<MockSession>,
    shared: Arc<Shared>,
}

impl Default for MockProvider {
    fn default() -> Self {
        let shared = Shared {
            next_pid: AtomicU32::new(40_000),
            ..Default::default()
        };
        Self {
            registry: SessionRegistry::new(),
            shared: Arc::new(shared),
        }
    }
}

impl MockProvider {
    /// Provider with no launchers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route command lines started in `session` to `launcher`.
    pub fn set_launcher(&self, session: &str, launcher: Launcher) {
        self.shared
            .launchers
            .lock()
            .insert(session.to_string(), launcher);
    }

    /// Whole journal.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.shared.journal.lock().clone()
    }

    /// Journal of one session.
    pub fn events_for(&self, session: &str) -> Vec<SessionEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.session == session)
            .collect()
    }

    /// Lines sent to `session`, in order.
    pub fn sent_to(&self, session: &str) -> Vec<String> {
        self.events_for(session)
            .into_iter()
            .filter_map(|e| match e.kind {
                SessionEventKind::Sent(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Instants at which a job appeared in `session`.
    pub fn starts_in(&self, session: &str) -> Vec<Instant> {
        self.events_for(session)
            .into_iter()
            .filter(|e| matches!(e.kind, SessionEventKind::Started { .. }))
            .map(|e| e.at)
            .collect()
    }

    /// Instants at which `session` was interrupted.
    pub fn interrupts_in(&self, session: &str) -> Vec<Instant> {
        self.events_for(session)
            .into_iter()
            .filter(|e| e.kind == SessionEventKind::Interrupt)
            .map(|e| e.at)
            .collect()
    }

    /// Pids of every job still alive, in any session.
    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .shared
            .pids
            .lock()
            .iter()
            .filter(|(_, alive)| alive.load(Ordering::SeqCst))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Session registered as `(host, name)`.
    pub fn session(&self, name: &str, host: Option<&str>) -> Option<Arc<MockSession>> {
        self.registry.get(name, host)
    }

    /// Sessions created so far.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl SessionProvider for MockProvider {
    async fn find_or_create(&self, name: &str, host: Option<&str>) -> AppResult<Arc<dyn Session>> {
        let mut created = false;
        let session = self.registry.get_or_insert_with(name, host, || {
            created = true;
            Arc::new(MockSession {
                name: name.to_string(),
                host: host.map(str::to_string),
                job: Mutex::new(None),
                shared: self.shared.clone(),
            })
        });
        if created {
            self.shared.record(&session, SessionEventKind::Created);
        }
        let session: Arc<dyn Session> = session;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let provider = MockProvider::new();
        let a = provider.find_or_create("dep", None).await.unwrap();
        let b = provider.find_or_create("dep", None).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        provider.find_or_create("dep", Some("rtc")).await.unwrap();
        assert_eq!(provider.session_count(), 2);
    }

    #[tokio::test]
    async fn commands_become_jobs_until_killed() {
        let provider = MockProvider::new();
        let s = provider.find_or_create("dep", None).await.unwrap();
        assert_eq!(s.foreground_pid().await.unwrap(), None);

        s.send("shmimview cam").await.unwrap();
        let pid = s.foreground_pid().await.unwrap().unwrap();
        assert!(s.is_pid_alive(pid).await.unwrap());

        // Input to a running job does not start another one
        s.send("q").await.unwrap();
        assert_eq!(s.foreground_pid().await.unwrap(), Some(pid));

        s.kill_running(Duration::ZERO).await.unwrap();
        assert_eq!(s.foreground_pid().await.unwrap(), None);
        assert!(!s.is_pid_alive(pid).await.unwrap());
        assert!(provider.live_pids().is_empty());
        assert_eq!(provider.sent_to("dep"), vec!["shmimview cam", "q"]);
    }

    #[tokio::test]
    async fn suppressed_history_gets_a_leading_space() {
        let provider = MockProvider::new();
        let s = provider.find_or_create("dep", None).await.unwrap();
        s.send_keys("secret", true, true).await.unwrap();
        assert_eq!(provider.sent_to("dep"), vec![" secret"]);
    }

    #[tokio::test]
    async fn launcher_owns_job_lifetime() {
        let provider = MockProvider::new();
        provider.set_launcher(
            "worker",
            Arc::new(|ctx: LaunchContext| {
                tokio::spawn(async move {
                    ctx.cancel.cancelled().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ctx.exit();
                });
            }),
        );
        let s = provider.find_or_create("worker", None).await.unwrap();
        s.send("simworker -s cam").await.unwrap();
        let pid = s.foreground_pid().await.unwrap().unwrap();

        s.interrupt().await.unwrap();
        assert!(s.is_pid_alive(pid).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!s.is_pid_alive(pid).await.unwrap());
    }
}
