//! Auxiliary processes whose lifecycle follows the camera mode.
//!
//! Each [`DependentProcess`] lives in its own session. The [`DependentGraph`]
//! starts them by ascending `start_order` and stops them by ascending
//! `kill_order`; the two orderings are independent and ties keep declaration
//! order. Arguments such as the current frame width are resolved when the
//! command is rendered, so a dependent never holds a reference back to the
//! camera.

pub mod rt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::error::{AppResult, CamstackError};
use crate::session::{session_label, Session, SessionProvider};

pub use rt::{make_children_rt, RtPlacement};

/// One argument of a dependent's command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependentArg {
    /// Passed through unchanged
    Literal(String),
    /// `#WIDTH#`: current frame width
    Width,
    /// `#HEIGHT#`: current frame height
    Height,
}

impl DependentArg {
    /// Placeholder token for [`DependentArg::Width`].
    pub const WIDTH: &'static str = "#WIDTH#";
    /// Placeholder token for [`DependentArg::Height`].
    pub const HEIGHT: &'static str = "#HEIGHT#";

    fn resolve(&self, ctx: &RenderContext) -> String {
        match self {
            DependentArg::Literal(s) => s.clone(),
            DependentArg::Width => ctx.width.to_string(),
            DependentArg::Height => ctx.height.to_string(),
        }
    }
}

impl From<&str> for DependentArg {
    fn from(s: &str) -> Self {
        match s {
            Self::WIDTH => DependentArg::Width,
            Self::HEIGHT => DependentArg::Height,
            other => DependentArg::Literal(other.to_string()),
        }
    }
}

impl fmt::Display for DependentArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependentArg::Literal(s) => f.write_str(s),
            DependentArg::Width => f.write_str(Self::WIDTH),
            DependentArg::Height => f.write_str(Self::HEIGHT),
        }
    }
}

impl Serialize for DependentArg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DependentArg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Float(f64),
            Str(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(i) => DependentArg::Literal(i.to_string()),
            Raw::Float(x) => DependentArg::Literal(x.to_string()),
            Raw::Str(s) => DependentArg::from(s.as_str()),
        })
    }
}

/// Values available to command templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Stream name
    pub stream: String,
    /// Camera name
    pub camera: String,
}

/// Description of one dependent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentProcess {
    /// Session name
    pub name: String,
    /// Remote host; local when unset
    #[serde(default)]
    pub host: Option<String>,
    /// Command template: `{0}`, `{1}`… are the resolved args, `{width}`,
    /// `{height}`, `{stream}` and `{camera}` are always available. `%s` tokens
    /// are filled with the args in order.
    pub command: String,
    /// Arguments substituted into the template
    #[serde(default)]
    pub args: Vec<DependentArg>,
    /// Lower starts first
    #[serde(default)]
    pub start_order: i32,
    /// Lower stops first
    #[serde(default)]
    pub kill_order: i32,
    /// CPU set the process tree is moved into
    #[serde(default = "default_cset")]
    pub cset: String,
    /// Real-time priority; no placement when unset
    #[serde(default)]
    pub rtprio: Option<u32>,
    /// Stopped whenever its session is (re)created at supervisor start
    #[serde(default = "default_true")]
    pub kill_upon_create: bool,
    /// Death of this dependent is a supervisor fault
    #[serde(default)]
    pub critical: bool,
    /// Relaunched by the polling task when found dead
    #[serde(default)]
    pub restart: bool,
}

fn default_cset() -> String {
    "system".to_string()
}

fn default_true() -> bool {
    true
}

impl DependentProcess {
    /// Local dependent with default orders and no arguments.
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            host: None,
            command: command.to_string(),
            args: Vec::new(),
            start_order: 0,
            kill_order: 0,
            cset: default_cset(),
            rtprio: None,
            kill_upon_create: true,
            critical: false,
            restart: false,
        }
    }

    /// Template arguments.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<DependentArg>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Start and kill orders.
    pub fn with_orders(mut self, start_order: i32, kill_order: i32) -> Self {
        self.start_order = start_order;
        self.kill_order = kill_order;
        self
    }

    /// Run on `host` over ssh.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Pin into `cset` at `rtprio`.
    pub fn with_rt(mut self, cset: &str, rtprio: u32) -> Self {
        self.cset = cset.to_string();
        self.rtprio = Some(rtprio);
        self
    }

    /// Death is a supervisor fault.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Restarted by the polling task when found dead.
    pub fn restartable(mut self) -> Self {
        self.restart = true;
        self
    }

    /// `name` or `host:name`.
    pub fn label(&self) -> String {
        match &self.host {
            Some(host) => format!("{host}:{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Real-time placement, when a priority is set.
    pub fn placement(&self) -> Option<RtPlacement> {
        self.rtprio.map(|prio| RtPlacement::new(self.cset.clone(), prio))
    }

    /// Check the template renders with placeholder values.
    pub fn validate(&self) -> AppResult<()> {
        if self.command.trim().is_empty() {
            return Err(CamstackError::Configuration(format!(
                "dependent {} has an empty command",
                self.name
            )));
        }
        self.render(&RenderContext {
            width: 1,
            height: 1,
            stream: String::new(),
            camera: String::new(),
        })
        .map(|_| ())
    }

    /// Command line with every placeholder resolved.
    pub fn render(&self, ctx: &RenderContext) -> AppResult<String> {
        let args: Vec<String> = self.args.iter().map(|a| a.resolve(ctx)).collect();

        let mut line = String::with_capacity(self.command.len());
        let mut positional = args.iter();
        let mut rest = self.command.as_str();
        while let Some(pos) = rest.find('%') {
            line.push_str(&rest[..pos]);
            let tail = &rest[pos + 1..];
            match tail.chars().next() {
                Some('s') | Some('d') => {
                    let arg = positional.next().ok_or_else(|| {
                        CamstackError::Configuration(format!(
                            "dependent {}: not enough args for '{}'",
                            self.name, self.command
                        ))
                    })?;
                    line.push_str(arg);
                    rest = &tail[1..];
                }
                Some('%') => {
                    line.push('%');
                    rest = &tail[1..];
                }
                _ => {
                    line.push('%');
                    rest = tail;
                }
            }
        }
        line.push_str(rest);

        if !line.contains('{') {
            return Ok(line);
        }
        let mut vars: HashMap<String, String> = args
            .iter()
            .enumerate()
            .map(|(i, a)| (i.to_string(), a.clone()))
            .collect();
        vars.insert("width".into(), ctx.width.to_string());
        vars.insert("height".into(), ctx.height.to_string());
        vars.insert("stream".into(), ctx.stream.clone());
        vars.insert("camera".into(), ctx.camera.clone());
        strfmt::strfmt(&line, &vars).map_err(|e| {
            CamstackError::Configuration(format!("dependent {}: bad template: {e}", self.name))
        })
    }
}

/// How `stop_all` sequences interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopStrategy {
    /// Interrupt, wait, kill; one dependent at a time
    Sequential,
    /// All interrupts, one wait, all kills
    #[default]
    Batched,
}

/// Liveness report for one dependent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependentStatus {
    /// Session name
    pub name: String,
    /// Remote host
    pub host: Option<String>,
    /// Pid of the running process
    pub pid: Option<u32>,
    /// Whether the process is alive
    pub alive: bool,
    /// Whether its death is a fault
    pub critical: bool,
}

struct Entry {
    spec: DependentProcess,
    session: Option<Arc<dyn Session>>,
    pid: Option<u32>,
}

/// Owns the dependents of one camera.
pub struct DependentGraph {
    provider: Arc<dyn SessionProvider>,
    entries: Vec<Entry>,
    timing: TimingConfig,
}

impl fmt::Debug for DependentGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentGraph")
            .field(
                "dependents",
                &self.entries.iter().map(|e| e.spec.label()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DependentGraph {
    /// Graph over `dependents`; no session is touched until [`initialize`](Self::initialize).
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        dependents: Vec<DependentProcess>,
        timing: TimingConfig,
    ) -> Self {
        let entries = dependents
            .into_iter()
            .map(|spec| Entry {
                spec,
                session: None,
                pid: None,
            })
            .collect();
        Self {
            provider,
            entries,
            timing,
        }
    }

    /// Number of dependents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are none.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured dependents in declaration order.
    pub fn specs(&self) -> impl Iterator<Item = &DependentProcess> {
        self.entries.iter().map(|e| &e.spec)
    }

    /// Indices sorted by `key`; ties keep declaration order.
    fn ordered_by(&self, key: impl Fn(&DependentProcess) -> i32) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| key(&self.entries[i].spec));
        order
    }

    /// Labels in start order.
    pub fn start_sequence(&self) -> Vec<String> {
        self.ordered_by(|d| d.start_order)
            .into_iter()
            .map(|i| self.entries[i].spec.label())
            .collect()
    }

    /// Labels in stop order.
    pub fn stop_sequence(&self) -> Vec<String> {
        self.ordered_by(|d| d.kill_order)
            .into_iter()
            .map(|i| self.entries[i].spec.label())
            .collect()
    }

    async fn session(&mut self, idx: usize) -> AppResult<Arc<dyn Session>> {
        if let Some(session) = &self.entries[idx].session {
            return Ok(session.clone());
        }
        let spec = &self.entries[idx].spec;
        let session = self
            .provider
            .find_or_create(&spec.name, spec.host.as_deref())
            .await?;
        self.entries[idx].session = Some(session.clone());
        Ok(session)
    }

    /// Find or create every session, let fresh shells settle, then stop
    /// whatever runs in the `kill_upon_create` ones.
    pub async fn initialize(&mut self) -> AppResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        for idx in 0..self.entries.len() {
            if let Err(e) = self.session(idx).await {
                warn!(dependent = %self.entries[idx].spec.label(), "cannot open session: {e}");
            }
        }
        tokio::time::sleep(self.timing.session_settle).await;
        self.stop_all(true, StopStrategy::Batched).await;
        Ok(())
    }

    async fn launch(&mut self, idx: usize, ctx: &RenderContext) -> AppResult<()> {
        let line = self.entries[idx].spec.render(ctx)?;
        let session = self.session(idx).await?;
        let label = self.entries[idx].spec.label();
        info!(dependent = %label, command = %line, "starting dependent");

        if let Err(e) = session.send(&line).await {
            if session.host().is_none() {
                return Err(e);
            }
            // Remote shells drop; reopen once
            warn!(dependent = %label, "send failed, reopening remote session: {e}");
            self.entries[idx].session = None;
            let session = self.session(idx).await?;
            session.send(&line).await?;
        }
        Ok(())
    }

    /// Start every dependent by ascending `start_order`.
    ///
    /// Best effort: a dependent that cannot be reached is logged and skipped.
    /// After `batch_delay` the foreground pid of each session is recorded and
    /// its tree pinned to the dependent's cpuset.
    pub async fn start_all(&mut self, ctx: &RenderContext) -> AppResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let order = self.ordered_by(|d| d.start_order);
        for &idx in &order {
            self.entries[idx].pid = None;
            if let Err(e) = self.launch(idx, ctx).await {
                error!(dependent = %self.entries[idx].spec.label(), "start failed: {e}");
            }
        }

        tokio::time::sleep(self.timing.batch_delay).await;

        for &idx in &order {
            let Some(session) = self.entries[idx].session.clone() else {
                continue;
            };
            match session.foreground_pid().await {
                Ok(Some(pid)) => {
                    self.entries[idx].pid = Some(pid);
                    if let Some(placement) = self.entries[idx].spec.placement() {
                        make_children_rt(session.as_ref(), pid, &placement).await?;
                    }
                }
                Ok(None) => warn!(
                    dependent = %self.entries[idx].spec.label(),
                    "no process after start"
                ),
                Err(e) => warn!(
                    dependent = %self.entries[idx].spec.label(),
                    "cannot query pid: {e}"
                ),
            }
        }
        Ok(())
    }

    /// Stop dependents by ascending `kill_order`.
    ///
    /// With `respect_kill_on_create` only dependents flagged
    /// `kill_upon_create` are touched. Never fails; errors are logged.
    pub async fn stop_all(&mut self, respect_kill_on_create: bool, strategy: StopStrategy) {
        let order: Vec<usize> = self
            .ordered_by(|d| d.kill_order)
            .into_iter()
            .filter(|&i| !respect_kill_on_create || self.entries[i].spec.kill_upon_create)
            .collect();
        let mut sessions = Vec::with_capacity(order.len());
        for idx in order {
            match self.session(idx).await {
                Ok(s) => sessions.push((idx, s)),
                Err(e) => warn!(dependent = %self.entries[idx].spec.label(), "cannot open session: {e}"),
            }
        }
        if sessions.is_empty() {
            return;
        }

        match strategy {
            StopStrategy::Sequential => {
                for (idx, session) in &sessions {
                    debug!(dependent = %self.entries[*idx].spec.label(), "stopping");
                    if let Err(e) = session.kill_running(self.timing.interrupt_grace).await {
                        warn!(session = %session_label(session.as_ref()), "stop failed: {e}");
                    }
                }
            }
            StopStrategy::Batched => {
                for (idx, session) in &sessions {
                    debug!(dependent = %self.entries[*idx].spec.label(), "interrupting");
                    if let Err(e) = session.interrupt().await {
                        warn!(session = %session_label(session.as_ref()), "interrupt failed: {e}");
                    }
                }
                tokio::time::sleep(self.timing.interrupt_grace).await;
                for (_, session) in &sessions {
                    if let Err(e) = session.suspend_and_kill().await {
                        warn!(session = %session_label(session.as_ref()), "kill failed: {e}");
                    }
                }
                tokio::time::sleep(self.timing.kill_settle).await;
            }
        }
        for (idx, _) in sessions {
            self.entries[idx].pid = None;
        }
    }

    /// Liveness of every dependent, in declaration order.
    ///
    /// The pid recorded at start is checked; the session's foreground pid is
    /// only used for dependents started outside this graph.
    pub async fn liveness(&self) -> Vec<DependentStatus> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let (pid, alive) = match &entry.session {
                None => (entry.pid, false),
                Some(session) => match entry.pid {
                    Some(pid) => (Some(pid), session.is_pid_alive(pid).await.unwrap_or(false)),
                    None => match session.foreground_pid().await {
                        Ok(Some(pid)) => (Some(pid), true),
                        _ => (None, false),
                    },
                },
            };
            out.push(DependentStatus {
                name: entry.spec.name.clone(),
                host: entry.spec.host.clone(),
                pid,
                alive,
                critical: entry.spec.critical,
            });
        }
        out
    }

    /// Re-pin the current process tree of every dependent with an RT placement.
    pub async fn reassert_rt(&self) {
        for entry in &self.entries {
            let (Some(placement), Some(session)) = (entry.spec.placement(), &entry.session) else {
                continue;
            };
            match session.foreground_pid().await {
                Ok(Some(pid)) => {
                    if let Err(e) = make_children_rt(session.as_ref(), pid, &placement).await {
                        warn!(dependent = %entry.spec.label(), "cannot re-pin: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(dependent = %entry.spec.label(), "cannot query pid: {e}"),
            }
        }
    }

    /// Stop and relaunch one dependent.
    pub async fn restart(&mut self, name: &str, ctx: &RenderContext) -> AppResult<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.spec.name == name)
            .ok_or_else(|| CamstackError::Configuration(format!("no dependent named {name}")))?;
        let session = self.session(idx).await?;
        session.kill_running(self.timing.interrupt_grace).await?;
        self.launch(idx, ctx).await?;
        tokio::time::sleep(self.timing.batch_delay).await;
        self.entries[idx].pid = session.foreground_pid().await?;
        if let (Some(pid), Some(placement)) = (self.entries[idx].pid, self.entries[idx].spec.placement()) {
            make_children_rt(session.as_ref(), pid, &placement).await?;
        }
        Ok(())
    }

    /// Find dead dependents, relaunch the restartable ones and report the rest.
    ///
    /// Returns one `DependentFailed` per dead dependent that was not brought back.
    pub async fn check_and_recover(&mut self, ctx: &RenderContext) -> Vec<CamstackError> {
        let mut faults = Vec::new();
        for status in self.liveness().await {
            if status.alive {
                continue;
            }
            let spec = self
                .entries
                .iter()
                .find(|e| e.spec.name == status.name && e.spec.host == status.host)
                .map(|e| e.spec.clone());
            let Some(spec) = spec else { continue };

            if spec.restart {
                warn!(dependent = %spec.label(), "dependent died, restarting");
                match self.restart(&spec.name, ctx).await {
                    Ok(()) => continue,
                    Err(e) => error!(dependent = %spec.label(), "restart failed: {e}"),
                }
            }
            if spec.critical {
                error!(dependent = %spec.label(), "critical dependent is dead");
            } else {
                warn!(dependent = %spec.label(), "dependent is dead");
            }
            faults.push(CamstackError::DependentFailed {
                name: spec.label(),
                critical: spec.critical,
            });
        }
        faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockProvider, SessionEventKind};

    fn ctx() -> RenderContext {
        RenderContext {
            width: 320,
            height: 256,
            stream: "kcam".into(),
            camera: "kalao".into(),
        }
    }

    #[test]
    fn renders_printf_and_named_placeholders() {
        let dep = DependentProcess::new("kcam_tcp", "shmimTCPtransmit %s %s")
            .with_args(["kcam", "#WIDTH#"]);
        assert_eq!(dep.render(&ctx()).unwrap(), "shmimTCPtransmit kcam 320");

        let dep = DependentProcess::new("kcam_utr", "utr {0} -x {width} -y {height} -c {camera}")
            .with_args([DependentArg::from("-v")]);
        assert_eq!(
            dep.render(&ctx()).unwrap(),
            "utr -v -x 320 -y 256 -c kalao"
        );

        let dep = DependentProcess::new("bad", "run %s %s").with_args(["one"]);
        assert!(dep.render(&ctx()).is_err());
    }

    #[test]
    fn args_deserialize_from_mixed_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            args: Vec<DependentArg>,
        }
        let w: Wrapper = toml::from_str(r##"args = ["#HEIGHT#", 12, "x"]"##).unwrap();
        assert_eq!(
            w.args,
            vec![
                DependentArg::Height,
                DependentArg::Literal("12".into()),
                DependentArg::Literal("x".into())
            ]
        );
    }

    #[test]
    fn orderings_are_independent() {
        let graph = DependentGraph::new(
            Arc::new(MockProvider::new()),
            vec![
                DependentProcess::new("a", "a").with_orders(1, 2),
                DependentProcess::new("b", "b").with_orders(2, 1),
                DependentProcess::new("c", "c").with_orders(2, 2),
            ],
            TimingConfig::fast(),
        );
        assert_eq!(graph.start_sequence(), vec!["a", "b", "c"]);
        assert_eq!(graph.stop_sequence(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn start_then_stop_leaves_nothing_running() {
        let provider = Arc::new(MockProvider::new());
        let mut graph = DependentGraph::new(
            provider.clone(),
            vec![
                DependentProcess::new("a", "proc_a").with_orders(1, 2),
                DependentProcess::new("b", "proc_b %s")
                    .with_args(["#WIDTH#"])
                    .with_orders(2, 1)
                    .with_rt("ircam", 40),
            ],
            TimingConfig::fast(),
        );
        graph.start_all(&ctx()).await.unwrap();
        assert_eq!(provider.sent_to("b"), vec!["proc_b 320"]);
        assert_eq!(provider.live_pids().len(), 2);
        assert!(graph.liveness().await.iter().all(|s| s.alive));

        let helpers = provider
            .events_for("b")
            .into_iter()
            .filter(|e| matches!(e.kind, SessionEventKind::Helper(_)))
            .count();
        assert_eq!(helpers, 1);

        graph.stop_all(false, StopStrategy::Sequential).await;
        assert!(provider.live_pids().is_empty());
        assert!(graph.liveness().await.iter().all(|s| !s.alive));
    }

    #[tokio::test]
    async fn batched_stop_interrupts_everything_first() {
        let provider = Arc::new(MockProvider::new());
        let mut graph = DependentGraph::new(
            provider.clone(),
            vec![
                DependentProcess::new("a", "proc_a").with_orders(1, 1),
                DependentProcess::new("b", "proc_b").with_orders(2, 2),
            ],
            TimingConfig::fast(),
        );
        graph.start_all(&ctx()).await.unwrap();
        graph.stop_all(false, StopStrategy::Batched).await;

        let kinds: Vec<(String, SessionEventKind)> = provider
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    SessionEventKind::Interrupt | SessionEventKind::SuspendKill
                )
            })
            .map(|e| (e.session, e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("a".to_string(), SessionEventKind::Interrupt),
                ("b".to_string(), SessionEventKind::Interrupt),
                ("a".to_string(), SessionEventKind::SuspendKill),
                ("b".to_string(), SessionEventKind::SuspendKill),
            ]
        );
    }

    #[tokio::test]
    async fn initialize_only_stops_kill_upon_create() {
        let provider = Arc::new(MockProvider::new());
        let mut keep = DependentProcess::new("keep", "viewer");
        keep.kill_upon_create = false;
        let mut graph = DependentGraph::new(
            provider.clone(),
            vec![DependentProcess::new("kill", "proc"), keep],
            TimingConfig::fast(),
        );
        graph.initialize().await.unwrap();
        assert_eq!(provider.session_count(), 2);
        assert_eq!(provider.interrupts_in("kill").len(), 1);
        assert!(provider.interrupts_in("keep").is_empty());
    }

    #[tokio::test]
    async fn dead_dependents_are_restarted_or_reported() {
        let provider = Arc::new(MockProvider::new());
        let mut graph = DependentGraph::new(
            provider.clone(),
            vec![
                DependentProcess::new("rtc", "cacao-rtc").critical(),
                DependentProcess::new("tcp", "shmimTCPtransmit").restartable(),
            ],
            TimingConfig::fast(),
        );
        graph.start_all(&ctx()).await.unwrap();

        for name in ["rtc", "tcp"] {
            let session = provider.session(name, None).unwrap();
            session.interrupt().await.unwrap();
        }

        let faults = graph.check_and_recover(&ctx()).await;
        assert_eq!(faults.len(), 1);
        assert!(matches!(
            &faults[0],
            CamstackError::DependentFailed { name, critical: true } if name == "rtc"
        ));
        assert_eq!(provider.starts_in("tcp").len(), 2);
        let status = graph.liveness().await;
        assert!(!status[0].alive);
        assert!(status[1].alive);
    }
}
