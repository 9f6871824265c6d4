//! cpuset and real-time priority for process trees.
//!
//! `milk-makecsetandrt <pid> <cset> <prio>` moves one pid into a cpuset and
//! switches it to SCHED_FIFO. Threads and subprocesses spawned by a worker do
//! not inherit the cpuset, so the whole tree under the session's foreground
//! pid is visited.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::session::{session_label, Session};

/// Helper creating the CPU set and applying the priority.
pub const RT_HELPER: &str = "milk-makecsetandrt";

/// Placement of one process tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtPlacement {
    /// CPU set name
    pub cset: String,
    /// `SCHED_FIFO` priority
    pub rtprio: u32,
}

impl RtPlacement {
    /// Place into `cset` at `rtprio`.
    pub fn new(cset: impl Into<String>, rtprio: u32) -> Self {
        Self {
            cset: cset.into(),
            rtprio,
        }
    }

    fn helper_args(&self, pid: u32) -> Vec<String> {
        vec![pid.to_string(), self.cset.clone(), self.rtprio.to_string()]
    }
}

/// Apply `placement` to `root` and every descendant, breadth first.
///
/// Returns the pids visited. A helper failure on one pid is logged and the
/// walk continues; failing to list children ends the walk at that node.
pub async fn make_children_rt(
    session: &dyn Session,
    root: u32,
    placement: &RtPlacement,
) -> AppResult<Vec<u32>> {
    let mut queue = VecDeque::from([root]);
    let mut seen = HashSet::new();
    let mut visited = Vec::new();

    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        if let Err(e) = session
            .run_helper(RT_HELPER, &placement.helper_args(pid))
            .await
        {
            warn!(session = %session_label(session), pid, "cannot set rt placement: {e}");
        }
        visited.push(pid);
        match session.children_of(pid).await {
            Ok(children) => queue.extend(children),
            Err(e) => debug!(pid, "cannot list children: {e}"),
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockProvider, SessionEventKind};
    use crate::session::SessionProvider;

    #[tokio::test]
    async fn helper_runs_for_the_root() {
        let provider = MockProvider::new();
        let session = provider.find_or_create("dep", None).await.unwrap();
        session.send("shmimTCPtransmit cam").await.unwrap();
        let pid = session.foreground_pid().await.unwrap().unwrap();

        let visited = make_children_rt(session.as_ref(), pid, &RtPlacement::new("ircam0", 45))
            .await
            .unwrap();
        assert_eq!(visited, vec![pid]);

        let helpers: Vec<String> = provider
            .events_for("dep")
            .into_iter()
            .filter_map(|e| match e.kind {
                SessionEventKind::Helper(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(helpers, vec![format!("{RT_HELPER} {pid} ircam0 45")]);
    }
}
