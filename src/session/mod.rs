//! Named, long-lived shell sessions hosting the acquisition worker and dependents.
//!
//! A session is addressed by `(host, name)`; `host == None` is the local
//! machine. Sending keys never waits for the command to complete: callers that
//! need to know a process is up check its pid explicitly.
//!
//! Two providers share the [`Session`] interface:
//! - [`tmux::TmuxProvider`]: terminal-multiplexer sessions, locally or over ssh
//! - [`mock::MockProvider`]: in-memory sessions that record what was sent

pub mod mock;
pub mod tmux;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;

/// Handle to one named session.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Session name.
    fn name(&self) -> &str;

    /// Remote host, `None` for local sessions.
    fn host(&self) -> Option<&str>;

    /// Type `keys`. With `suppress_history` a leading space keeps the line out
    /// of the shell history.
    async fn send_keys(&self, keys: &str, enter: bool, suppress_history: bool) -> AppResult<()>;

    /// Ctrl-C, twice.
    async fn interrupt(&self) -> AppResult<()>;

    /// Ctrl-Z, then `kill %`.
    async fn suspend_and_kill(&self) -> AppResult<()>;

    /// Pid of the single child of the session shell, `None` when idle.
    async fn foreground_pid(&self) -> AppResult<Option<u32>>;

    /// Direct children of `pid`, on the session's host.
    async fn children_of(&self, pid: u32) -> AppResult<Vec<u32>>;

    /// Whether `pid` still exists on the session's host.
    async fn is_pid_alive(&self, pid: u32) -> AppResult<bool>;

    /// Run a one-shot helper program on the session's host (not inside the session).
    async fn run_helper(&self, program: &str, args: &[String]) -> AppResult<()>;

    /// Send a command line followed by Enter.
    async fn send(&self, keys: &str) -> AppResult<()> {
        self.send_keys(keys, true, false).await
    }

    /// Interrupt, give the job `grace` to exit, then suspend and kill it.
    async fn kill_running(&self, grace: Duration) -> AppResult<()> {
        self.interrupt().await?;
        tokio::time::sleep(grace).await;
        self.suspend_and_kill().await
    }
}

/// Creates sessions, at most one per `(host, name)`.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Existing session of `(host, name)`, or a new one.
    async fn find_or_create(&self, name: &str, host: Option<&str>) -> AppResult<Arc<dyn Session>>;
}

/// Process-wide uniqueness table shared by the providers.
pub struct SessionRegistry<S: ?Sized> {
    sessions: Mutex<HashMap<(Option<String>, String), Arc<S>>>,
}

impl<S: ?Sized> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: ?Sized> SessionRegistry<S> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered session, if any.
    pub fn get(&self, name: &str, host: Option<&str>) -> Option<Arc<S>> {
        self.sessions
            .lock()
            .get(&(host.map(str::to_string), name.to_string()))
            .cloned()
    }

    /// Return the registered session, or register the one built by `make`.
    pub fn get_or_insert_with(
        &self,
        name: &str,
        host: Option<&str>,
        make: impl FnOnce() -> Arc<S>,
    ) -> Arc<S> {
        self.sessions
            .lock()
            .entry((host.map(str::to_string), name.to_string()))
            .or_insert_with(make)
            .clone()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Human label for logs: `name` or `host:name`.
pub fn session_label(session: &dyn Session) -> String {
    match session.host() {
        Some(host) => format!("{host}:{}", session.name()),
        None => session.name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_unique_per_host_and_name() {
        let registry: SessionRegistry<String> = SessionRegistry::new();
        let a = registry.get_or_insert_with("cam_fgrab", None, || Arc::new("a".into()));
        let b = registry.get_or_insert_with("cam_fgrab", None, || Arc::new("b".into()));
        let c = registry.get_or_insert_with("cam_fgrab", Some("rtc"), || Arc::new("c".into()));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("cam_fgrab", Some("other")).is_none());
    }
}
