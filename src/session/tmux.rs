//! tmux-backed sessions, local or tunneled over ssh.
//!
//! Every session is expected to hold a single pane. Remote operations are
//! plain `ssh <host> tmux ...` invocations; keys are wrapped in double quotes
//! for the remote shell, with embedded double quotes escaped.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Session, SessionProvider, SessionRegistry};
use crate::error::{AppResult, CamstackError};

async fn run(program: &str, args: &[String]) -> AppResult<Output> {
    debug!(program, ?args, "exec");
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CamstackError::Session(format!("failed to run {program}: {e}")))
}

fn parse_pids(stdout: &[u8]) -> Vec<u32> {
    String::from_utf8_lossy(stdout)
        .split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect()
}

/// Quote `keys` for the remote shell.
pub fn remote_quote(keys: &str) -> String {
    format!("\"{}\"", keys.replace('"', "\\\""))
}

/// One tmux session.
#[derive(Debug)]
pub struct TmuxSession {
    name: String,
    host: Option<String>,
}

impl TmuxSession {
    /// `tmux <args...>`, through ssh when remote.
    async fn tmux(&self, args: Vec<String>) -> AppResult<Output> {
        match &self.host {
            None => run("tmux", &args).await,
            Some(host) => {
                let mut ssh_args = vec![host.clone(), "tmux".to_string()];
                ssh_args.extend(args);
                run("ssh", &ssh_args).await
            }
        }
    }

    async fn on_host(&self, program: &str, args: &[String]) -> AppResult<Output> {
        match &self.host {
            None => run(program, args).await,
            Some(host) => {
                let mut ssh_args = vec![host.clone(), program.to_string()];
                ssh_args.extend(args.iter().cloned());
                run("ssh", &ssh_args).await
            }
        }
    }

    async fn send_raw(&self, key: &str) -> AppResult<()> {
        self.tmux(vec![
            "send-keys".into(),
            "-t".into(),
            self.name.clone(),
            key.into(),
        ])
        .await?;
        Ok(())
    }

    async fn pane_pid(&self) -> AppResult<Option<u32>> {
        let out = self
            .tmux(vec![
                "list-panes".into(),
                "-t".into(),
                self.name.clone(),
                "-F#{pane_pid}".into(),
            ])
            .await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(parse_pids(&out.stdout).first().copied())
    }
}

#[async_trait]
impl Session for TmuxSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    async fn send_keys(&self, keys: &str, enter: bool, suppress_history: bool) -> AppResult<()> {
        let mut keys = if suppress_history {
            format!(" {keys}")
        } else {
            keys.to_string()
        };
        if self.host.is_some() {
            keys = remote_quote(&keys);
        }
        let mut args = vec!["send-keys".into(), "-t".into(), self.name.clone(), keys];
        if enter {
            args.push("Enter".into());
        }
        let out = self.tmux(args).await?;
        if !out.status.success() {
            return Err(CamstackError::Session(format!(
                "send-keys to {} failed: {}",
                self.name,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn interrupt(&self) -> AppResult<()> {
        self.send_raw("C-c").await?;
        self.send_raw("C-c").await
    }

    async fn suspend_and_kill(&self) -> AppResult<()> {
        self.send_raw("C-z").await?;
        self.send_keys("kill %", true, false).await
    }

    async fn foreground_pid(&self) -> AppResult<Option<u32>> {
        let Some(shell) = self.pane_pid().await? else {
            return Ok(None);
        };
        let children = self.children_of(shell).await?;
        if children.len() > 1 {
            warn!(session = %self.name, ?children, "more than one foreground job");
        }
        Ok(children.first().copied())
    }

    async fn children_of(&self, pid: u32) -> AppResult<Vec<u32>> {
        let out = self
            .on_host("pgrep", &["-P".to_string(), pid.to_string()])
            .await?;
        // pgrep exits 1 when nothing matches
        Ok(parse_pids(&out.stdout))
    }

    async fn is_pid_alive(&self, pid: u32) -> AppResult<bool> {
        match &self.host {
            None => Ok(Path::new(&format!("/proc/{pid}")).exists()),
            Some(_) => {
                let out = self
                    .on_host("kill", &["-0".to_string(), pid.to_string()])
                    .await?;
                Ok(out.status.success())
            }
        }
    }

    async fn run_helper(&self, program: &str, args: &[String]) -> AppResult<()> {
        let out = self.on_host(program, args).await?;
        if !out.status.success() {
            return Err(CamstackError::Session(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// tmux sessions of this process, whichever provider created them.
static TMUX_SESSIONS: Lazy<SessionRegistry<TmuxSession>> = Lazy::new(SessionRegistry::new);

/// Provider of tmux sessions. Every instance shares one registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxProvider;

impl TmuxProvider {
    /// Provider over the process-wide registry.
    pub fn new() -> Self {
        Self
    }

    fn registry(&self) -> &'static SessionRegistry<TmuxSession> {
        &TMUX_SESSIONS
    }
}

#[async_trait]
impl SessionProvider for TmuxProvider {
    async fn find_or_create(&self, name: &str, host: Option<&str>) -> AppResult<Arc<dyn Session>> {
        if let Some(existing) = self.registry().get(name, host) {
            let existing: Arc<dyn Session> = existing;
            return Ok(existing);
        }

        match host {
            None => {
                let has = run("tmux", &["has-session".to_string(), "-t".to_string(), name.to_string()]).await?;
                if !has.status.success() {
                    let out = run(
                        "tmux",
                        &[
                            "new-session".to_string(),
                            "-d".to_string(),
                            "-s".to_string(),
                            name.to_string(),
                        ],
                    )
                    .await?;
                    if !out.status.success() {
                        return Err(CamstackError::Session(format!(
                            "cannot create tmux session {name}: {}",
                            String::from_utf8_lossy(&out.stderr).trim()
                        )));
                    }
                }
            }
            Some(host) => {
                // Fails harmlessly when the session exists
                run(
                    "ssh",
                    &[host.to_string(), format!("tmux new-session -d -s {name}")],
                )
                .await?;
            }
        }

        let session: Arc<dyn Session> = self.registry().get_or_insert_with(name, host, || {
            Arc::new(TmuxSession {
                name: name.to_string(),
                host: host.map(str::to_string),
            })
        });
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_keys_escape_quotes() {
        assert_eq!(remote_quote("echo hi"), "\"echo hi\"");
        assert_eq!(
            remote_quote(r#"python -c "print(1)""#),
            r#""python -c \"print(1)\"""#
        );
    }

    #[test]
    fn providers_share_one_registry() {
        let first = TmuxProvider::new();
        let second = TmuxProvider::new();
        let made = first.registry().get_or_insert_with("camstack_unit_fgrab", Some("rtc"), || {
            Arc::new(TmuxSession {
                name: "camstack_unit_fgrab".into(),
                host: Some("rtc".into()),
            })
        });
        let seen = second
            .registry()
            .get("camstack_unit_fgrab", Some("rtc"))
            .expect("registered through the other provider");
        assert!(Arc::ptr_eq(&made, &seen));
        assert!(second.registry().get("camstack_unit_fgrab", None).is_none());
    }

    #[test]
    fn pid_lists() {
        assert_eq!(parse_pids(b"123\n456\n"), vec![123, 456]);
        assert!(parse_pids(b"").is_empty());
    }

    #[tokio::test]
    async fn local_liveness_uses_proc() {
        let session = TmuxSession {
            name: "unused".into(),
            host: None,
        };
        assert!(session.is_pid_alive(std::process::id()).await.unwrap());
        assert!(!session.is_pid_alive(u32::MAX - 1).await.unwrap());
    }
}
