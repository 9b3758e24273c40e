//! Agent subprocess supervisor
//!
//! Launches one agent process per session and drives the session
//! lifecycle from the process's life: running once spawned, then
//! completed, failed, or interrupted when it exits.

use crate::error::{HitlError, Result};
use crate::session::SessionRegistry;
use crate::types::{ConversationEvent, SessionStatus};
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Environment variable carrying the session id into the agent
pub const SESSION_ID_ENV: &str = "A3S_HITL_SESSION_ID";

/// Environment variable carrying the MCP endpoint URL into the agent
pub const GATEWAY_URL_ENV: &str = "A3S_HITL_GATEWAY_URL";

struct RunningAgent {
    pid: u32,
    interrupted: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct Supervisor {
    sessions: SessionRegistry,
    command: String,
    gateway_url: String,
    running: Arc<DashMap<String, RunningAgent>>,
}

impl Supervisor {
    pub fn new(
        sessions: SessionRegistry,
        command: impl Into<String>,
        gateway_url: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            command: command.into(),
            gateway_url: gateway_url.into(),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the agent for a session and return its pid
    ///
    /// The session query is passed as the last argument. Stdout lines
    /// are recorded as assistant messages in the conversation log.
    pub async fn launch(&self, session_id: &str) -> Result<u32> {
        if self.running.contains_key(session_id) {
            return Err(HitlError::Process {
                session_id: session_id.to_string(),
                msg: "agent already running".to_string(),
            });
        }

        let parts = shell_words::split(&self.command)
            .map_err(|e| HitlError::Config(format!("Invalid agent command: {}", e)))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(HitlError::Config("Agent command is empty".to_string()));
        };

        let session = self.sessions.get(session_id).await?;
        if session.status == SessionStatus::Draft {
            self.sessions
                .update_status(session_id, SessionStatus::Starting)
                .await?;
        } else if !session.status.can_transition_to(SessionStatus::Running) {
            return Err(HitlError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Running,
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&session.query)
            .env(SESSION_ID_ENV, session_id)
            .env(GATEWAY_URL_ENV, &self.gateway_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if !session.working_dir.is_empty() {
            cmd.current_dir(&session.working_dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Err(status_err) = self
                    .sessions
                    .update_status(session_id, SessionStatus::Failed)
                    .await
                {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %status_err,
                        "Failed to mark session failed"
                    );
                }
                return Err(HitlError::Process {
                    session_id: session_id.to_string(),
                    msg: e.to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let interrupted = Arc::new(AtomicBool::new(false));
        self.running.insert(
            session_id.to_string(),
            RunningAgent {
                pid,
                interrupted: interrupted.clone(),
            },
        );

        if let Some(stdout) = child.stdout.take() {
            let sessions = self.sessions.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = sessions
                        .record_conversation(ConversationEvent::message(&id, "assistant", line))
                        .await
                    {
                        tracing::warn!(
                            session_id = %id,
                            error = %e,
                            "Failed to record agent output"
                        );
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let id = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %id, "agent: {}", line);
                }
            });
        }

        if let Err(e) = self.sessions.update_status(session_id, SessionStatus::Running).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to mark session running");
        }

        tracing::info!(session_id = %session_id, pid, "Agent launched");

        let sessions = self.sessions.clone();
        let running = self.running.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            let exit = child.wait().await;
            running.remove(&id);

            let next = match &exit {
                _ if interrupted.load(Ordering::SeqCst) => SessionStatus::Interrupted,
                Ok(status) if status.success() => SessionStatus::Completed,
                _ => SessionStatus::Failed,
            };
            match &exit {
                Ok(status) => {
                    tracing::info!(session_id = %id, status = %status, next = %next, "Agent exited")
                }
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to wait for agent"),
            }

            if let Err(e) = sessions.update_status(&id, next).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to record agent exit");
            }
        });

        Ok(pid)
    }

    /// Ask a running agent to stop
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let (pid, interrupted) = match self.running.get(session_id) {
            Some(agent) => (agent.pid, agent.interrupted.clone()),
            None => {
                return Err(HitlError::Process {
                    session_id: session_id.to_string(),
                    msg: "no running agent".to_string(),
                })
            }
        };

        interrupted.store(true, Ordering::SeqCst);
        self.sessions
            .update_status(session_id, SessionStatus::Interrupting)
            .await?;

        send_interrupt(session_id, pid)?;
        tracing::info!(session_id = %session_id, pid, "Interrupt sent to agent");
        Ok(())
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running.contains_key(session_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[cfg(unix)]
fn send_interrupt(session_id: &str, pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(|e| HitlError::Process {
        session_id: session_id.to_string(),
        msg: format!("SIGINT failed: {}", e),
    })
}

#[cfg(not(unix))]
fn send_interrupt(session_id: &str, _pid: u32) -> Result<()> {
    Err(HitlError::Process {
        session_id: session_id.to_string(),
        msg: "interrupt is only supported on unix".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemoryStore::new()), Arc::new(EventBus::default()))
    }

    async fn wait_for_status(sessions: &SessionRegistry, id: &str, status: SessionStatus) {
        for _ in 0..200 {
            if sessions.get(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_unbalanced_quote_is_rejected() {
        let sessions = registry();
        let session = sessions.create_session("q", "", false).await.unwrap();
        let supervisor = Supervisor::new(sessions.clone(), "claude 'oops", "");

        let err = supervisor.launch(&session.id).await.unwrap_err();
        assert!(matches!(err, HitlError::Config(_)));
        // rejected before any status change
        assert_eq!(
            sessions.get(&session.id).await.unwrap().status,
            SessionStatus::Draft
        );
        assert!(!supervisor.is_running(&session.id));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let sessions = registry();
        let session = sessions.create_session("q", "", true).await.unwrap();
        let supervisor = Supervisor::new(sessions, "   ", "");

        let err = supervisor.launch(&session.id).await.unwrap_err();
        assert!(matches!(err, HitlError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_exit_completes_session() {
        let sessions = registry();
        let session = sessions.create_session("hello", "", true).await.unwrap();
        let supervisor = Supervisor::new(sessions.clone(), "echo", "http://127.0.0.1:0/mcp");

        supervisor.launch(&session.id).await.unwrap();
        wait_for_status(&sessions, &session.id, SessionStatus::Completed).await;
        assert!(!supervisor.is_running(&session.id));

        // echo printed the query, which lands in the conversation log
        for _ in 0..100 {
            if !sessions.conversation(&session.id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let log = sessions.conversation(&session.id).await.unwrap();
        assert_eq!(log[0].content, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exit_fails_session() {
        let sessions = registry();
        let session = sessions.create_session("ignored", "", false).await.unwrap();
        let supervisor = Supervisor::new(sessions.clone(), "sh -c 'exit 3'", "");

        supervisor.launch(&session.id).await.unwrap();
        wait_for_status(&sessions, &session.id, SessionStatus::Failed).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt() {
        let sessions = registry();
        let session = sessions.create_session("ignored", "", true).await.unwrap();
        let supervisor = Supervisor::new(sessions.clone(), "sh -c 'exec sleep 30'", "");

        supervisor.launch(&session.id).await.unwrap();
        assert!(supervisor.is_running(&session.id));

        supervisor.interrupt(&session.id).await.unwrap();
        wait_for_status(&sessions, &session.id, SessionStatus::Interrupted).await;
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_session() {
        let sessions = registry();
        let session = sessions.create_session("q", "", true).await.unwrap();
        let supervisor = Supervisor::new(sessions.clone(), "/nonexistent/agent-binary", "");

        let err = supervisor.launch(&session.id).await.unwrap_err();
        assert!(matches!(err, HitlError::Process { .. }));
        assert_eq!(
            sessions.get(&session.id).await.unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_interrupt_without_agent() {
        let supervisor = Supervisor::new(registry(), "echo", "");
        let err = supervisor.interrupt("sess-x").await.unwrap_err();
        assert!(matches!(err, HitlError::Process { .. }));
    }
}
