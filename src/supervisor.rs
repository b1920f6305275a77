//! Lifecycle of the background worker process.
//!
//! The dashboard runs in its own process and controls a `swatch run`
//! worker. The supervisor owns the [`Child`] handle from spawn time, so
//! status and stop act on exactly the process it started.
//!
//! Stopping asks first: on Unix the worker gets `SIGTERM` and the grace
//! period to close its scheduler and bot. Only a worker still alive after
//! that is killed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::SupervisorError;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code of the last worker that ended on its own.
    pub last_exit_code: Option<i32>,
}

struct Running {
    child: Child,
    started_at: DateTime<Utc>,
}

pub struct WorkerSupervisor {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    last_exit_code: Option<i32>,
}

impl State {
    /// Forgets a child that has already exited.
    fn reap(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        match running.child.try_wait() {
            Ok(Some(exit)) => {
                tracing::info!(code = ?exit.code(), "worker exited");
                self.last_exit_code = exit.code();
                self.running = None;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cannot poll worker"),
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.running.is_some(),
            pid: self.running.as_ref().and_then(|r| r.child.id()),
            started_at: self.running.as_ref().map(|r| r.started_at),
            last_exit_code: self.last_exit_code,
        }
    }
}

impl WorkerSupervisor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stop_grace: DEFAULT_STOP_GRACE,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Supervises `<current executable> --config <config> run`.
    pub fn for_current_exe(config_path: &Path) -> anyhow::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(
            program,
            vec![
                "--config".to_string(),
                config_path.display().to_string(),
                "run".to_string(),
            ],
        ))
    }

    pub async fn status(&self) -> WorkerStatus {
        let mut state = self.state.lock().await;
        state.reap();
        state.status()
    }

    pub async fn start(&self) -> Result<WorkerStatus, SupervisorError> {
        let mut state = self.state.lock().await;
        state.reap();
        if let Some(running) = &state.running {
            return Err(SupervisorError::AlreadyRunning(
                running.child.id().unwrap_or_default(),
            ));
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        tracing::info!(pid = ?child.id(), program = %self.program.display(), "worker started");
        state.running = Some(Running {
            child,
            started_at: Utc::now(),
        });
        Ok(state.status())
    }

    /// Stops the worker and waits for it. Stopping an idle supervisor is a no-op.
    pub async fn stop(&self) -> Result<WorkerStatus, SupervisorError> {
        let mut state = self.state.lock().await;
        if let Some(mut running) = state.running.take() {
            let pid = running.child.id();
            if terminate(&running.child) {
                match tokio::time::timeout(self.stop_grace, running.child.wait()).await {
                    Ok(Ok(exit)) => {
                        tracing::info!(pid = ?pid, code = ?exit.code(), "worker stopped");
                        state.last_exit_code = exit.code();
                        return Ok(state.status());
                    }
                    Ok(Err(e)) => tracing::warn!(pid = ?pid, error = %e, "cannot wait for worker"),
                    Err(_) => tracing::warn!(
                        pid = ?pid,
                        grace_secs = self.stop_grace.as_secs_f32(),
                        "worker ignored SIGTERM, killing"
                    ),
                }
            }
            running.child.kill().await.map_err(SupervisorError::Stop)?;
            state.last_exit_code = None;
            tracing::info!(pid = ?pid, "worker killed");
        }
        Ok(state.status())
    }

    pub async fn restart(&self) -> Result<WorkerStatus, SupervisorError> {
        self.stop().await?;
        self.start().await
    }
}

/// Sends `SIGTERM`. False when no signal could be delivered.
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers; `pid` is our own unreaped child.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper(secs: &str) -> WorkerSupervisor {
        WorkerSupervisor::new("sleep", vec![secs.to_string()])
    }

    #[tokio::test]
    async fn test_start_stop() {
        let sup = sleeper("30");
        assert!(!sup.status().await.running);

        let status = sup.start().await.unwrap();
        assert!(status.running);
        assert!(status.pid.is_some());
        assert!(sup.status().await.running);

        let status = sup.stop().await.unwrap();
        assert!(!status.running);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_double_start_conflicts() {
        let sup = sleeper("30");
        sup.start().await.unwrap();
        assert!(matches!(
            sup.start().await,
            Err(SupervisorError::AlreadyRunning(_))
        ));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_changes_pid() {
        let sup = sleeper("30");
        let first = sup.start().await.unwrap().pid;
        let second = sup.restart().await.unwrap().pid;
        assert!(second.is_some());
        assert_ne!(first, second);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_worker_reported() {
        let sup = sleeper("0");
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = sup.status().await;
        assert!(!status.running);
        assert_eq!(status.last_exit_code, Some(0));
        // can be started again
        assert!(sup.start().await.unwrap().running);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = WorkerSupervisor::new("/nonexistent/swatch", vec![]);
        assert!(matches!(
            sup.start().await,
            Err(SupervisorError::Spawn { .. })
        ));
        assert!(!sup.status().await.running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_lets_worker_exit_on_sigterm() {
        let sup = WorkerSupervisor::new(
            "sh",
            vec!["-c".to_string(), "trap 'exit 3' TERM; sleep 30 & wait".to_string()],
        );
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = sup.stop().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.last_exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_after_grace() {
        let sup = WorkerSupervisor::new(
            "sh",
            vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
        )
        .with_stop_grace(Duration::from_millis(300));
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        let status = sup.stop().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.last_exit_code, None);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let sup = sleeper("30");
        assert!(!sup.stop().await.unwrap().running);
    }
}
