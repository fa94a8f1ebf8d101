//! Supervision of one encoder process
//!
//! A supervisor task owns the child. It waits for a concurrency permit,
//! spawns the process, forwards stderr to `tracing` and publishes every
//! state change on a watch channel. Completion is observed through
//! `Child::wait`, never by polling.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::encoder::EncodePlan;

/// Lifecycle of an encoder process; only ever moves forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProcessState {
    /// Waiting for a concurrency slot
    Queued,
    Starting,
    Running { pid: Option<u32> },
    /// Exit code, `-1` when terminated by a signal we did not send
    Exited(i32),
    /// Exited with status 0 but left its output missing or empty
    NoOutput,
    Killed,
    LaunchFailed(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Exited(_) | Self::NoOutput | Self::Killed | Self::LaunchFailed(_)
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Why the process did not succeed, for terminal failures
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Exited(0) => None,
            Self::Exited(code) => Some(format!("encoder exited with status {}", code)),
            Self::NoOutput => Some("encoder produced no output".to_string()),
            Self::Killed => Some("encoder was killed".to_string()),
            Self::LaunchFailed(reason) => Some(format!("encoder failed to launch: {}", reason)),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Starting => write!(f, "starting"),
            Self::Running { .. } => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited({})", code),
            Self::NoOutput => write!(f, "no_output"),
            Self::Killed => write!(f, "killed"),
            Self::LaunchFailed(_) => write!(f, "launch_failed"),
        }
    }
}

/// Handle on a supervised encoder process
#[derive(Debug)]
pub struct SupervisedProcess {
    state: watch::Receiver<ProcessState>,
    cancel: CancellationToken,
}

impl SupervisedProcess {
    /// Start supervising `plan`; the process launches once a permit is free
    pub fn spawn(job_id: Uuid, plan: EncodePlan, slots: Arc<Semaphore>) -> Self {
        Self::start(job_id, plan, slots, None)
    }

    /// Like [`spawn`](Self::spawn), but a clean exit only counts as success
    /// when `output` exists and is non-empty
    pub fn spawn_producing(
        job_id: Uuid,
        plan: EncodePlan,
        slots: Arc<Semaphore>,
        output: PathBuf,
    ) -> Self {
        Self::start(job_id, plan, slots, Some(output))
    }

    fn start(
        job_id: Uuid,
        plan: EncodePlan,
        slots: Arc<Semaphore>,
        output: Option<PathBuf>,
    ) -> Self {
        let (tx, rx) = watch::channel(ProcessState::Queued);
        let cancel = CancellationToken::new();

        tokio::spawn(supervise(job_id, plan, output, slots, tx, cancel.clone()));

        Self { state: rx, cancel }
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Ask the supervisor to kill the process (or never start it)
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> ProcessState {
        wait_terminal(self.state.clone()).await
    }

    /// Wait until the process holds a slot or has already ended
    pub async fn wait_started(&self) -> ProcessState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ProcessState::Queued)
            .await
            .map(|s| s.clone());
        reached.unwrap_or_else(|_| state.borrow().clone())
    }
}

/// Resolve once `state` reaches a terminal value
pub async fn wait_terminal(mut state: watch::Receiver<ProcessState>) -> ProcessState {
    let reached = state
        .wait_for(ProcessState::is_terminal)
        .await
        .map(|terminal| terminal.clone());
    match reached {
        Ok(terminal) => terminal,
        // Supervisor gone without a terminal state; report what we last saw
        Err(_) => {
            let last = state.borrow().clone();
            if last.is_terminal() {
                last
            } else {
                ProcessState::LaunchFailed("supervisor stopped unexpectedly".to_string())
            }
        }
    }
}

async fn supervise(
    job_id: Uuid,
    plan: EncodePlan,
    output: Option<PathBuf>,
    slots: Arc<Semaphore>,
    state: watch::Sender<ProcessState>,
    cancel: CancellationToken,
) {
    let permit = tokio::select! {
        permit = slots.acquire_owned() => permit,
        _ = cancel.cancelled() => {
            let _ = state.send(ProcessState::Killed);
            return;
        }
    };
    let permit = match permit {
        Ok(permit) => permit,
        Err(_) => {
            let _ = state.send(ProcessState::LaunchFailed("transcoder is shut down".to_string()));
            return;
        }
    };

    let _ = state.send(ProcessState::Starting);

    let mut command = Command::new(&plan.program);
    command
        .args(&plan.args)
        .envs(plan.envs.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(
                job_id = %job_id,
                program = ?plan.program,
                error = %e,
                "Failed to launch encoder"
            );
            let _ = state.send(ProcessState::LaunchFailed(e.to_string()));
            return;
        }
    };

    let pid = child.id();
    tracing::debug!(job_id = %job_id, pid = ?pid, "Encoder started");
    let _ = state.send(ProcessState::Running { pid });

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "encoder", job_id = %job_id, "{}", line);
            }
        });
    }

    let mut terminal = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessState::Exited(status.code().unwrap_or(-1)),
            Err(e) => ProcessState::LaunchFailed(format!("wait failed: {}", e)),
        },
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to kill encoder");
            }
            ProcessState::Killed
        }
    };

    if terminal.is_success() {
        if let Some(output) = output.as_deref() {
            let written = tokio::fs::metadata(output)
                .await
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if !written {
                terminal = ProcessState::NoOutput;
            }
        }
    }

    match terminal.failure_reason() {
        Some(reason) if terminal != ProcessState::Killed => {
            tracing::warn!(job_id = %job_id, state = %terminal, reason = %reason, "Encoder failed")
        }
        _ => tracing::debug!(job_id = %job_id, state = %terminal, "Encoder finished"),
    }
    // Free the slot before waiters observe the terminal state
    drop(child);
    drop(permit);
    let _ = state.send(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> EncodePlan {
        EncodePlan::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_exit_code_is_published() {
        let slots = Arc::new(Semaphore::new(1));
        let process = SupervisedProcess::spawn(Uuid::new_v4(), sh("exit 3"), slots);

        assert_eq!(process.wait().await, ProcessState::Exited(3));
        assert!(process.has_exited());
        assert_eq!(
            process.state().failure_reason().as_deref(),
            Some("encoder exited with status 3")
        );
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let slots = Arc::new(Semaphore::new(1));
        let process = SupervisedProcess::spawn(Uuid::new_v4(), sh("sleep 30"), slots.clone());

        let mut states = process.subscribe();
        states
            .wait_for(|s| matches!(s, ProcessState::Running { .. }))
            .await
            .unwrap();

        process.kill();
        let terminal = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap();
        assert_eq!(terminal, ProcessState::Killed);
        // Slot is released
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let slots = Arc::new(Semaphore::new(1));
        let plan = EncodePlan::new("/definitely/not/an/encoder");
        let process = SupervisedProcess::spawn(Uuid::new_v4(), plan, slots);

        assert!(matches!(process.wait().await, ProcessState::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_second_process_waits_for_slot() {
        let slots = Arc::new(Semaphore::new(1));
        let first = SupervisedProcess::spawn(Uuid::new_v4(), sh("sleep 30"), slots.clone());
        first
            .subscribe()
            .wait_for(|s| matches!(s, ProcessState::Running { .. }))
            .await
            .unwrap();

        let second = SupervisedProcess::spawn(Uuid::new_v4(), sh("exit 0"), slots.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(second.state(), ProcessState::Queued);

        first.kill();
        assert_eq!(second.wait().await, ProcessState::Exited(0));
    }

    #[tokio::test]
    async fn test_clean_exit_without_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let slots = Arc::new(Semaphore::new(1));
        let process = SupervisedProcess::spawn_producing(
            Uuid::new_v4(),
            sh("exit 0"),
            slots,
            dir.path().join("output.aac"),
        );

        let terminal = process.wait().await;
        assert_eq!(terminal, ProcessState::NoOutput);
        assert!(!terminal.is_success());
        assert_eq!(terminal.failure_reason().as_deref(), Some("encoder produced no output"));
    }

    #[tokio::test]
    async fn test_clean_exit_with_output_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output.aac");
        let script = format!("printf data > '{}'", output.display());
        let process = SupervisedProcess::spawn_producing(
            Uuid::new_v4(),
            sh(&script),
            Arc::new(Semaphore::new(1)),
            output,
        );

        assert_eq!(process.wait().await, ProcessState::Exited(0));
    }

    #[tokio::test]
    async fn test_wait_started_returns_once_slot_is_taken() {
        let slots = Arc::new(Semaphore::new(0));
        let process = SupervisedProcess::spawn(Uuid::new_v4(), sh("sleep 30"), slots.clone());

        let pending = tokio::time::timeout(Duration::from_millis(100), process.wait_started()).await;
        assert!(pending.is_err());

        slots.add_permits(1);
        let started = tokio::time::timeout(Duration::from_secs(5), process.wait_started())
            .await
            .unwrap();
        assert_ne!(started, ProcessState::Queued);
        process.kill();
        process.wait().await;
    }

    #[tokio::test]
    async fn test_kill_while_queued_never_starts() {
        let slots = Arc::new(Semaphore::new(0));
        let process = SupervisedProcess::spawn(Uuid::new_v4(), sh("exit 0"), slots);

        process.kill();
        assert_eq!(process.wait().await, ProcessState::Killed);
    }

    #[test]
    fn test_state_predicates() {
        assert!(!ProcessState::Queued.is_terminal());
        assert!(!ProcessState::Running { pid: None }.is_terminal());
        assert!(ProcessState::Killed.is_terminal());
        assert!(ProcessState::NoOutput.is_terminal());
        assert!(ProcessState::Exited(0).is_success());
        assert!(!ProcessState::Exited(1).is_success());
        assert_eq!(ProcessState::Exited(0).failure_reason(), None);
    }
}
