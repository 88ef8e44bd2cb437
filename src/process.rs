//! Data structures for tracking process state.
//!
//! This module defines how a child's command line is built (`shell_command`),
//! its exit state (`ExitState`), and the cloneable `ProcessHandle` through which
//! callers request a stop and await the exit of a managed process.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::watch;

use crate::events::ProcessSignal;
use crate::store::split_env_list;

/// Shell used to interpret every command string.
pub const SHELL: &str = "/bin/sh";

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    /// Process is actively running.
    Running,
    /// Process exited on its own with a status code.
    Exited(i32),
    /// Process was terminated by a signal (`None` when the status was lost).
    Killed(Option<i32>),
}

impl ExitState {
    pub fn is_running(&self) -> bool {
        matches!(self, ExitState::Running)
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited(0))
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitState::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitState::Killed(status.signal())
        }
        #[cfg(not(unix))]
        {
            ExitState::Killed(None)
        }
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitState::Running => write!(f, "running"),
            ExitState::Exited(code) => write!(f, "exited with code {}", code),
            ExitState::Killed(Some(signal)) => write!(f, "killed by signal {}", signal),
            ExitState::Killed(None) => write!(f, "killed"),
        }
    }
}

/// Shared view of one spawned process.
///
/// The registry in `ProcessManager` owns one handle per name; lookups hand out
/// clones, which stay valid after the registration is replaced or removed.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    state: watch::Receiver<ExitState>,
    reaped: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub(crate) fn new(
        name: String,
        pid: Option<u32>,
        state: watch::Receiver<ExitState>,
        reaped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            pid,
            state,
            reaped,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ExitState {
        self.state.borrow().clone()
    }

    /// Whether the OS process has been waited on.
    ///
    /// This can be true while `state` is still `Running`: the exit state is
    /// only published once both output streams are drained, and a background
    /// grandchild may hold them open.
    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// Sends `signal` to the process group unless the process already exited.
    ///
    /// A reaped pid may already belong to another process, so it is never
    /// signalled.
    pub fn request_stop(&self, signal: ProcessSignal) -> io::Result<()> {
        if self.is_reaped() || !self.state().is_running() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match send_os_signal(pid, signal) {
            // The process exited between the state check and the signal.
            Err(err) if err.raw_os_error() == Some(esrch()) => Ok(()),
            other => other,
        }
    }

    /// Resolves once the process has exited and both output streams drained.
    pub async fn await_exit(&self) -> ExitState {
        let mut state = self.state.clone();
        let result = state.wait_for(|state| !state.is_running()).await;
        match result {
            Ok(state) => state.clone(),
            Err(_) => ExitState::Killed(None),
        }
    }
}

/// Builds `sh -c <command>` in `dir`, with piped output and its own process group.
///
/// A non-empty `env` replaces the inherited environment entirely; an empty
/// one leaves the child with the supervisor's environment.
pub fn shell_command(command: &str, dir: &Path, env: &[String]) -> Command {
    let mut cmd = Command::new(SHELL);
    cmd.arg("-c").arg(command).current_dir(dir);
    if !env.is_empty() {
        cmd.env_clear();
        cmd.envs(split_env_list(env));
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

#[cfg(unix)]
fn esrch() -> i32 {
    libc::ESRCH
}

#[cfg(not(unix))]
fn esrch() -> i32 {
    3
}

/// Delivers `signal` to the process group led by `pid`, falling back to the
/// process itself.
#[cfg(unix)]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) -> io::Result<()> {
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
    };
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory safety requirements.
    if unsafe { libc::kill(-pid, sig) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

#[cfg(not(unix))]
pub fn send_os_signal(_pid: u32, signal: ProcessSignal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot deliver {} on this platform", signal.name()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_command_uses_only_the_given_environment() {
        let dir = std::env::temp_dir();
        let output = shell_command(
            "echo \"$ONLY_VAR:$HOME\"",
            &dir,
            &["ONLY_VAR=set".to_string()],
        )
        .output()
        .await
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "set:");
    }

    #[tokio::test]
    async fn exit_state_reflects_status_codes() {
        let dir = std::env::temp_dir();
        let status = shell_command("exit 3", &dir, &[]).status().await.unwrap();
        assert_eq!(ExitState::from(status), ExitState::Exited(3));
        assert!(!ExitState::from(status).success());

        let status = shell_command("true", &dir, &[]).status().await.unwrap();
        assert!(ExitState::from(status).success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signalled_processes_report_killed() {
        let dir = std::env::temp_dir();
        let status = shell_command("kill -TERM $$", &dir, &[])
            .status()
            .await
            .unwrap();
        assert_eq!(ExitState::from(status), ExitState::Killed(Some(libc::SIGTERM)));
    }
}
