//! Process execution and management.
//!
//! This module contains the `ProcessManager`, which spawns named child
//! processes, streams their output through line handlers, and signals and
//! reaps them. A reaper task owns each `Child`; callers only ever see a
//! `ProcessHandle`, which reports "exited" once both output streams drained.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::ProcessSignal;
use crate::output::{prefixed, read_lines, LineHandler, StreamKind};
use crate::process::{shell_command, ExitState, ProcessHandle};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no managed process named {0}")]
    Unknown(String),
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} {state}")]
    Failed { name: String, state: ExitState },
    #[error("failed to send {} to {name}: {source}", .signal.name())]
    Signal {
        name: String,
        signal: ProcessSignal,
        #[source]
        source: std::io::Error,
    },
}

/// Output handlers for one process.
#[derive(Clone)]
pub struct Handlers {
    pub stdout: LineHandler,
    pub stderr: LineHandler,
}

impl Handlers {
    /// Both streams echoed as `"<name> | <line>"`.
    pub fn prefixed(name: &str) -> Self {
        let handler = prefixed(name);
        Self {
            stdout: handler.clone(),
            stderr: handler,
        }
    }
}

/// Manages the lifecycle and I/O of named child processes.
#[derive(Default)]
pub struct ProcessManager {
    processes: Mutex<HashMap<String, ProcessHandle>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `command` under `name` with output echoed as `"<name> | <line>"`.
    pub async fn start(
        &self,
        name: &str,
        command: &str,
        dir: &Path,
        env: &[String],
    ) -> Result<(), ProcessError> {
        self.start_with_handlers(name, command, dir, env, Handlers::prefixed(name))
            .await
    }

    /// Starts `command` under `name`, routing each output line to `handlers`.
    ///
    /// An existing registration under the same name is replaced without being
    /// stopped. On spawn failure nothing is registered.
    pub async fn start_with_handlers(
        &self,
        name: &str,
        command: &str,
        dir: &Path,
        env: &[String],
        handlers: Handlers,
    ) -> Result<(), ProcessError> {
        let mut processes = self.processes.lock().await;
        let handle = spawn(name, command, dir, env, handlers)?;
        debug!(name, pid = ?handle.pid(), "started process");
        processes.insert(name.to_string(), handle);
        Ok(())
    }

    /// A handle to the process registered under `name`.
    pub async fn handle(&self, name: &str) -> Option<ProcessHandle> {
        self.processes.lock().await.get(name).cloned()
    }

    /// Names of every registered process.
    pub async fn names(&self) -> Vec<String> {
        self.processes.lock().await.keys().cloned().collect()
    }

    /// Sends SIGTERM to `name`.
    ///
    /// Unknown names and processes that already exited are not an error, so
    /// repeated calls are always safe.
    pub async fn stop(&self, name: &str) -> Result<(), ProcessError> {
        let Some(handle) = self.handle(name).await else {
            return Ok(());
        };
        request_stop(&handle, ProcessSignal::SigTerm)
    }

    /// Stops `name` and drops its registration.
    ///
    /// The registration is kept when the stop fails.
    pub async fn remove(&self, name: &str) -> Result<(), ProcessError> {
        let mut processes = self.processes.lock().await;
        if let Some(handle) = processes.get(name) {
            request_stop(handle, ProcessSignal::SigTerm)?;
            processes.remove(name);
        }
        Ok(())
    }

    /// Blocks until `name` exits; a non-zero or signalled exit is an error.
    pub async fn wait_for(&self, name: &str) -> Result<(), ProcessError> {
        let handle = self
            .handle(name)
            .await
            .ok_or_else(|| ProcessError::Unknown(name.to_string()))?;
        let state = handle.await_exit().await;
        if state.success() {
            Ok(())
        } else {
            Err(ProcessError::Failed {
                name: name.to_string(),
                state,
            })
        }
    }

    /// Blocks until every registered process has exited.
    pub async fn wait_all(&self) {
        for handle in self.snapshot().await {
            let state = handle.await_exit().await;
            debug!(name = handle.name(), %state, "process finished");
        }
    }

    /// Sends `signal` to every managed process.
    ///
    /// Delivery failures are logged; a process that already exited is skipped.
    pub async fn forward_signal(&self, signal: ProcessSignal) {
        for handle in self.snapshot().await {
            if let Err(err) = request_stop(&handle, signal) {
                warn!(error = %err, "error sending signal");
            }
        }
    }

    /// Stops every managed process and waits for all of them to exit.
    pub async fn shutdown(&self) {
        let handles = self.snapshot().await;
        for handle in &handles {
            if let Err(err) = request_stop(handle, ProcessSignal::SigTerm) {
                warn!(error = %err, "problem stopping process");
            }
        }
        for handle in &handles {
            handle.await_exit().await;
        }
    }

    // Clone the handles so the registry is never held across a wait or a signal.
    async fn snapshot(&self) -> Vec<ProcessHandle> {
        self.processes.lock().await.values().cloned().collect()
    }
}

/// Runs `command` to completion as a one-shot task with prefixed output.
///
/// Tasks are never registered; a non-zero or signalled exit is an error.
/// Dropping the returned future before the task finishes sends it SIGTERM.
pub async fn run_task(
    name: &str,
    command: &str,
    dir: &Path,
    env: &[String],
) -> Result<(), ProcessError> {
    info!("Running task: {}", name);
    let handle = spawn(name, command, dir, env, Handlers::prefixed(name))?;
    let _guard = StopOnDrop(&handle);
    let state = handle.await_exit().await;
    if state.success() {
        Ok(())
    } else {
        Err(ProcessError::Failed {
            name: name.to_string(),
            state,
        })
    }
}

struct StopOnDrop<'a>(&'a ProcessHandle);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(err) = request_stop(self.0, ProcessSignal::SigTerm) {
            warn!(error = %err, "problem stopping abandoned task");
        }
    }
}

fn request_stop(handle: &ProcessHandle, signal: ProcessSignal) -> Result<(), ProcessError> {
    handle
        .request_stop(signal)
        .map_err(|source| ProcessError::Signal {
            name: handle.name().to_string(),
            signal,
            source,
        })
}

// Spawn the child, its two line readers and the reaper that publishes the exit
// state once the child exited and both streams hit EOF.
fn spawn(
    name: &str,
    command: &str,
    dir: &Path,
    env: &[String],
    handlers: Handlers,
) -> Result<ProcessHandle, ProcessError> {
    let mut child = match shell_command(command, dir, env).spawn() {
        Ok(child) => child,
        Err(source) => {
            (handlers.stderr)(StreamKind::Stderr, &format!("failed to start: {}", source));
            return Err(ProcessError::Spawn {
                name: name.to_string(),
                source,
            });
        }
    };
    let pid = child.id();

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(
            stdout,
            StreamKind::Stdout,
            handlers.stdout.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(
            stderr,
            StreamKind::Stderr,
            handlers.stderr.clone(),
        )));
    }

    let (state_tx, state_rx) = watch::channel(ExitState::Running);
    let reaped = Arc::new(AtomicBool::new(false));
    let reaper_reaped = Arc::clone(&reaped);
    let reaper_name = name.to_string();
    tokio::spawn(async move {
        let state = match child.wait().await {
            Ok(status) => ExitState::from(status),
            Err(err) => {
                warn!(name = %reaper_name, error = %err, "failed to wait for process");
                ExitState::Killed(None)
            }
        };
        reaper_reaped.store(true, Ordering::Release);
        for reader in readers {
            let _ = reader.await;
        }
        debug!(name = %reaper_name, %state, "process exited");
        let _ = state_tx.send(state);
    });

    Ok(ProcessHandle::new(name.to_string(), pid, state_rx, reaped))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::output::tests::capture;

    const LIMIT: Duration = Duration::from_secs(10);

    fn captured() -> (Handlers, Arc<std::sync::Mutex<Vec<String>>>) {
        let (handler, lines) = capture();
        (
            Handlers {
                stdout: handler.clone(),
                stderr: handler,
            },
            lines,
        )
    }

    #[tokio::test]
    async fn streams_output_before_reporting_exit() {
        let manager = ProcessManager::new();
        let (handlers, lines) = captured();
        let dir = std::env::temp_dir();
        manager
            .start_with_handlers(
                "echo",
                "echo one; echo two >&2; printf three",
                &dir,
                &[],
                handlers,
            )
            .await
            .unwrap();
        tokio::time::timeout(LIMIT, manager.wait_for("echo"))
            .await
            .unwrap()
            .unwrap();
        let mut lines = lines.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn child_receives_given_environment() {
        let manager = ProcessManager::new();
        let (handlers, lines) = captured();
        let dir = std::env::temp_dir();
        let env = vec!["GREETING=hello".to_string()];
        manager
            .start_with_handlers("env", "echo $GREETING", &dir, &env, handlers)
            .await
            .unwrap();
        manager.wait_for("env").await.unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = ProcessManager::new();
        let dir = std::env::temp_dir();
        assert!(manager.stop("missing").await.is_ok());

        manager.start("sleeper", "sleep 30", &dir, &[]).await.unwrap();
        assert!(manager.stop("sleeper").await.is_ok());
        assert!(manager.stop("sleeper").await.is_ok());
        let err = tokio::time::timeout(LIMIT, manager.wait_for("sleeper"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ProcessError::Failed { .. }));
        assert!(manager.stop("sleeper").await.is_ok());
    }

    #[tokio::test]
    async fn wait_for_reports_unknown_and_failed_processes() {
        let manager = ProcessManager::new();
        let dir = std::env::temp_dir();
        assert!(matches!(
            manager.wait_for("nobody").await,
            Err(ProcessError::Unknown(_))
        ));

        manager.start("fails", "exit 2", &dir, &[]).await.unwrap();
        match manager.wait_for("fails").await {
            Err(ProcessError::Failed { state, .. }) => assert_eq!(state, ExitState::Exited(2)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_not_registered() {
        let manager = ProcessManager::new();
        let (handlers, lines) = captured();
        let missing = std::env::temp_dir().join("envrack-missing-dir-for-test");
        let err = manager
            .start_with_handlers("ghost", "true", &missing, &[], handlers)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(manager.handle("ghost").await.is_none());
        assert!(lines.lock().unwrap()[0].starts_with("failed to start"));
    }

    #[tokio::test]
    async fn forward_signal_reaches_every_process() {
        let manager = ProcessManager::new();
        let dir = std::env::temp_dir();
        manager.start("a", "sleep 30", &dir, &[]).await.unwrap();
        manager.start("b", "sleep 30", &dir, &[]).await.unwrap();
        manager.forward_signal(ProcessSignal::SigInt).await;
        tokio::time::timeout(LIMIT, manager.wait_all()).await.unwrap();
        for name in ["a", "b"] {
            let state = manager.handle(name).await.unwrap().state();
            assert!(!state.is_running(), "{name} still running");
        }
    }

    #[tokio::test]
    async fn remove_drops_the_registration() {
        let manager = ProcessManager::new();
        let dir = std::env::temp_dir();
        manager.start("svc", "sleep 30", &dir, &[]).await.unwrap();
        let handle = manager.handle("svc").await.unwrap();
        manager.remove("svc").await.unwrap();
        assert!(manager.names().await.is_empty());
        let state = tokio::time::timeout(LIMIT, handle.await_exit()).await.unwrap();
        assert!(!state.success());
    }

    #[tokio::test]
    async fn shutdown_waits_for_exits() {
        let manager = ProcessManager::new();
        let dir = std::env::temp_dir();
        manager.start("one", "sleep 30", &dir, &[]).await.unwrap();
        manager.start("two", "true", &dir, &[]).await.unwrap();
        tokio::time::timeout(LIMIT, manager.shutdown()).await.unwrap();
        for name in manager.names().await {
            assert!(!manager.handle(&name).await.unwrap().state().is_running());
        }
    }

    #[tokio::test]
    async fn tasks_fail_on_non_zero_exit() {
        let dir = std::env::temp_dir();
        assert!(run_task("ok", "true", &dir, &[]).await.is_ok());
        let env = vec!["ENV_INJECTED=true".to_string()];
        assert!(run_task("env", "test \"$ENV_INJECTED\" = true", &dir, &env)
            .await
            .is_ok());
        assert!(matches!(
            run_task("bad", "exit 7", &dir, &[]).await,
            Err(ProcessError::Failed {
                state: ExitState::Exited(7),
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_tasks_are_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let task = run_task("slow", "echo $$ > task.pid; exec sleep 30", dir.path(), &[]);
        assert!(tokio::time::timeout(Duration::from_secs(1), task).await.is_err());

        let pid: libc::pid_t = std::fs::read_to_string(dir.path().join("task.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = tokio::time::Instant::now() + LIMIT;
        // SAFETY: signal 0 only checks that the pid exists.
        while unsafe { libc::kill(pid, 0) } == 0 {
            assert!(tokio::time::Instant::now() < deadline, "task {pid} still alive");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaped_process_is_not_signalled_while_output_drains() {
        let manager = ProcessManager::new();
        let (handlers, _lines) = captured();
        let dir = tempfile::tempdir().unwrap();
        // The background subshell keeps stdout open after its parent exits.
        manager
            .start_with_handlers(
                "bg",
                "(sleep 1; touch done) & exit 0",
                dir.path(),
                &[],
                handlers,
            )
            .await
            .unwrap();
        let handle = manager.handle("bg").await.unwrap();
        let deadline = tokio::time::Instant::now() + LIMIT;
        while !handle.is_reaped() {
            assert!(tokio::time::Instant::now() < deadline, "never reaped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.state().is_running());

        manager.stop("bg").await.unwrap();
        let state = tokio::time::timeout(LIMIT, handle.await_exit()).await.unwrap();
        assert_eq!(state, ExitState::Exited(0));
        assert!(dir.path().join("done").exists());
    }
}
