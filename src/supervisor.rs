//! The supervision loop around the primary command.
//!
//! `Supervisor::run` builds the environment, starts the primary command and
//! then waits for whichever comes first: the command exiting, or the poller
//! reporting that the environment drifted. Drift stops the command, rebuilds
//! everything from scratch and starts it again. Deferred `post` directives run
//! once the loop is over, whatever its result.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{resolve, CommandSpec, ConfigSource};
use crate::environment::Environment;
use crate::events::{Event, ProcessSignal};
use crate::process::{ExitState, ProcessHandle};
use crate::runner::{ProcessError, ProcessManager};
use crate::store::{ConfigStore, EnvMap};
use crate::watch::spawn_poller;

/// Default cadence of the config poller.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Run settings shared by every rebuild of the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub inherit_env: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            inherit_env: false,
        }
    }
}

enum Outcome {
    Exited(ExitState),
    Restart,
}

pub struct Supervisor {
    source: ConfigSource,
    command: Vec<String>,
    base: Arc<EnvMap>,
    settings: Settings,
}

impl Supervisor {
    pub fn new(
        source: ConfigSource,
        command: Vec<String>,
        base: Arc<EnvMap>,
        settings: Settings,
    ) -> Self {
        Self {
            source,
            command,
            base,
            settings,
        }
    }

    fn environment(&self) -> Result<Environment> {
        Ok(Environment::new(self.source.dir()?, Arc::clone(&self.base))
            .inherit_env(self.settings.inherit_env))
    }

    /// Supervises the primary command until it exits, then runs `post`.
    ///
    /// Host SIGINT/SIGTERM are handled for the whole run. Errors from `post` are
    /// logged and never replace the loop's result.
    pub async fn run(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel(4);
        let listener = spawn_signal_listener(tx);
        let result = self.run_with_signals(rx).await;
        listener.abort();
        result
    }

    /// Same as [`Supervisor::run`], reading host signals from `signals`.
    ///
    /// A signal during setup is forwarded to the services started so far and
    /// aborts the walk. While the primary command runs it is forwarded to
    /// every managed process. During `post` it stops the remaining directives.
    pub async fn run_with_signals(&self, mut signals: mpsc::Receiver<ProcessSignal>) -> Result<()> {
        let mut env = self.environment()?;
        let result = self.supervise(&mut env, &mut signals).await;
        info!("running post now");
        let post = tokio::select! {
            result = env.post() => result,
            Some(signal) = signals.recv() => Err(anyhow!("post interrupted by {}", signal.name())),
        };
        if let Err(err) = post {
            warn!("error running post: {:#}", err);
        }
        result
    }

    async fn supervise(
        &self,
        env: &mut Environment,
        signals: &mut mpsc::Receiver<ProcessSignal>,
    ) -> Result<()> {
        loop {
            self.pre(env, signals).await?;
            if self.command.is_empty() {
                return Ok(());
            }
            match self.run_primary(env, signals).await? {
                Outcome::Exited(state) if state.success() => return Ok(()),
                Outcome::Exited(state) => {
                    return Err(ProcessError::Failed {
                        name: primary_name(&self.command),
                        state,
                    }
                    .into())
                }
                Outcome::Restart => {
                    env.stop_services().await;
                    *env = self.environment()?;
                }
            }
        }
    }

    // Dropping the walk on a signal also stops a task it was waiting on.
    async fn pre(
        &self,
        env: &mut Environment,
        signals: &mut mpsc::Receiver<ProcessSignal>,
    ) -> Result<()> {
        let directives = self.source.directives()?;
        let manager = env.manager();
        tokio::select! {
            result = env.pre(&directives) => result,
            Some(signal) = signals.recv() => {
                info!("received {} during setup, stopping", signal.name());
                manager.forward_signal(signal).await;
                bail!("setup interrupted by {}", signal.name())
            }
        }
    }

    async fn run_primary(
        &self,
        env: &Environment,
        signals: &mut mpsc::Receiver<ProcessSignal>,
    ) -> Result<Outcome> {
        let name = primary_name(&self.command);
        let command = shell_words::join(&self.command);
        let dir = std::env::current_dir().context("failed to resolve current dir")?;
        info!("Going to start: {}", command);

        let manager = env.manager();
        manager
            .start(&name, &command, &dir, &env.child_env())
            .await?;
        let handle = manager
            .handle(&name)
            .await
            .ok_or_else(|| ProcessError::Unknown(name.clone()))?;

        let (tx, mut events) = mpsc::channel(4);
        let tasks = [
            spawn_poller(
                self.source.clone(),
                Arc::clone(&self.base),
                self.settings.inherit_env,
                env.store().clone(),
                self.settings.poll_interval,
                tx.clone(),
            ),
            spawn_exit_watcher(handle.clone(), tx),
        ];

        let outcome = loop {
            tokio::select! {
                Some(signal) = signals.recv() => {
                    info!("received {}, forwarding to children", signal.name());
                    manager.forward_signal(signal).await;
                }
                event = events.recv() => match event {
                    Some(Event::Restart { changed }) => {
                        info!(changed = ?changed, "configuration data changed. restarting");
                        if let Err(err) = handle.request_stop(ProcessSignal::SigTerm) {
                            warn!(error = %err, "unable to stop {}", name);
                        }
                        handle.await_exit().await;
                        break Outcome::Restart;
                    }
                    Some(Event::ProcessExited { state }) => {
                        if !state.success() {
                            warn!("{} {}", name, state);
                        }
                        break Outcome::Exited(state);
                    }
                    None => break Outcome::Exited(handle.await_exit().await),
                },
            }
        };
        for task in tasks {
            task.abort();
        }
        Ok(outcome)
    }
}

/// Name the primary command's output is prefixed with: its program's file name.
pub fn primary_name(command: &[String]) -> String {
    command
        .first()
        .and_then(|program| Path::new(program).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string())
}

fn spawn_exit_watcher(handle: ProcessHandle, tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let state = handle.await_exit().await;
        let _ = tx.send(Event::ProcessExited { state }).await;
    })
}

// Handlers are registered before returning so no signal falls back to the
// default disposition once this has been called.
fn spawn_signal_listener(tx: mpsc::Sender<ProcessSignal>) -> JoinHandle<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let streams = signal(SignalKind::interrupt())
            .and_then(|sigint| Ok((sigint, signal(SignalKind::terminate())?)));
        tokio::spawn(async move {
            let (mut sigint, mut sigterm) = match streams {
                Ok(streams) => streams,
                Err(err) => {
                    warn!(error = %err, "failed to install signal handlers");
                    return;
                }
            };
            loop {
                let signal = tokio::select! {
                    Some(()) = sigint.recv() => ProcessSignal::SigInt,
                    Some(()) = sigterm.recv() => ProcessSignal::SigTerm,
                    else => return,
                };
                if tx.send(signal).await.is_err() {
                    return;
                }
            }
        })
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(ProcessSignal::SigInt).await.is_err() {
                    return;
                }
            }
        })
    }
}

/// Runs a plain list of services until all of them exit.
///
/// Services get the supervisor's own environment. Host signals are forwarded
/// to every service and waiting continues until they are gone.
pub async fn serve(services: &[CommandSpec], dir: &Path) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(4);
    let listener = spawn_signal_listener(tx);
    let manager = ProcessManager::new();
    let env = ConfigStore::from_process_env().overlay();
    for service in services {
        info!("Starting: {} {}", service.name, service.cmd);
        let service_dir: PathBuf = resolve(dir, service.dir.as_deref());
        if let Err(err) = manager
            .start(&service.name, &service.cmd, &service_dir, &env)
            .await
        {
            warn!(error = %err, "failed to start {}", service.name);
        }
    }

    let wait = manager.wait_all();
    tokio::pin!(wait);
    loop {
        tokio::select! {
            _ = &mut wait => break,
            Some(signal) = rx.recv() => {
                info!("received {}, stopping services", signal.name());
                manager.forward_signal(signal).await;
            }
        }
    }
    listener.abort();
    Ok(())
}
