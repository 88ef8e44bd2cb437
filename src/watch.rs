//! Change detection for the live environment.
//!
//! On a fixed cadence the poller rebuilds the environment from the config
//! source in data-only mode and compares it with the live store. The first
//! difference is reported to the supervision loop as `Event::Restart`; errors
//! while rebuilding are logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigSource;
use crate::environment::Environment;
use crate::events::Event;
use crate::store::{ConfigStore, EnvMap};

/// Spawns the poller for `live`. The task ends after sending one restart event.
///
/// `inherit_env` must match the live environment so value commands see the
/// same environment on both sides of the comparison.
pub fn spawn_poller(
    source: ConfigSource,
    base: Arc<EnvMap>,
    inherit_env: bool,
    live: ConfigStore,
    interval: Duration,
    tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let fresh = match recompute(&source, Arc::clone(&base), inherit_env).await {
                Ok(fresh) => fresh,
                Err(err) => {
                    warn!("error rebuilding config data: {:#}", err);
                    continue;
                }
            };
            let Some(diff) = live.diff(&fresh) else {
                debug!("configuration data unchanged");
                continue;
            };
            let changed: Vec<String> = diff.data().keys().cloned().collect();
            info!(changed = ?changed, "configuration data changed");
            let _ = tx.send(Event::Restart { changed }).await;
            return;
        }
    })
}

/// Builds a fresh store from `source` without side effects.
pub async fn recompute(
    source: &ConfigSource,
    base: Arc<EnvMap>,
    inherit_env: bool,
) -> Result<ConfigStore> {
    let directives = source.directives()?;
    let mut env = Environment::new(source.dir()?, base)
        .data_only(true)
        .inherit_env(inherit_env);
    env.pre(&directives).await?;
    Ok(env.store().clone())
}
