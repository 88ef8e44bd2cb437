//! The directive orchestrator.
//!
//! An `Environment` walks directives in order, feeding `env`/`envscript`
//! values into its `ConfigStore`, starting services and tasks with the store as
//! their environment, rendering templates and collecting `post` directives
//! for teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::compile::{compile_value, run_script};
use crate::config::{resolve, CommandSpec, Directive, EnvPairs, TemplateSpec};
use crate::runner::{run_task, ProcessManager};
use crate::store::{ConfigStore, EnvMap};
use crate::template;

pub struct Environment {
    manager: Arc<ProcessManager>,
    store: ConfigStore,
    config_dir: PathBuf,
    data_only: bool,
    inherit_env: bool,
    post: Vec<Directive>,
}

impl Environment {
    /// Creates an environment rooted at `config_dir`, falling back to `base`
    /// for values it does not set.
    pub fn new(config_dir: impl Into<PathBuf>, base: Arc<EnvMap>) -> Self {
        Self {
            manager: Arc::new(ProcessManager::new()),
            store: ConfigStore::new(base),
            config_dir: config_dir.into(),
            data_only: false,
            inherit_env: false,
            post: Vec::new(),
        }
    }

    /// Only dispatch `env` and `envscript` directives.
    pub fn data_only(mut self, data_only: bool) -> Self {
        self.data_only = data_only;
        self
    }

    /// Give children the base environment with the store layered on top.
    pub fn inherit_env(mut self, inherit_env: bool) -> Self {
        self.inherit_env = inherit_env;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn manager(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.manager)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Deferred directives collected so far.
    pub fn post_directives(&self) -> &[Directive] {
        &self.post
    }

    /// Environment handed to children: the store's entries, or the overlay on
    /// the base environment when inheriting.
    pub fn child_env(&self) -> Vec<String> {
        if self.inherit_env {
            self.store.overlay()
        } else {
            self.store.to_env_list()
        }
    }

    /// Dispatches every directive in order, stopping at the first failure.
    pub async fn pre(&mut self, directives: &[Directive]) -> Result<()> {
        for (idx, directive) in directives.iter().enumerate() {
            self.dispatch(directive)
                .await
                .with_context(|| format!("directive #{} ({}) failed", idx + 1, directive))?;
        }
        Ok(())
    }

    /// Runs one directive.
    pub async fn dispatch(&mut self, directive: &Directive) -> Result<()> {
        if self.data_only && !directive.is_data() {
            debug!(directive = %directive, "skipping in data-only mode");
            return Ok(());
        }
        debug!(directive = %directive, "dispatching");
        match directive {
            Directive::Service(spec) => self.start_service(spec).await,
            Directive::Env(maps) => self.set_env_maps(maps).await,
            Directive::EnvScript(command) => self.set_env_from_script(command).await,
            Directive::Task(spec) => self.run_task(spec).await,
            Directive::Template(spec) => self.render_template(spec),
            Directive::Post(directives) => {
                self.post.extend(directives.iter().cloned());
                Ok(())
            }
        }
    }

    /// Expands `value` against the store, compiles it and stores it under `key`.
    pub async fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        let expanded = self.store.expand(value);
        let compiled = compile_value(&expanded, &self.config_dir, &self.child_env())
            .await
            .with_context(|| format!("failed to compute {}", key))?;
        self.store.set(key, compiled);
        Ok(())
    }

    async fn set_env_maps(&mut self, maps: &[EnvPairs]) -> Result<()> {
        for pairs in maps {
            for (key, value) in pairs {
                self.set_env(key, value).await?;
            }
        }
        Ok(())
    }

    /// Runs `command`, flattens its output and sets every resulting key.
    pub async fn set_env_from_script(&mut self, command: &str) -> Result<()> {
        let values = run_script(command, &self.config_dir, &self.child_env()).await?;
        for (key, value) in values {
            self.set_env(&key, &value).await?;
        }
        Ok(())
    }

    async fn start_service(&self, spec: &CommandSpec) -> Result<()> {
        let dir = resolve(&self.config_dir, spec.dir.as_deref());
        info!("Starting service {}: {}", spec.name, spec.cmd);
        self.manager
            .start(&spec.name, &spec.cmd, &dir, &self.child_env())
            .await?;
        Ok(())
    }

    async fn run_task(&self, spec: &CommandSpec) -> Result<()> {
        let dir = resolve(&self.config_dir, spec.dir.as_deref());
        run_task(&spec.name, &spec.cmd, &dir, &self.child_env()).await?;
        Ok(())
    }

    fn render_template(&self, spec: &TemplateSpec) -> Result<()> {
        template::render(spec, &self.config_dir, self.store.data())?;
        Ok(())
    }

    /// Stops every service this environment started and waits for them to exit.
    pub async fn stop_services(&self) {
        self.manager.shutdown().await;
    }

    /// Stops services, then runs the deferred directives.
    ///
    /// Deferred directives always run with side effects, even in data-only mode.
    pub async fn post(&mut self) -> Result<()> {
        self.stop_services().await;
        let data_only = std::mem::replace(&mut self.data_only, false);
        let mut idx = 0;
        let result = loop {
            let Some(directive) = self.post.get(idx).cloned() else {
                break Ok(());
            };
            idx += 1;
            if let Err(err) = self
                .dispatch(&directive)
                .await
                .with_context(|| format!("post directive #{} ({}) failed", idx, directive))
            {
                break Err(err);
            }
        };
        self.data_only = data_only;
        result
    }
}
