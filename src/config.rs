//! Configuration management for envrack.
//!
//! This module defines the directives of an `xe.yml` file and loads them from
//! YAML or JSON. Each directive object names exactly one action; the raw
//! objects are validated into the closed `Directive` enum at load time.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_yaml::Value;

/// Ordered `KEY: value` pairs from one `env` mapping.
pub type EnvPairs = Vec<(String, String)>;

/// One declarative instruction, processed in file order.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Start a long-running process next to the primary command.
    Service(CommandSpec),
    /// Set literal or backtick-computed values.
    Env(Vec<EnvPairs>),
    /// Run a command printing YAML/JSON and flatten it into the environment.
    EnvScript(String),
    /// Run a command to completion before continuing.
    Task(CommandSpec),
    /// Render a template file with the environment.
    Template(TemplateSpec),
    /// Directives deferred until the primary command finished.
    Post(Vec<Directive>),
}

impl Directive {
    /// Whether the directive only computes data (kept in data-only walks).
    pub fn is_data(&self) -> bool {
        matches!(self, Directive::Env(_) | Directive::EnvScript(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Directive::Service(_) => "service",
            Directive::Env(_) => "env",
            Directive::EnvScript(_) => "envscript",
            Directive::Task(_) => "task",
            Directive::Template(_) => "template",
            Directive::Post(_) => "post",
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Service(spec) | Directive::Task(spec) => {
                write!(f, "{} {:?}", self.kind(), spec.name)
            }
            Directive::Template(spec) => write!(f, "template {:?}", spec.target),
            _ => f.write_str(self.kind()),
        }
    }
}

/// A named shell command for `service` and `task` directives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    /// Name used to prefix the command's output.
    pub name: String,
    /// Command line, run through `sh -c`.
    pub cmd: String,
    /// Working directory, relative to the config directory.
    #[serde(default)]
    pub dir: Option<String>,
}

/// Settings for a `template` directive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateSpec {
    /// Template source file.
    pub template: String,
    /// Rendered output file.
    pub target: String,
    /// Owning user name.
    #[serde(default)]
    pub owner: Option<String>,
    /// Owning group name.
    #[serde(default)]
    pub group: Option<String>,
    /// Octal file mode such as "0644".
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDirective {
    service: Option<CommandSpec>,
    env: Option<Value>,
    envscript: Option<String>,
    task: Option<CommandSpec>,
    template: Option<TemplateSpec>,
    post: Option<Vec<RawDirective>>,
}

impl RawDirective {
    fn into_directive(self, position: &str) -> Result<Directive> {
        let present: Vec<&str> = [
            ("service", self.service.is_some()),
            ("env", self.env.is_some()),
            ("envscript", self.envscript.is_some()),
            ("task", self.task.is_some()),
            ("template", self.template.is_some()),
            ("post", self.post.is_some()),
        ]
        .into_iter()
        .filter(|(_, set)| *set)
        .map(|(key, _)| key)
        .collect();
        if present.len() != 1 {
            bail!(
                "directive {} must set exactly one of service, env, envscript, task, template, post (found {})",
                position,
                if present.is_empty() {
                    "none".to_string()
                } else {
                    present.join(", ")
                }
            );
        }

        if let Some(spec) = self.service {
            return Ok(Directive::Service(spec));
        }
        if let Some(env) = self.env {
            return Ok(Directive::Env(env_maps(&env, position)?));
        }
        if let Some(script) = self.envscript {
            return Ok(Directive::EnvScript(script));
        }
        if let Some(spec) = self.task {
            return Ok(Directive::Task(spec));
        }
        if let Some(spec) = self.template {
            return Ok(Directive::Template(spec));
        }
        let post = self.post.unwrap_or_default();
        convert_all(post, Some(position)).map(Directive::Post)
    }
}

fn convert_all(raw: Vec<RawDirective>, parent: Option<&str>) -> Result<Vec<Directive>> {
    raw.into_iter()
        .enumerate()
        .map(|(idx, directive)| {
            let position = match parent {
                Some(parent) => format!("{}.{}", parent, idx + 1),
                None => format!("#{}", idx + 1),
            };
            directive.into_directive(&position)
        })
        .collect()
}

// `env` is either one mapping or a list of mappings.
fn env_maps(value: &Value, position: &str) -> Result<Vec<EnvPairs>> {
    match value {
        Value::Mapping(_) => Ok(vec![env_pairs(value, position)?]),
        Value::Sequence(items) => items.iter().map(|item| env_pairs(item, position)).collect(),
        _ => bail!("directive {}: env must be a mapping or a list of mappings", position),
    }
}

fn env_pairs(value: &Value, position: &str) -> Result<EnvPairs> {
    let Value::Mapping(map) = value else {
        bail!("directive {}: env entries must be mappings", position);
    };
    map.iter()
        .map(|(key, value)| {
            let key = scalar(key)
                .with_context(|| format!("directive {}: env keys must be scalars", position))?;
            let value = scalar(value).with_context(|| {
                format!("directive {}: value of {} must be a scalar", position, key)
            })?;
            Ok((key, value))
        })
        .collect()
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Parses directives from YAML or JSON text.
pub fn parse_directives(raw: &str) -> Result<Vec<Directive>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Option<Vec<RawDirective>> =
        serde_yaml::from_str(raw).context("failed to parse directives")?;
    convert_all(raw.unwrap_or_default(), None)
}

/// Loads and parses the directives from a file path.
pub fn load_directives(path: &Path) -> Result<Vec<Directive>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_directives(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

/// Loads a plain list of services, as used by `envrack services`.
pub fn load_services(path: &Path) -> Result<Vec<CommandSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read services file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let services: Option<Vec<CommandSpec>> = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse services file {}", path.display()))?;
    Ok(services.unwrap_or_default())
}

/// Absolute directory of `path`: the path itself for a directory, else its parent.
pub fn abs_dir(path: &Path) -> Result<PathBuf> {
    let abs = std::fs::canonicalize(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    if abs.is_dir() {
        return Ok(abs);
    }
    Ok(abs.parent().map(Path::to_path_buf).unwrap_or(abs))
}

/// Resolves an optional, possibly relative path against `base`.
pub fn resolve(base: &Path, path: Option<&str>) -> PathBuf {
    match path {
        Some(path) if !path.is_empty() => {
            let path = Path::new(path);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        }
        _ => base.to_path_buf(),
    }
}

/// Where directives come from, re-read whenever an environment is rebuilt.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A config file, re-read on each rebuild.
    File(PathBuf),
    /// Directives held in memory, rooted at `dir`.
    Static {
        dir: PathBuf,
        directives: Vec<Directive>,
    },
}

impl ConfigSource {
    /// Base directory for services, tasks, templates and value commands.
    pub fn dir(&self) -> Result<PathBuf> {
        match self {
            ConfigSource::File(path) => abs_dir(path),
            ConfigSource::Static { dir, .. } => Ok(dir.clone()),
        }
    }

    pub fn directives(&self) -> Result<Vec<Directive>> {
        match self {
            ConfigSource::File(path) => load_directives(path),
            ConfigSource::Static { directives, .. } => Ok(directives.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_directive_kind() {
        let raw = r#"
- env:
    BAR: hello
    PORT: 8080
- env:
    - FOO: "`echo world`"
    - DEBUG: true
- envscript: ./print-config.sh
- service:
    name: redis
    cmd: redis-server
- task:
    name: migrate
    cmd: ./migrate.sh
    dir: db
- template:
    template: app.conf.tmpl
    target: /tmp/app.conf
    mode: "0644"
- post:
    - task:
        name: cleanup
        cmd: rm -f /tmp/app.conf
"#;
        let directives = parse_directives(raw).unwrap();
        assert_eq!(directives.len(), 7);
        assert_eq!(
            directives[0],
            Directive::Env(vec![vec![
                ("BAR".to_string(), "hello".to_string()),
                ("PORT".to_string(), "8080".to_string()),
            ]])
        );
        assert_eq!(
            directives[1],
            Directive::Env(vec![
                vec![("FOO".to_string(), "`echo world`".to_string())],
                vec![("DEBUG".to_string(), "true".to_string())],
            ])
        );
        assert_eq!(directives[2], Directive::EnvScript("./print-config.sh".into()));
        assert_eq!(directives[3].kind(), "service");
        match &directives[4] {
            Directive::Task(spec) => assert_eq!(spec.dir.as_deref(), Some("db")),
            other => panic!("expected task, got {other}"),
        }
        match &directives[5] {
            Directive::Template(spec) => {
                assert_eq!(spec.mode.as_deref(), Some("0644"));
                assert_eq!(spec.owner, None);
            }
            other => panic!("expected template, got {other}"),
        }
        match &directives[6] {
            Directive::Post(nested) => assert_eq!(nested[0].kind(), "task"),
            other => panic!("expected post, got {other}"),
        }
    }

    #[test]
    fn parses_json() {
        let raw = r#"[{"env": {"A": "1"}}, {"envscript": "cat vars.json"}]"#;
        let directives = parse_directives(raw).unwrap();
        assert_eq!(directives.len(), 2);
        assert!(directives.iter().all(Directive::is_data));
    }

    #[test]
    fn rejects_directives_with_several_actions() {
        let raw = "- env: {A: '1'}\n  envscript: echo\n";
        let err = parse_directives(raw).unwrap_err().to_string();
        assert!(err.contains("#1"), "{err}");
        assert!(err.contains("env, envscript"), "{err}");
    }

    #[test]
    fn rejects_empty_directives() {
        let err = parse_directives("- post:\n    - {}\n").unwrap_err().to_string();
        assert!(err.contains("#1.1"), "{err}");
        assert!(err.contains("none"), "{err}");
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(parse_directives("- services: {name: a, cmd: b}\n").is_err());
    }

    #[test]
    fn empty_file_has_no_directives() {
        assert!(parse_directives("").unwrap().is_empty());
    }

    #[test]
    fn resolves_relative_paths_against_base() {
        let base = Path::new("/srv/app");
        assert_eq!(resolve(base, None), PathBuf::from("/srv/app"));
        assert_eq!(resolve(base, Some("")), PathBuf::from("/srv/app"));
        assert_eq!(resolve(base, Some("db")), PathBuf::from("/srv/app/db"));
        assert_eq!(resolve(base, Some("/tmp")), PathBuf::from("/tmp"));
    }

    #[test]
    fn abs_dir_of_a_file_is_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("xe.yml");
        std::fs::write(&file, "[]").unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(abs_dir(&file).unwrap(), expected);
        assert_eq!(abs_dir(dir.path()).unwrap(), expected);
    }

    #[test]
    fn loads_service_lists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svcs.yml");
        std::fs::write(&file, "- name: web\n  cmd: python -m http.server\n").unwrap();
        let services = load_services(&file).unwrap();
        assert_eq!(services[0].name, "web");
        assert_eq!(services[0].dir, None);
    }
}
