//! Resolution of dynamic values into literal environment values.
//!
//! A value wrapped in backticks is run as a shell command and replaced by its
//! trimmed output. An `envscript` command prints YAML or JSON, which is
//! flattened into `KEY=VALUE` pairs with underscore-joined, upper-cased keys.

use std::path::Path;
use std::process::Output;

use serde_yaml::Value;
use thiserror::Error;

use crate::process::{shell_command, ExitState};
use crate::store::EnvMap;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` {state}: {stderr}")]
    Failed {
        command: String,
        state: ExitState,
        stderr: String,
    },
    #[error("output of `{command}` is not YAML or JSON: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Runs `raw` as a command when it is wrapped in backticks, otherwise returns it.
///
/// The command runs in `dir` with `env` (see [`shell_command`]) and its stdout is
/// trimmed of surrounding whitespace.
pub async fn compile_value(raw: &str, dir: &Path, env: &[String]) -> Result<String, CompileError> {
    let Some(command) = raw
        .strip_prefix('`')
        .and_then(|rest| rest.strip_suffix('`'))
    else {
        return Ok(raw.to_string());
    };
    let output = capture(command, dir, env).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Runs `command` and flattens its YAML/JSON output.
pub async fn run_script(command: &str, dir: &Path, env: &[String]) -> Result<EnvMap, CompileError> {
    let output = capture(command, dir, env).await?;
    let value: Value =
        serde_yaml::from_slice(&output.stdout).map_err(|source| CompileError::Parse {
            command: command.to_string(),
            source,
        })?;
    Ok(flatten(&value))
}

async fn capture(command: &str, dir: &Path, env: &[String]) -> Result<Output, CompileError> {
    let output = shell_command(command, dir, env)
        .output()
        .await
        .map_err(|source| CompileError::Spawn {
            command: command.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(CompileError::Failed {
            command: command.to_string(),
            state: ExitState::from(output.status),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Flattens a parsed document into an environment map.
///
/// Mappings recurse with the key appended to the path, lists are joined with
/// single spaces into one value, scalars are stored under the joined path.
/// A top-level list is flattened entry by entry, later entries winning.
pub fn flatten(value: &Value) -> EnvMap {
    let mut env = EnvMap::new();
    flatten_into(value, &mut Vec::new(), &mut env);
    env
}

fn flatten_into(value: &Value, prefix: &mut Vec<String>, env: &mut EnvMap) {
    match value {
        Value::Mapping(map) => {
            for (key, value) in map {
                prefix.push(scalar_string(key));
                flatten_into(value, prefix, env);
                prefix.pop();
            }
        }
        Value::Tagged(tagged) => flatten_into(&tagged.value, prefix, env),
        // A document that is a list of mappings merges every entry.
        Value::Sequence(items) if prefix.is_empty() => {
            for item in items {
                flatten_into(item, prefix, env);
            }
        }
        Value::Sequence(items) => {
            let joined = items.iter().map(scalar_string).collect::<Vec<_>>().join(" ");
            store_at(prefix, joined, env);
        }
        scalar => store_at(prefix, scalar_string(scalar), env),
    }
}

fn store_at(prefix: &[String], value: String, env: &mut EnvMap) {
    let key = prefix.join("_").to_uppercase();
    if key.is_empty() {
        return;
    }
    env.insert(key, value);
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Tagged(tagged) => scalar_string(&tagged.value),
        nested => serde_json::to_string(nested).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn backticks_run_a_command() {
        let dir = std::env::temp_dir();
        assert_eq!(compile_value("`echo hi`", &dir, &[]).await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn plain_values_pass_through() {
        let dir = std::env::temp_dir();
        assert_eq!(compile_value("plain", &dir, &[]).await.unwrap(), "plain");
        assert_eq!(compile_value("`", &dir, &[]).await.unwrap(), "`");
        assert_eq!(compile_value("`half", &dir, &[]).await.unwrap(), "`half");
    }

    #[tokio::test]
    async fn commands_see_the_given_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here\n").unwrap();
        let env = vec!["NAME=world".to_string()];
        let value = compile_value("`echo \"$NAME\"; read x < marker.txt; echo $x`", dir.path(), &env)
            .await
            .unwrap();
        assert_eq!(value, "world\nhere");
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let dir = std::env::temp_dir();
        let err = compile_value("`echo oops >&2; exit 4`", &dir, &[])
            .await
            .unwrap_err();
        match err {
            CompileError::Failed { state, stderr, .. } => {
                assert_eq!(state, ExitState::Exited(4));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn flattens_nested_mappings() {
        let env = flatten(&parse("FOO:\n  BAR:\n    BAZ: hello world\n"));
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("FOO_BAR_BAZ").map(String::as_str), Some("hello world"));
    }

    #[test]
    fn joins_lists_into_one_value() {
        let env = flatten(&parse(r#"{"FOO": ["one", "two", "three"]}"#));
        assert_eq!(env.get("FOO").map(String::as_str), Some("one two three"));
    }

    #[test]
    fn upper_cases_keys_and_stringifies_scalars() {
        let env = flatten(&parse("db:\n  port: 5432\n  tls: true\n  host: ~\n"));
        assert_eq!(env.get("DB_PORT").map(String::as_str), Some("5432"));
        assert_eq!(env.get("DB_TLS").map(String::as_str), Some("true"));
        assert_eq!(env.get("DB_HOST").map(String::as_str), Some(""));
    }

    #[test]
    fn merges_a_top_level_list_of_maps() {
        for raw in [
            r#"[{"FOO": "bar"}, {"NESTED": {"KEY": "value"}}, {"FOO": "baz", "LIST": [1, 2]}]"#,
            "- FOO: bar\n- NESTED:\n    KEY: value\n- FOO: baz\n  LIST: [1, 2]\n",
        ] {
            let env = flatten(&parse(raw));
            assert_eq!(env.get("FOO").map(String::as_str), Some("baz"), "{raw}");
            assert_eq!(env.get("NESTED_KEY").map(String::as_str), Some("value"), "{raw}");
            assert_eq!(env.get("LIST").map(String::as_str), Some("1 2"), "{raw}");
            assert_eq!(env.len(), 3, "{raw}");
        }
        assert_eq!(
            flatten(&parse(r#"[{"FOO": "bar"}]"#)).get("FOO").map(String::as_str),
            Some("bar")
        );
    }

    #[test]
    fn top_level_scalar_has_no_key() {
        assert!(flatten(&parse("just text")).is_empty());
    }

    #[tokio::test]
    async fn script_output_is_flattened() {
        let dir = std::env::temp_dir();
        let env = run_script(
            r#"printf '{"app": {"name": "demo", "ports": [80, 443]}}'"#,
            &dir,
            &[],
        )
        .await
        .unwrap();
        assert_eq!(env.get("APP_NAME").map(String::as_str), Some("demo"));
        assert_eq!(env.get("APP_PORTS").map(String::as_str), Some("80 443"));
    }

    #[tokio::test]
    async fn unparsable_script_output_is_an_error() {
        let dir = std::env::temp_dir();
        let err = run_script("echo '{unterminated'", &dir, &[]).await.unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[tokio::test]
    async fn failing_script_is_an_error() {
        let dir = std::env::temp_dir();
        let err = run_script("exit 1", &dir, &[]).await.unwrap_err();
        assert!(matches!(err, CompileError::Failed { .. }));
    }
}
