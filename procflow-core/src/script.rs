//! External script execution for `scriptTask` activities.
//!
//! The engine never interprets script code itself; it hands the body to a
//! sandboxed interpreter process with the instance variables as environment
//! and reads back exit status, stdout, and stderr.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use tokio::process::Command;

#[derive(Clone, Debug)]
pub struct ScriptOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, code: &str, env: &HashMap<String, String>) -> Result<ScriptOutcome>;
}

/// Runs script bodies through an external interpreter subprocess.
pub struct ProcessScriptRunner {
    interpreter: String,
}

impl ProcessScriptRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for ProcessScriptRunner {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(&self, code: &str, env: &HashMap<String, String>) -> Result<ScriptOutcome> {
        let mut file = tempfile::Builder::new()
            .suffix(".py")
            .tempfile()
            .context("failed to create script tempfile")?;
        file.write_all(code.as_bytes())
            .context("failed to write script body")?;
        let path = file.path().to_path_buf();

        let output = Command::new(&self.interpreter)
            .arg(&path)
            .envs(env)
            .output()
            .await
            .with_context(|| format!("failed to spawn interpreter '{}'", self.interpreter))?;

        Ok(ScriptOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Flatten instance variables into environment strings: lists join with
/// commas, objects serialize to JSON, nulls are skipped.
pub fn variables_as_env(variables: &[crate::types::VariableEntry]) -> HashMap<String, String> {
    use serde_json::Value;
    let mut env = HashMap::new();
    for variable in variables {
        let rendered = match &variable.value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            Value::Object(_) => variable.value.to_string(),
            other => other.to_string(),
        };
        env.insert(variable.key.clone(), rendered);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableEntry;
    use serde_json::json;

    #[test]
    fn variables_flatten_for_the_environment() {
        let vars = vec![
            VariableEntry {
                key: "name".into(),
                name: None,
                value: json!("laptop"),
            },
            VariableEntry {
                key: "tags".into(),
                name: None,
                value: json!(["a", "b"]),
            },
            VariableEntry {
                key: "form".into(),
                name: None,
                value: json!({"qty": 2}),
            },
            VariableEntry {
                key: "missing".into(),
                name: None,
                value: json!(null),
            },
        ];
        let env = variables_as_env(&vars);
        assert_eq!(env.get("name").map(String::as_str), Some("laptop"));
        assert_eq!(env.get("tags").map(String::as_str), Some("a, b"));
        assert_eq!(env.get("form").map(String::as_str), Some(r#"{"qty":2}"#));
        assert!(!env.contains_key("missing"));
    }
}
