use crate::config::ToolsConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Result contract shared by every tool: `{success, output, error, ...extra}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "success": self.success }))
    }
}

/// Capability the proxy calls when the model asks for a tool. Unknown names
/// must come back as a failed outcome, never as a panic or transport error.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// OpenAI function-tool definitions advertised to the model.
    fn definitions(&self) -> Vec<Value>;

    async fn execute(&self, name: &str, args: &Value) -> ToolOutcome;
}

pub struct BuiltinTools {
    shell_config_path: PathBuf,
    workdir: PathBuf,
    command_timeout: Duration,
}

impl BuiltinTools {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            shell_config_path: config.shell_config_path.clone(),
            workdir: config.workdir.clone(),
            command_timeout: config.command_timeout,
        }
    }

    async fn run_shell_command(&self, args: &Value) -> ToolOutcome {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty());
        let Some(command) = command else {
            return ToolOutcome::failed("", "Missing required argument: command")
                .with_extra("expected", json!({ "command": "<string, bash command>" }))
                .with_extra("example", json!({ "command": "fastfetch" }));
        };

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.workdir.is_dir() {
            cmd.current_dir(&self.workdir);
        }
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return ToolOutcome::failed("", err.to_string()),
        };
        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return ToolOutcome::failed("", err.to_string()),
            Err(_) => {
                return ToolOutcome::failed(
                    "",
                    format!(
                        "Command timed out after {} seconds",
                        self.command_timeout.as_secs()
                    ),
                );
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        text.push_str(&format!("\n\n[exit code: {code}]"));
        if output.status.success() {
            ToolOutcome::ok(text)
        } else {
            ToolOutcome::failed(text, format!("Command exited with code {code}"))
        }
    }

    async fn get_shell_config(&self) -> ToolOutcome {
        match read_config(&self.shell_config_path).await {
            Ok(config) => match serde_json::to_string_pretty(&config) {
                Ok(text) => ToolOutcome::ok(text),
                Err(err) => ToolOutcome::failed("", err.to_string()),
            },
            Err(ConfigReadError::NotFound) => ToolOutcome::failed("{}", "Config file not found"),
            Err(ConfigReadError::Other(err)) => ToolOutcome::failed("", err),
        }
    }

    async fn set_shell_config(&self, args: &Value) -> ToolOutcome {
        let key = args.get("key").and_then(Value::as_str).filter(|k| !k.is_empty());
        let value = args.get("value").filter(|v| !v.is_null());
        let (Some(key), Some(value)) = (key, value) else {
            return ToolOutcome::failed("", "Missing required arguments: key and value");
        };

        let mut config = match read_config(&self.shell_config_path).await {
            Ok(config) => config,
            Err(ConfigReadError::NotFound) => {
                return ToolOutcome::failed("", "Config file not found");
            }
            Err(ConfigReadError::Other(err)) => return ToolOutcome::failed("", err),
        };
        if let Err(err) = set_dotted(&mut config, key, value.clone()) {
            return ToolOutcome::failed("", err);
        }
        let text = match serde_json::to_string_pretty(&config) {
            Ok(text) => text,
            Err(err) => return ToolOutcome::failed("", err.to_string()),
        };
        if let Err(err) = tokio::fs::write(&self.shell_config_path, text).await {
            return ToolOutcome::failed("", err.to_string());
        }
        let shown = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ToolOutcome::ok(format!("Set {key} = {shown}"))
    }
}

#[async_trait]
impl ToolExecutor for BuiltinTools {
    fn definitions(&self) -> Vec<Value> {
        default_tool_definitions()
    }

    async fn execute(&self, name: &str, args: &Value) -> ToolOutcome {
        let outcome = match name {
            "run_shell_command" => self.run_shell_command(args).await,
            "get_shell_config" => self.get_shell_config().await,
            "set_shell_config" => self.set_shell_config(args).await,
            "switch_to_search_mode" => {
                ToolOutcome::ok("Switched to search mode. Continue with the user's request.")
                    .with_extra("action", json!("switch_mode"))
                    .with_extra("mode", json!("search"))
            }
            other => ToolOutcome::failed("", format!("Unknown tool: {other}")),
        };
        metrics::counter!(
            "toolrelay_tool_calls_total",
            "tool" => name.to_string(),
            "success" => outcome.success.to_string()
        )
        .increment(1);
        outcome
    }
}

pub fn default_tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "run_shell_command",
                "description": "Run a shell command in bash and get its output. Use this for quick commands. The 'command' argument is REQUIRED.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "The bash command to run (REQUIRED)"
                        }
                    },
                    "required": ["command"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_shell_config",
                "description": "Get the desktop shell configuration file contents",
                "parameters": { "type": "object", "properties": {}, "required": [] }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "set_shell_config",
                "description": "Set a field in the desktop shell configuration file. Must use after get_shell_config.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "key": {
                            "type": "string",
                            "description": "The config key path, e.g. 'appearance.theme'"
                        },
                        "value": {
                            "type": "string",
                            "description": "The value to set"
                        }
                    },
                    "required": ["key", "value"]
                }
            }
        }),
    ]
}

enum ConfigReadError {
    NotFound,
    Other(String),
}

async fn read_config(path: &Path) -> Result<Value, ConfigReadError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConfigReadError::NotFound
        } else {
            ConfigReadError::Other(err.to_string())
        }
    })?;
    serde_json::from_str(&text).map_err(|err| ConfigReadError::Other(err.to_string()))
}

/// Walks `a.b.c`, creating intermediate objects as needed.
fn set_dotted(root: &mut Value, key: &str, value: Value) -> Result<(), String> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let last = parts.pop().unwrap_or(key);
    let mut current = root;
    for part in parts {
        let obj = current
            .as_object_mut()
            .ok_or_else(|| format!("'{part}' parent is not an object"))?;
        current = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let obj = current
        .as_object_mut()
        .ok_or_else(|| format!("cannot set '{last}' on a non-object value"))?;
    obj.insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tools_in(dir: &TempDir) -> BuiltinTools {
        BuiltinTools::new(&ToolsConfig {
            shell_config_path: dir.path().join("config.json"),
            workdir: dir.path().to_path_buf(),
            command_timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn set_dotted_creates_intermediate_objects() {
        let mut root = json!({ "appearance": { "theme": "dark" } });
        set_dotted(&mut root, "appearance.theme", json!("light")).unwrap();
        set_dotted(&mut root, "bar.clock.format", json!("24h")).unwrap();
        assert_eq!(root["appearance"]["theme"], "light");
        assert_eq!(root["bar"]["clock"]["format"], "24h");

        let mut scalar = json!({ "a": 1 });
        assert!(set_dotted(&mut scalar, "a.b", json!(2)).is_err());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_outcome() {
        let dir = TempDir::new().unwrap();
        let outcome = tools_in(&dir).execute("nope", &json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Unknown tool: nope"));
        assert_eq!(outcome.to_value()["error"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn shell_command_reports_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let tools = tools_in(&dir);
        let outcome = tools
            .execute("run_shell_command", &json!({ "command": "echo hi" }))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "hi\n\n\n[exit code: 0]");
        assert!(outcome.error.is_none());

        let outcome = tools
            .execute("run_shell_command", &json!({ "command": "echo oops >&2; exit 3" }))
            .await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("[stderr]\noops"));
        assert!(outcome.output.ends_with("[exit code: 3]"));
        assert_eq!(outcome.error.as_deref(), Some("Command exited with code 3"));
    }

    #[tokio::test]
    async fn shell_command_requires_command_argument() {
        let dir = TempDir::new().unwrap();
        let outcome = tools_in(&dir).execute("run_shell_command", &json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.extra["example"]["command"], "fastfetch");
    }

    #[tokio::test]
    async fn shell_config_get_and_set() {
        let dir = TempDir::new().unwrap();
        let tools = tools_in(&dir);

        let missing = tools.execute("get_shell_config", &json!({})).await;
        assert!(!missing.success);
        assert_eq!(missing.output, "{}");

        std::fs::write(dir.path().join("config.json"), r#"{"appearance":{"theme":"dark"}}"#)
            .unwrap();
        let set = tools
            .execute(
                "set_shell_config",
                &json!({ "key": "appearance.theme", "value": "light" }),
            )
            .await;
        assert!(set.success);
        assert_eq!(set.output, "Set appearance.theme = light");

        let got = tools.execute("get_shell_config", &json!({})).await;
        assert!(got.success);
        let parsed: Value = serde_json::from_str(&got.output).unwrap();
        assert_eq!(parsed["appearance"]["theme"], "light");
    }

    #[tokio::test]
    async fn search_mode_switch_carries_extra_fields() {
        let dir = TempDir::new().unwrap();
        let outcome = tools_in(&dir)
            .execute("switch_to_search_mode", &json!({}))
            .await;
        let value = outcome.to_value();
        assert_eq!(value["action"], "switch_mode");
        assert_eq!(value["mode"], "search");
        assert_eq!(value["error"], Value::Null);
    }
}
