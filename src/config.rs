use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_TOOL_ITERATIONS: i64 = 10;
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 600;

/// Process-wide settings, resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub upstream: UpstreamConfig,
    pub max_tool_iterations: i64,
    pub access_token: Option<String>,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub shell_config_path: PathBuf,
    pub workdir: PathBuf,
    pub command_timeout: Duration,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let home = home_dir();
        let listen =
            env_non_empty("TOOLRELAY_LISTEN").unwrap_or_else(|| "127.0.0.1:15333".to_string());
        let metrics_path =
            env_non_empty("TOOLRELAY_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = env_non_empty("TOOLRELAY_DATABASE_DSN")
            .or_else(|| env_non_empty("DATABASE_URL"))
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}",
                    home.join(".local/state/toolrelay/chats.db").display()
                )
            });
        let read_timeout = env_non_empty("TOOLRELAY_UPSTREAM_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
        Self {
            listen,
            metrics_path,
            database_dsn,
            upstream: UpstreamConfig {
                base_url: env_non_empty("OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
                api_key: env_non_empty("OPENAI_API_KEY"),
                read_timeout: Duration::from_secs(read_timeout),
            },
            max_tool_iterations: parse_max_tool_iterations(
                std::env::var("TOOLRELAY_MAX_TOOL_ITERATIONS").ok().as_deref(),
            ),
            access_token: env_non_empty("TOOLRELAY_ACCESS_TOKEN"),
            tools: ToolsConfig {
                shell_config_path: env_non_empty("TOOLRELAY_SHELL_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| home.join(".config/illogical-impulse/config.json")),
                workdir: env_non_empty("TOOLRELAY_TOOL_WORKDIR")
                    .map(PathBuf::from)
                    .unwrap_or(home),
                command_timeout: Duration::from_secs(60),
            },
        }
    }
}

/// Only strictly positive integers override the default budget.
pub fn parse_max_tool_iterations(raw: Option<&str>) -> i64 {
    raw.map(str::trim)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS)
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn home_dir() -> PathBuf {
    env_non_empty("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_MAX_TOOL_ITERATIONS, parse_max_tool_iterations};

    #[test]
    fn max_tool_iterations_ignores_non_positive_and_garbage() {
        assert_eq!(parse_max_tool_iterations(None), DEFAULT_MAX_TOOL_ITERATIONS);
        assert_eq!(parse_max_tool_iterations(Some("")), DEFAULT_MAX_TOOL_ITERATIONS);
        assert_eq!(parse_max_tool_iterations(Some("0")), DEFAULT_MAX_TOOL_ITERATIONS);
        assert_eq!(parse_max_tool_iterations(Some("-3")), DEFAULT_MAX_TOOL_ITERATIONS);
        assert_eq!(parse_max_tool_iterations(Some("abc")), DEFAULT_MAX_TOOL_ITERATIONS);
        assert_eq!(parse_max_tool_iterations(Some(" 25 ")), 25);
    }
}
