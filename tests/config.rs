use std::time::Duration;
use tempfile::TempDir;
use toolrelay::config::{RuntimeConfig, ToolsConfig, UpstreamConfig};

fn test_runtime(database_dsn: String, temp_dir: &TempDir) -> RuntimeConfig {
    RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn,
        upstream: UpstreamConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: None,
            read_timeout: Duration::from_secs(5),
        },
        max_tool_iterations: 10,
        access_token: None,
        tools: ToolsConfig {
            shell_config_path: temp_dir.path().join("config.json"),
            workdir: temp_dir.path().to_path_buf(),
            command_timeout: Duration::from_secs(5),
        },
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("state").join("toolrelay").join("chats.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()), &temp_dir);
    let state = toolrelay::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
    assert!(state.store.list_chats().await.expect("list chats").is_empty());
    assert!(!state.upstream.health().has_api_key);
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let temp_dir = TempDir::new().expect("temp dir");
    let runtime = test_runtime("sqlite::memory:".to_string(), &temp_dir);
    let state = toolrelay::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    let chat = state.store.create_chat("scratch").await.expect("create chat");
    let listed = state.store.list_chats().await.expect("list chats");
    assert_eq!(listed, vec![chat]);
}

#[tokio::test]
async fn builtin_tools_are_advertised_by_default() {
    let temp_dir = TempDir::new().expect("temp dir");
    let runtime = test_runtime("sqlite::memory:".to_string(), &temp_dir);
    let state = toolrelay::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    let names: Vec<String> = state
        .tools
        .definitions()
        .iter()
        .filter_map(|d| d["function"]["name"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        names,
        vec!["run_shell_command", "get_shell_config", "set_shell_config"]
    );
}
