use crate::auth::AccessGuard;
use crate::config::RuntimeConfig;
use crate::error::{AppError, AppResult};
use crate::store::{ChatStore, ensure_sqlite_file, is_memory_dsn};
use crate::tools::{BuiltinTools, ToolExecutor};
use crate::upstream::UpstreamClient;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub upstream: UpstreamClient,
    pub tools: Arc<dyn ToolExecutor>,
    pub store: ChatStore,
    pub metrics: PrometheusHandle,
    pub access: AccessGuard,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let tools: Arc<dyn ToolExecutor> = Arc::new(BuiltinTools::new(&runtime.tools));
    load_state_with_tools(runtime, tools).await
}

/// Like [`load_state_with_runtime`] with a caller-supplied tool executor.
pub async fn load_state_with_tools(
    runtime: RuntimeConfig,
    tools: Arc<dyn ToolExecutor>,
) -> AppResult<AppState> {
    let upstream = UpstreamClient::new(&runtime.upstream)
        .map_err(|err| AppError::startup("http_client_init_failed", err))?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| AppError::startup("database_init_failed", err))?;

    // Every in-memory connection is its own database, so it gets exactly one.
    let max_connections = if is_memory_dsn(&runtime.database_dsn) {
        1
    } else {
        5
    };
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| AppError::startup("database_dsn_parse_failed", err.to_string()))?
                .foreign_keys(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| AppError::startup("database_init_failed", err.to_string()))?;

    let store = ChatStore::new(pool)
        .await
        .map_err(|err| AppError::startup("chat_store_init_failed", err))?;

    let metrics = init_metrics()?;

    tracing::info!(
        upstream = %runtime.upstream.base_url,
        has_api_key = runtime.upstream.api_key.is_some(),
        max_tool_iterations = runtime.max_tool_iterations,
        "state loaded"
    );

    Ok(AppState {
        access: AccessGuard::new(runtime.access_token.clone()),
        runtime: Arc::new(runtime),
        upstream,
        tools,
        store,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::startup("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::startup("metrics_init_failed", "metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router();
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(crate::handlers::health))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(
            "/v1/tools",
            get(crate::handlers::list_tools).post(crate::handlers::execute_tool),
        )
        .route("/v1/tools/definitions", get(crate::handlers::list_tools))
        .route(
            "/v1/chats",
            get(crate::chat_handlers::list_chats).post(crate::chat_handlers::create_chat),
        )
        .route(
            "/v1/chats/{id}",
            get(crate::chat_handlers::get_chat)
                .put(crate::chat_handlers::update_chat)
                .delete(crate::chat_handlers::delete_chat),
        )
        .route(
            "/v1/messages/{id}",
            get(crate::chat_handlers::list_messages)
                .post(crate::chat_handlers::add_message)
                .put(crate::chat_handlers::update_message)
                .delete(crate::chat_handlers::delete_message),
        )
        .route("/v1/clear/{id}", post(crate::chat_handlers::clear_chat))
        .route("/v1/current", get(crate::chat_handlers::current_chat))
}
