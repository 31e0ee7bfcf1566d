use crate::app::AppState;
use crate::chat::CompletionRequest;
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::nonstream;
use crate::stream::StreamProcessor;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio::sync::mpsc;

const SSE_CHANNEL_CAPACITY: usize = 64;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.upstream.health())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    if !body.is_object() {
        return Err(AppError::bad_request(
            "invalid_request",
            "JSON must be an object",
        ));
    }
    let req: CompletionRequest = serde_json::from_value(body)
        .map_err(|err| AppError::bad_request("invalid_request", err.to_string()))?;

    if req.is_stream() {
        return Ok(stream_response(&state, req));
    }
    let value = nonstream::complete_with_tools(&state.upstream, state.tools.as_ref(), req).await?;
    Ok(Json(value).into_response())
}

/// Starts the turn loop on its own task; the response body is the receiving
/// end of the event channel.
fn stream_response(state: &AppState, req: CompletionRequest) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(SSE_CHANNEL_CAPACITY);
    let processor = StreamProcessor::new(
        state.upstream.clone(),
        state.tools.clone(),
        state.runtime.max_tool_iterations,
    );
    tokio::spawn(async move {
        processor.run(req, EventSink::new(tx)).await;
    });
    let body = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("close")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(body),
    )
        .into_response()
}

pub async fn list_tools(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    state.access.check(&headers)?;
    Ok(Json(json!({ "tools": state.tools.definitions() })).into_response())
}

/// Runs a tool directly: `{"name": "...", "args": {...}}`.
pub async fn execute_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            AppError::bad_request("invalid_request", "Tool name required").with_param("name")
        })?;
    let args = body
        .get("args")
        .filter(|a| a.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));
    tracing::info!(tool = %name, "direct tool execution");
    let outcome = state.tools.execute(name, &args).await;
    Ok(Json(outcome).into_response())
}
