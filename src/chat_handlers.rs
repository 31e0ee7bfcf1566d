use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::store::{MessageUpdate, NewMessage};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

fn chat_not_found() -> AppError {
    AppError::not_found("Chat not found")
}

fn message_not_found() -> AppError {
    AppError::not_found("Message not found")
}

fn name_from(body: Option<Json<Value>>) -> String {
    body.and_then(|Json(v)| v.get("name").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

fn decode_body<T: serde::de::DeserializeOwned>(body: Value) -> AppResult<T> {
    serde_json::from_value(body)
        .map_err(|err| AppError::bad_request("invalid_request", err.to_string()))
}

pub async fn list_chats(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    state.access.check(&headers)?;
    let chats = state.store.list_chats().await.map_err(AppError::store)?;
    Ok(Json(chats).into_response())
}

pub async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let chat = state
        .store
        .create_chat(&name_from(body))
        .await
        .map_err(AppError::store)?;
    tracing::debug!(chat_id = chat.id, "chat created");
    Ok((StatusCode::CREATED, Json(chat)).into_response())
}

pub async fn get_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let chat = state
        .store
        .get_chat(id)
        .await
        .map_err(AppError::store)?
        .ok_or_else(chat_not_found)?;
    Ok(Json(chat).into_response())
}

pub async fn update_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    body: Option<Json<Value>>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let chat = state
        .store
        .update_chat(id, &name_from(body))
        .await
        .map_err(AppError::store)?
        .ok_or_else(chat_not_found)?;
    Ok(Json(chat).into_response())
}

pub async fn delete_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    if !state.store.delete_chat(id).await.map_err(AppError::store)? {
        return Err(chat_not_found());
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn clear_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let removed = state.store.clear_chat(id).await.map_err(AppError::store)?;
    tracing::debug!(chat_id = id, removed, "chat cleared");
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let messages = state
        .store
        .list_messages(chat_id)
        .await
        .map_err(AppError::store)?;
    Ok(Json(messages).into_response())
}

pub async fn add_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let msg: NewMessage = decode_body(body)?;
    if state
        .store
        .get_chat(chat_id)
        .await
        .map_err(AppError::store)?
        .is_none()
    {
        return Err(chat_not_found());
    }
    let stored = state
        .store
        .add_message(chat_id, msg)
        .await
        .map_err(AppError::store)?;
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

pub async fn update_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let update: MessageUpdate = decode_body(body)?;
    if !state
        .store
        .update_message(id, update)
        .await
        .map_err(AppError::store)?
    {
        return Err(message_not_found());
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    if !state.store.delete_message(id).await.map_err(AppError::store)? {
        return Err(message_not_found());
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn current_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    state.access.check(&headers)?;
    let current = state.store.current_chat().await.map_err(AppError::store)?;
    Ok(Json(current).into_response())
}
