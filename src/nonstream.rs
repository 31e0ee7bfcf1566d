//! Non-streaming completions: at most one tool round and exactly one
//! follow-up request. Tool calls in the follow-up response are returned to
//! the caller untouched.

use crate::chat::{CompletionRequest, Message};
use crate::error::{AppError, AppResult};
use crate::tools::ToolExecutor;
use crate::upstream::UpstreamClient;
use axum::http::StatusCode;
use serde_json::Value;

pub async fn complete_with_tools(
    upstream: &UpstreamClient,
    tools: &dyn ToolExecutor,
    mut request: CompletionRequest,
) -> AppResult<Value> {
    request.inject_default_tools(tools.definitions());
    let first = upstream.complete(&request).await.map_err(upstream_failure)?;

    let Some(assistant) = assistant_with_tool_calls(&first) else {
        return Ok(first);
    };
    let calls = assistant.tool_calls.clone().unwrap_or_default();
    tracing::info!(tool_calls = calls.len(), "running tools before follow-up");

    request.messages.push(assistant);
    for call in &calls {
        let outcome = tools
            .execute(&call.function.name, &call.parsed_arguments())
            .await;
        let content = if outcome.output.is_empty() {
            outcome.to_value().to_string()
        } else {
            outcome.output
        };
        request
            .messages
            .push(Message::tool_result(call.id.clone(), content));
    }

    request.tools = None;
    request.tool_choice = None;
    upstream.complete(&request).await.map_err(|mut err| {
        err.message = format!("Tool follow-up failed: {}", err.message);
        upstream_failure(err)
    })
}

/// The first choice's message when it carries at least one tool call.
fn assistant_with_tool_calls(body: &Value) -> Option<Message> {
    let message = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))?;
    let has_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .is_some_and(|calls| !calls.is_empty());
    if !has_calls {
        return None;
    }
    match serde_json::from_value::<Message>(message.clone()) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(error = %err, "assistant message with tool calls did not decode");
            None
        }
    }
}

fn upstream_failure(err: crate::upstream::UpstreamError) -> AppError {
    AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", err.message)
        .with_type("upstream_error")
}

#[cfg(test)]
mod tests {
    use super::assistant_with_tool_calls;
    use serde_json::json;

    #[test]
    fn only_messages_with_tool_calls_are_extracted() {
        let body = json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "get_shell_config", "arguments": "{}" }
                }]
            }}]
        });
        let message = assistant_with_tool_calls(&body).unwrap();
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_shell_config");

        let plain = json!({ "choices": [{ "message": { "role": "assistant", "content": "hi" } }] });
        assert!(assistant_with_tool_calls(&plain).is_none());
        let empty = json!({ "choices": [{ "message": { "role": "assistant", "tool_calls": [] } }] });
        assert!(assistant_with_tool_calls(&empty).is_none());
        assert!(assistant_with_tool_calls(&json!({ "choices": [] })).is_none());
    }
}
