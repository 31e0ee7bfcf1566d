//! Streaming tool loop.
//!
//! One logical client request runs as a sequence of upstream turns. Each turn
//! forwards the upstream SSE payloads downstream while accumulating content,
//! reasoning and tool-call fragments. When a turn ends with tool calls, the
//! tools run in index order, their results are appended to the conversation
//! and the next turn starts. The loop ends on a turn without tool calls, when
//! the iteration budget runs out, or on a fatal error; every ending except a
//! client disconnect writes `[DONE]` last.

use crate::chat::{CompletionRequest, Message, ToolCall};
use crate::events::{
    ContinuationStatus, DONE_SENTINEL, Disconnected, ErrorLocation, EventSink, ExecutionStatus,
    StreamEvent, SyntheticEvent, ToolCallView,
};
use crate::tools::{ToolExecutor, ToolOutcome};
use crate::upstream::{UpstreamClient, error_chain};
use crate::usage::{
    UsageStats, estimate_completion_tokens, estimate_prompt_tokens, parse_usage_from_chat_object,
};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ESTIMATE_INTERVAL: Duration = Duration::from_millis(750);

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("downstream client disconnected")]
    Disconnected,
    #[error("Max tool iterations reached (TOOLRELAY_MAX_TOOL_ITERATIONS={limit})")]
    BudgetExhausted { limit: i64 },
    /// `follow_up` is set when the request followed a tool round.
    #[error("{message}")]
    Upstream { message: String, follow_up: bool },
    #[error("Streaming error: {message}")]
    Transport { message: String, usage: UsageStats },
}

impl TurnError {
    fn location(&self) -> Option<ErrorLocation> {
        match self {
            TurnError::Upstream {
                follow_up: true, ..
            } => Some(ErrorLocation::Upstream),
            TurnError::Transport { .. } => Some(ErrorLocation::Backend),
            TurnError::Upstream { .. }
            | TurnError::Disconnected
            | TurnError::BudgetExhausted { .. } => None,
        }
    }
}

impl From<Disconnected> for TurnError {
    fn from(_: Disconnected) -> Self {
        TurnError::Disconnected
    }
}

/// One accumulated tool call, keyed by its delta index in [`ToolCallBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub id: String,
    pub name: String,
    pub args_str: String,
}

/// Tool-call fragments of a single upstream turn.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    fragments: BTreeMap<u64, ToolCallFragment>,
}

impl ToolCallBuffer {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&ToolCallFragment> {
        self.fragments.get(&index)
    }

    /// Merges one element of `delta.tool_calls`. `id` and `name` only take
    /// non-empty values; `arguments` pieces are appended in arrival order.
    pub fn merge(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let fragment = self.fragments.entry(index).or_default();
        if let Some(id) = delta.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            fragment.id = id.to_string();
        }
        let function = delta.get("function");
        if let Some(name) = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            fragment.name = name.to_string();
        }
        if let Some(args) = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            fragment.args_str.push_str(args);
        }
    }

    /// Calls with a resolved name, in index order. A missing id is replaced
    /// by a generated one so the tool message can still reference it.
    pub fn resolve(&self) -> Vec<ToolCall> {
        self.fragments
            .values()
            .filter(|f| !f.name.is_empty())
            .map(|f| {
                let id = if f.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    f.id.clone()
                };
                let arguments = if f.args_str.trim().is_empty() {
                    "{}".to_string()
                } else {
                    f.args_str.clone()
                };
                ToolCall::function(id, f.name.clone(), arguments)
            })
            .collect()
    }
}

/// Accumulator for a single upstream turn.
#[derive(Debug)]
pub struct TurnState {
    content: String,
    reasoning: String,
    tool_calls: ToolCallBuffer,
    real_usage: Option<UsageStats>,
    prompt_estimate: u64,
    last_estimate_at: Option<Instant>,
}

impl TurnState {
    pub fn new(messages: &[Message]) -> Self {
        Self {
            content: String::new(),
            reasoning: String::new(),
            tool_calls: ToolCallBuffer::default(),
            real_usage: None,
            prompt_estimate: estimate_prompt_tokens(messages),
            last_estimate_at: None,
        }
    }

    /// Applies one parsed chat-completion chunk.
    pub fn absorb(&mut self, chunk: &Value) {
        if let Some(usage) = parse_usage_from_chat_object(chunk) {
            self.real_usage = Some(usage);
        }
        let Some(delta) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
        else {
            return;
        };
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            self.content.push_str(text);
        }
        if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
            self.reasoning.push_str(text);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                self.tool_calls.merge(call);
            }
        }
    }

    pub fn tool_calls(&self) -> &ToolCallBuffer {
        &self.tool_calls
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    fn estimate_now(&self) -> UsageStats {
        UsageStats::estimated(
            self.prompt_estimate,
            estimate_completion_tokens(&self.reasoning, &self.content),
        )
    }

    /// Estimated usage to emit now, if any. Real usage silences estimates for
    /// the rest of the turn; unforced estimates are throttled.
    pub fn estimate_due(&mut self, now: Instant, force: bool) -> Option<UsageStats> {
        if self.real_usage.is_some() {
            return None;
        }
        if !force
            && self
                .last_estimate_at
                .is_some_and(|at| now.duration_since(at) < ESTIMATE_INTERVAL)
        {
            return None;
        }
        self.last_estimate_at = Some(now);
        Some(self.estimate_now())
    }

    /// Usage for the end of the turn: real if the upstream reported it.
    pub fn final_usage(&self) -> UsageStats {
        self.real_usage.unwrap_or_else(|| self.estimate_now())
    }
}

/// Conversation state carried across turns of one logical request.
#[derive(Debug)]
pub struct StreamContext {
    pub request: CompletionRequest,
    pub remaining: i64,
    pub request_id: String,
    pub turn: u32,
}

impl StreamContext {
    pub fn new(request: CompletionRequest, budget: i64) -> Self {
        Self {
            request,
            remaining: budget,
            request_id: new_request_id(),
            turn: 0,
        }
    }
}

/// Lowercase hex of the current wall-clock time in milliseconds.
pub fn new_request_id() -> String {
    format!("{:x}", chrono::Utc::now().timestamp_millis())
}

#[derive(Clone)]
pub struct StreamProcessor {
    upstream: UpstreamClient,
    tools: Arc<dyn ToolExecutor>,
    max_iterations: i64,
}

impl StreamProcessor {
    pub fn new(
        upstream: UpstreamClient,
        tools: Arc<dyn ToolExecutor>,
        max_iterations: i64,
    ) -> Self {
        Self {
            upstream,
            tools,
            max_iterations,
        }
    }

    /// Drives the request to completion, writing every event into `sink`.
    pub async fn run(&self, request: CompletionRequest, sink: EventSink) {
        let mut ctx = StreamContext::new(request, self.max_iterations);
        tracing::info!(
            request_id = %ctx.request_id,
            messages = ctx.request.messages.len(),
            budget = ctx.remaining,
            "streaming completion started"
        );
        match self.drive(&mut ctx, &sink).await {
            Ok(()) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    turns = ctx.turn + 1,
                    "stream finished"
                );
            }
            Err(TurnError::Disconnected) => {
                tracing::debug!(request_id = %ctx.request_id, "downstream disconnected, stopping");
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err,
                    "stream ended with error"
                );
                if self.finish_with_error(&ctx, &sink, err).await.is_err() {
                    tracing::debug!(request_id = %ctx.request_id, "downstream gone before [DONE]");
                }
            }
        }
    }

    async fn drive(&self, ctx: &mut StreamContext, sink: &EventSink) -> Result<(), TurnError> {
        loop {
            if ctx.remaining <= 0 {
                return Err(TurnError::BudgetExhausted {
                    limit: self.max_iterations,
                });
            }
            ctx.request.inject_default_tools(self.tools.definitions());

            let resp = self
                .upstream
                .request_completions(&ctx.request)
                .await
                .map_err(|err| TurnError::Upstream {
                    message: if ctx.turn == 0 {
                        err.message
                    } else {
                        format!("Tool follow-up failed: {}", err.message)
                    },
                    follow_up: ctx.turn > 0,
                })?;

            let mut turn = TurnState::new(&ctx.request.messages);
            // The response is consumed here, so the upstream connection is
            // closed before any follow-up request opens.
            self.read_turn(resp, &mut turn, &ctx.request_id, sink).await?;

            let calls = turn.tool_calls.resolve();
            if calls.is_empty() {
                sink.synthetic(SyntheticEvent::usage(turn.final_usage(), &ctx.request_id))
                    .await?;
                sink.done().await?;
                return Ok(());
            }

            self.dispatch_tools(calls, turn, ctx, sink).await?;
            ctx.remaining -= 1;
            ctx.turn += 1;
            metrics::counter!("toolrelay_continuations_total").increment(1);
            tracing::debug!(
                request_id = %ctx.request_id,
                remaining = ctx.remaining,
                "continuing after tool execution"
            );
        }
    }

    async fn read_turn(
        &self,
        resp: reqwest::Response,
        turn: &mut TurnState,
        request_id: &str,
        sink: &EventSink,
    ) -> Result<(), TurnError> {
        let mut events = resp.bytes_stream().eventsource();
        while let Some(item) = events.next().await {
            let ev = match item {
                Ok(ev) => ev,
                Err(EventStreamError::Transport(err)) => {
                    return Err(TurnError::Transport {
                        message: error_chain(&err),
                        usage: turn.final_usage(),
                    });
                }
                Err(err) => {
                    tracing::debug!(request_id, error = %err, "skipping undecodable SSE event");
                    continue;
                }
            };
            if ev.data.trim() == DONE_SENTINEL {
                return Ok(());
            }
            if ev.data.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&ev.data) {
                Ok(chunk) => {
                    turn.absorb(&chunk);
                    if let Some(usage) = turn.estimate_due(Instant::now(), false) {
                        sink.synthetic(SyntheticEvent::usage(usage, request_id))
                            .await?;
                    }
                }
                Err(err) => {
                    tracing::debug!(request_id, error = %err, "malformed chunk forwarded as-is");
                }
            }
            sink.send(StreamEvent::Passthrough {
                event: Some(ev.event),
                data: ev.data,
            })
            .await?;
        }
        // EOF without [DONE] ends the turn the same way.
        Ok(())
    }

    async fn dispatch_tools(
        &self,
        calls: Vec<ToolCall>,
        mut turn: TurnState,
        ctx: &mut StreamContext,
        sink: &EventSink,
    ) -> Result<(), TurnError> {
        let request_id = ctx.request_id.clone();
        let mut outcomes: Vec<ToolOutcome> = Vec::with_capacity(calls.len());
        for call in &calls {
            let args = call.parsed_arguments();
            let view = ToolCallView {
                id: call.id.clone(),
                name: call.function.name.clone(),
                args: args.clone(),
            };
            sink.synthetic(SyntheticEvent::ToolExecution {
                tool_call: view.clone(),
                status: ExecutionStatus::Executing,
            })
            .await?;
            if let Some(usage) = turn.estimate_due(Instant::now(), true) {
                sink.synthetic(SyntheticEvent::usage(usage, &request_id))
                    .await?;
            }

            tracing::info!(request_id = %request_id, tool = %view.name, "executing tool");
            let outcome = self.tools.execute(&view.name, &args).await;

            sink.synthetic(SyntheticEvent::ToolResult {
                tool_call: view,
                result: outcome.to_value(),
            })
            .await?;
            if let Some(usage) = turn.estimate_due(Instant::now(), true) {
                sink.synthetic(SyntheticEvent::usage(usage, &request_id))
                    .await?;
            }
            outcomes.push(outcome);
        }

        let had_real_usage = turn.real_usage.is_some();
        let messages = &mut ctx.request.messages;
        messages.push(Message::assistant_with_tool_calls(
            std::mem::take(&mut turn.content),
            Some(std::mem::take(&mut turn.reasoning)),
            calls.clone(),
        ));
        for (call, outcome) in calls.iter().zip(outcomes) {
            let content = if outcome.success {
                outcome.output
            } else {
                outcome.to_value().to_string()
            };
            messages.push(Message::tool_result(call.id.clone(), content));
        }

        sink.synthetic(SyntheticEvent::Continuation {
            status: ContinuationStatus::Starting,
            request_id: request_id.clone(),
        })
        .await?;
        if !had_real_usage {
            let prompt = estimate_prompt_tokens(&ctx.request.messages);
            sink.synthetic(SyntheticEvent::usage(
                UsageStats::estimated(prompt, 0),
                &request_id,
            ))
            .await?;
        }
        Ok(())
    }

    async fn finish_with_error(
        &self,
        ctx: &StreamContext,
        sink: &EventSink,
        err: TurnError,
    ) -> Result<(), Disconnected> {
        let usage = match &err {
            TurnError::Transport { usage, .. } => *usage,
            _ => UsageStats::estimated(estimate_prompt_tokens(&ctx.request.messages), 0),
        };
        sink.synthetic(SyntheticEvent::usage(usage, &ctx.request_id))
            .await?;
        sink.synthetic(SyntheticEvent::Error {
            message: err.to_string(),
            location: err.location(),
            request_id: Some(ctx.request_id.clone()),
        })
        .await?;
        sink.done().await
    }
}
