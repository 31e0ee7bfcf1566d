use crate::usage::{TokenUsage, UsageStats};
use axum::response::sse::Event;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Progress events the proxy interleaves with the upstream pass-through.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyntheticEvent {
    Usage {
        usage: TokenUsage,
        estimated: bool,
        request_id: String,
    },
    ToolExecution {
        tool_call: ToolCallView,
        status: ExecutionStatus,
    },
    ToolResult {
        tool_call: ToolCallView,
        result: Value,
    },
    Continuation {
        status: ContinuationStatus,
        request_id: String,
    },
    Error {
        message: String,
        #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
        location: Option<ErrorLocation>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl SyntheticEvent {
    pub fn usage(stats: UsageStats, request_id: &str) -> Self {
        Self::Usage {
            usage: stats.tokens,
            estimated: stats.estimated,
            request_id: request_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallView {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Executing,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationStatus {
    Starting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLocation {
    Upstream,
    Backend,
}

/// Everything written to the downstream SSE body.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Synthetic(SyntheticEvent),
    /// An upstream event forwarded untouched.
    Passthrough {
        event: Option<String>,
        data: String,
    },
    Done,
}

impl StreamEvent {
    pub fn into_sse(self) -> Event {
        match self {
            StreamEvent::Synthetic(event) => {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Event::default().data(data)
            }
            StreamEvent::Passthrough { event, data } => {
                let sse = Event::default().data(data);
                match event {
                    Some(name) if !name.is_empty() && name != "message" => sse.event(name),
                    _ => sse,
                }
            }
            StreamEvent::Done => Event::default().data(DONE_SENTINEL),
        }
    }
}

/// The receiving half was dropped: the client went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("downstream client disconnected")]
pub struct Disconnected;

/// Ordered writer for the downstream SSE body.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: StreamEvent) -> Result<(), Disconnected> {
        self.tx.send(event.into_sse()).await.map_err(|_| Disconnected)
    }

    pub async fn synthetic(&self, event: SyntheticEvent) -> Result<(), Disconnected> {
        self.send(StreamEvent::Synthetic(event)).await
    }

    pub async fn done(&self) -> Result<(), Disconnected> {
        self.send(StreamEvent::Done).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn synthetic_events_serialize_with_type_tag() {
        let ev = SyntheticEvent::usage(UsageStats::estimated(10, 2), "abc");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "type": "usage",
                "usage": { "prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12 },
                "estimated": true,
                "request_id": "abc"
            })
        );

        let ev = SyntheticEvent::ToolExecution {
            tool_call: ToolCallView {
                id: "call_1".into(),
                name: "run_shell_command".into(),
                args: json!({ "command": "ls" }),
            },
            status: ExecutionStatus::Executing,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_execution");
        assert_eq!(v["status"], "executing");
        assert_eq!(v["tool_call"]["args"]["command"], "ls");

        let ev = SyntheticEvent::Continuation {
            status: ContinuationStatus::Starting,
            request_id: "abc".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({ "type": "continuation", "status": "starting", "request_id": "abc" })
        );
    }

    #[test]
    fn error_event_omits_absent_location() {
        let ev = SyntheticEvent::Error {
            message: "boom".into(),
            location: None,
            request_id: None,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({ "type": "error", "message": "boom" })
        );
        let ev = SyntheticEvent::Error {
            message: "boom".into(),
            location: Some(ErrorLocation::Upstream),
            request_id: Some("r".into()),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["where"], "upstream");
        assert_eq!(v["request_id"], "r");
    }

    #[tokio::test]
    async fn sink_reports_disconnect_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        assert!(sink.done().await.is_ok());
        drop(rx);
        assert_eq!(sink.done().await, Err(Disconnected));
    }
}
