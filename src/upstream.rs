use crate::chat::CompletionRequest;
use crate::config::UpstreamConfig;
use axum::http::StatusCode;
use serde::Serialize;
use std::time::Duration;

const ERROR_BODY_LIMIT: usize = 2000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

/// The only failure callers of the upstream client ever see.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub upstream_base_url: String,
    pub has_api_key: bool,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .user_agent("toolrelay/0.1")
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|err| err.to_string())?;
        Ok(Self {
            http,
            base_url: config.base_url.trim().to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn health(&self) -> UpstreamHealth {
        UpstreamHealth {
            upstream_base_url: self.base_url.clone(),
            has_api_key: self.api_key.is_some(),
        }
    }

    /// Sends a chat-completions request. The returned response is either
    /// read as a whole or consumed as a byte stream by the caller; dropping
    /// it closes the connection.
    pub async fn request_completions(
        &self,
        body: &CompletionRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = join_url(&self.base_url, "/chat/completions");
        let accept = if body.is_stream() {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut req = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, accept)
            .json(body);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }
        metrics::counter!("toolrelay_upstream_requests_total").increment(1);
        let resp = req.send().await.map_err(|err| {
            UpstreamError::new(
                UpstreamErrorKind::Network,
                None,
                format!("upstream request failed: {}", error_chain(&err)),
            )
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::new(
                UpstreamErrorKind::Http,
                Some(status),
                format!("upstream status {}: {}", status, truncate_body(&text)),
            ));
        }
        Ok(resp)
    }

    /// Non-streaming round trip returning the decoded JSON body.
    pub async fn complete(
        &self,
        body: &CompletionRequest,
    ) -> Result<serde_json::Value, UpstreamError> {
        let resp = self.request_completions(body).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            UpstreamError::new(UpstreamErrorKind::Network, Some(status), error_chain(&err))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            UpstreamError::new(
                UpstreamErrorKind::Http,
                Some(status),
                format!("upstream returned invalid JSON: {err}"),
            )
        })
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.is_empty() {
        return format!("/{path}");
    }
    format!("{base}/{path}")
}

/// `err` followed by each of its sources, joined with `": "`. Causes whose
/// text is already part of the message are skipped.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !text.is_empty() && !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn truncate_body(text: &str) -> String {
    if text.chars().count() <= ERROR_BODY_LIMIT {
        return text.to_string();
    }
    let mut out: String = text.chars().take(ERROR_BODY_LIMIT).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::{error_chain, join_url, truncate_body};
    use std::io;

    #[derive(Debug, thiserror::Error)]
    #[error("error sending request")]
    struct Outer(#[source] Middle);

    #[derive(Debug, thiserror::Error)]
    #[error("tcp connect error")]
    struct Middle(#[source] io::Error);

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://api.deepseek.com/", "/chat/completions"),
            "https://api.deepseek.com/chat/completions"
        );
        assert_eq!(
            join_url("http://127.0.0.1:8000/v1", "chat/completions"),
            "http://127.0.0.1:8000/v1/chat/completions"
        );
        assert_eq!(join_url("", "/chat/completions"), "/chat/completions");
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let long = "x".repeat(5000);
        let out = truncate_body(&long);
        assert_eq!(out.len(), 2003);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_body("short"), "short");
    }

    #[test]
    fn error_chain_names_every_cause() {
        let err = Outer(Middle(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        )));
        assert_eq!(
            error_chain(&err),
            "error sending request: tcp connect error: Connection refused (os error 111)"
        );
    }

    #[test]
    fn error_chain_skips_repeated_causes() {
        let err = Middle(io::Error::other("tcp connect error"));
        assert_eq!(error_chain(&err), "tcp connect error");
    }
}
