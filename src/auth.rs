use crate::error::{AppError, AppResult};
use axum::http::{HeaderMap, StatusCode};

/// Optional shared secret for the local API. Without a configured token
/// every request is allowed, which is the normal single-user setup.
#[derive(Clone, Debug, Default)]
pub struct AccessGuard {
    token: Option<String>,
}

impl AccessGuard {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> AppResult<()> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };
        match bearer_token(headers) {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(unauthorized("invalid access token")),
            None => Err(unauthorized("missing access token")),
        }
    }
}

/// `Authorization: Bearer <token>`, falling back to `x-api-key`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let value = value.trim();
        if let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

fn unauthorized(message: &str) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn disabled_guard_allows_everything() {
        let guard = AccessGuard::new(Some("  ".to_string()));
        assert!(!guard.is_enabled());
        assert!(guard.check(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn token_checked_from_bearer_or_api_key_header() {
        let guard = AccessGuard::new(Some("secret".to_string()));
        let mut headers = HeaderMap::new();
        assert_eq!(guard.check(&headers).unwrap_err().status, StatusCode::UNAUTHORIZED);

        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        assert!(guard.check(&headers).is_ok());

        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(guard.check(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert!(guard.check(&headers).is_ok());
    }
}
