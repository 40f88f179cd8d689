//! HTTP error responses
//!
//! Every error leaves the service with a JSON body. Proxy routes answer
//! `{"error":{"type","message","request_id"}}`; the `/tokens` API answers
//! `{"message","error_details"?}` so the dashboard can show the provider's
//! own explanation and documentation link.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use copilot_pool::{Error as PoolError, LastError};
use serde::Serialize;
use thiserror::Error;

/// Per-request failures on the proxy routes.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    PoolExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::RateLimited(_) => "rate_limited",
            ProxyError::PoolExhausted(_) => "pool_exhausted",
            ProxyError::Internal(_) => "proxy_error",
        }
    }

    /// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        let message = err.to_string();
        match err {
            PoolError::AllCredentialsExhausted { .. } => {
                ProxyError::PoolExhausted(format!("provider unavailable: {message}"))
            }
            _ => ProxyError::Internal(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl From<&LastError> for ErrorDetails {
    fn from(last: &LastError) -> Self {
        Self {
            message: last.message.clone(),
            url: last.url.clone(),
            title: last.title.clone(),
        }
    }
}

/// Failure body of the `/tokens` API.
#[derive(Debug, Serialize)]
pub struct TokenApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

impl From<PoolError> for TokenApiError {
    fn from(err: PoolError) -> Self {
        let message = err.to_string();
        match err {
            PoolError::InvalidSwitchTarget {
                last_error: Some(last_error),
                ..
            } => Self {
                status: StatusCode::CONFLICT,
                message,
                error_details: Some(ErrorDetails::from(last_error.as_ref())),
            },
            PoolError::InvalidSwitchTarget { .. } | PoolError::IndexOutOfRange { .. } => Self {
                status: StatusCode::BAD_REQUEST,
                message,
                error_details: None,
            },
            PoolError::AllCredentialsExhausted { .. } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message,
                error_details: None,
            },
            _ => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message,
                error_details: None,
            },
        }
    }
}

impl IntoResponse for TokenApiError {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self)
            .unwrap_or_else(|_| String::from(r#"{"message":"error serialization failed"}"#));
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_auth::ErrorKind;

    fn last_error() -> LastError {
        LastError {
            message: "Copilot access revoked".into(),
            url: Some("https://docs.example/revoked".into()),
            title: Some("Access denied".into()),
            kind: ErrorKind::Revoked,
        }
    }

    #[test]
    fn exhausted_pool_maps_to_503() {
        let err = ProxyError::from(PoolError::AllCredentialsExhausted {
            attempts: 3,
            last_failure: "rate limited".into(),
        });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_type(), "pool_exhausted");
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn proxy_error_body_has_type_message_and_request_id() {
        let resp = ProxyError::RateLimited("slow down".into()).into_response_with_id("req_abc");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "rate_limited");
        assert_eq!(json["error"]["message"], "slow down");
        assert_eq!(json["error"]["request_id"], "req_abc");
    }

    #[test]
    fn switch_to_errored_target_is_conflict_with_details() {
        let err = TokenApiError::from(PoolError::InvalidSwitchTarget {
            index: 1,
            reason: "credential is in error".into(),
            last_error: Some(Box::new(last_error())),
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error_details"]["url"], "https://docs.example/revoked");
        assert_eq!(json["error_details"]["title"], "Access denied");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn out_of_range_switch_is_bad_request_without_details() {
        let err = TokenApiError::from(PoolError::InvalidSwitchTarget {
            index: 9,
            reason: "index out of range".into(),
            last_error: None,
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let json = serde_json::to_value(&err).unwrap();
        assert!(json["message"].as_str().unwrap().contains("9"));
        assert!(json.get("error_details").is_none());
    }
}
