//! Token exchange errors and provider error body parsing

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error body returned by the provider, parsed into a fixed shape.
///
/// The provider answers failures with one of two JSON layouts, or sometimes
/// plain text. Anything that is not recognised falls back to `Opaque` with the
/// raw text so the dashboard can still render a cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum UpstreamErrorBody {
    Structured {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Opaque {
        text: String,
    },
}

impl UpstreamErrorBody {
    /// Parse a provider error body.
    ///
    /// Recognised layouts, checked in order:
    /// 1. `{"error_details": {"message", "url", "title"}, ...}`
    /// 2. `{"message": "...", "documentation_url": "..."}`
    ///
    /// Also accepts `{"error": {"message": ...}}` as used by the completions
    /// API. Everything else is `Opaque`.
    pub fn parse(body: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => return Self::opaque(body),
        };

        let field = |obj: &serde_json::Value, key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        if let Some(details) = value.get("error_details").filter(|d| d.is_object())
            && let Some(message) = field(details, "message")
        {
            return Self::Structured {
                message,
                url: field(details, "url"),
                title: field(details, "title"),
            };
        }

        if let Some(message) = field(&value, "message") {
            return Self::Structured {
                message,
                url: field(&value, "documentation_url"),
                title: None,
            };
        }

        if let Some(inner) = value.get("error").filter(|e| e.is_object())
            && let Some(message) = field(inner, "message")
        {
            return Self::Structured {
                message,
                url: None,
                title: field(inner, "type").or_else(|| field(inner, "code")),
            };
        }

        Self::opaque(body)
    }

    /// Wrap arbitrary text. Empty text becomes a placeholder message.
    pub fn opaque(text: &str) -> Self {
        let text = text.trim();
        Self::Opaque {
            text: if text.is_empty() {
                "<no body>".to_string()
            } else {
                text.to_string()
            },
        }
    }

    /// Human-readable message regardless of shape.
    pub fn message(&self) -> &str {
        match self {
            Self::Structured { message, .. } => message,
            Self::Opaque { text } => text,
        }
    }

    /// Documentation URL, when the provider supplied one.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Structured { url, .. } => url.as_deref(),
            Self::Opaque { .. } => None,
        }
    }

    /// Short title, when the provider supplied one.
    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Structured { title, .. } => title.as_deref(),
            Self::Opaque { .. } => None,
        }
    }
}

impl fmt::Display for UpstreamErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Stable category of a credential failure, used for `lastError.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ExpiredRefresh,
    Revoked,
    RateLimited,
    Unauthorized,
    Network,
    Timeout,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::ExpiredRefresh => "expired_refresh",
            ErrorKind::Revoked => "revoked",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// Failure to exchange a refresh credential for a bearer.
///
/// `Clone` so a single exchange result can be handed to every caller waiting
/// on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("refresh credential expired: {0}")]
    ExpiredRefresh(UpstreamErrorBody),

    #[error("refresh credential revoked: {0}")]
    Revoked(UpstreamErrorBody),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("rate limited: {0}")]
    RateLimited(UpstreamErrorBody),

    #[error("token exchange timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl ExchangeError {
    /// Transient errors are retried locally before being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_) | ExchangeError::RateLimited(_) | ExchangeError::Timeout(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::ExpiredRefresh(_) => ErrorKind::ExpiredRefresh,
            ExchangeError::Revoked(_) => ErrorKind::Revoked,
            ExchangeError::NetworkError(_) => ErrorKind::Network,
            ExchangeError::RateLimited(_) => ErrorKind::RateLimited,
            ExchangeError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Provider error body for this failure, synthesising one when the
    /// failure never reached the provider.
    pub fn body(&self) -> UpstreamErrorBody {
        match self {
            ExchangeError::ExpiredRefresh(body)
            | ExchangeError::Revoked(body)
            | ExchangeError::RateLimited(body) => body.clone(),
            other => UpstreamErrorBody::opaque(&other.to_string()),
        }
    }
}

/// Result alias for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Phrases that mark a 403 as throttling rather than a rejection. Shared by
/// the token endpoint and the completion API classifiers.
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate-limit", "too many requests", "quota"];

/// Classify a non-success token endpoint response.
///
/// - 401 → `ExpiredRefresh` (bad or expired credential)
/// - 403 mentioning a rate limit → `RateLimited`
/// - 429 → `RateLimited`
/// - 408, 5xx → `NetworkError`
/// - any other status → `Revoked`
pub fn classify_failure(status: u16, body: &str) -> ExchangeError {
    let parsed = UpstreamErrorBody::parse(body);
    match status {
        401 => ExchangeError::ExpiredRefresh(parsed),
        403 if mentions_rate_limit(parsed.message()) => ExchangeError::RateLimited(parsed),
        429 => ExchangeError::RateLimited(parsed),
        408 | 500..=599 => ExchangeError::NetworkError(format!(
            "token endpoint returned {status}: {}",
            parsed.message()
        )),
        _ => ExchangeError::Revoked(parsed),
    }
}

/// Whether a provider error message describes throttling.
pub fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}
