//! Bearer token exchange
//!
//! A single GET to the token endpoint, authenticated with the refresh
//! credential, yields a short-lived bearer. `expires_at` in the response is an
//! absolute unix timestamp in seconds.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::EDITOR_VERSION_HEADER;
use crate::error::{ExchangeError, Result, classify_failure};

/// API endpoints advertised alongside a bearer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Endpoints {
    #[serde(default)]
    pub api: Option<String>,
}

/// Successful token endpoint response.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub token: String,
    /// Absolute expiry, unix seconds
    pub expires_at: i64,
    /// Seconds after which the provider suggests refreshing
    #[serde(default)]
    pub refresh_in: Option<u64>,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
}

/// Short-lived bearer token obtained from a refresh credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Bearer {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Base API URL the provider wants this bearer used against
    pub api_endpoint: Option<String>,
}

impl Bearer {
    /// Whether the bearer can still be trusted at `now`.
    ///
    /// A bearer is only trusted while `now < expires_at - margin`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match self.expires_at.checked_sub_signed(margin) {
            Some(deadline) => now < deadline,
            None => false,
        }
    }

    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.is_fresh_at(Utc::now(), margin)
    }
}

impl fmt::Debug for Bearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bearer")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("api_endpoint", &self.api_endpoint)
            .finish()
    }
}

impl TryFrom<TokenResponse> for Bearer {
    type Error = ExchangeError;

    fn try_from(response: TokenResponse) -> Result<Self> {
        let expires_at = DateTime::<Utc>::from_timestamp(response.expires_at, 0).ok_or_else(|| {
            ExchangeError::NetworkError(format!(
                "token endpoint returned invalid expires_at {}",
                response.expires_at
            ))
        })?;
        Ok(Bearer {
            token: response.token,
            expires_at,
            api_endpoint: response
                .endpoints
                .and_then(|e| e.api)
                .map(|api| api.trim_end_matches('/').to_string()),
        })
    }
}

/// HTTP client for the token endpoint.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    endpoint: String,
    editor_version: String,
}

impl TokenClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        editor_version: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            editor_version: editor_version.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Exchange a refresh credential for a bearer.
    ///
    /// Performs exactly one request; retries and timeouts are the caller's
    /// concern.
    pub async fn exchange(&self, refresh: &str) -> Result<Bearer> {
        let response = self
            .http
            .get(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("token {refresh}"))
            .header(EDITOR_VERSION_HEADER, &self.editor_version)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            debug!(status = status.as_u16(), "token endpoint rejected exchange");
            return Err(classify_failure(status.as_u16(), &body));
        }

        let token_response = response.json::<TokenResponse>().await.map_err(|e| {
            ExchangeError::NetworkError(format!("invalid token endpoint response: {e}"))
        })?;
        Bearer::try_from(token_response)
    }
}

fn transport_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout(Duration::ZERO)
    } else {
        ExchangeError::NetworkError(format!("token exchange request failed: {e}"))
    }
}
