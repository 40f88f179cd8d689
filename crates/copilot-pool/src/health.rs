//! Outcome classification and credential health transitions
//!
//! Distinguishes upstream responses that indict the credential (authorization
//! and rate-limit rejections) from transient failures and from ordinary client
//! errors that say nothing about the credential. A rejection moves the
//! credential to `Error` with `lastError` filled from the provider's error
//! body. Transient failures change nothing here; the coordinator escalates
//! them the same way once its local retries are spent.
//!
//! Success never heals an `Error` credential. Healing is an operator action.

use copilot_auth::{ErrorKind, ExchangeError, UpstreamErrorBody, mentions_rate_limit};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::PoolState;

/// A failure attributed to a specific credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub body: UpstreamErrorBody,
}

impl Rejection {
    pub fn new(kind: ErrorKind, body: UpstreamErrorBody) -> Self {
        Self { kind, body }
    }

    pub fn from_exchange(err: &ExchangeError) -> Self {
        Self {
            kind: err.kind(),
            body: err.body(),
        }
    }
}

/// Details of the most recent failure, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub kind: ErrorKind,
}

impl LastError {
    pub fn from_rejection(rejection: &Rejection) -> Self {
        Self {
            message: rejection.body.message().to_string(),
            url: rejection.body.url().map(str::to_owned),
            title: rejection.body.title().map(str::to_owned),
            kind: rejection.kind,
        }
    }
}

/// How an upstream call outcome bears on the credential that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Credential is fine; relay the response.
    Healthy,
    /// Credential rejected; mark it and fail over.
    Rejected(Rejection),
    /// Retryable failure unrelated to the credential.
    Transient(String),
}

/// Classify an upstream completion/model API response.
///
/// - 2xx and unrelated 4xx → `Healthy` (relayed to the client as-is)
/// - 401 → `Rejected(Unauthorized)`
/// - 403 → `Rejected(RateLimited)` if the body mentions throttling, else
///   `Rejected(Unauthorized)`
/// - 429 → `Rejected(RateLimited)`
/// - 408, 5xx → `Transient`
pub fn classify_response(status: u16, body: &str) -> Verdict {
    match status {
        401 => Verdict::Rejected(Rejection::new(
            ErrorKind::Unauthorized,
            UpstreamErrorBody::parse(body),
        )),
        403 => {
            let parsed = UpstreamErrorBody::parse(body);
            let kind = if mentions_rate_limit(parsed.message()) {
                ErrorKind::RateLimited
            } else {
                ErrorKind::Unauthorized
            };
            Verdict::Rejected(Rejection::new(kind, parsed))
        }
        429 => Verdict::Rejected(Rejection::new(
            ErrorKind::RateLimited,
            UpstreamErrorBody::parse(body),
        )),
        408 | 500..=599 => Verdict::Transient(format!(
            "upstream returned {status}: {}",
            UpstreamErrorBody::parse(body).message()
        )),
        _ => Verdict::Healthy,
    }
}

/// Credential health transitions.
///
/// Both functions operate on state the caller already holds the pool lock
/// for, so the coordinator can mark and switch in one critical section.
pub(crate) struct HealthTracker;

impl HealthTracker {
    /// Move `index` to `Error`. The cached bearer is dropped: a token that
    /// was rejected is not reused. Returns true for the first detector.
    pub(crate) fn apply_rejection(
        state: &mut PoolState,
        index: usize,
        rejection: &Rejection,
    ) -> bool {
        let Some(slot) = state.slots.get_mut(index) else {
            return false;
        };
        let was_error = slot.error.is_some();
        slot.error = Some(LastError::from_rejection(rejection));
        slot.cached = None;

        if was_error {
            debug!(credential = index, kind = rejection.kind.label(), "credential already in error");
            false
        } else {
            warn!(
                credential = index,
                kind = rejection.kind.label(),
                error = %rejection.body,
                "credential marked as error"
            );
            true
        }
    }

    /// Operator heal: clear `Error`, `lastError` and the cached bearer.
    pub(crate) fn apply_reset(state: &mut PoolState, index: usize) -> bool {
        let Some(slot) = state.slots.get_mut(index) else {
            return false;
        };
        let was_error = slot.error.take().is_some();
        slot.cached = None;
        if was_error {
            info!(credential = index, "credential error cleared by operator");
        }
        was_error
    }
}
