//! Failover coordinator
//!
//! Drives one inbound request through `Selecting → Calling → {Succeeded |
//! Failed}`, looping back to `Selecting` at most `pool size` times.
//!
//! A transient failure (5xx, 408, transport error, call timeout) is retried
//! on the same credential first. Once those retries are spent it is escalated
//! like a rejection, with a `timeout` or `network` kind, so the next hop runs
//! against a different credential.
//!
//! Every write to `current` goes through the pool-wide lock as a single
//! compare-and-commit: only the first caller to report a failure on the
//! current credential moves the pointer. Callers reporting the same, now
//! stale, credential see the updated pointer and move on without switching
//! again. Operator switches take the same lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use copilot_auth::{Bearer, ErrorKind, UpstreamErrorBody};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::exchanger::Exchanger;
use crate::health::{HealthTracker, LastError, Rejection, Verdict};
use crate::rate_gate::RateGate;
use crate::store::{CredentialStore, PoolState};

/// Limits for the outbound call made with each selected credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Per-try timeout; expiry counts as a transient failure
    pub timeout: Duration,
    /// Local retries on the same credential for transient failures
    pub retries: u32,
    /// Base delay between local retries, doubled each time
    pub backoff: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl DispatchPolicy {
    fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }
}

/// Context handed to the outbound call.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub index: usize,
    pub bearer: Bearer,
    /// Failover hop, 0-based
    pub hop: usize,
    /// Try on this credential within the hop, 0-based
    pub try_number: u32,
}

/// What the outbound call reports back.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Success(T),
    /// Authorization or rate-limit rejection: mark and fail over
    Rejected(Rejection),
    /// Retry locally, then escalate like a rejection
    Transient(String),
}

/// Result of one hop once local retries are settled.
enum HopOutcome<T> {
    Success(T),
    Failed(Rejection),
}

impl<T> CallOutcome<T> {
    /// Map a classified upstream response onto an outcome, keeping `value`
    /// when the credential is healthy.
    pub fn from_verdict(verdict: Verdict, value: T) -> Self {
        match verdict {
            Verdict::Healthy => CallOutcome::Success(value),
            Verdict::Rejected(rejection) => CallOutcome::Rejected(rejection),
            Verdict::Transient(message) => CallOutcome::Transient(message),
        }
    }
}

/// Successful result of `dispatch`.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub value: T,
    /// Credential that produced the value
    pub index: usize,
    /// Failover hops taken before success
    pub hops: usize,
}

#[derive(Clone)]
pub struct FailoverCoordinator {
    store: Arc<CredentialStore>,
    exchanger: Exchanger,
    gate: RateGate,
    policy: DispatchPolicy,
}

impl FailoverCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        exchanger: Exchanger,
        gate: RateGate,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            exchanger,
            gate,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn exchanger(&self) -> &Exchanger {
        &self.exchanger
    }

    /// Run `call` against the current credential, failing over on rejection.
    ///
    /// `call` is invoked once per outbound try with a fresh `Attempt`. Each try
    /// passes the rate gate first and is bounded by the dispatch timeout.
    pub async fn dispatch<T, F, Fut>(&self, mut call: F) -> Result<Dispatched<T>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = CallOutcome<T>>,
    {
        let size = self.store.len();
        let mut last_failure = String::from("no attempt completed");

        for hop in 0..size {
            let index = self.select().await?;

            let bearer = match self.exchanger.exchange(index).await {
                Ok(bearer) => bearer,
                Err(Error::Exchange(e)) => {
                    last_failure = e.to_string();
                    self.report_failure(index, &Rejection::from_exchange(&e))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.call_with_retries(index, bearer, hop, &mut call).await {
                HopOutcome::Success(value) => {
                    if hop > 0 {
                        info!(credential = index, hops = hop, "request succeeded after failover");
                    }
                    return Ok(Dispatched {
                        value,
                        index,
                        hops: hop,
                    });
                }
                HopOutcome::Failed(rejection) => {
                    last_failure = rejection.body.message().to_string();
                    self.report_failure(index, &rejection).await?;
                }
            }
        }

        error!(attempts = size, last_failure = %last_failure, "failover hops exhausted");
        Err(Error::AllCredentialsExhausted {
            attempts: size,
            last_failure,
        })
    }

    async fn call_with_retries<T, F, Fut>(
        &self,
        index: usize,
        bearer: Bearer,
        hop: usize,
        call: &mut F,
    ) -> HopOutcome<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = CallOutcome<T>>,
    {
        let mut try_number = 0u32;
        loop {
            self.gate.wait().await;
            let attempt = Attempt {
                index,
                bearer: bearer.clone(),
                hop,
                try_number,
            };
            let (outcome, kind) =
                match tokio::time::timeout(self.policy.timeout, call(attempt)).await {
                    Ok(outcome) => (outcome, ErrorKind::Network),
                    Err(_) => (
                        CallOutcome::Transient(format!(
                            "upstream call timed out after {}s",
                            self.policy.timeout.as_secs()
                        )),
                        ErrorKind::Timeout,
                    ),
                };

            match outcome {
                CallOutcome::Success(value) => return HopOutcome::Success(value),
                CallOutcome::Rejected(rejection) => return HopOutcome::Failed(rejection),
                CallOutcome::Transient(message) if try_number < self.policy.retries => {
                    let delay = self.policy.backoff_for(try_number);
                    debug!(
                        credential = index,
                        try_number,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient upstream failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    try_number += 1;
                }
                CallOutcome::Transient(message) => {
                    warn!(
                        credential = index,
                        hop,
                        tries = try_number + 1,
                        error = %message,
                        "transient failure persisted, escalating"
                    );
                    return HopOutcome::Failed(Rejection::new(
                        kind,
                        UpstreamErrorBody::opaque(&message),
                    ));
                }
            }
        }
    }

    /// Current credential if usable, else commit the next candidate.
    async fn select(&self) -> Result<usize> {
        let mut state = self.store.lock().await;
        let current = state.current;
        if !state.is_error(current) {
            return Ok(current);
        }
        match state.next_candidate() {
            Some(next) => {
                info!(from = current, to = next, "current credential in error, advancing");
                state.current = next;
                Ok(next)
            }
            None => Err(exhausted(&state, current)),
        }
    }

    /// Mark `index` as `Error` and fail over if it is still current.
    ///
    /// Returns the index callers should use next. When `index` is no longer
    /// current another caller already switched, so the pointer is left alone.
    /// When no candidate remains the pointer stays put and
    /// `AllCredentialsExhausted` is returned.
    pub async fn report_failure(&self, index: usize, rejection: &Rejection) -> Result<usize> {
        self.store.check_index(index)?;
        let mut state = self.store.lock().await;
        HealthTracker::apply_rejection(&mut state, index, rejection);

        if state.current != index {
            debug!(
                credential = index,
                current = state.current,
                "failure on superseded credential, no switch"
            );
            return Ok(state.current);
        }

        match state.next_candidate() {
            Some(next) => {
                state.current = next;
                metrics::counter!("pool_failovers_total", "reason" => rejection.kind.label())
                    .increment(1);
                warn!(
                    from = index,
                    to = next,
                    reason = rejection.kind.label(),
                    "failed over to next credential"
                );
                Ok(next)
            }
            None => {
                error!(credential = index, "no healthy credential left to fail over to");
                Err(exhausted(&state, index))
            }
        }
    }

    /// Operator switch. Fails without touching state when the target is out
    /// of range or in `Error`.
    pub async fn switch_to(&self, index: usize) -> Result<()> {
        let size = self.store.len();
        if index >= size {
            return Err(Error::InvalidSwitchTarget {
                index,
                reason: format!("index out of range (pool size {size})"),
                last_error: None,
            });
        }

        let mut state = self.store.lock().await;
        if let Some(last_error) = state.slots[index].error.clone() {
            return Err(Error::InvalidSwitchTarget {
                index,
                reason: format!("credential is in error: {}", last_error.message),
                last_error: Some(Box::new(last_error)),
            });
        }

        let previous = state.current;
        state.current = index;
        metrics::counter!("pool_operator_switches_total").increment(1);
        info!(from = previous, to = index, "operator switched current credential");
        Ok(())
    }

    /// Operator heal: clear `Error` on `index`. Returns whether it was in
    /// `Error`.
    pub async fn reset(&self, index: usize) -> Result<bool> {
        self.store.check_index(index)?;
        let mut state = self.store.lock().await;
        Ok(HealthTracker::apply_reset(&mut state, index))
    }

    /// Obtain a bearer for the current credential, failing over on exchange
    /// failures. Used at startup so the first request does not pay for the
    /// exchange.
    pub async fn warm_up(&self) -> Result<usize> {
        for _ in 0..self.store.len() {
            let index = self.select().await?;
            match self.exchanger.exchange(index).await {
                Ok(_) => return Ok(index),
                Err(Error::Exchange(e)) => {
                    self.report_failure(index, &Rejection::from_exchange(&e))
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        let state = self.store.lock().await;
        Err(exhausted(&state, state.current))
    }
}

fn exhausted(state: &PoolState, index: usize) -> Error {
    let last_failure = state
        .slots
        .get(index)
        .and_then(|s| s.error.as_ref())
        .map(|e: &LastError| e.message.clone())
        .unwrap_or_else(|| String::from("every credential is in error"));
    Error::AllCredentialsExhausted {
        attempts: state.slots.len(),
        last_failure,
    }
}
