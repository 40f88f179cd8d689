//! Bearer exchange with per-credential singleflight
//!
//! Any number of callers may ask for a bearer for the same credential at
//! once; at most one exchange request is in flight per credential and every
//! caller receives its result. The exchange runs in its own task, so a caller
//! that gives up does not cancel the exchange for the others.
//!
//! A cached bearer is only reused while `now < expires_at - safety_margin`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use copilot_auth::{Bearer, ExchangeError, TokenClient};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::CredentialStore;

/// Source of bearer tokens for a refresh credential.
///
/// Uses `Pin<Box<dyn Future>>` so the pool can hold an `Arc<dyn TokenSource>`.
pub trait TokenSource: Send + Sync {
    /// Perform one exchange. No retries, no timeout.
    fn exchange<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<Bearer>> + Send + 'a>>;
}

impl TokenSource for TokenClient {
    fn exchange<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<Bearer>> + Send + 'a>> {
        Box::pin(TokenClient::exchange(self, refresh))
    }
}

/// Timing knobs for token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangePolicy {
    /// Cached bearers expiring within this window are not reused
    pub safety_margin: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Local retries for transient failures
    pub max_retries: u32,
    /// Base delay, doubled on each retry
    pub backoff: Duration,
}

impl Default for ExchangePolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(300),
            timeout: Duration::from_secs(300),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl ExchangePolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

type SharedExchange = Shared<BoxFuture<'static, copilot_auth::Result<Bearer>>>;

/// Obtains bearers for credentials, caching them in the store.
#[derive(Clone)]
pub struct Exchanger {
    store: Arc<CredentialStore>,
    source: Arc<dyn TokenSource>,
    policy: ExchangePolicy,
    in_flight: Arc<Mutex<HashMap<usize, SharedExchange>>>,
}

impl Exchanger {
    pub fn new(
        store: Arc<CredentialStore>,
        source: Arc<dyn TokenSource>,
        policy: ExchangePolicy,
    ) -> Self {
        Self {
            store,
            source,
            policy,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bearer for credential `index`, from cache or a fresh exchange.
    ///
    /// Joins an exchange already in flight for the same credential instead of
    /// starting another. Failures are returned as `Error::Exchange`; marking
    /// the credential is left to the caller.
    pub async fn exchange(&self, index: usize) -> Result<Bearer> {
        self.store.check_index(index)?;

        let pending = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(bearer) = self
                .store
                .fresh_bearer(index, self.policy.safety_margin)
                .await
            {
                return Ok(bearer);
            }
            match in_flight.get(&index) {
                Some(pending) => {
                    debug!(credential = index, "joining in-flight exchange");
                    pending.clone()
                }
                None => {
                    let pending = self.start(index);
                    in_flight.insert(index, pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(Error::Exchange)
    }

    /// Number of exchanges currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Spawn the exchange task. Called with the in-flight lock held, so the
    /// task cannot deregister itself before it is registered.
    fn start(&self, index: usize) -> SharedExchange {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.exchange_with_retries(index).await;
            this.finish(index, &result).await;
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ExchangeError::NetworkError(format!(
                    "exchange task aborted: {e}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    async fn exchange_with_retries(&self, index: usize) -> copilot_auth::Result<Bearer> {
        let secret = self
            .store
            .secret(index)
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        let mut attempt = 0u32;
        loop {
            let outcome =
                tokio::time::timeout(self.policy.timeout, self.source.exchange(secret.expose()))
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout(self.policy.timeout)));

            match outcome {
                Ok(bearer) => {
                    info!(
                        credential = index,
                        expires_at = %bearer.expires_at,
                        "bearer exchanged"
                    );
                    return Ok(bearer);
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff_for(attempt);
                    warn!(
                        credential = index,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "exchange failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(credential = index, kind = e.kind().label(), error = %e, "exchange failed");
                    return Err(e);
                }
            }
        }
    }

    /// Publish the result and deregister. A credential that went to `Error`
    /// while the exchange ran does not get its cache repopulated.
    async fn finish(&self, index: usize, result: &copilot_auth::Result<Bearer>) {
        let mut in_flight = self.in_flight.lock().await;
        if let Ok(bearer) = result {
            let mut state = self.store.lock().await;
            if let Some(slot) = state.slots.get_mut(index)
                && slot.error.is_none()
            {
                slot.cached = Some(bearer.clone());
            }
        }
        in_flight.remove(&index);

        let label = match result {
            Ok(_) => "success",
            Err(e) => e.kind().label(),
        };
        metrics::counter!("pool_exchanges_total", "result" => label).increment(1);
    }
}
