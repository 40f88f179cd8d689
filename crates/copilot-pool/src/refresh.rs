//! Proactive background bearer refresh
//!
//! Periodically asks the exchanger for the current credential's bearer. The
//! exchanger only calls upstream when the cached bearer is inside the safety
//! margin, so most cycles are a cache hit. Runs independently of the request
//! path and shares the singleflight with it.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::failover::FailoverCoordinator;
use crate::health::Rejection;
use crate::store::CredentialStatus;

/// Spawn a background task that keeps the current bearer fresh.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    coordinator: FailoverCoordinator,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; startup warm-up just exchanged
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&coordinator).await;
        }
    })
}

/// One refresh cycle for the current credential.
///
/// A failed exchange marks the credential and fails over, exactly as on the
/// request path.
pub(crate) async fn refresh_cycle(coordinator: &FailoverCoordinator) {
    let store = coordinator.store();
    let index = store.current_index().await;
    if store.status(index).await.ok() == Some(CredentialStatus::Error) {
        debug!(credential = index, "current credential in error, skipping refresh");
        return;
    }

    match coordinator.exchanger().exchange(index).await {
        Ok(bearer) => {
            debug!(credential = index, expires_at = %bearer.expires_at, "bearer refresh check done");
        }
        Err(Error::Exchange(e)) => {
            warn!(credential = index, error = %e, "background refresh failed");
            if let Err(e) = coordinator
                .report_failure(index, &Rejection::from_exchange(&e))
                .await
            {
                warn!(error = %e, "background refresh could not fail over");
            }
        }
        Err(e) => warn!(credential = index, error = %e, "background refresh failed"),
    }
}
