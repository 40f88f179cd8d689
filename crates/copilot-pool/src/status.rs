//! Read-only credential snapshots and operator actions
//!
//! Views never carry the refresh credential; `id` is a short prefix only.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::failover::FailoverCoordinator;
use crate::health::LastError;
use crate::store::{CredentialStatus, PoolState};

/// One credential as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialView {
    pub id: String,
    pub index: usize,
    pub status: CredentialStatus,
    pub is_current: bool,
    /// Expiry of the cached bearer; `None` until one has been exchanged
    pub expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<LastError>,
}

/// Overall pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    /// No credential in error
    Healthy,
    /// Some credentials in error, current still usable
    Degraded,
    /// Every credential in error
    Unhealthy,
}

impl PoolHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub status: PoolHealth,
    pub total: usize,
    pub errored: usize,
    pub current: usize,
}

#[derive(Clone)]
pub struct StatusApi {
    coordinator: FailoverCoordinator,
}

impl StatusApi {
    pub fn new(coordinator: FailoverCoordinator) -> Self {
        Self { coordinator }
    }

    /// Snapshot of every credential, taken under one lock acquisition.
    pub async fn list(&self) -> Vec<CredentialView> {
        let state = self.coordinator.store().lock().await;
        (0..state.slots.len())
            .map(|index| self.view(&state, index))
            .collect()
    }

    pub async fn get(&self, index: usize) -> Result<CredentialView> {
        self.coordinator.store().check_index(index)?;
        let state = self.coordinator.store().lock().await;
        Ok(self.view(&state, index))
    }

    /// Make `index` current. Returns the updated view of that credential.
    pub async fn switch_to(&self, index: usize) -> Result<CredentialView> {
        self.coordinator.switch_to(index).await?;
        self.get(index).await
    }

    /// Clear `Error` on `index`. Returns the updated view.
    pub async fn reset(&self, index: usize) -> Result<CredentialView> {
        self.coordinator.reset(index).await?;
        self.get(index).await
    }

    pub async fn summary(&self) -> PoolSummary {
        let state = self.coordinator.store().lock().await;
        let total = state.slots.len();
        let errored = state.error_count();
        let status = if errored == 0 {
            PoolHealth::Healthy
        } else if state.is_exhausted() {
            PoolHealth::Unhealthy
        } else {
            PoolHealth::Degraded
        };
        PoolSummary {
            status,
            total,
            errored,
            current: state.current,
        }
    }

    fn view(&self, state: &PoolState, index: usize) -> CredentialView {
        let slot = &state.slots[index];
        CredentialView {
            id: self.coordinator.store().public_id(index).unwrap_or_default(),
            index,
            status: state.status(index),
            is_current: index == state.current,
            expiration: slot.cached.as_ref().map(|b| b.expires_at),
            error_message: slot.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::{cached_bearer, test_coordinator, test_rejection};
    use copilot_auth::ErrorKind;

    #[tokio::test]
    async fn list_reports_exactly_one_current_after_switch() {
        let api = StatusApi::new(test_coordinator(&["gho_aaaaaaaaaa", "gho_bbbbbbbbbb", "gho_cccccccccc"]));

        let view = api.switch_to(2).await.unwrap();
        assert!(view.is_current);
        assert_eq!(view.status, CredentialStatus::Active);

        let list = api.list().await;
        assert_eq!(list.len(), 3);
        let current: Vec<usize> = list.iter().filter(|v| v.is_current).map(|v| v.index).collect();
        assert_eq!(current, vec![2]);
        assert_eq!(list[0].status, CredentialStatus::Inactive);
    }

    #[tokio::test]
    async fn list_after_rate_limit_failover() {
        let coordinator = test_coordinator(&["gho_A", "gho_B", "gho_C"]);
        let api = StatusApi::new(coordinator.clone());
        coordinator
            .report_failure(0, &test_rejection(ErrorKind::RateLimited, Some("https://x")))
            .await
            .unwrap();

        let list = api.list().await;
        assert_eq!(list[0].status, CredentialStatus::Error);
        assert_eq!(
            list[0].error_message.as_ref().and_then(|e| e.url.as_deref()),
            Some("https://x")
        );
        assert!(list[1].is_current);
        assert!(!list[0].is_current);
    }

    #[tokio::test]
    async fn views_never_contain_raw_secret() {
        let secret = "gho_supersecretvalue1234";
        let coordinator = test_coordinator(&[secret]);
        coordinator.store().lock().await.slots[0].cached = Some(cached_bearer("tid", 600));
        let api = StatusApi::new(coordinator);

        let json = serde_json::to_string(&api.list().await).unwrap();
        assert!(!json.contains(secret));
        assert!(json.contains("gho_supe..."));
        assert!(json.contains("\"expiration\":\""));
        assert!(!json.contains("error_message"));
    }

    #[tokio::test]
    async fn switch_to_error_credential_is_rejected() {
        let coordinator = test_coordinator(&["a", "b"]);
        let api = StatusApi::new(coordinator.clone());
        coordinator
            .report_failure(1, &test_rejection(ErrorKind::Revoked, None))
            .await
            .unwrap();

        assert!(matches!(
            api.switch_to(1).await,
            Err(Error::InvalidSwitchTarget { index: 1, .. })
        ));
        assert!(api.get(0).await.unwrap().is_current);
    }

    #[tokio::test]
    async fn summary_tracks_pool_health() {
        let coordinator = test_coordinator(&["a", "b"]);
        let api = StatusApi::new(coordinator.clone());
        assert_eq!(api.summary().await.status, PoolHealth::Healthy);

        coordinator
            .report_failure(0, &test_rejection(ErrorKind::Unauthorized, None))
            .await
            .unwrap();
        let summary = api.summary().await;
        assert_eq!(summary.status, PoolHealth::Degraded);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.current, 1);

        let _ = coordinator
            .report_failure(1, &test_rejection(ErrorKind::Unauthorized, None))
            .await;
        assert_eq!(api.summary().await.status, PoolHealth::Unhealthy);

        let view = api.reset(0).await.unwrap();
        assert_eq!(view.status, CredentialStatus::Inactive);
        assert_eq!(api.summary().await.status, PoolHealth::Degraded);
    }
}
