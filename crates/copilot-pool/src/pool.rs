//! Pool facade wiring store, exchanger, coordinator and status API

use std::sync::Arc;

use common::Secret;
use tracing::info;

use crate::error::Result;
use crate::exchanger::{ExchangePolicy, Exchanger, TokenSource};
use crate::failover::{DispatchPolicy, FailoverCoordinator};
use crate::rate_gate::RateGate;
use crate::status::StatusApi;
use crate::store::CredentialStore;

/// Everything needed to build a pool. Read once at startup.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub secrets: Vec<Secret<String>>,
    pub initial_index: usize,
    pub exchange: ExchangePolicy,
    pub dispatch: DispatchPolicy,
    pub gate: RateGate,
}

impl PoolConfig {
    pub fn new(secrets: Vec<Secret<String>>) -> Self {
        Self {
            secrets,
            initial_index: 0,
            exchange: ExchangePolicy::default(),
            dispatch: DispatchPolicy::default(),
            gate: RateGate::disabled(),
        }
    }
}

/// The credential pool. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    store: Arc<CredentialStore>,
    coordinator: FailoverCoordinator,
    status: StatusApi,
}

impl Pool {
    pub fn new(config: PoolConfig, source: Arc<dyn TokenSource>) -> Result<Self> {
        let store = Arc::new(CredentialStore::new(config.secrets, config.initial_index)?);
        let exchanger = Exchanger::new(store.clone(), source, config.exchange);
        let coordinator =
            FailoverCoordinator::new(store.clone(), exchanger, config.gate, config.dispatch);
        let status = StatusApi::new(coordinator.clone());

        info!(
            credentials = store.len(),
            current = config.initial_index,
            min_delay_ms = config.gate.min().as_millis() as u64,
            max_delay_ms = config.gate.max().as_millis() as u64,
            "credential pool ready"
        );
        Ok(Self {
            store,
            coordinator,
            status,
        })
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn exchanger(&self) -> &Exchanger {
        self.coordinator.exchanger()
    }

    pub fn coordinator(&self) -> &FailoverCoordinator {
        &self.coordinator
    }

    pub fn status(&self) -> &StatusApi {
        &self.status
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::failover::CallOutcome;
    use crate::testing::{MockSource, secrets};

    #[test]
    fn empty_config_fails() {
        let result = Pool::new(PoolConfig::new(vec![]), Arc::new(MockSource::new()));
        assert!(matches!(result.err(), Some(Error::EmptyPool)));
    }

    #[test]
    fn initial_index_must_be_in_range() {
        let config = PoolConfig {
            initial_index: 3,
            ..PoolConfig::new(secrets(&["a", "b"]))
        };
        let result = Pool::new(config, Arc::new(MockSource::new()));
        assert!(matches!(result.err(), Some(Error::IndexOutOfRange { index: 3, size: 2 })));
    }

    #[tokio::test]
    async fn dispatch_through_facade_uses_initial_credential() {
        let config = PoolConfig {
            initial_index: 1,
            ..PoolConfig::new(secrets(&["a", "b"]))
        };
        let pool = Pool::new(config, Arc::new(MockSource::new())).unwrap();
        assert_eq!(pool.len(), 2);

        let dispatched = pool
            .coordinator()
            .dispatch(|attempt| async move { CallOutcome::Success(attempt.bearer.token) })
            .await
            .unwrap();
        assert_eq!(dispatched.index, 1);
        assert_eq!(dispatched.value, "tid_b");
        assert!(pool.status().list().await[1].expiration.is_some());
    }
}
