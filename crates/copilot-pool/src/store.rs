//! Credential store: configured refresh credentials plus the current pointer
//!
//! The secrets are fixed at construction and never change. Everything that
//! does change (current index, per-credential error, cached bearer) sits in a
//! single `PoolState` behind one pool-wide lock. Only the exchanger, the health
//! tracker and the failover coordinator take that lock for writing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use copilot_auth::Bearer;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::{Error, Result};
use crate::health::LastError;

/// Externally visible status of a credential.
///
/// `Error` is sticky: only an explicit operator reset clears it. Of the
/// remaining credentials exactly the current one is `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CredentialStatus {
    Active,
    Inactive,
    Error,
}

/// Mutable runtime state of one credential slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct Slot {
    pub cached: Option<Bearer>,
    /// `Some` marks the credential as `Error`.
    pub error: Option<LastError>,
}

/// Everything guarded by the pool-wide lock.
#[derive(Debug)]
pub(crate) struct PoolState {
    pub current: usize,
    pub slots: Vec<Slot>,
}

impl PoolState {
    pub fn is_error(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.error.is_some())
    }

    pub fn status(&self, index: usize) -> CredentialStatus {
        if self.is_error(index) {
            CredentialStatus::Error
        } else if index == self.current {
            CredentialStatus::Active
        } else {
            CredentialStatus::Inactive
        }
    }

    /// Next failover target after the current credential.
    ///
    /// Scans forward from `current + 1`, then wraps to 0, skipping every
    /// credential in `Error`. The current credential itself is never returned.
    pub fn next_candidate(&self) -> Option<usize> {
        let n = self.slots.len();
        (self.current + 1..n)
            .chain(0..self.current)
            .find(|&i| !self.is_error(i))
    }

    pub fn error_count(&self) -> usize {
        self.slots.iter().filter(|s| s.error.is_some()).count()
    }

    /// True when no credential is usable.
    pub fn is_exhausted(&self) -> bool {
        self.error_count() == self.slots.len()
    }
}

/// Ordered, immutable set of refresh credentials with shared runtime state.
pub struct CredentialStore {
    secrets: Vec<Secret<String>>,
    state: Mutex<PoolState>,
}

impl CredentialStore {
    /// Build the store. Fails if `secrets` is empty or `initial_index` is out
    /// of range.
    pub fn new(secrets: Vec<Secret<String>>, initial_index: usize) -> Result<Self> {
        if secrets.is_empty() {
            return Err(Error::EmptyPool);
        }
        if initial_index >= secrets.len() {
            return Err(Error::IndexOutOfRange {
                index: initial_index,
                size: secrets.len(),
            });
        }
        info!(
            credentials = secrets.len(),
            current = initial_index,
            "credential store initialized"
        );
        let slots = vec![Slot::default(); secrets.len()];
        Ok(Self {
            secrets,
            state: Mutex::new(PoolState {
                current: initial_index,
                slots,
            }),
        })
    }

    /// Number of configured credentials (fixed for the process lifetime).
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Always false: construction rejects an empty pool.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        if index < self.secrets.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                index,
                size: self.secrets.len(),
            })
        }
    }

    /// Raw refresh credential. Stays inside the pool crate.
    pub(crate) fn secret(&self, index: usize) -> Result<&Secret<String>> {
        self.check_index(index)?;
        Ok(&self.secrets[index])
    }

    /// Public identifier derived from the secret prefix.
    pub fn public_id(&self, index: usize) -> Option<String> {
        self.secrets.get(index).map(Secret::preview)
    }

    pub async fn current_index(&self) -> usize {
        self.state.lock().await.current
    }

    pub async fn status(&self, index: usize) -> Result<CredentialStatus> {
        self.check_index(index)?;
        Ok(self.state.lock().await.status(index))
    }

    pub async fn last_error(&self, index: usize) -> Option<LastError> {
        self.state
            .lock()
            .await
            .slots
            .get(index)
            .and_then(|s| s.error.clone())
    }

    /// Cached bearer for `index` if it is still trusted under `margin`.
    pub async fn fresh_bearer(&self, index: usize, margin: Duration) -> Option<Bearer> {
        let state = self.state.lock().await;
        state
            .slots
            .get(index)
            .and_then(|s| s.cached.as_ref())
            .filter(|b| b.is_fresh(margin))
            .cloned()
    }

    /// Expiry of the cached bearer, trusted or not.
    pub async fn bearer_expiry(&self, index: usize) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .slots
            .get(index)
            .and_then(|s| s.cached.as_ref())
            .map(|b| b.expires_at)
    }

    /// Acquire the pool-wide lock.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().await
    }
}
