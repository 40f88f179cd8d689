//! Credential pool and failover coordinator for the Copilot completion API
//!
//! Holds an ordered set of long-lived refresh credentials, exchanges them for
//! short-lived bearers, and keeps exactly one credential current. Requests are
//! dispatched with the current credential and fail over to the next healthy
//! one when the upstream rejects it.
//!
//! Credential lifecycle:
//! 1. Configured at startup; the first current credential is `Active`
//! 2. `Exchanger` obtains a bearer (singleflight per credential, cached until
//!    the safety margin)
//! 3. Upstream 401/403/429 or a non-transient exchange failure → `Error`,
//!    `lastError` recorded, `FailoverCoordinator` commits the next candidate
//! 4. `Error` is sticky until an operator reset
//! 5. Background task keeps the current bearer fresh

pub mod error;
pub mod exchanger;
pub mod failover;
pub mod health;
pub mod pool;
pub mod rate_gate;
pub mod refresh;
pub mod status;
pub mod store;

pub use error::{Error, Result};
pub use exchanger::{ExchangePolicy, Exchanger, TokenSource};
pub use failover::{Attempt, CallOutcome, DispatchPolicy, Dispatched, FailoverCoordinator};
pub use health::{LastError, Rejection, Verdict, classify_response};
pub use pool::{Pool, PoolConfig};
pub use rate_gate::RateGate;
pub use refresh::spawn_refresh_task;
pub use status::{CredentialView, PoolHealth, PoolSummary, StatusApi};
pub use store::{CredentialStatus, CredentialStore};
