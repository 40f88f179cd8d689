//! GitHub Copilot token exchange library
//!
//! Converts a long-lived GitHub OAuth refresh credential into a short-lived
//! Copilot bearer token and classifies token endpoint failures. This crate has
//! no notion of pools or failover; `copilot-pool` builds on it.
//!
//! Exchange flow:
//! 1. `TokenClient::exchange()` sends `Authorization: token <refresh>` to the
//!    token endpoint
//! 2. A 200 body becomes a `Bearer` with an absolute expiry
//! 3. Any other outcome becomes an `ExchangeError`, with the provider's error
//!    body parsed into an `UpstreamErrorBody`

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{
    ErrorKind, ExchangeError, Result, UpstreamErrorBody, classify_failure, mentions_rate_limit,
};
pub use token::{Bearer, TokenClient, TokenResponse};
