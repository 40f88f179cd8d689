//! Error types for pool operations

use copilot_auth::ExchangeError;

use crate::health::LastError;

/// Errors from pool operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("credential pool is empty: at least one refresh credential is required")]
    EmptyPool,

    #[error("credential index {index} out of range (pool size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("invalid rate gate delay: {0}")]
    InvalidDelay(String),

    #[error("token exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("cannot switch to credential {index}: {reason}")]
    InvalidSwitchTarget {
        index: usize,
        reason: String,
        last_error: Option<Box<LastError>>,
    },

    #[error("all credentials exhausted after {attempts} attempt(s): {last_failure}")]
    AllCredentialsExhausted { attempts: usize, last_failure: String },
}

impl Error {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Error::EmptyPool => "empty_pool",
            Error::IndexOutOfRange { .. } => "index_out_of_range",
            Error::InvalidDelay(_) => "invalid_delay",
            Error::Exchange(_) => "exchange",
            Error::InvalidSwitchTarget { .. } => "invalid_switch_target",
            Error::AllCredentialsExhausted { .. } => "all_credentials_exhausted",
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
