//! Common types shared by the Copilot credential pool crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
