//! Error taxonomy shared across the gantry crates.
//!
//! Not-found conditions are deliberately absent: lookups for unknown
//! ids return `Option`/`bool`, since callers routinely probe
//! optimistically.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation '{operation}' timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Tool failure: {0}")]
    ToolFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
