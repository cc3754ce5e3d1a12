//! Error taxonomy for the engine.
//!
//! Library code returns [`EngramError`]; the binary wraps everything in
//! `anyhow` at the top. Validation failures are caller mistakes, persistence
//! failures come from SQLite, and capability exhaustion means an external
//! provider stayed down through its whole retry budget.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngramError>;

#[derive(Debug, Error)]
pub enum EngramError {
    /// A caller-supplied value failed validation before touching storage.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// SQLite rejected or failed an operation.
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// An external capability failed every attempt its retry policy allowed.
    #[error("{capability} capability exhausted after {attempts} attempts: {source}")]
    CapabilityExhausted {
        capability: &'static str,
        attempts: u32,
        source: anyhow::Error,
    },

    /// An internal invariant or background task failed.
    #[error("{0}")]
    Task(String),
}

impl EngramError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for EngramError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(format!("background task failed: {err}"))
    }
}
