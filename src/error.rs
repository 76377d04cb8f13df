//! Crate-wide error taxonomy.
//!
//! Configuration mistakes (bad route paths, conflicting tree structure) are
//! programmer errors and panic at registration time; they never appear here.
//! [`Error`] covers the per-request recoverable failures that final handlers
//! and renderers can produce.

use thiserror::Error;

use crate::bind::BindError;

/// A recoverable per-request error.
///
/// Returned by final handlers and forwarded to the engine's error hook (or
/// the default 500 renderer when no hook is configured). It never crosses
/// request boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binding failed: {0}")]
    Bind(#[from] BindError),

    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Builds an ad-hoc handler error from a display string.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}
