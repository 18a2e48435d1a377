//! Typed errors for the places callers branch on the failure kind.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use thiserror::Error;

/// A site config is not usable for persistence or navigation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Page lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// Load polling exceeded its attempt budget
    #[error("page load timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// The page disappeared while we were waiting on it
    #[error("page was closed")]
    PageClosed,

    #[error("cancelled")]
    Cancelled,
}
