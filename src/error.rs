//! Error types for the tier cache

use thiserror::Error;

use crate::cache::{TierFailure, TierKind};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tier cache
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid caller input (key, TTL, tag)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A networked or durable tier could not be reached or rejected a command
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: TierKind, reason: String },

    /// Value could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// One or more tiers failed during a fan-out operation
    #[error("{} tier(s) failed: {}", .failures.len(), summarize(.failures))]
    PartialFailure { failures: Vec<TierFailure> },

    /// Invalidation transport failure
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// Build a `TierUnavailable` error from any displayable cause.
    pub fn tier(tier: TierKind, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    /// True for errors raised before any tier was touched.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

fn summarize(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.tier, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_display() {
        let err = Error::PartialFailure {
            failures: vec![TierFailure {
                tier: TierKind::Networked,
                reason: "connection refused".into(),
            }],
        };
        assert_eq!(
            err.to_string(),
            "1 tier(s) failed: networked (connection refused)"
        );
    }

    #[test]
    fn test_tier_helper() {
        let err = Error::tier(TierKind::Durable, "pool timed out");
        assert_eq!(err.to_string(), "Tier durable unavailable: pool timed out");
        assert!(!err.is_validation());
    }
}
