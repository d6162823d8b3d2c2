//! Error types for marketplace operations.
//!
//! The taxonomy separates caller-caused failures (validation, authorization,
//! state conflicts) from infrastructure failures. State conflicts are opaque
//! at this boundary: which guard failed is recorded in internal diagnostics
//! only, never echoed back to an untrusted caller.

use thiserror::Error;

/// Result type alias for marketplace operations.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Error taxonomy for the marketplace core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// The referenced listing does not exist.
    #[error("Listing not found")]
    NotFound,

    /// Malformed input. Safe to expose: it concerns the caller's own request.
    #[error("Invalid request: {reason}")]
    Validation {
        /// Human-readable reason.
        reason: String,
    },

    /// The caller lacks the role required for the operation. Deliberately
    /// generic: it does not reveal who does hold the role.
    #[error("Not permitted")]
    Forbidden,

    /// A lifecycle guard rejected the operation. Deliberately opaque: the
    /// failing precondition would reveal the aggregate's internal state to a
    /// caller who may not be a participant.
    #[error("The listing does not allow this operation right now")]
    Conflict,

    /// City name could not be resolved (city statistics only).
    #[error("Unknown city")]
    CityNotFound,

    /// Durable store failure. Retryable, server-side.
    #[error("Storage error: {0}")]
    Database(String),

    /// A collaborator service failed (scanner down, runtime unavailable).
    /// Retryable, server-side.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}

impl MarketError {
    /// Returns `true` if the failure was caused by the caller's request
    /// rather than by the system.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::Validation { .. }
                | Self::Forbidden
                | Self::Conflict
                | Self::CityNotFound
        )
    }

    /// Returns `true` if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Infrastructure(_))
    }
}
