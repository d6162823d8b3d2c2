//! External collaborator contracts.
//!
//! Each trait abstracts a service the marketplace depends on but does not
//! own. Production wiring supplies real clients; tests use the mocks behind
//! the `test-utils` feature.

use crate::notifications::Notification;
use crate::types::{CityId, UserId};
use async_trait::async_trait;
use std::fmt;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    /// Which collaborator failed.
    pub provider: &'static str,
    /// Human-readable failure description.
    pub message: String,
}

impl ProviderError {
    /// Builds an error attributed to `provider`.
    pub fn new(provider: &'static str, message: impl fmt::Display) -> Self {
        Self {
            provider,
            message: message.to_string(),
        }
    }
}

/// Result alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Resolves free-text city names to canonical identifiers.
#[async_trait]
pub trait CityDirectory: Send + Sync {
    /// Resolves `name` to a city, creating the entry if it does not exist.
    /// Matching is case-insensitive on the trimmed name.
    async fn resolve_or_create(&self, name: &str) -> ProviderResult<CityId>;

    /// Looks up an existing city without creating it.
    async fn lookup(&self, name: &str) -> ProviderResult<Option<CityId>>;
}

/// Verdict from scanning an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    /// No threat detected.
    Clean,
    /// The upload is malicious and must be rejected.
    Infected,
}

/// Scans uploaded receipt images before they are stored.
#[async_trait]
pub trait MalwareScanner: Send + Sync {
    /// Scans `data` and returns a verdict. An `Err` means the scanner itself
    /// was unreachable, not that the upload is malicious.
    async fn scan(&self, data: &[u8]) -> ProviderResult<ScanVerdict>;
}

/// Sends transactional email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Sends an email to the given user.
    async fn send(&self, to: UserId, subject: &str, body: &str) -> ProviderResult<()>;
}

/// Pushes a notification to a user's live channel (websocket, mobile push).
///
/// Delivery is best-effort. Callers must treat failures as non-fatal; the
/// durable notification record is the source of truth.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Attempts to push `notification` to `recipient`.
    async fn push(&self, recipient: UserId, notification: &Notification) -> ProviderResult<()>;
}
