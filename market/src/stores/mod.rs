//! Persistence contracts and backends.
//!
//! Aggregates are stored as whole snapshots keyed by listing id. The
//! in-memory backend serves tests and the demo binary; the Postgres backend
//! sits behind the `postgres` feature.

use crate::error::Result;
use crate::notifications::Notification;
use crate::types::{CityId, Listing, ListingId, NotificationId, UserId};
use async_trait::async_trait;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Snapshot storage for listing aggregates.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Writes the full listing snapshot, inserting or replacing.
    async fn save(&self, listing: &Listing) -> Result<()>;

    /// Loads one listing by id.
    async fn find(&self, id: ListingId) -> Result<Option<Listing>>;

    /// Loads every stored listing. Used to hydrate the store at startup.
    async fn load_all(&self) -> Result<Vec<Listing>>;

    /// Completed listings owned by `owner`.
    async fn completed_by_owner(&self, owner: UserId) -> Result<Vec<Listing>>;

    /// Completed listings assigned to `claimant`.
    async fn completed_by_claimant(&self, claimant: UserId) -> Result<Vec<Listing>>;

    /// Completed listings in `city`.
    async fn completed_in_city(&self, city: CityId) -> Result<Vec<Listing>>;
}

/// Durable notification storage.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Appends one notification record.
    async fn append(&self, notification: Notification) -> Result<()>;

    /// The recipient's notifications, newest first, at most `limit`.
    async fn list_recent(&self, recipient: UserId, limit: usize) -> Result<Vec<Notification>>;

    /// Marks the given ids as read, but only those belonging to `recipient`.
    async fn mark_read(&self, recipient: UserId, ids: &[NotificationId]) -> Result<()>;
}
