//! In-memory backends for tests and demos.

use crate::error::Result;
use crate::notifications::Notification;
use crate::stores::{ListingRepository, NotificationStore};
use crate::types::{CityId, Listing, ListingId, ListingStatus, NotificationId, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Listing repository backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryListingRepository {
    listings: RwLock<HashMap<ListingId, Listing>>,
}

impl InMemoryListingRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn completed_where<F>(&self, predicate: F) -> Vec<Listing>
    where
        F: Fn(&Listing) -> bool,
    {
        self.listings
            .read()
            .await
            .values()
            .filter(|l| l.status == ListingStatus::Completed && predicate(l))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ListingRepository for InMemoryListingRepository {
    async fn save(&self, listing: &Listing) -> Result<()> {
        let mut guard = self.listings.write().await;
        // A best-effort re-save may land after a newer snapshot was
        // already written. Stale writes are dropped, not applied.
        if let Some(existing) = guard.get(&listing.id) {
            if existing.revision > listing.revision {
                return Ok(());
            }
        }
        guard.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn find(&self, id: ListingId) -> Result<Option<Listing>> {
        Ok(self.listings.read().await.get(&id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<Listing>> {
        Ok(self.listings.read().await.values().cloned().collect())
    }

    async fn completed_by_owner(&self, owner: UserId) -> Result<Vec<Listing>> {
        Ok(self.completed_where(|l| l.owner == owner).await)
    }

    async fn completed_by_claimant(&self, claimant: UserId) -> Result<Vec<Listing>> {
        Ok(self
            .completed_where(|l| l.assigned_claimant == Some(claimant))
            .await)
    }

    async fn completed_in_city(&self, city: CityId) -> Result<Vec<Listing>> {
        Ok(self.completed_where(|l| l.city == city).await)
    }
}

/// Notification store backed by a `Vec` per recipient.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    notifications: RwLock<Vec<Notification>>,
}

impl InMemoryNotificationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn append(&self, notification: Notification) -> Result<()> {
        self.notifications.write().await.push(notification);
        Ok(())
    }

    async fn list_recent(&self, recipient: UserId, limit: usize) -> Result<Vec<Notification>> {
        let mut own: Vec<Notification> = self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect();
        own.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        own.truncate(limit);
        Ok(own)
    }

    async fn mark_read(&self, recipient: UserId, ids: &[NotificationId]) -> Result<()> {
        let mut guard = self.notifications.write().await;
        for n in guard.iter_mut() {
            if n.recipient == recipient && ids.contains(&n.id) {
                n.read = true;
            }
        }
        Ok(())
    }
}
