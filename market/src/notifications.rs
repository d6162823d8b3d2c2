//! Notification side-channel.
//!
//! Lifecycle events fan out to the affected counterparty as notifications.
//! Dispatch is durable-first: the record is appended to the store, then a
//! single push attempt goes out over the live channel. Push failures are
//! logged and swallowed; they never fail the triggering operation, and
//! there is no retry. The durable record is the source of truth.

use crate::providers::{ProviderResult, PushChannel};
use crate::stores::NotificationStore;
use crate::types::{ListingId, NotificationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A claimant applied for pickup on the recipient's listing.
    ApplicationReceived,
    /// The recipient's application was accepted by the owner.
    Accepted,
    /// The counterparty sent a chat message.
    ChatMessage,
    /// The owner set the meeting point.
    MeetingSet,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ApplicationReceived => "application_received",
            Self::Accepted => "accepted",
            Self::ChatMessage => "chat_message",
            Self::MeetingSet => "meeting_set",
        };
        f.write_str(s)
    }
}

/// A durable notification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier.
    pub id: NotificationId,
    /// Who the notification is for.
    pub recipient: UserId,
    /// The listing it concerns.
    pub listing_id: ListingId,
    /// What happened.
    pub kind: NotificationKind,
    /// Display text.
    pub message: String,
    /// When it was created.
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read it.
    pub read: bool,
}

impl Notification {
    /// Builds a fresh unread notification.
    #[must_use]
    pub fn new(
        recipient: UserId,
        listing_id: ListingId,
        kind: NotificationKind,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            recipient,
            listing_id,
            kind,
            message: message.into(),
            created_at,
            read: false,
        }
    }
}

/// Appends notifications durably and pushes them best-effort.
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    push: Arc<dyn PushChannel>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher over a store and a push channel.
    pub fn new(store: Arc<dyn NotificationStore>, push: Arc<dyn PushChannel>) -> Self {
        Self { store, push }
    }

    /// Dispatches one notification: durable append, then one push attempt.
    ///
    /// Returns an error only when the durable append fails. Push failures
    /// are downgraded to a warning.
    #[tracing::instrument(
        skip(self, notification),
        fields(
            recipient = %notification.recipient,
            listing_id = %notification.listing_id,
            kind = %notification.kind,
        )
    )]
    pub async fn dispatch(&self, notification: Notification) -> crate::error::Result<()> {
        self.store.append(notification.clone()).await?;

        if let Err(error) = self.push.push(notification.recipient, &notification).await {
            tracing::warn!(%error, "push delivery failed, durable record kept");
        }
        Ok(())
    }

    /// Returns the recipient's most recent notifications, newest first,
    /// capped at `limit`.
    pub async fn recent(
        &self,
        recipient: UserId,
        limit: usize,
    ) -> crate::error::Result<Vec<Notification>> {
        self.store.list_recent(recipient, limit).await
    }

    /// Marks the given notifications as read for `recipient`. Ids belonging
    /// to other users are ignored.
    pub async fn mark_read(
        &self,
        recipient: UserId,
        ids: &[NotificationId],
    ) -> crate::error::Result<()> {
        self.store.mark_read(recipient, ids).await
    }
}

/// Push channel that drops everything. Useful when no live channel exists.
pub struct NoopPushChannel;

#[async_trait::async_trait]
impl PushChannel for NoopPushChannel {
    async fn push(&self, _recipient: UserId, _notification: &Notification) -> ProviderResult<()> {
        Ok(())
    }
}
