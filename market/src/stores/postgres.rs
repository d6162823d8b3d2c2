//! `PostgreSQL` backends behind the `postgres` feature.
//!
//! Listings are stored as one row per aggregate: hot query columns are
//! scalar, the embedded collections (items, applicants, meeting, receipt)
//! live in JSONB. Migrations are under `market/migrations/`.

use crate::error::{MarketError, Result};
use crate::notifications::{Notification, NotificationKind};
use crate::stores::{ListingRepository, NotificationStore};
use crate::types::{
    CityId, Item, Listing, ListingId, ListingStatus, MeetingPoint, Money, NotificationId, Receipt,
    UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn db_err(error: sqlx::Error) -> MarketError {
    MarketError::Database(error.to_string())
}

fn json_err(error: serde_json::Error) -> MarketError {
    MarketError::Database(error.to_string())
}

fn status_to_str(status: ListingStatus) -> &'static str {
    match status {
        ListingStatus::Created => "created",
        ListingStatus::PendingAcceptance => "pending_acceptance",
        ListingStatus::Accepted => "accepted",
        ListingStatus::Completed => "completed",
        ListingStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> Result<ListingStatus> {
    match s {
        "created" => Ok(ListingStatus::Created),
        "pending_acceptance" => Ok(ListingStatus::PendingAcceptance),
        "accepted" => Ok(ListingStatus::Accepted),
        "completed" => Ok(ListingStatus::Completed),
        "cancelled" => Ok(ListingStatus::Cancelled),
        other => Err(MarketError::Database(format!(
            "unknown listing status '{other}'"
        ))),
    }
}

/// Listing repository over a Postgres pool.
pub struct PostgresListingRepository {
    pool: PgPool,
}

impl PostgresListingRepository {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn completed_where(&self, clause: &str, param: Uuid) -> Result<Vec<Listing>> {
        let sql = format!(
            "SELECT * FROM listings WHERE status = 'completed' AND {clause} = $1"
        );
        let rows = sqlx::query(&sql)
            .bind(param)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_listing).collect()
    }
}

fn row_to_listing(row: &PgRow) -> Result<Listing> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let items: serde_json::Value = row.try_get("items").map_err(db_err)?;
    let applicants: serde_json::Value = row.try_get("applicants").map_err(db_err)?;
    let meeting: Option<serde_json::Value> = row.try_get("meeting").map_err(db_err)?;
    let receipt: Option<serde_json::Value> = row.try_get("receipt").map_err(db_err)?;

    Ok(Listing {
        id: ListingId::from_uuid(row.try_get("id").map_err(db_err)?),
        owner: UserId::from_uuid(row.try_get("owner_id").map_err(db_err)?),
        title: row.try_get("title").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        estimated_value: row
            .try_get::<Option<i64>, _>("estimated_value_cents")
            .map_err(db_err)?
            .map(Money::from_cents),
        available_from: row.try_get("available_from").map_err(db_err)?,
        available_to: row.try_get("available_to").map_err(db_err)?,
        city: CityId::from_uuid(row.try_get("city_id").map_err(db_err)?),
        active: row.try_get("active").map_err(db_err)?,
        status: status_from_str(&status)?,
        assigned_claimant: row
            .try_get::<Option<Uuid>, _>("assigned_claimant")
            .map_err(db_err)?
            .map(UserId::from_uuid),
        accepted_at: row.try_get("accepted_at").map_err(db_err)?,
        chat_id: row
            .try_get::<Option<Uuid>, _>("chat_id")
            .map_err(db_err)?
            .map(crate::types::ChatId::from_uuid),
        meeting: meeting
            .map(serde_json::from_value::<MeetingPoint>)
            .transpose()
            .map_err(json_err)?,
        receipt: receipt
            .map(serde_json::from_value::<Receipt>)
            .transpose()
            .map_err(json_err)?,
        verified_amount: row
            .try_get::<Option<i64>, _>("verified_amount_cents")
            .map_err(db_err)?
            .map(Money::from_cents),
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        revision: u64::try_from(row.try_get::<i64, _>("revision").map_err(db_err)?)
            .unwrap_or_default(),
        items: serde_json::from_value::<Vec<Item>>(items).map_err(json_err)?,
        applicants: serde_json::from_value(applicants).map_err(json_err)?,
    })
}

#[async_trait]
impl ListingRepository for PostgresListingRepository {
    async fn save(&self, listing: &Listing) -> Result<()> {
        let items = serde_json::to_value(&listing.items).map_err(json_err)?;
        let applicants = serde_json::to_value(&listing.applicants).map_err(json_err)?;
        let meeting = listing
            .meeting
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_err)?;
        let receipt = listing
            .receipt
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_err)?;

        sqlx::query(
            r"
            INSERT INTO listings (
                id, owner_id, title, description, estimated_value_cents,
                available_from, available_to, city_id, active, status,
                assigned_claimant, accepted_at, chat_id, meeting, receipt,
                verified_amount_cents, completed_at, created_at, revision,
                items, applicants
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                estimated_value_cents = EXCLUDED.estimated_value_cents,
                available_from = EXCLUDED.available_from,
                available_to = EXCLUDED.available_to,
                city_id = EXCLUDED.city_id,
                active = EXCLUDED.active,
                status = EXCLUDED.status,
                assigned_claimant = EXCLUDED.assigned_claimant,
                accepted_at = EXCLUDED.accepted_at,
                chat_id = EXCLUDED.chat_id,
                meeting = EXCLUDED.meeting,
                receipt = EXCLUDED.receipt,
                verified_amount_cents = EXCLUDED.verified_amount_cents,
                completed_at = EXCLUDED.completed_at,
                revision = EXCLUDED.revision,
                items = EXCLUDED.items,
                applicants = EXCLUDED.applicants
            WHERE listings.revision <= EXCLUDED.revision
            ",
        )
        .bind(*listing.id.as_uuid())
        .bind(*listing.owner.as_uuid())
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.estimated_value.map(|m| m.cents()))
        .bind(listing.available_from)
        .bind(listing.available_to)
        .bind(*listing.city.as_uuid())
        .bind(listing.active)
        .bind(status_to_str(listing.status))
        .bind(listing.assigned_claimant.map(|u| *u.as_uuid()))
        .bind(listing.accepted_at)
        .bind(listing.chat_id.map(|c| *c.as_uuid()))
        .bind(meeting)
        .bind(receipt)
        .bind(listing.verified_amount.map(|m| m.cents()))
        .bind(listing.completed_at)
        .bind(listing.created_at)
        .bind(i64::try_from(listing.revision).unwrap_or(i64::MAX))
        .bind(items)
        .bind(applicants)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn find(&self, id: ListingId) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_listing).transpose()
    }

    async fn load_all(&self) -> Result<Vec<Listing>> {
        let rows = sqlx::query("SELECT * FROM listings")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_listing).collect()
    }

    async fn completed_by_owner(&self, owner: UserId) -> Result<Vec<Listing>> {
        self.completed_where("owner_id", *owner.as_uuid()).await
    }

    async fn completed_by_claimant(&self, claimant: UserId) -> Result<Vec<Listing>> {
        self.completed_where("assigned_claimant", *claimant.as_uuid())
            .await
    }

    async fn completed_in_city(&self, city: CityId) -> Result<Vec<Listing>> {
        self.completed_where("city_id", *city.as_uuid()).await
    }
}

/// Notification store over a Postgres pool.
pub struct PostgresNotificationStore {
    pool: PgPool,
}

impl PostgresNotificationStore {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn kind_to_str(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::ApplicationReceived => "application_received",
        NotificationKind::Accepted => "accepted",
        NotificationKind::ChatMessage => "chat_message",
        NotificationKind::MeetingSet => "meeting_set",
    }
}

fn kind_from_str(s: &str) -> Result<NotificationKind> {
    match s {
        "application_received" => Ok(NotificationKind::ApplicationReceived),
        "accepted" => Ok(NotificationKind::Accepted),
        "chat_message" => Ok(NotificationKind::ChatMessage),
        "meeting_set" => Ok(NotificationKind::MeetingSet),
        other => Err(MarketError::Database(format!(
            "unknown notification kind '{other}'"
        ))),
    }
}

fn row_to_notification(row: &PgRow) -> Result<Notification> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;
    Ok(Notification {
        id: NotificationId::from_uuid(row.try_get("id").map_err(db_err)?),
        recipient: UserId::from_uuid(row.try_get("recipient").map_err(db_err)?),
        listing_id: ListingId::from_uuid(row.try_get("listing_id").map_err(db_err)?),
        kind: kind_from_str(&kind)?,
        message: row.try_get("message").map_err(db_err)?,
        created_at,
        read: row.try_get("read").map_err(db_err)?,
    })
}

#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    async fn append(&self, notification: Notification) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO notifications (id, recipient, listing_id, kind, message, created_at, read)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(*notification.id.as_uuid())
        .bind(*notification.recipient.as_uuid())
        .bind(*notification.listing_id.as_uuid())
        .bind(kind_to_str(notification.kind))
        .bind(&notification.message)
        .bind(notification.created_at)
        .bind(notification.read)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_recent(&self, recipient: UserId, limit: usize) -> Result<Vec<Notification>> {
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query(
            r"
            SELECT * FROM notifications
            WHERE recipient = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(*recipient.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_notification).collect()
    }

    async fn mark_read(&self, recipient: UserId, ids: &[NotificationId]) -> Result<()> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query(
            "UPDATE notifications SET read = TRUE WHERE recipient = $1 AND id = ANY($2)",
        )
        .bind(*recipient.as_uuid())
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
