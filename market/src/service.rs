//! The marketplace service facade.
//!
//! One method per user-facing operation. Commands go through the store and
//! block until the matching `Persisted` or `Rejected` outcome comes back, so
//! a successful return means the write is durable. Read paths go straight to
//! the in-memory state or the repository.

use crate::aggregates::{ListingAction, ListingReducer, MarketState};
use crate::environment::ListingEnvironment;
use crate::error::{MarketError, Result};
use crate::notifications::Notification;
use crate::providers::{CityDirectory, MalwareScanner, ScanVerdict};
use crate::registry;
use crate::stats::{CityStats, ClaimantStats, DonorStats, StatsAggregator};
use crate::types::{
    Applicant, ChatId, CommandId, Item, Listing, ListingId, MeetingPoint, Money, NotificationId,
    Receipt, UserId,
};
use chrono::{DateTime, Utc};
use repant_runtime::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Store specialization for the listing aggregate.
pub type MarketStore = Store<MarketState, ListingAction, ListingEnvironment, ListingReducer>;

/// Input for publishing a listing.
#[derive(Debug, Clone)]
pub struct NewListing {
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Declared items.
    pub items: Vec<Item>,
    /// Start of the pickup window.
    pub available_from: DateTime<Utc>,
    /// End of the pickup window.
    pub available_to: DateTime<Utc>,
    /// Free-text city name, resolved against the directory.
    pub city: String,
}

/// Input for a receipt upload.
#[derive(Debug, Clone)]
pub struct ReceiptUpload {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// MIME content type.
    pub content_type: String,
    /// Original filename.
    pub filename: String,
    /// Amount the claimant reports having received.
    pub reported_amount: Money,
}

/// The marketplace entry point.
pub struct MarketplaceService {
    store: MarketStore,
    env: ListingEnvironment,
    stats: StatsAggregator,
    cities: Arc<dyn CityDirectory>,
    scanner: Arc<dyn MalwareScanner>,
}

impl MarketplaceService {
    /// Builds the service, hydrating in-memory state from stored snapshots.
    ///
    /// # Errors
    ///
    /// Returns a storage error when snapshot loading fails.
    pub async fn new(
        env: ListingEnvironment,
        cities: Arc<dyn CityDirectory>,
        scanner: Arc<dyn MalwareScanner>,
    ) -> Result<Self> {
        let snapshots = env.listings.load_all().await?;
        tracing::info!(listings = snapshots.len(), "hydrated marketplace state");
        let state = MarketState::hydrate(snapshots);
        // Every outcome is broadcast to every waiter; a roomy buffer keeps
        // slow observers from lagging past their own outcome.
        let store = Store::with_broadcast_capacity(state, ListingReducer::new(), env.clone(), 256);
        let stats = StatsAggregator::new(env.listings.clone(), cities.clone(), env.config.clone());
        Ok(Self {
            store,
            env,
            stats,
            cities,
            scanner,
        })
    }

    /// The underlying store, for observers that want the raw action feed.
    #[must_use]
    pub fn store(&self) -> &MarketStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Publishes a new listing and returns its id.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad draft, `Infrastructure` when the city
    /// directory is unreachable.
    #[tracing::instrument(skip(self, draft), fields(owner = %owner))]
    pub async fn create_listing(&self, owner: UserId, draft: NewListing) -> Result<ListingId> {
        let city = self
            .cities
            .resolve_or_create(&draft.city)
            .await
            .map_err(|e| MarketError::Infrastructure(e.to_string()))?;

        let listing_id = ListingId::new();
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::Create {
                listing_id,
                command_id,
                owner,
                title: draft.title,
                description: draft.description,
                items: draft.items,
                available_from: draft.available_from,
                available_to: draft.available_to,
                city,
            },
        )
        .await?;
        Ok(listing_id)
    }

    /// A claimant applies for pickup. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Conflict` when the pool is closed, `Validation` for a
    /// self-application.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id, claimant = %claimant))]
    pub async fn request_pickup(&self, listing_id: ListingId, claimant: UserId) -> Result<()> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::RequestPickup {
                listing_id,
                command_id,
                claimant,
            },
        )
        .await
    }

    /// The owner accepts one applicant.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-owners, `Conflict` when the listing is not
    /// pending or the applicant is unknown.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id))]
    pub async fn accept_claimant(
        &self,
        listing_id: ListingId,
        caller: UserId,
        chosen: UserId,
    ) -> Result<()> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::AcceptPickup {
                listing_id,
                command_id,
                caller,
                chosen,
            },
        )
        .await
    }

    /// Opens (or returns) the chat session between the two parties.
    ///
    /// # Errors
    ///
    /// `Forbidden` for outsiders, `Conflict` before acceptance.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id))]
    pub async fn start_chat(&self, listing_id: ListingId, caller: UserId) -> Result<ChatId> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::StartChat {
                listing_id,
                command_id,
                caller,
                chat_id: ChatId::new(),
            },
        )
        .await?;

        self.store
            .state(|s| s.get(&listing_id).and_then(|l| l.chat_id))
            .await
            .ok_or(MarketError::NotFound)
    }

    /// Sends a chat message; the counterparty is notified.
    ///
    /// # Errors
    ///
    /// `Forbidden` for outsiders, `Conflict` before the chat exists,
    /// `Validation` for an empty message.
    #[tracing::instrument(skip(self, body), fields(listing_id = %listing_id))]
    pub async fn send_chat_message(
        &self,
        listing_id: ListingId,
        sender: UserId,
        body: String,
    ) -> Result<()> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::SendChatMessage {
                listing_id,
                command_id,
                sender,
                body,
            },
        )
        .await
    }

    /// The owner fixes the meeting point. Returns the normalized coordinates.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-owners, `Validation` for out-of-range
    /// coordinates, `Conflict` before the chat exists.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id))]
    pub async fn set_meeting_point(
        &self,
        listing_id: ListingId,
        caller: UserId,
        latitude: f64,
        longitude: f64,
    ) -> Result<MeetingPoint> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::SetMeetingPoint {
                listing_id,
                command_id,
                caller,
                latitude,
                longitude,
            },
        )
        .await?;

        self.store
            .state(|s| s.get(&listing_id).and_then(|l| l.meeting))
            .await
            .ok_or(MarketError::NotFound)
    }

    /// The owner confirms the handover; the listing completes.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-owners, `Conflict` until chat and meeting point
    /// exist.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id))]
    pub async fn confirm_pickup(&self, listing_id: ListingId, caller: UserId) -> Result<()> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::ConfirmPickup {
                listing_id,
                command_id,
                caller,
            },
        )
        .await
    }

    /// The claimant uploads the redemption receipt. The upload is scanned
    /// before anything is stored; re-uploads overwrite.
    ///
    /// # Errors
    ///
    /// `Validation` when the scan flags the upload, `Infrastructure` when
    /// the scanner is unreachable, `Forbidden` for anyone but the assigned
    /// claimant.
    #[tracing::instrument(skip(self, upload), fields(listing_id = %listing_id))]
    pub async fn submit_receipt(
        &self,
        listing_id: ListingId,
        caller: UserId,
        upload: ReceiptUpload,
    ) -> Result<()> {
        let verdict = self
            .scanner
            .scan(&upload.data)
            .await
            .map_err(|e| MarketError::Infrastructure(e.to_string()))?;
        if verdict == ScanVerdict::Infected {
            tracing::warn!(%listing_id, filename = %upload.filename, "malicious receipt upload rejected");
            return Err(MarketError::Validation {
                reason: "Uploaded file failed the malware scan".to_string(),
            });
        }

        let receipt = Receipt {
            data: upload.data,
            content_type: upload.content_type,
            filename: upload.filename,
            reported_amount: upload.reported_amount,
            submitted_at: self.env.clock.now(),
        };
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::SubmitReceipt {
                listing_id,
                command_id,
                caller,
                receipt,
            },
        )
        .await
    }

    /// The owner confirms the redeemed amount.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-owners, `Conflict` before a receipt exists.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id))]
    pub async fn verify_outcome(
        &self,
        listing_id: ListingId,
        caller: UserId,
        amount: Money,
    ) -> Result<()> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::VerifyOutcome {
                listing_id,
                command_id,
                caller,
                amount,
            },
        )
        .await
    }

    /// The owner withdraws the listing.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-owners, `Conflict` once terminal.
    #[tracing::instrument(skip(self), fields(listing_id = %listing_id))]
    pub async fn cancel(&self, listing_id: ListingId, caller: UserId) -> Result<()> {
        let command_id = CommandId::new();
        self.execute(
            command_id,
            ListingAction::Cancel {
                listing_id,
                command_id,
                caller,
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    /// One listing by id.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub async fn listing(&self, listing_id: ListingId) -> Result<Listing> {
        self.store
            .state(|s| s.get(&listing_id).cloned())
            .await
            .ok_or(MarketError::NotFound)
    }

    /// The applicant pool, newest first. Owner-only while the listing is
    /// active.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown listings, `Forbidden` otherwise.
    pub async fn list_applicants(
        &self,
        listing_id: ListingId,
        caller: UserId,
    ) -> Result<Vec<Applicant>> {
        self.store
            .state(|s| {
                let listing = s.get(&listing_id).ok_or(MarketError::NotFound)?;
                registry::list(listing, caller)
            })
            .await
    }

    /// Totals for listings the donor completed.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn donor_stats(&self, owner: UserId) -> Result<DonorStats> {
        self.stats.donor_stats(owner).await
    }

    /// Totals for pickups the claimant completed.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn claimant_stats(&self, claimant: UserId) -> Result<ClaimantStats> {
        self.stats.claimant_stats(claimant).await
    }

    /// City-wide totals over completed listings.
    ///
    /// # Errors
    ///
    /// `CityNotFound` for unknown city names.
    pub async fn city_stats(&self, city_name: &str) -> Result<CityStats> {
        self.stats.city_stats(city_name).await
    }

    /// The user's most recent notifications, newest first.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn recent_notifications(&self, user: UserId) -> Result<Vec<Notification>> {
        self.env
            .notifications
            .recent(user, self.env.config.notification_page_limit)
            .await
    }

    /// Marks the given notifications as read.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn mark_notifications_read(
        &self,
        user: UserId,
        ids: &[NotificationId],
    ) -> Result<()> {
        self.env.notifications.mark_read(user, ids).await
    }

    /// Gracefully shuts the store down, draining in-flight effects.
    ///
    /// # Errors
    ///
    /// `Infrastructure` when effects do not drain within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.store
            .shutdown(timeout)
            .await
            .map_err(|e| MarketError::Infrastructure(e.to_string()))
    }

    // ------------------------------------------------------------------

    /// Sends a command and waits for its durable outcome. Outcomes carry
    /// the id of the command that produced them, so racing callers on the
    /// same listing each match only their own result.
    async fn execute(&self, command_id: CommandId, action: ListingAction) -> Result<()> {
        let outcome = self
            .store
            .send_and_wait_for(
                action,
                |a| match a {
                    ListingAction::Persisted {
                        command_id: id, ..
                    }
                    | ListingAction::Rejected {
                        command_id: id, ..
                    } => *id == command_id,
                    _ => false,
                },
                self.env.config.request_timeout,
            )
            .await
            .map_err(map_store_error)?;

        match outcome {
            ListingAction::Persisted { .. } => Ok(()),
            ListingAction::Rejected { reason, .. } => Err(reason.to_market_error()),
            other => {
                tracing::error!(?other, "predicate matched a non-outcome action");
                Err(MarketError::Infrastructure(
                    "unexpected store outcome".to_string(),
                ))
            }
        }
    }
}

fn map_store_error(error: StoreError) -> MarketError {
    MarketError::Infrastructure(error.to_string())
}
