//! End-to-end demo: a listing goes from creation to a verified outcome with
//! in-memory storage and mock collaborators.
//!
//! Run with `cargo run --bin demo` (add `RUST_LOG=debug` for the action
//! flow).

#![allow(clippy::unwrap_used)]

use repant_core::environment::SystemClock;
use repant_market::mocks::{MockCityDirectory, MockScanner, RecordingEmailSender};
use repant_market::notifications::{NoopPushChannel, NotificationDispatcher};
use repant_market::stores::memory::{InMemoryListingRepository, InMemoryNotificationStore};
use repant_market::{
    Item, ListingEnvironment, MarketConfig, MarketplaceService, MaterialType, Money, NewListing,
    ReceiptUpload, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listings = Arc::new(InMemoryListingRepository::new());
    let notifications = Arc::new(NotificationDispatcher::new(
        Arc::new(InMemoryNotificationStore::new()),
        Arc::new(NoopPushChannel),
    ));
    let email = Arc::new(RecordingEmailSender::new());
    let cities = Arc::new(MockCityDirectory::new());

    let env = ListingEnvironment::new(
        Arc::new(SystemClock),
        listings,
        notifications,
        email,
        MarketConfig::default(),
    );
    let service =
        MarketplaceService::new(env, cities, Arc::new(MockScanner::clean())).await?;

    let donor = UserId::new();
    let claimant = UserId::new();

    // Donor lists a crate of bottles.
    let listing_id = service
        .create_listing(
            donor,
            NewListing {
                title: "Crate of plastic bottles".to_string(),
                description: "24 bottles from the weekend".to_string(),
                items: vec![Item {
                    material: MaterialType::PlasticBottle,
                    quantity: 24,
                    deposit_class: None,
                    unit_deposit: Some(Money::from_cents(233)),
                }],
                available_from: chrono::Utc::now(),
                available_to: chrono::Utc::now() + chrono::Duration::days(7),
                city: "Copenhagen".to_string(),
            },
        )
        .await?;
    tracing::info!(%listing_id, "listing created");

    // A claimant applies and the donor accepts.
    service.request_pickup(listing_id, claimant).await?;
    let pool = service.list_applicants(listing_id, donor).await?;
    tracing::info!(applicants = pool.len(), "pool after application");
    service.accept_claimant(listing_id, donor, claimant).await?;

    // The two coordinate and hand over.
    let chat_id = service.start_chat(listing_id, claimant).await?;
    tracing::info!(%chat_id, "chat started");
    service
        .send_chat_message(listing_id, claimant, "When can I come by?".to_string())
        .await?;
    let meeting = service
        .set_meeting_point(listing_id, donor, 55.676_097_9, 12.568_337_1)
        .await?;
    tracing::info!(lat = meeting.latitude, lon = meeting.longitude, "meeting point");
    service.confirm_pickup(listing_id, donor).await?;

    // The claimant redeems the deposit and uploads the receipt.
    service
        .submit_receipt(
            listing_id,
            claimant,
            ReceiptUpload {
                data: vec![0xFF, 0xD8, 0xFF],
                content_type: "image/jpeg".to_string(),
                filename: "receipt.jpg".to_string(),
                reported_amount: Money::from_cents(5592),
            },
        )
        .await?;
    service
        .verify_outcome(listing_id, donor, Money::from_cents(5592))
        .await?;

    let donor_stats = service.donor_stats(donor).await?;
    let claimant_stats = service.claimant_stats(claimant).await?;
    let city_stats = service.city_stats("Copenhagen").await?;
    tracing::info!(
        listings = donor_stats.listing_count,
        items = donor_stats.total_items,
        worth = %donor_stats.approximate_worth,
        "donor totals"
    );
    tracing::info!(
        pickups = claimant_stats.listing_count,
        reported = %claimant_stats.total_reported,
        "claimant totals"
    );
    tracing::info!(
        listings = city_stats.listing_count,
        items = city_stats.total_items,
        "city totals"
    );

    let inbox = service.recent_notifications(claimant).await?;
    for note in &inbox {
        tracing::info!(kind = %note.kind, message = %note.message, "claimant notification");
    }

    service.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
