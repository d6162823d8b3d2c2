//! Deposit-recycling marketplace core.
//!
//! Listings of deposit-bearing recyclables move through a guarded lifecycle
//! (created, pending acceptance, accepted, completed or cancelled) driven by
//! a reducer running inside a [`repant_runtime::Store`]. Because the store
//! serializes commands under its write lock, guard checks and state changes
//! are atomic per command; racing accepts or cancellations resolve to
//! exactly one winner.
//!
//! # Layout
//!
//! - [`types`]: identifiers, money, items, the listing aggregate
//! - [`guards`]: lifecycle guards and input validation
//! - [`aggregates`]: the listing reducer and its actions
//! - [`registry`]: applicant pool operations
//! - [`notifications`]: durable-first notification fan-out
//! - [`stats`]: live statistics over completed listings
//! - [`stores`]: persistence contracts, in-memory and Postgres backends
//! - [`providers`]: external collaborator traits
//! - [`service`]: the [`service::MarketplaceService`] facade
//!
//! # Example
//!
//! ```ignore
//! let service = MarketplaceService::new(env, cities, scanner).await?;
//! let listing_id = service.create_listing(owner, draft).await?;
//! service.request_pickup(listing_id, claimant).await?;
//! service.accept_claimant(listing_id, owner, claimant).await?;
//! ```

pub mod aggregates;
pub mod config;
pub mod environment;
pub mod error;
pub mod guards;
#[cfg(feature = "test-utils")]
pub mod mocks;
pub mod notifications;
pub mod providers;
pub mod registry;
pub mod service;
pub mod stats;
pub mod stores;
pub mod types;

pub use aggregates::{ListingAction, ListingOp, ListingReducer, MarketState, RejectReason};
pub use config::MarketConfig;
pub use environment::ListingEnvironment;
pub use error::{MarketError, Result};
pub use notifications::{Notification, NotificationDispatcher, NotificationKind};
pub use service::{MarketplaceService, NewListing, ReceiptUpload};
pub use stats::{CityStats, ClaimantStats, DonorStats, StatsAggregator};
pub use types::{
    Applicant, ChatId, CityId, CommandId, Item, Listing, ListingId, ListingStatus, MaterialType,
    MeetingPoint, Money, NotificationId, Receipt, UserId,
};
