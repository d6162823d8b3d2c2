//! Domain types for the deposit-recycling marketplace.
//!
//! Value objects, entities, and the listing aggregate itself. Identifiers are
//! UUID newtypes; money is integer cents so the derived deposit estimates stay
//! exact on both the write and read paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing `Uuid`.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a listing.
    ListingId
);
uuid_id!(
    /// Unique identifier for a user (owner or claimant).
    UserId
);
uuid_id!(
    /// Unique identifier for a city.
    CityId
);
uuid_id!(
    /// Unique identifier for a chat session.
    ChatId
);
uuid_id!(
    /// Unique identifier for a notification row.
    NotificationId
);
uuid_id!(
    /// Correlation token for one command, echoed on its outcome so concurrent
    /// callers on the same listing each wait for their own result.
    CommandId
);

// ============================================================================
// Money
// ============================================================================

/// Monetary amount in integer cents.
///
/// Deposit estimates are derived from item counts with integer math, so there
/// is never a floating-point rounding step to get wrong.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` from cents.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Amount in cents.
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Multiply by a count, saturating on overflow.
    #[must_use]
    pub const fn saturating_mul(self, count: u32) -> Self {
        Self(self.0.saturating_mul(count as i64))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ============================================================================
// Items
// ============================================================================

/// Material a recyclable item is made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MaterialType {
    /// Plastic bottle (PET).
    PlasticBottle,
    /// Glass bottle.
    GlassBottle,
    /// Aluminium or steel can.
    Can,
}

impl fmt::Display for MaterialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlasticBottle => write!(f, "plastic bottle"),
            Self::GlassBottle => write!(f, "glass bottle"),
            Self::Can => write!(f, "can"),
        }
    }
}

/// Deposit class of an item, where the deposit system defines one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepositClass {
    /// Class A deposit.
    A,
    /// Class B deposit.
    B,
    /// Class C deposit.
    C,
}

/// A batch of recyclable items on a listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// What the items are made of.
    pub material: MaterialType,
    /// How many items. Positive, bounded by configuration.
    pub quantity: u32,
    /// Deposit class, if known.
    pub deposit_class: Option<DepositClass>,
    /// Per-unit deposit estimate, if the lister supplied one. Summed into the
    /// listing's estimated value at creation.
    pub unit_deposit: Option<Money>,
}

impl Item {
    /// Estimated deposit value of this batch, if a per-unit estimate is set.
    #[must_use]
    pub fn estimated_value(&self) -> Option<Money> {
        self.unit_deposit.map(|unit| unit.saturating_mul(self.quantity))
    }
}

/// Sum of per-unit deposit estimates across items that carry one.
///
/// Returns `None` when no item specifies a unit deposit.
#[must_use]
pub fn estimated_value(items: &[Item]) -> Option<Money> {
    let mut any = false;
    let mut total = Money::ZERO;
    for item in items {
        if let Some(value) = item.estimated_value() {
            any = true;
            total = total.saturating_add(value);
        }
    }
    any.then_some(total)
}

/// Derived approximate worth: `total_items × unit_deposit`.
///
/// Never stored; recomputed wherever it is shown.
#[must_use]
pub fn approximate_worth(total_items: u64, unit_deposit: Money) -> Money {
    #[allow(clippy::cast_possible_wrap)] // item totals are far below i64::MAX
    Money::from_cents((total_items as i64).saturating_mul(unit_deposit.cents()))
}

// ============================================================================
// Listing lifecycle
// ============================================================================

/// Lifecycle status of a listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListingStatus {
    /// Listed, no pickup requested yet.
    Created,
    /// At least one claimant applied; owner has not chosen.
    PendingAcceptance,
    /// Owner accepted a claimant; exchange in progress.
    Accepted,
    /// Handoff confirmed by the owner. Terminal.
    Completed,
    /// Cancelled by the owner. Terminal.
    Cancelled,
}

impl ListingStatus {
    /// Whether this status is terminal (the listing is never resurrected).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::PendingAcceptance => write!(f, "pending acceptance"),
            Self::Accepted => write!(f, "accepted"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A claimant's entry in a listing's applicant pool.
///
/// Append-only: one row per `(listing, claimant)`, never updated or removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    /// The listing applied to.
    pub listing_id: ListingId,
    /// The claimant who applied.
    pub claimant: UserId,
    /// When the application was made.
    pub applied_at: DateTime<Utc>,
}

/// Owner-set meeting coordinates. All fields are set together, never partially.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeetingPoint {
    /// Latitude, rounded to 6 decimals.
    pub latitude: f64,
    /// Longitude, rounded to 6 decimals.
    pub longitude: f64,
    /// When the meeting point was set.
    pub set_at: DateTime<Utc>,
}

impl MeetingPoint {
    /// Builds a meeting point, rounding coordinates to 6 decimal places.
    ///
    /// Callers validate the coordinate ranges first; this only normalizes.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, set_at: DateTime<Utc>) -> Self {
        Self {
            latitude: round6(latitude),
            longitude: round6(longitude),
            set_at,
        }
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Claimant-supplied proof of the completed exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// MIME content type of the upload.
    pub content_type: String,
    /// Original filename.
    pub filename: String,
    /// Amount the claimant reports having received.
    pub reported_amount: Money,
    /// When the receipt was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receipt")
            .field("bytes", &self.data.len())
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .field("reported_amount", &self.reported_amount)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// The listing aggregate root.
///
/// Mutated only through the guarded operations of the listing reducer;
/// terminal at `Completed` or `Cancelled`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Listing identifier.
    pub id: ListingId,
    /// The owner (donator) who created the listing.
    pub owner: UserId,
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Lister-declared value estimate, derived from item unit deposits.
    pub estimated_value: Option<Money>,
    /// Start of the availability window.
    pub available_from: DateTime<Utc>,
    /// End of the availability window.
    pub available_to: DateTime<Utc>,
    /// City the goods are in.
    pub city: CityId,
    /// Whether the listing is open for interaction. Coupled to `status`:
    /// `true` iff the status is non-terminal.
    pub active: bool,
    /// Lifecycle status.
    pub status: ListingStatus,
    /// The claimant the owner accepted, if any.
    pub assigned_claimant: Option<UserId>,
    /// When the owner accepted a claimant.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Chat session between owner and assigned claimant.
    pub chat_id: Option<ChatId>,
    /// Owner-set meeting point.
    pub meeting: Option<MeetingPoint>,
    /// Claimant-submitted receipt.
    pub receipt: Option<Receipt>,
    /// Owner-verified monetary outcome.
    pub verified_amount: Option<Money>,
    /// When the pickup was confirmed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the listing was created.
    pub created_at: DateTime<Utc>,
    /// Bumped on every applied event. Lets a failed durable write tell
    /// whether later commands already built on the unsaved state.
    #[serde(default)]
    pub revision: u64,
    /// Item batches on the listing.
    pub items: Vec<Item>,
    /// Applicant pool, in application order.
    pub applicants: Vec<Applicant>,
}

impl Listing {
    /// Total number of individual items across all batches.
    #[must_use]
    pub fn total_items(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    /// Whether `user` is a participant: the owner or the assigned claimant.
    #[must_use]
    pub fn is_participant(&self, user: UserId) -> bool {
        self.owner == user || self.assigned_claimant == Some(user)
    }

    /// Whether `claimant` is in the applicant pool.
    #[must_use]
    pub fn has_applicant(&self, claimant: UserId) -> bool {
        self.applicants.iter().any(|a| a.claimant == claimant)
    }
}
