//! Validation guards for the listing state machine.
//!
//! Stateless predicates checked before every mutating operation. Guard
//! outcomes are structured internally ([`GuardViolation`]) so calling code
//! and logs can see exactly which precondition failed, while the public
//! surface collapses them to one opaque conflict signal (see
//! `MarketError::Conflict`).
//!
//! No guard mutates anything: a failed guard leaves the aggregate untouched.

use crate::types::{Item, Listing, ListingStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a lifecycle guard rejected an operation.
///
/// Internal diagnostics only. Never serialized across the trust boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardViolation {
    /// The listing is no longer active.
    NotActive,
    /// The listing's status does not permit the operation.
    WrongStatus(ListingStatus),
    /// The chosen claimant never applied for pickup.
    NotAnApplicant,
    /// The chat session has not been started.
    ChatNotStarted,
    /// The meeting point has not been set.
    MeetingNotSet,
    /// No receipt has been submitted.
    ReceiptMissing,
    /// The listing already reached a terminal status.
    AlreadyTerminal,
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActive => write!(f, "listing is not active"),
            Self::WrongStatus(status) => write!(f, "listing status is '{status}'"),
            Self::NotAnApplicant => write!(f, "claimant is not in the applicant pool"),
            Self::ChatNotStarted => write!(f, "chat has not been started"),
            Self::MeetingNotSet => write!(f, "meeting point has not been set"),
            Self::ReceiptMissing => write!(f, "no receipt has been submitted"),
            Self::AlreadyTerminal => write!(f, "listing is already closed"),
        }
    }
}

/// Guard result.
pub type GuardResult = std::result::Result<(), GuardViolation>;

// ============================================================================
// Lifecycle guards
// ============================================================================

/// `RequestPickup`: the listing must be active and still open for
/// applications (`Created`, or `PendingAcceptance` for additional or repeat
/// applicants — the pool stays open until the owner accepts).
pub fn can_request_pickup(listing: &Listing) -> GuardResult {
    if !listing.active {
        return Err(GuardViolation::NotActive);
    }
    match listing.status {
        ListingStatus::Created | ListingStatus::PendingAcceptance => Ok(()),
        status => Err(GuardViolation::WrongStatus(status)),
    }
}

/// `AcceptPickup`: pending, and the chosen claimant must be in the pool.
pub fn can_accept_pickup(listing: &Listing, chosen: UserId) -> GuardResult {
    if listing.status != ListingStatus::PendingAcceptance {
        return Err(GuardViolation::WrongStatus(listing.status));
    }
    if !listing.has_applicant(chosen) {
        return Err(GuardViolation::NotAnApplicant);
    }
    Ok(())
}

/// `StartChat`: accepted and active. Participant authorization is a separate
/// check ([`is_participant`]).
pub fn can_start_chat(listing: &Listing) -> GuardResult {
    if !listing.active {
        return Err(GuardViolation::NotActive);
    }
    if listing.status != ListingStatus::Accepted {
        return Err(GuardViolation::WrongStatus(listing.status));
    }
    Ok(())
}

/// Chat messages require a started chat session.
pub fn can_send_chat_message(listing: &Listing) -> GuardResult {
    if listing.chat_id.is_none() {
        return Err(GuardViolation::ChatNotStarted);
    }
    Ok(())
}

/// `SetMeetingPoint`: accepted, with the chat already started.
pub fn can_set_meeting_point(listing: &Listing) -> GuardResult {
    if listing.status != ListingStatus::Accepted {
        return Err(GuardViolation::WrongStatus(listing.status));
    }
    if listing.chat_id.is_none() {
        return Err(GuardViolation::ChatNotStarted);
    }
    Ok(())
}

/// `ConfirmPickup`: accepted, chat started, meeting point set.
pub fn can_confirm_pickup(listing: &Listing) -> GuardResult {
    if listing.status != ListingStatus::Accepted {
        return Err(GuardViolation::WrongStatus(listing.status));
    }
    if listing.chat_id.is_none() {
        return Err(GuardViolation::ChatNotStarted);
    }
    if listing.meeting.is_none() {
        return Err(GuardViolation::MeetingNotSet);
    }
    Ok(())
}

/// `Cancel`: any non-terminal status.
pub fn can_cancel(listing: &Listing) -> GuardResult {
    if listing.status.is_terminal() {
        return Err(GuardViolation::AlreadyTerminal);
    }
    Ok(())
}

/// `VerifyOutcome`: a receipt must have been submitted. Status is otherwise
/// unconstrained, matching `SubmitReceipt`.
pub fn can_verify_outcome(listing: &Listing) -> GuardResult {
    if listing.receipt.is_none() {
        return Err(GuardViolation::ReceiptMissing);
    }
    Ok(())
}

// ============================================================================
// Authorization checks
// ============================================================================

/// Whether `caller` owns the listing.
#[must_use]
pub fn is_owner(listing: &Listing, caller: UserId) -> bool {
    listing.owner == caller
}

/// Whether `caller` is the assigned claimant.
#[must_use]
pub fn is_assigned_claimant(listing: &Listing, caller: UserId) -> bool {
    listing.assigned_claimant == Some(caller)
}

/// Whether `caller` is the owner or the assigned claimant.
#[must_use]
pub fn is_participant(listing: &Listing, caller: UserId) -> bool {
    listing.is_participant(caller)
}

// ============================================================================
// Input validation
// ============================================================================

/// Validates listing creation input. Returns a caller-safe reason on failure.
pub fn validate_draft(
    title: &str,
    items: &[Item],
    available_from: DateTime<Utc>,
    available_to: DateTime<Utc>,
    max_item_quantity: u32,
) -> std::result::Result<(), String> {
    if title.trim().is_empty() {
        return Err("Title must not be empty".to_string());
    }
    if items.is_empty() {
        return Err("A listing must contain at least one item".to_string());
    }
    if available_from > available_to {
        return Err("Availability range is inverted".to_string());
    }
    for item in items {
        if item.quantity == 0 {
            return Err(format!("Quantity for {} must be positive", item.material));
        }
        if item.quantity > max_item_quantity {
            return Err(format!(
                "Quantity for {} exceeds the limit of {max_item_quantity}",
                item.material
            ));
        }
    }
    Ok(())
}

/// Validates meeting coordinates: latitude in [-90, 90], longitude in
/// [-180, 180], both finite.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> std::result::Result<(), String> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(format!("Latitude {latitude} is out of range"));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("Longitude {longitude} is out of range"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{
        Applicant, CityId, ListingId, MaterialType, Receipt, Money,
    };

    fn listing(status: ListingStatus) -> Listing {
        let now = Utc::now();
        Listing {
            id: ListingId::new(),
            owner: UserId::new(),
            title: "Crates of bottles".to_string(),
            description: String::new(),
            estimated_value: None,
            available_from: now,
            available_to: now,
            city: CityId::new(),
            active: !status.is_terminal(),
            status,
            assigned_claimant: None,
            accepted_at: None,
            chat_id: None,
            meeting: None,
            receipt: None,
            verified_amount: None,
            completed_at: None,
            created_at: now,
            revision: 0,
            items: Vec::new(),
            applicants: Vec::new(),
        }
    }

    fn with_applicant(mut l: Listing, claimant: UserId) -> Listing {
        l.applicants.push(Applicant {
            listing_id: l.id,
            claimant,
            applied_at: Utc::now(),
        });
        l
    }

    #[test]
    fn request_pickup_allowed_while_pool_is_open() {
        assert!(can_request_pickup(&listing(ListingStatus::Created)).is_ok());
        assert!(can_request_pickup(&listing(ListingStatus::PendingAcceptance)).is_ok());
        assert_eq!(
            can_request_pickup(&listing(ListingStatus::Accepted)),
            Err(GuardViolation::WrongStatus(ListingStatus::Accepted))
        );
        assert_eq!(
            can_request_pickup(&listing(ListingStatus::Cancelled)),
            Err(GuardViolation::NotActive)
        );
    }

    #[test]
    fn accept_requires_pending_and_pool_membership() {
        let claimant = UserId::new();
        let pending = with_applicant(listing(ListingStatus::PendingAcceptance), claimant);
        assert!(can_accept_pickup(&pending, claimant).is_ok());
        assert_eq!(
            can_accept_pickup(&pending, UserId::new()),
            Err(GuardViolation::NotAnApplicant)
        );
        assert_eq!(
            can_accept_pickup(&listing(ListingStatus::Created), claimant),
            Err(GuardViolation::WrongStatus(ListingStatus::Created))
        );
    }

    #[test]
    fn confirm_requires_chat_and_meeting() {
        let mut l = listing(ListingStatus::Accepted);
        assert_eq!(can_confirm_pickup(&l), Err(GuardViolation::ChatNotStarted));

        l.chat_id = Some(crate::types::ChatId::new());
        assert_eq!(can_confirm_pickup(&l), Err(GuardViolation::MeetingNotSet));

        l.meeting = Some(crate::types::MeetingPoint::new(55.0, 12.0, Utc::now()));
        assert!(can_confirm_pickup(&l).is_ok());
    }

    #[test]
    fn cancel_rejected_on_terminal_listings() {
        assert!(can_cancel(&listing(ListingStatus::Created)).is_ok());
        assert!(can_cancel(&listing(ListingStatus::Accepted)).is_ok());
        assert_eq!(
            can_cancel(&listing(ListingStatus::Completed)),
            Err(GuardViolation::AlreadyTerminal)
        );
        assert_eq!(
            can_cancel(&listing(ListingStatus::Cancelled)),
            Err(GuardViolation::AlreadyTerminal)
        );
    }

    #[test]
    fn verify_requires_receipt() {
        let mut l = listing(ListingStatus::Completed);
        assert_eq!(can_verify_outcome(&l), Err(GuardViolation::ReceiptMissing));
        l.receipt = Some(Receipt {
            data: vec![1, 2, 3],
            content_type: "image/jpeg".to_string(),
            filename: "receipt.jpg".to_string(),
            reported_amount: Money::from_cents(500),
            submitted_at: Utc::now(),
        });
        assert!(can_verify_outcome(&l).is_ok());
    }

    #[test]
    fn coordinate_bounds() {
        assert!(validate_coordinates(0.0, 0.0).is_ok());
        assert!(validate_coordinates(90.0, 180.0).is_ok());
        assert!(validate_coordinates(-90.0, -180.0).is_ok());
        assert!(validate_coordinates(-91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, 181.0).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn draft_validation() {
        let now = Utc::now();
        let items = vec![Item {
            material: MaterialType::Can,
            quantity: 10,
            deposit_class: None,
            unit_deposit: None,
        }];

        assert!(validate_draft("Cans", &items, now, now, 10_000).is_ok());
        assert!(validate_draft("  ", &items, now, now, 10_000).is_err());
        assert!(validate_draft("Cans", &[], now, now, 10_000).is_err());
        assert!(validate_draft(
            "Cans",
            &items,
            now + chrono::Duration::days(1),
            now,
            10_000
        )
        .is_err());

        let oversized = vec![Item {
            material: MaterialType::Can,
            quantity: 10_001,
            deposit_class: None,
            unit_deposit: None,
        }];
        assert!(validate_draft("Cans", &oversized, now, now, 10_000).is_err());
    }
}
