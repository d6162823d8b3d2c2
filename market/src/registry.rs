//! Applicant pool operations.
//!
//! The pool is an append-only set embedded in the listing aggregate. Entries
//! are never removed, not even when the owner accepts someone else or the
//! listing closes. Insertion is idempotent keyed on the claimant.

use crate::error::{MarketError, Result};
use crate::guards;
use crate::types::{Applicant, Listing, UserId};
use chrono::{DateTime, Utc};

/// Adds `claimant` to the pool if absent. Returns `true` when a new entry
/// was created, `false` for a repeat application.
pub fn add(listing: &mut Listing, claimant: UserId, applied_at: DateTime<Utc>) -> bool {
    if listing.has_applicant(claimant) {
        return false;
    }
    listing.applicants.push(Applicant {
        listing_id: listing.id,
        claimant,
        applied_at,
    });
    true
}

/// Returns the applicant pool, newest application first.
///
/// Only the owner may view it, and only while the listing is active. Pool
/// size is intentionally invisible to everyone else.
pub fn list(listing: &Listing, requested_by: UserId) -> Result<Vec<Applicant>> {
    if !guards::is_owner(listing, requested_by) || !listing.active {
        return Err(MarketError::Forbidden);
    }
    let mut pool = listing.applicants.clone();
    pool.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
    Ok(pool)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CityId, ListingId, ListingStatus};
    use chrono::Duration;

    fn listing(owner: UserId) -> Listing {
        let now = Utc::now();
        Listing {
            id: ListingId::new(),
            owner,
            title: "Bottles".to_string(),
            description: String::new(),
            estimated_value: None,
            available_from: now,
            available_to: now,
            city: CityId::new(),
            active: true,
            status: ListingStatus::Created,
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

    #[test]
    fn repeat_application_is_a_no_op() {
        let owner = UserId::new();
        let claimant = UserId::new();
        let mut l = listing(owner);
        let t0 = Utc::now();

        assert!(add(&mut l, claimant, t0));
        assert!(!add(&mut l, claimant, t0 + Duration::minutes(5)));

        assert_eq!(l.applicants.len(), 1);
        assert_eq!(l.applicants[0].applied_at, t0);
    }

    #[test]
    fn pool_is_newest_first_and_owner_only() {
        let owner = UserId::new();
        let mut l = listing(owner);
        let t0 = Utc::now();
        let first = UserId::new();
        let second = UserId::new();

        add(&mut l, first, t0);
        add(&mut l, second, t0 + Duration::minutes(1));

        let pool = list(&l, owner).unwrap();
        assert_eq!(pool[0].claimant, second);
        assert_eq!(pool[1].claimant, first);

        assert!(matches!(
            list(&l, UserId::new()),
            Err(MarketError::Forbidden)
        ));
    }

    #[test]
    fn inactive_listing_hides_the_pool_even_from_the_owner() {
        let owner = UserId::new();
        let mut l = listing(owner);
        add(&mut l, UserId::new(), Utc::now());
        l.active = false;

        assert!(matches!(list(&l, owner), Err(MarketError::Forbidden)));
    }
}
