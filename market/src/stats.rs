//! Statistics over completed listings.
//!
//! Views are computed live from stored snapshots on every request; nothing
//! is materialized. Only `Completed` listings count, and the approximate
//! worth is integer cents (`item count x unit deposit`) so repeated reads
//! never drift.

use crate::config::MarketConfig;
use crate::error::{MarketError, Result};
use crate::providers::CityDirectory;
use crate::stores::ListingRepository;
use crate::types::{approximate_worth, Listing, ListingStatus, MaterialType, Money, UserId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A donor's completed-listing totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DonorStats {
    /// Number of completed listings.
    pub listing_count: u64,
    /// Individual items across those listings.
    pub total_items: u64,
    /// Derived worth of those items.
    pub approximate_worth: Money,
}

/// A claimant's completed-pickup totals, with a material breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimantStats {
    /// Number of completed pickups.
    pub listing_count: u64,
    /// Individual items across those pickups.
    pub total_items: u64,
    /// Derived worth of those items.
    pub approximate_worth: Money,
    /// Item counts per material.
    pub by_material: BTreeMap<MaterialType, u64>,
    /// Sum of receipt-reported amounts, where receipts exist.
    pub total_reported: Money,
}

/// City-wide totals over completed listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CityStats {
    /// Number of completed listings in the city.
    pub listing_count: u64,
    /// Individual items across those listings.
    pub total_items: u64,
    /// Derived worth of those items.
    pub approximate_worth: Money,
    /// Item counts per material.
    pub by_material: BTreeMap<MaterialType, u64>,
    /// Sum of receipt-reported amounts, where receipts exist.
    pub total_reported: Money,
}

/// Computes statistics views on demand.
pub struct StatsAggregator {
    listings: Arc<dyn ListingRepository>,
    cities: Arc<dyn CityDirectory>,
    config: MarketConfig,
}

impl StatsAggregator {
    /// Builds an aggregator over the repository and city directory.
    pub fn new(
        listings: Arc<dyn ListingRepository>,
        cities: Arc<dyn CityDirectory>,
        config: MarketConfig,
    ) -> Self {
        Self {
            listings,
            cities,
            config,
        }
    }

    /// Totals for listings the donor completed.
    pub async fn donor_stats(&self, owner: UserId) -> Result<DonorStats> {
        let completed = self.listings.completed_by_owner(owner).await?;
        let mut stats = DonorStats::default();
        for listing in completed_only(&completed) {
            stats.listing_count += 1;
            stats.total_items += listing.total_items();
        }
        stats.approximate_worth = approximate_worth(stats.total_items, self.config.unit_deposit);
        Ok(stats)
    }

    /// Totals for pickups the claimant completed.
    pub async fn claimant_stats(&self, claimant: UserId) -> Result<ClaimantStats> {
        let completed = self.listings.completed_by_claimant(claimant).await?;
        let mut stats = ClaimantStats::default();
        for listing in completed_only(&completed) {
            accumulate(
                listing,
                &mut stats.listing_count,
                &mut stats.total_items,
                &mut stats.by_material,
                &mut stats.total_reported,
            );
        }
        stats.approximate_worth = approximate_worth(stats.total_items, self.config.unit_deposit);
        Ok(stats)
    }

    /// City-wide totals. The city is looked up by name; an unknown city is a
    /// `CityNotFound` error rather than empty stats.
    pub async fn city_stats(&self, city_name: &str) -> Result<CityStats> {
        let city = self
            .cities
            .lookup(city_name)
            .await
            .map_err(|e| MarketError::Infrastructure(e.to_string()))?
            .ok_or(MarketError::CityNotFound)?;

        let completed = self.listings.completed_in_city(city).await?;
        let mut stats = CityStats::default();
        for listing in completed_only(&completed) {
            accumulate(
                listing,
                &mut stats.listing_count,
                &mut stats.total_items,
                &mut stats.by_material,
                &mut stats.total_reported,
            );
        }
        stats.approximate_worth = approximate_worth(stats.total_items, self.config.unit_deposit);
        Ok(stats)
    }
}

// The repository queries already filter on status; this keeps a buggy
// backend from inflating the numbers.
fn completed_only(listings: &[Listing]) -> impl Iterator<Item = &Listing> {
    listings
        .iter()
        .filter(|l| l.status == ListingStatus::Completed)
}

fn accumulate(
    listing: &Listing,
    listing_count: &mut u64,
    total_items: &mut u64,
    by_material: &mut BTreeMap<MaterialType, u64>,
    total_reported: &mut Money,
) {
    *listing_count += 1;
    *total_items += listing.total_items();
    for item in &listing.items {
        *by_material.entry(item.material).or_insert(0) += u64::from(item.quantity);
    }
    if let Some(receipt) = &listing.receipt {
        *total_reported = total_reported.saturating_add(receipt.reported_amount);
    }
}
