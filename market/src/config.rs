//! Marketplace configuration.
//!
//! Tunables are injected through the environment rather than read from
//! process-wide statics, so tests can pin them per case.

use crate::types::Money;
use std::time::Duration;

/// Configuration for the marketplace core.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Average per-unit deposit used for the derived approximate worth.
    ///
    /// Default: 233 cents (2.33 per item).
    pub unit_deposit: Money,

    /// Upper bound on a single item batch's quantity.
    ///
    /// Default: 10 000.
    pub max_item_quantity: u32,

    /// Default page size for pull-based notification listing.
    ///
    /// Default: 50.
    pub notification_page_limit: usize,

    /// How long the request/response surface waits for an operation outcome.
    ///
    /// Default: 5 seconds.
    pub request_timeout: Duration,
}

impl MarketConfig {
    /// Set the per-unit deposit constant.
    #[must_use]
    pub const fn with_unit_deposit(mut self, unit_deposit: Money) -> Self {
        self.unit_deposit = unit_deposit;
        self
    }

    /// Set the maximum quantity per item batch.
    #[must_use]
    pub const fn with_max_item_quantity(mut self, max: u32) -> Self {
        self.max_item_quantity = max;
        self
    }

    /// Set the notification page size.
    #[must_use]
    pub const fn with_notification_page_limit(mut self, limit: usize) -> Self {
        self.notification_page_limit = limit;
        self
    }

    /// Set the operation outcome timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            unit_deposit: Money::from_cents(233),
            max_item_quantity: 10_000,
            notification_page_limit: 50,
            request_timeout: Duration::from_secs(5),
        }
    }
}
