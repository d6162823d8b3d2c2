//! Dependencies injected into the listing reducer.

use crate::config::MarketConfig;
use crate::notifications::NotificationDispatcher;
use crate::providers::EmailSender;
use crate::stores::ListingRepository;
use repant_core::environment::Clock;
use std::sync::Arc;

/// Everything the listing reducer needs from the outside world.
///
/// All fields are shared handles so effects can move clones into spawned
/// futures.
#[derive(Clone)]
pub struct ListingEnvironment {
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Listing snapshot storage.
    pub listings: Arc<dyn ListingRepository>,
    /// Notification side-channel.
    pub notifications: Arc<NotificationDispatcher>,
    /// Transactional email.
    pub email: Arc<dyn EmailSender>,
    /// Tunable limits.
    pub config: MarketConfig,
}

impl ListingEnvironment {
    /// Builds an environment from its parts.
    pub fn new(
        clock: Arc<dyn Clock>,
        listings: Arc<dyn ListingRepository>,
        notifications: Arc<NotificationDispatcher>,
        email: Arc<dyn EmailSender>,
        config: MarketConfig,
    ) -> Self {
        Self {
            clock,
            listings,
            notifications,
            email,
            config,
        }
    }
}
