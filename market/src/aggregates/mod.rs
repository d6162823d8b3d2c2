//! Aggregates: reducer-driven state machines over the marketplace domain.

pub mod listing;

pub use listing::{
    ListingAction, ListingOp, ListingReducer, MarketState, RejectReason,
};
