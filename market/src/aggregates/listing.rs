//! The listing aggregate: lifecycle state machine, applicant pool, and the
//! notification fan-out that follows durable writes.
//!
//! Commands validate against current state, apply their event in place, and
//! emit a persistence effect. The persistence effect feeds back `Persisted`
//! (which triggers notifications) or, when the durable write fails, a
//! `PersistenceFailed` that undoes the in-memory apply before the caller is
//! told. Guard failures feed back `Rejected` without touching state. Every
//! command carries a [`CommandId`] that its outcome echoes, so concurrent
//! callers on the same listing each match their own result.
//!
//! Because the store runs the reducer under its write lock, the
//! check-then-apply sequence for one command is atomic with respect to every
//! other command. Two racing accepts cannot both pass the pending-status
//! guard.

use crate::environment::ListingEnvironment;
use crate::error::MarketError;
use crate::guards::{self, GuardViolation};
use crate::notifications::{Notification, NotificationKind};
use crate::registry;
use crate::types::{
    estimated_value, ChatId, CityId, CommandId, Item, Listing, ListingId, ListingStatus,
    MeetingPoint, Money, Receipt, UserId,
};
use chrono::{DateTime, Utc};
use repant_core::effect::Effect;
use repant_core::reducer::{Effects, Reducer};
use repant_core::smallvec;
use std::collections::HashMap;
use std::fmt;

/// Which operation an outcome refers to. Lets callers waiting on an outcome
/// match it without inspecting event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ListingOp {
    Create,
    RequestPickup,
    AcceptPickup,
    StartChat,
    SendChatMessage,
    SetMeetingPoint,
    ConfirmPickup,
    SubmitReceipt,
    VerifyOutcome,
    Cancel,
}

impl fmt::Display for ListingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::RequestPickup => "request_pickup",
            Self::AcceptPickup => "accept_pickup",
            Self::StartChat => "start_chat",
            Self::SendChatMessage => "send_chat_message",
            Self::SetMeetingPoint => "set_meeting_point",
            Self::ConfirmPickup => "confirm_pickup",
            Self::SubmitReceipt => "submit_receipt",
            Self::VerifyOutcome => "verify_outcome",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Why a command was rejected.
#[derive(Debug, Clone)]
pub enum RejectReason {
    /// No such listing.
    NotFound,
    /// Caller-correctable input problem, safe to show verbatim.
    Validation(String),
    /// Caller is not authorized for the operation.
    Forbidden,
    /// A lifecycle guard failed. The detail stays internal; callers see an
    /// opaque conflict.
    Conflict(GuardViolation),
    /// The durable write failed and the command took no lasting effect.
    Storage(String),
}

impl RejectReason {
    /// Maps the internal reason onto the public error surface. Guard detail
    /// is deliberately dropped here.
    #[must_use]
    pub fn to_market_error(&self) -> MarketError {
        match self {
            Self::NotFound => MarketError::NotFound,
            Self::Validation(reason) => MarketError::Validation {
                reason: reason.clone(),
            },
            Self::Forbidden => MarketError::Forbidden,
            Self::Conflict(_) => MarketError::Conflict,
            Self::Storage(detail) => MarketError::Database(detail.clone()),
        }
    }
}

/// Commands, events, and outcomes of the listing aggregate.
#[derive(Debug, Clone)]
pub enum ListingAction {
    // ------------------------------------------------------------------
    // Commands. Callers identify themselves; the reducer authorizes.
    // ------------------------------------------------------------------
    /// Publish a new listing. The id and city are resolved by the caller.
    Create {
        /// Pre-generated listing id, returned to the caller on success.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// The owner publishing the listing.
        owner: UserId,
        /// Short title.
        title: String,
        /// Free-text description.
        description: String,
        /// Declared items.
        items: Vec<Item>,
        /// Start of the pickup window.
        available_from: DateTime<Utc>,
        /// End of the pickup window.
        available_to: DateTime<Utc>,
        /// Resolved city.
        city: CityId,
    },
    /// A claimant applies for pickup. Idempotent per claimant.
    RequestPickup {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Applying claimant.
        claimant: UserId,
    },
    /// The owner picks one applicant.
    AcceptPickup {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be the owner.
        caller: UserId,
        /// The applicant being accepted.
        chosen: UserId,
    },
    /// Open the chat session between the two parties.
    StartChat {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be a participant.
        caller: UserId,
        /// Pre-generated chat id, ignored if a chat already exists.
        chat_id: ChatId,
    },
    /// Send a chat message to the counterparty.
    SendChatMessage {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be a participant.
        sender: UserId,
        /// Message text.
        body: String,
    },
    /// The owner fixes the meeting point.
    SetMeetingPoint {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be the owner.
        caller: UserId,
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
    /// The owner confirms the handover happened.
    ConfirmPickup {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be the owner.
        caller: UserId,
    },
    /// The claimant uploads the redemption receipt. Overwrites any earlier
    /// upload.
    SubmitReceipt {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be the assigned claimant.
        caller: UserId,
        /// Scanned-clean receipt.
        receipt: Receipt,
    },
    /// The owner confirms the redeemed amount.
    VerifyOutcome {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be the owner.
        caller: UserId,
        /// Amount the owner agrees was redeemed.
        amount: Money,
    },
    /// The owner withdraws the listing.
    Cancel {
        /// Target listing.
        listing_id: ListingId,
        /// Echoed on the outcome.
        command_id: CommandId,
        /// Must be the owner.
        caller: UserId,
    },

    // ------------------------------------------------------------------
    // Events. Applied in place; also reduced directly during hydration.
    // ------------------------------------------------------------------
    /// A listing entered the marketplace.
    Created {
        /// The full initial snapshot.
        listing: Box<Listing>,
    },
    /// A claimant joined (or re-requested) the pool.
    PickupRequested {
        /// Target listing.
        listing_id: ListingId,
        /// The claimant.
        claimant: UserId,
        /// Application time.
        at: DateTime<Utc>,
        /// False for an idempotent repeat.
        newly_applied: bool,
    },
    /// The owner accepted an applicant.
    PickupAccepted {
        /// Target listing.
        listing_id: ListingId,
        /// The accepted claimant.
        chosen: UserId,
        /// Acceptance time.
        at: DateTime<Utc>,
    },
    /// The chat session opened.
    ChatStarted {
        /// Target listing.
        listing_id: ListingId,
        /// Session id.
        chat_id: ChatId,
    },
    /// A chat message went to the counterparty.
    ChatMessageSent {
        /// Target listing.
        listing_id: ListingId,
        /// The sending participant.
        sender: UserId,
        /// The other participant.
        recipient: UserId,
        /// Message text.
        body: String,
    },
    /// The meeting point was fixed.
    MeetingPointSet {
        /// Target listing.
        listing_id: ListingId,
        /// Normalized coordinates.
        point: MeetingPoint,
    },
    /// The handover was confirmed.
    PickupConfirmed {
        /// Target listing.
        listing_id: ListingId,
        /// Completion time.
        at: DateTime<Utc>,
    },
    /// A receipt was stored.
    ReceiptSubmitted {
        /// Target listing.
        listing_id: ListingId,
        /// The stored receipt.
        receipt: Box<Receipt>,
    },
    /// The owner verified the outcome.
    OutcomeVerified {
        /// Target listing.
        listing_id: ListingId,
        /// Verified amount.
        amount: Money,
    },
    /// The listing was withdrawn.
    Cancelled {
        /// Target listing.
        listing_id: ListingId,
        /// Cancellation time.
        at: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Outcomes, fed back by effects. Callers wait on these.
    // ------------------------------------------------------------------
    /// The event reached durable storage.
    Persisted {
        /// Target listing.
        listing_id: ListingId,
        /// The command this outcome answers.
        command_id: CommandId,
        /// The event that was made durable.
        event: Box<ListingAction>,
    },
    /// The command did not take effect.
    Rejected {
        /// Target listing.
        listing_id: ListingId,
        /// The command this outcome answers.
        command_id: CommandId,
        /// Which operation was rejected.
        op: ListingOp,
        /// Why.
        reason: RejectReason,
    },
    /// The durable write failed after the in-memory apply. Reducing this
    /// undoes the apply (when nothing built on it) and answers the caller
    /// with a storage `Rejected`.
    PersistenceFailed {
        /// Target listing.
        listing_id: ListingId,
        /// The command whose write failed.
        command_id: CommandId,
        /// Which operation failed.
        op: ListingOp,
        /// Listing revision the unsaved snapshot carried.
        revision: u64,
        /// Pre-command snapshot to restore; `None` for a failed create.
        prior: Option<Box<Listing>>,
        /// Storage error detail.
        error: String,
    },
}

impl ListingAction {
    /// The operation an action belongs to, for outcome matching.
    #[must_use]
    pub fn op(&self) -> Option<ListingOp> {
        match self {
            Self::Create { .. } | Self::Created { .. } => Some(ListingOp::Create),
            Self::RequestPickup { .. } | Self::PickupRequested { .. } => {
                Some(ListingOp::RequestPickup)
            }
            Self::AcceptPickup { .. } | Self::PickupAccepted { .. } => Some(ListingOp::AcceptPickup),
            Self::StartChat { .. } | Self::ChatStarted { .. } => Some(ListingOp::StartChat),
            Self::SendChatMessage { .. } | Self::ChatMessageSent { .. } => {
                Some(ListingOp::SendChatMessage)
            }
            Self::SetMeetingPoint { .. } | Self::MeetingPointSet { .. } => {
                Some(ListingOp::SetMeetingPoint)
            }
            Self::ConfirmPickup { .. } | Self::PickupConfirmed { .. } => {
                Some(ListingOp::ConfirmPickup)
            }
            Self::SubmitReceipt { .. } | Self::ReceiptSubmitted { .. } => {
                Some(ListingOp::SubmitReceipt)
            }
            Self::VerifyOutcome { .. } | Self::OutcomeVerified { .. } => {
                Some(ListingOp::VerifyOutcome)
            }
            Self::Cancel { .. } | Self::Cancelled { .. } => Some(ListingOp::Cancel),
            Self::Persisted { event, .. } => event.op(),
            Self::Rejected { op, .. } | Self::PersistenceFailed { op, .. } => Some(*op),
        }
    }
}

/// In-memory view of every listing, keyed by id.
#[derive(Debug, Default, Clone)]
pub struct MarketState {
    /// All known listings.
    pub listings: HashMap<ListingId, Listing>,
}

impl MarketState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State pre-populated from stored snapshots.
    #[must_use]
    pub fn hydrate(listings: Vec<Listing>) -> Self {
        Self {
            listings: listings.into_iter().map(|l| (l.id, l)).collect(),
        }
    }

    /// Looks up one listing.
    #[must_use]
    pub fn get(&self, id: &ListingId) -> Option<&Listing> {
        self.listings.get(id)
    }
}

/// Reducer over [`MarketState`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ListingReducer;

impl ListingReducer {
    /// Creates the reducer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Reducer for ListingReducer {
    type State = MarketState;
    type Action = ListingAction;
    type Environment = ListingEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Effects<Self::Action> {
        match action {
            // Commands.
            ListingAction::Create {
                listing_id,
                command_id,
                owner,
                title,
                description,
                items,
                available_from,
                available_to,
                city,
            } => handle_create(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                owner,
                title,
                description,
                items,
                available_from,
                available_to,
                city,
            ),
            ListingAction::RequestPickup {
                listing_id,
                command_id,
                claimant,
            } => handle_request_pickup(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                claimant,
            ),
            ListingAction::AcceptPickup {
                listing_id,
                command_id,
                caller,
                chosen,
            } => handle_accept_pickup(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
                chosen,
            ),
            ListingAction::StartChat {
                listing_id,
                command_id,
                caller,
                chat_id,
            } => handle_start_chat(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
                chat_id,
            ),
            ListingAction::SendChatMessage {
                listing_id,
                command_id,
                sender,
                body,
            } => handle_send_chat_message(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                sender,
                body,
            ),
            ListingAction::SetMeetingPoint {
                listing_id,
                command_id,
                caller,
                latitude,
                longitude,
            } => handle_set_meeting_point(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
                latitude,
                longitude,
            ),
            ListingAction::ConfirmPickup {
                listing_id,
                command_id,
                caller,
            } => handle_confirm_pickup(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
            ),
            ListingAction::SubmitReceipt {
                listing_id,
                command_id,
                caller,
                receipt,
            } => handle_submit_receipt(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
                receipt,
            ),
            ListingAction::VerifyOutcome {
                listing_id,
                command_id,
                caller,
                amount,
            } => handle_verify_outcome(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
                amount,
            ),
            ListingAction::Cancel {
                listing_id,
                command_id,
                caller,
            } => handle_cancel(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                caller,
            ),

            // Events reduced directly (hydration, replay in tests).
            event @ (ListingAction::Created { .. }
            | ListingAction::PickupRequested { .. }
            | ListingAction::PickupAccepted { .. }
            | ListingAction::ChatStarted { .. }
            | ListingAction::ChatMessageSent { .. }
            | ListingAction::MeetingPointSet { .. }
            | ListingAction::PickupConfirmed { .. }
            | ListingAction::ReceiptSubmitted { .. }
            | ListingAction::OutcomeVerified { .. }
            | ListingAction::Cancelled { .. }) => {
                apply_event(state, &event);
                smallvec![]
            }

            // Outcomes.
            ListingAction::Persisted {
                listing_id, event, ..
            } => notification_effects(state, env, listing_id, &event),
            ListingAction::Rejected {
                listing_id,
                op,
                reason,
                ..
            } => {
                tracing::debug!(%listing_id, %op, ?reason, "command rejected");
                smallvec![]
            }
            ListingAction::PersistenceFailed {
                listing_id,
                command_id,
                op,
                revision,
                prior,
                error,
            } => handle_persist_failed(
                state,
                env,
                Cmd {
                    listing_id,
                    command_id,
                },
                op,
                revision,
                prior,
                error,
            ),
        }
    }
}

// ============================================================================
// Command handlers
// ============================================================================

/// Addressing for one in-flight command: the targeted listing and the
/// correlation id its outcome must echo.
#[derive(Clone, Copy)]
struct Cmd {
    listing_id: ListingId,
    command_id: CommandId,
}

fn reject(cmd: Cmd, op: ListingOp, reason: RejectReason) -> Effects<ListingAction> {
    smallvec![Effect::future(async move {
        Some(ListingAction::Rejected {
            listing_id: cmd.listing_id,
            command_id: cmd.command_id,
            op,
            reason,
        })
    })]
}

/// Applies `event` in place and schedules the durable write. The feedback is
/// `Persisted` on success, or `PersistenceFailed` carrying the pre-command
/// snapshot so the optimistic apply can be undone before the caller hears a
/// storage error. Waiting callers are never left hanging.
fn apply_and_persist(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    op: ListingOp,
    event: ListingAction,
) -> Effects<ListingAction> {
    let prior = state.listings.get(&cmd.listing_id).cloned().map(Box::new);
    apply_event(state, &event);

    let Some(snapshot) = state.listings.get(&cmd.listing_id).cloned() else {
        return reject(cmd, op, RejectReason::NotFound);
    };
    let revision = snapshot.revision;
    let listings = env.listings.clone();
    smallvec![Effect::future(async move {
        match listings.save(&snapshot).await {
            Ok(()) => Some(ListingAction::Persisted {
                listing_id: cmd.listing_id,
                command_id: cmd.command_id,
                event: Box::new(event),
            }),
            Err(error) => {
                tracing::error!(listing_id = %cmd.listing_id, %op, %error, "durable write failed");
                Some(ListingAction::PersistenceFailed {
                    listing_id: cmd.listing_id,
                    command_id: cmd.command_id,
                    op,
                    revision,
                    prior,
                    error: error.to_string(),
                })
            }
        }
    })]
}

/// Recovers from a failed durable write. When the listing's revision still
/// matches the unsaved snapshot, nothing reduced on top of it and the
/// pre-command state comes back, so the caller's retry passes the same
/// guards again. When later commands already built on the unsaved event,
/// their whole-listing snapshots carry it; the state stands and a fresh
/// save of the newest snapshot is scheduled.
fn handle_persist_failed(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    op: ListingOp,
    revision: u64,
    prior: Option<Box<Listing>>,
    error: String,
) -> Effects<ListingAction> {
    let current = state.listings.get(&cmd.listing_id).map(|l| l.revision);
    if current == Some(revision) {
        match prior {
            Some(listing) => {
                state.listings.insert(cmd.listing_id, *listing);
            }
            None => {
                state.listings.remove(&cmd.listing_id);
            }
        }
        return reject(cmd, op, RejectReason::Storage(error));
    }

    let mut effects = reject(cmd, op, RejectReason::Storage(error));
    if let Some(snapshot) = state.listings.get(&cmd.listing_id).cloned() {
        let listings = env.listings.clone();
        effects.push(Effect::fire_and_forget(async move {
            if let Err(error) = listings.save(&snapshot).await {
                tracing::error!(listing_id = %snapshot.id, %error, "snapshot re-save failed");
            }
        }));
    }
    effects
}

#[allow(clippy::too_many_arguments)]
fn handle_create(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    owner: UserId,
    title: String,
    description: String,
    items: Vec<Item>,
    available_from: DateTime<Utc>,
    available_to: DateTime<Utc>,
    city: CityId,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::Create;

    if state.listings.contains_key(&cmd.listing_id) {
        return reject(
            cmd,
            OP,
            RejectReason::Validation("Listing already exists".to_string()),
        );
    }
    if let Err(reason) = guards::validate_draft(
        &title,
        &items,
        available_from,
        available_to,
        env.config.max_item_quantity,
    ) {
        return reject(cmd, OP, RejectReason::Validation(reason));
    }

    let now = env.clock.now();
    let listing = Listing {
        id: cmd.listing_id,
        owner,
        title,
        description,
        estimated_value: estimated_value(&items),
        available_from,
        available_to,
        city,
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
        items,
        applicants: Vec::new(),
    };

    let event = ListingAction::Created {
        listing: Box::new(listing),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_request_pickup(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    claimant: UserId,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::RequestPickup;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if listing.owner == claimant {
        return reject(
            cmd,
            OP,
            RejectReason::Validation("You cannot apply for your own listing".to_string()),
        );
    }
    if let Err(violation) = guards::can_request_pickup(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }

    let event = ListingAction::PickupRequested {
        listing_id: cmd.listing_id,
        claimant,
        at: env.clock.now(),
        newly_applied: !listing.has_applicant(claimant),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_accept_pickup(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
    chosen: UserId,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::AcceptPickup;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_owner(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_accept_pickup(listing, chosen) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }

    let event = ListingAction::PickupAccepted {
        listing_id: cmd.listing_id,
        chosen,
        at: env.clock.now(),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_start_chat(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
    chat_id: ChatId,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::StartChat;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_participant(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_start_chat(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }

    // Idempotent: a second start keeps the existing session.
    let chat_id = listing.chat_id.unwrap_or(chat_id);
    let event = ListingAction::ChatStarted {
        listing_id: cmd.listing_id,
        chat_id,
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_send_chat_message(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    sender: UserId,
    body: String,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::SendChatMessage;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_participant(listing, sender) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_send_chat_message(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }
    if body.trim().is_empty() {
        return reject(
            cmd,
            OP,
            RejectReason::Validation("Message must not be empty".to_string()),
        );
    }

    let recipient = if guards::is_owner(listing, sender) {
        match listing.assigned_claimant {
            Some(claimant) => claimant,
            None => {
                return reject(
                    cmd,
                    OP,
                    RejectReason::Conflict(GuardViolation::ChatNotStarted),
                )
            }
        }
    } else {
        listing.owner
    };

    let event = ListingAction::ChatMessageSent {
        listing_id: cmd.listing_id,
        sender,
        recipient,
        body,
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_set_meeting_point(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
    latitude: f64,
    longitude: f64,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::SetMeetingPoint;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_owner(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_set_meeting_point(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }
    if let Err(reason) = guards::validate_coordinates(latitude, longitude) {
        return reject(cmd, OP, RejectReason::Validation(reason));
    }

    let event = ListingAction::MeetingPointSet {
        listing_id: cmd.listing_id,
        point: MeetingPoint::new(latitude, longitude, env.clock.now()),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_confirm_pickup(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::ConfirmPickup;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_owner(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_confirm_pickup(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }

    let event = ListingAction::PickupConfirmed {
        listing_id: cmd.listing_id,
        at: env.clock.now(),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_submit_receipt(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
    receipt: Receipt,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::SubmitReceipt;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_assigned_claimant(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }

    let event = ListingAction::ReceiptSubmitted {
        listing_id: cmd.listing_id,
        receipt: Box::new(receipt),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_verify_outcome(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
    amount: Money,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::VerifyOutcome;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_owner(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_verify_outcome(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }

    let event = ListingAction::OutcomeVerified {
        listing_id: cmd.listing_id,
        amount,
    };
    apply_and_persist(state, env, cmd, OP, event)
}

fn handle_cancel(
    state: &mut MarketState,
    env: &ListingEnvironment,
    cmd: Cmd,
    caller: UserId,
) -> Effects<ListingAction> {
    const OP: ListingOp = ListingOp::Cancel;

    let Some(listing) = state.listings.get(&cmd.listing_id) else {
        return reject(cmd, OP, RejectReason::NotFound);
    };
    if !guards::is_owner(listing, caller) {
        return reject(cmd, OP, RejectReason::Forbidden);
    }
    if let Err(violation) = guards::can_cancel(listing) {
        return reject(cmd, OP, RejectReason::Conflict(violation));
    }

    let event = ListingAction::Cancelled {
        listing_id: cmd.listing_id,
        at: env.clock.now(),
    };
    apply_and_persist(state, env, cmd, OP, event)
}

// ============================================================================
// Event application
// ============================================================================

/// Applies one event to the state. Events are facts; unknown listings are
/// ignored rather than rejected.
fn apply_event(state: &mut MarketState, event: &ListingAction) {
    match event {
        ListingAction::Created { listing } => {
            state.listings.insert(listing.id, (**listing).clone());
        }
        ListingAction::PickupRequested {
            listing_id,
            claimant,
            at,
            newly_applied,
        } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                if *newly_applied {
                    registry::add(listing, *claimant, *at);
                }
                if listing.status == ListingStatus::Created {
                    listing.status = ListingStatus::PendingAcceptance;
                }
                listing.revision += 1;
            }
        }
        ListingAction::PickupAccepted {
            listing_id,
            chosen,
            at,
        } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                listing.status = ListingStatus::Accepted;
                listing.assigned_claimant = Some(*chosen);
                listing.accepted_at = Some(*at);
                listing.revision += 1;
            }
        }
        ListingAction::ChatStarted {
            listing_id,
            chat_id,
        } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                if listing.chat_id.is_none() {
                    listing.chat_id = Some(*chat_id);
                }
                listing.revision += 1;
            }
        }
        // Chat content is not part of the aggregate; only the notification
        // fan-out cares.
        ListingAction::ChatMessageSent { .. } => {}
        ListingAction::MeetingPointSet { listing_id, point } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                listing.meeting = Some(*point);
                listing.revision += 1;
            }
        }
        ListingAction::PickupConfirmed { listing_id, at } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                listing.status = ListingStatus::Completed;
                listing.active = false;
                listing.completed_at = Some(*at);
                listing.revision += 1;
            }
        }
        ListingAction::ReceiptSubmitted {
            listing_id,
            receipt,
        } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                listing.receipt = Some((**receipt).clone());
                listing.revision += 1;
            }
        }
        ListingAction::OutcomeVerified { listing_id, amount } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                listing.verified_amount = Some(*amount);
                listing.revision += 1;
            }
        }
        ListingAction::Cancelled { listing_id, at: _ } => {
            if let Some(listing) = state.listings.get_mut(listing_id) {
                listing.status = ListingStatus::Cancelled;
                listing.active = false;
                listing.revision += 1;
            }
        }
        _ => {}
    }
}

// ============================================================================
// Notification fan-out
// ============================================================================

/// Effects that follow a durable write. Dispatch is fire-and-forget: the
/// triggering operation already succeeded and stays successful.
fn notification_effects(
    state: &MarketState,
    env: &ListingEnvironment,
    listing_id: ListingId,
    event: &ListingAction,
) -> Effects<ListingAction> {
    let Some(listing) = state.listings.get(&listing_id) else {
        return smallvec![];
    };
    let now = env.clock.now();

    match event {
        ListingAction::PickupRequested {
            newly_applied: true,
            ..
        } => {
            let note = Notification::new(
                listing.owner,
                listing_id,
                NotificationKind::ApplicationReceived,
                format!("Someone applied to pick up '{}'", listing.title),
                now,
            );
            smallvec![dispatch_effect(env, note)]
        }
        ListingAction::PickupAccepted { chosen, .. } => {
            let note = Notification::new(
                *chosen,
                listing_id,
                NotificationKind::Accepted,
                format!("Your application for '{}' was accepted", listing.title),
                now,
            );
            let email = env.email.clone();
            let to = *chosen;
            let subject = format!("Pickup accepted: {}", listing.title);
            let body = format!(
                "Your application for '{}' was accepted. Open the chat to agree on a meeting point.",
                listing.title
            );
            smallvec![
                dispatch_effect(env, note),
                Effect::fire_and_forget(async move {
                    if let Err(error) = email.send(to, &subject, &body).await {
                        tracing::warn!(%error, "acceptance email failed");
                    }
                }),
            ]
        }
        ListingAction::ChatMessageSent {
            recipient, body, ..
        } => {
            let preview: String = body.chars().take(80).collect();
            let note = Notification::new(
                *recipient,
                listing_id,
                NotificationKind::ChatMessage,
                preview,
                now,
            );
            smallvec![dispatch_effect(env, note)]
        }
        ListingAction::MeetingPointSet { .. } => {
            let Some(claimant) = listing.assigned_claimant else {
                return smallvec![];
            };
            let note = Notification::new(
                claimant,
                listing_id,
                NotificationKind::MeetingSet,
                format!("A meeting point was set for '{}'", listing.title),
                now,
            );
            smallvec![dispatch_effect(env, note)]
        }
        _ => smallvec![],
    }
}

fn dispatch_effect(env: &ListingEnvironment, note: Notification) -> Effect<ListingAction> {
    let dispatcher = env.notifications.clone();
    Effect::fire_and_forget(async move {
        if let Err(error) = dispatcher.dispatch(note).await {
            tracing::error!(%error, "notification append failed");
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;
    use crate::mocks::{RecordingEmailSender, RecordingPushChannel};
    use crate::notifications::NotificationDispatcher;
    use crate::stores::memory::{InMemoryListingRepository, InMemoryNotificationStore};
    use crate::types::MaterialType;
    use chrono::TimeZone;
    use repant_core::environment::FixedClock;
    use repant_testing::{assertions, ReducerTest};
    use std::sync::Arc;

    fn test_env() -> ListingEnvironment {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        ListingEnvironment::new(
            Arc::new(FixedClock::new(at)),
            Arc::new(InMemoryListingRepository::new()),
            Arc::new(NotificationDispatcher::new(
                Arc::new(InMemoryNotificationStore::new()),
                Arc::new(RecordingPushChannel::new()),
            )),
            Arc::new(RecordingEmailSender::new()),
            MarketConfig::default(),
        )
    }

    fn items() -> Vec<Item> {
        vec![Item {
            material: MaterialType::PlasticBottle,
            quantity: 24,
            deposit_class: None,
            unit_deposit: Some(Money::from_cents(233)),
        }]
    }

    fn create(listing_id: ListingId, owner: UserId) -> ListingAction {
        let from = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        ListingAction::Create {
            listing_id,
            command_id: CommandId::new(),
            owner,
            title: "Crate of bottles".to_string(),
            description: "24 plastic bottles".to_string(),
            items: items(),
            available_from: from,
            available_to: from + chrono::Duration::days(7),
            city: CityId::new(),
        }
    }

    #[test]
    fn create_inserts_an_active_listing_with_estimated_value() {
        let listing_id = ListingId::new();
        let owner = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.status, ListingStatus::Created);
                assert!(listing.active);
                assert_eq!(listing.estimated_value, Some(Money::from_cents(24 * 233)));
            })
            .then_effects(|effects| {
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn invalid_draft_leaves_state_untouched() {
        let listing_id = ListingId::new();
        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(ListingAction::Create {
                listing_id,
                command_id: CommandId::new(),
                owner: UserId::new(),
                title: "  ".to_string(),
                description: String::new(),
                items: items(),
                available_from: Utc::now(),
                available_to: Utc::now(),
                city: CityId::new(),
            })
            .then_state(move |state| {
                assert!(state.get(&listing_id).is_none());
            })
            .then_effects(|effects| {
                // Only the rejection feedback.
                assertions::assert_effects_count(effects, 1);
            })
            .run();
    }

    #[test]
    fn first_application_moves_to_pending_and_joins_the_pool() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.status, ListingStatus::PendingAcceptance);
                assert!(listing.has_applicant(claimant));
            })
            .run();
    }

    #[test]
    fn repeat_application_does_not_grow_the_pool() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.applicants.len(), 1);
                assert_eq!(listing.status, ListingStatus::PendingAcceptance);
            })
            .run();
    }

    #[test]
    fn owner_cannot_apply_for_own_listing() {
        let listing_id = ListingId::new();
        let owner = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant: owner,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert!(listing.applicants.is_empty());
                assert_eq!(listing.status, ListingStatus::Created);
            })
            .run();
    }

    #[test]
    fn accept_assigns_the_claimant_and_freezes_the_choice() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.status, ListingStatus::Accepted);
                assert_eq!(listing.assigned_claimant, Some(claimant));
                assert!(listing.accepted_at.is_some());
            })
            .run();
    }

    #[test]
    fn second_accept_is_rejected_and_does_not_reassign() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let first = UserId::new();
        let second = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant: first,
            })
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant: second,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: first,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: second,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.assigned_claimant, Some(first));
            })
            .run();
    }

    #[test]
    fn accept_by_non_owner_is_rejected() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: claimant,
                chosen: claimant,
            })
            .then_state(move |state| {
                assert_eq!(
                    state.get(&listing_id).unwrap().status,
                    ListingStatus::PendingAcceptance
                );
            })
            .run();
    }

    #[test]
    fn confirm_requires_chat_and_meeting_first() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        // Straight to confirm after accept: rejected, still Accepted.
        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::ConfirmPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
            })
            .then_state(move |state| {
                assert_eq!(
                    state.get(&listing_id).unwrap().status,
                    ListingStatus::Accepted
                );
            })
            .run();
    }

    #[test]
    fn full_path_to_completion() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();
        let chat_id = ChatId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::StartChat {
                listing_id,
                command_id: CommandId::new(),
                caller: claimant,
                chat_id,
            })
            .when_action(ListingAction::SetMeetingPoint {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                latitude: 55.676_097_9,
                longitude: 12.568_337_1,
            })
            .when_action(ListingAction::ConfirmPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.status, ListingStatus::Completed);
                assert!(!listing.active);
                assert!(listing.completed_at.is_some());
                let meeting = listing.meeting.unwrap();
                assert!((meeting.latitude - 55.676_098).abs() < 1e-9);
                assert!((meeting.longitude - 12.568_337).abs() < 1e-9);
            })
            .run();
    }

    #[test]
    fn start_chat_is_idempotent_on_the_session_id() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();
        let first_chat = ChatId::new();
        let second_chat = ChatId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::StartChat {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chat_id: first_chat,
            })
            .when_action(ListingAction::StartChat {
                listing_id,
                command_id: CommandId::new(),
                caller: claimant,
                chat_id: second_chat,
            })
            .then_state(move |state| {
                assert_eq!(state.get(&listing_id).unwrap().chat_id, Some(first_chat));
            })
            .run();
    }

    #[test]
    fn outsider_cannot_start_chat() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::StartChat {
                listing_id,
                command_id: CommandId::new(),
                caller: UserId::new(),
                chat_id: ChatId::new(),
            })
            .then_state(move |state| {
                assert!(state.get(&listing_id).unwrap().chat_id.is_none());
            })
            .run();
    }

    #[test]
    fn cancel_closes_any_non_terminal_listing() {
        let listing_id = ListingId::new();
        let owner = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::Cancel {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(listing.status, ListingStatus::Cancelled);
                assert!(!listing.active);
            })
            .run();
    }

    #[test]
    fn cancel_after_completion_is_rejected() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::StartChat {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chat_id: ChatId::new(),
            })
            .when_action(ListingAction::SetMeetingPoint {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                latitude: 55.0,
                longitude: 12.0,
            })
            .when_action(ListingAction::ConfirmPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
            })
            .when_action(ListingAction::Cancel {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
            })
            .then_state(move |state| {
                assert_eq!(
                    state.get(&listing_id).unwrap().status,
                    ListingStatus::Completed
                );
            })
            .run();
    }

    #[test]
    fn receipt_resubmission_overwrites() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        let receipt = |amount: i64| Receipt {
            data: vec![0xFF, 0xD8],
            content_type: "image/jpeg".to_string(),
            filename: "receipt.jpg".to_string(),
            reported_amount: Money::from_cents(amount),
            submitted_at: Utc::now(),
        };

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::SubmitReceipt {
                listing_id,
                command_id: CommandId::new(),
                caller: claimant,
                receipt: receipt(2330),
            })
            .when_action(ListingAction::SubmitReceipt {
                listing_id,
                command_id: CommandId::new(),
                caller: claimant,
                receipt: receipt(3262),
            })
            .then_state(move |state| {
                let listing = state.get(&listing_id).unwrap();
                assert_eq!(
                    listing.receipt.as_ref().unwrap().reported_amount,
                    Money::from_cents(3262)
                );
            })
            .run();
    }

    #[test]
    fn verify_requires_a_receipt_and_records_the_amount() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::VerifyOutcome {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                amount: Money::from_cents(2330),
            })
            .then_state(move |state| {
                // No receipt yet, so nothing recorded.
                assert!(state.get(&listing_id).unwrap().verified_amount.is_none());
            })
            .run();

        let listing_id = ListingId::new();
        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::SubmitReceipt {
                listing_id,
                command_id: CommandId::new(),
                caller: claimant,
                receipt: Receipt {
                    data: vec![1],
                    content_type: "image/png".to_string(),
                    filename: "r.png".to_string(),
                    reported_amount: Money::from_cents(2330),
                    submitted_at: Utc::now(),
                },
            })
            .when_action(ListingAction::VerifyOutcome {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                amount: Money::from_cents(2200),
            })
            .then_state(move |state| {
                assert_eq!(
                    state.get(&listing_id).unwrap().verified_amount,
                    Some(Money::from_cents(2200))
                );
            })
            .run();
    }

    #[test]
    fn unknown_listing_rejects_without_state_change() {
        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(ListingAction::RequestPickup {
                listing_id: ListingId::new(),
                command_id: CommandId::new(),
                claimant: UserId::new(),
            })
            .then_state(|state| {
                assert!(state.listings.is_empty());
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn persisted_acceptance_fans_out_notification_and_email() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            })
            .when_action(ListingAction::Persisted {
                listing_id,
                command_id: CommandId::new(),
                event: Box::new(ListingAction::PickupAccepted {
                    listing_id,
                    chosen: claimant,
                    at,
                }),
            })
            .then_effects(|effects| {
                // Durable notification plus the best-effort email.
                assertions::assert_effects_count(effects, 2);
            })
            .run();
    }

    #[test]
    fn repeat_application_persist_produces_no_notification() {
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        ReducerTest::new(ListingReducer::new())
            .with_env(test_env())
            .given_state(MarketState::new())
            .when_action(create(listing_id, owner))
            .when_action(ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            })
            .when_action(ListingAction::Persisted {
                listing_id,
                command_id: CommandId::new(),
                event: Box::new(ListingAction::PickupRequested {
                    listing_id,
                    claimant,
                    at,
                    newly_applied: false,
                }),
            })
            .then_effects(|effects| {
                assertions::assert_no_effects(effects);
            })
            .run();
    }

    #[test]
    fn storage_failure_rolls_back_an_untouched_listing() {
        let reducer = ListingReducer::new();
        let env = test_env();
        let mut state = MarketState::new();
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        drop(reducer.reduce(&mut state, create(listing_id, owner), &env));
        let prior = state.get(&listing_id).unwrap().clone();

        drop(reducer.reduce(
            &mut state,
            ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            },
            &env,
        ));
        let unsaved_revision = state.get(&listing_id).unwrap().revision;

        let effects = reducer.reduce(
            &mut state,
            ListingAction::PersistenceFailed {
                listing_id,
                command_id: CommandId::new(),
                op: ListingOp::RequestPickup,
                revision: unsaved_revision,
                prior: Some(Box::new(prior)),
                error: "disk full".to_string(),
            },
            &env,
        );

        // The application is gone; a retry starts from the pre-command state.
        let listing = state.get(&listing_id).unwrap();
        assert_eq!(listing.status, ListingStatus::Created);
        assert!(!listing.has_applicant(claimant));
        // Only the storage rejection goes back to the caller.
        assertions::assert_effects_count(&effects, 1);
    }

    #[test]
    fn storage_failure_keeps_state_that_later_commands_extended() {
        let reducer = ListingReducer::new();
        let env = test_env();
        let mut state = MarketState::new();
        let listing_id = ListingId::new();
        let owner = UserId::new();
        let claimant = UserId::new();

        drop(reducer.reduce(&mut state, create(listing_id, owner), &env));
        let prior = state.get(&listing_id).unwrap().clone();

        drop(reducer.reduce(
            &mut state,
            ListingAction::RequestPickup {
                listing_id,
                command_id: CommandId::new(),
                claimant,
            },
            &env,
        ));
        let unsaved_revision = state.get(&listing_id).unwrap().revision;

        // A later accept built on the unsaved application.
        drop(reducer.reduce(
            &mut state,
            ListingAction::AcceptPickup {
                listing_id,
                command_id: CommandId::new(),
                caller: owner,
                chosen: claimant,
            },
            &env,
        ));

        let effects = reducer.reduce(
            &mut state,
            ListingAction::PersistenceFailed {
                listing_id,
                command_id: CommandId::new(),
                op: ListingOp::RequestPickup,
                revision: unsaved_revision,
                prior: Some(Box::new(prior)),
                error: "disk full".to_string(),
            },
            &env,
        );

        // The acceptance stands; rolling back would erase it.
        let listing = state.get(&listing_id).unwrap();
        assert_eq!(listing.status, ListingStatus::Accepted);
        assert!(listing.has_applicant(claimant));
        // Rejection to the caller plus a re-save of the newest snapshot.
        assertions::assert_effects_count(&effects, 2);
    }

    #[test]
    fn failed_create_write_removes_the_listing_again() {
        let reducer = ListingReducer::new();
        let env = test_env();
        let mut state = MarketState::new();
        let listing_id = ListingId::new();

        drop(reducer.reduce(&mut state, create(listing_id, UserId::new()), &env));
        let revision = state.get(&listing_id).unwrap().revision;

        let effects = reducer.reduce(
            &mut state,
            ListingAction::PersistenceFailed {
                listing_id,
                command_id: CommandId::new(),
                op: ListingOp::Create,
                revision,
                prior: None,
                error: "disk full".to_string(),
            },
            &env,
        );

        assert!(state.get(&listing_id).is_none());
        assertions::assert_effects_count(&effects, 1);
    }
}
