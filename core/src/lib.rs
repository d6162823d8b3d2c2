//! # Repant Core
//!
//! Core traits and types for the repant marketplace architecture.
//!
//! The write path of the system is built on the Reducer pattern:
//!
//! - **State**: owned domain state for an aggregate
//! - **Action**: unified input type (commands and events)
//! - **Reducer**: pure function `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: side-effect *descriptions*, executed by the runtime
//! - **Environment**: injected dependencies behind traits
//!
//! Reducers contain all business logic, run synchronously under the store's
//! write lock, and never perform I/O themselves. Everything that touches the
//! outside world is returned as an [`effect::Effect`] value and executed by
//! the `repant-runtime` store.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Reducer module - the core trait for business logic.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// Effect vector returned by reducers.
    ///
    /// Most actions produce zero to four effects; `SmallVec` keeps the common
    /// case off the heap.
    pub type Effects<A> = SmallVec<[Effect<A>; 4]>;

    /// The Reducer trait - core abstraction for business logic.
    ///
    /// A reducer validates the incoming action against current state, applies
    /// the resulting event in place, and returns effect descriptions for the
    /// runtime to execute.
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for ListingReducer {
    ///     type State = ListingState;
    ///     type Action = ListingAction;
    ///     type Environment = ListingEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut ListingState,
    ///         action: ListingAction,
    ///         env: &ListingEnvironment,
    ///     ) -> Effects<ListingAction> {
    ///         // guard, mutate, describe side effects
    ///         smallvec![]
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on.
        type State;

        /// The action type this reducer processes.
        type Action;

        /// The environment type with injected dependencies.
        type Environment;

        /// Reduce an action into state changes and effects.
        ///
        /// This must be a pure function apart from the in-place state
        /// mutation: no I/O, no panics, deterministic given `(state, action)`
        /// and the values read from `env` (e.g. the clock).
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Effects<Self::Action>;
    }
}

/// Effect module - side-effect descriptions.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Describes a side effect to be executed by the store runtime.
    ///
    /// Effects are values, not execution. A reducer returns them; the runtime
    /// interprets them on spawned tasks. An effect may feed an action back
    /// into the reducer (the feedback loop), which is how asynchronous
    /// outcomes (persistence results, dispatch confirmations) re-enter the
    /// state machine.
    #[allow(missing_docs)]
    pub enum Effect<Action> {
        /// No-op effect.
        None,

        /// Run effects concurrently.
        Parallel(Vec<Effect<Action>>),

        /// Run effects in order, waiting for each to complete.
        Sequential(Vec<Effect<Action>>),

        /// Dispatch an action after a delay (timeouts, retries).
        Delay {
            /// How long to wait.
            duration: Duration,
            /// Action to dispatch after the delay.
            action: Box<Action>,
        },

        /// Arbitrary async computation.
        ///
        /// Returns `Option<Action>`; `Some` is fed back into the reducer.
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug since the boxed future is opaque.
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel.
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially.
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Build a `Future` effect from an async block.
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }

        /// Build a `Future` effect that performs work but never feeds an
        /// action back (fire-and-forget, e.g. best-effort push delivery).
        pub fn fire_and_forget<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = ()> + Send + 'static,
        {
            Effect::Future(Box::pin(async move {
                fut.await;
                None
            }))
        }
    }
}

/// Environment module - dependency injection traits.
///
/// All external dependencies of a reducer are abstracted behind traits and
/// injected via the `Environment` associated type. The traits here are the
/// ones shared by every aggregate; domain-specific providers live next to
/// their reducers.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Abstracts time for testability.
    ///
    /// Production uses [`SystemClock`]; tests pin time with [`FixedClock`]
    /// so timestamp-sensitive assertions are deterministic.
    pub trait Clock: Send + Sync {
        /// Get the current time.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Deterministic clock that always returns the same instant.
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock {
        /// The instant this clock is pinned to.
        pub time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Pin the clock to `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }
}
