//! # Repant Runtime
//!
//! Runtime implementation for the repant architecture: the [`Store`] that
//! coordinates reducer execution and effect handling.
//!
//! ## Core components
//!
//! - **Store**: owns the state, serializes reducer execution, executes effects
//! - **Effect executor**: runs effect descriptions and feeds produced actions
//!   back into the reducer
//! - **Action broadcast**: observers (request/response facades, projections)
//!   see every action produced by effects
//!
//! ## Concurrency contract
//!
//! The reducer runs synchronously while holding a write lock on state, so
//! guard evaluation and mutation form one critical section: two concurrent
//! commands against the same aggregate can never interleave between the
//! check and the act. Effects run on spawned tasks and never hold the lock.
//!
//! ## Example
//!
//! ```ignore
//! let store = Store::new(initial_state, my_reducer, environment);
//! let handle = store.send(Action::DoSomething).await?;
//! handle.wait().await;
//! let value = store.state(|s| s.some_field).await;
//! ```

use repant_core::{effect::Effect, reducer::Reducer};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};

/// Error types for the Store runtime.
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations.
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions.
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete.
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for a terminal action.
        ///
        /// Returned by `send_and_wait_for` when the timeout expires before
        /// a matching action is received.
        #[error("Timeout waiting for action")]
        Timeout,

        /// The action broadcast channel closed, typically because the store
        /// is shutting down.
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;

/// Tracks outstanding effects spawned for one `send` call.
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: watch::Sender<()>,
}

impl EffectTracking {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.notifier.send(());
        }
    }
}

/// Decrements the tracking counter on drop, so the count stays accurate
/// even when an effect task panics.
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Decrements the store-wide pending-effect counter on drop.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle returned by [`Store::send`] for awaiting effect completion.
///
/// `send` returns once effect execution has *started*; use the handle when
/// a caller needs the side effects of an action to have finished.
pub struct EffectHandle {
    counter: Arc<AtomicUsize>,
    receiver: watch::Receiver<()>,
}

impl EffectHandle {
    fn new() -> (Self, EffectTracking) {
        let counter = Arc::new(AtomicUsize::new(0));
        let (notifier, receiver) = watch::channel(());
        let handle = Self {
            counter: Arc::clone(&counter),
            receiver,
        };
        let tracking = EffectTracking { counter, notifier };
        (handle, tracking)
    }

    /// Wait until every effect spawned for the originating action (including
    /// effects produced by feedback actions) has completed.
    pub async fn wait(mut self) {
        while self.counter.load(Ordering::SeqCst) > 0 {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait for effect completion with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if effects are still running when the
    /// timeout elapses.
    pub async fn wait_with_timeout(self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| StoreError::Timeout)
    }
}

/// The Store - runtime coordinator for a reducer.
///
/// The store manages state (behind an async `RwLock`), the reducer, the
/// environment, and effect execution with the action feedback loop.
pub struct Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    state: Arc<RwLock<S>>,
    reducer: R,
    environment: E,
    shutdown: Arc<AtomicBool>,
    pending_effects: Arc<AtomicUsize>,
    /// Every action produced by an effect is broadcast to observers. This is
    /// what makes request/response patterns possible on top of the store.
    action_broadcast: broadcast::Sender<A>,
}

impl<S, A, E, R> Clone for Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Clone,
    E: Clone,
{
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            reducer: self.reducer.clone(),
            environment: self.environment.clone(),
            shutdown: Arc::clone(&self.shutdown),
            pending_effects: Arc::clone(&self.pending_effects),
            action_broadcast: self.action_broadcast.clone(),
        }
    }
}

impl<S, A, E, R> Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
    A: Send + Clone + 'static,
    S: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a new store with initial state, reducer, and environment.
    ///
    /// The action broadcast capacity defaults to 16; use
    /// [`Store::with_broadcast_capacity`] when many observers subscribe.
    #[must_use]
    pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
        Self::with_broadcast_capacity(initial_state, reducer, environment, 16)
    }

    /// Create a new store with a custom action broadcast capacity.
    #[must_use]
    pub fn with_broadcast_capacity(
        initial_state: S,
        reducer: R,
        environment: E,
        capacity: usize,
    ) -> Self {
        let (action_broadcast, _) = broadcast::channel(capacity);

        Self {
            state: Arc::new(RwLock::new(initial_state)),
            reducer,
            environment,
            shutdown: Arc::new(AtomicBool::new(false)),
            pending_effects: Arc::new(AtomicUsize::new(0)),
            action_broadcast,
        }
    }

    /// Subscribe to the action broadcast.
    ///
    /// Observers receive every action produced by effects (not the commands
    /// passed to `send` directly).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<A> {
        self.action_broadcast.subscribe()
    }

    /// Send an action to the store.
    ///
    /// 1. Acquires the write lock on state
    /// 2. Runs the reducer with `(state, action, environment)`
    /// 3. Spawns the returned effects (which may feed actions back)
    ///
    /// Returns once effect execution has started, not completed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting
    /// down.
    #[tracing::instrument(skip(self, action), name = "store_send")]
    pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Rejected action: store is shutting down");
            metrics::counter!("store.shutdown.rejected_actions").increment(1);
            return Err(StoreError::ShutdownInProgress);
        }

        metrics::counter!("store.commands.total").increment(1);

        let (handle, tracking) = EffectHandle::new();

        let effects = {
            let mut state = self.state.write().await;

            let start = std::time::Instant::now();
            let effects = self.reducer.reduce(&mut state, action, &self.environment);
            metrics::histogram!("store.reducer.duration_seconds")
                .record(start.elapsed().as_secs_f64());

            tracing::trace!(effect_count = effects.len(), "Reducer completed");
            effects
        };

        for effect in effects {
            self.spawn_effect(effect, tracking.clone());
        }

        Ok(handle)
    }

    /// Send an action and wait for a matching result action.
    ///
    /// Designed for request/response patterns: subscribe to the action
    /// broadcast *before* sending (avoiding the race where the outcome is
    /// broadcast before the observer exists), send the command, then return
    /// the first broadcast action the predicate accepts.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Timeout`]: no matching action within `timeout`
    /// - [`StoreError::ChannelClosed`]: broadcast closed (store shutting down)
    /// - [`StoreError::ShutdownInProgress`]: store is shutting down
    pub async fn send_and_wait_for<F>(
        &self,
        action: A,
        predicate: F,
        timeout: Duration,
    ) -> Result<A, StoreError>
    where
        F: Fn(&A) -> bool,
    {
        let mut receiver = self.subscribe();

        self.send(action).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(StoreError::Timeout)?;

            match tokio::time::timeout(remaining, receiver.recv()).await {
                Err(_) => return Err(StoreError::Timeout),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(StoreError::ChannelClosed)
                },
                // A lagged observer skips missed actions; for our request
                // volumes the buffer is ample, and the caller's timeout
                // still bounds the wait.
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Action observer lagged");
                },
                Ok(Ok(candidate)) => {
                    if predicate(&candidate) {
                        return Ok(candidate);
                    }
                },
            }
        }
    }

    /// Read current state via a closure, releasing the lock promptly.
    ///
    /// ```ignore
    /// let count = store.state(|s| s.listings.len()).await;
    /// ```
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        let state = self.state.read().await;
        f(&state)
    }

    /// Initiate graceful shutdown: reject new actions, then wait for pending
    /// effects to drain.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if effects are still running
    /// when the timeout expires.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        tracing::info!("Initiating graceful shutdown");
        metrics::counter!("store.shutdown.initiated").increment(1);

        self.shutdown.store(true, Ordering::Release);

        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(50);

        loop {
            let pending = self.pending_effects.load(Ordering::Acquire);

            if pending == 0 {
                tracing::info!("All effects completed, shutdown successful");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                tracing::error!(pending_effects = pending, "Shutdown timed out");
                return Err(StoreError::ShutdownTimeout(pending));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Spawn a top-level effect with completion tracking.
    fn spawn_effect(&self, effect: Effect<A>, tracking: EffectTracking) {
        if matches!(effect, Effect::None) {
            metrics::counter!("store.effects.executed", "type" => "none").increment(1);
            return;
        }

        tracking.increment();
        self.pending_effects.fetch_add(1, Ordering::SeqCst);
        let pending_guard = PendingGuard(Arc::clone(&self.pending_effects));

        let store = self.clone();
        tokio::spawn(async move {
            let _guard = DecrementGuard(tracking.clone());
            let _pending_guard = pending_guard;

            store.run_effect(effect, tracking).await;
        });
    }

    /// Execute one effect to completion, recursing into composites.
    ///
    /// Boxed recursion: `Effect` nests arbitrarily (`Parallel` inside
    /// `Sequential` and vice versa).
    fn run_effect(
        &self,
        effect: Effect<A>,
        tracking: EffectTracking,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let store = self.clone();
        Box::pin(async move {
            match effect {
                Effect::None => {},
                Effect::Future(fut) => {
                    metrics::counter!("store.effects.executed", "type" => "future")
                        .increment(1);
                    if let Some(action) = fut.await {
                        store.feed_back(action, tracking).await;
                    }
                },
                Effect::Delay { duration, action } => {
                    metrics::counter!("store.effects.executed", "type" => "delay")
                        .increment(1);
                    tokio::time::sleep(duration).await;
                    store.feed_back(*action, tracking).await;
                },
                Effect::Parallel(effects) => {
                    metrics::counter!("store.effects.executed", "type" => "parallel")
                        .increment(1);
                    let mut handles = Vec::with_capacity(effects.len());
                    for sub in effects {
                        let store = store.clone();
                        let tracking = tracking.clone();
                        handles.push(tokio::spawn(async move {
                            store.run_effect(sub, tracking).await;
                        }));
                    }
                    for handle in handles {
                        if let Err(e) = handle.await {
                            tracing::error!(error = %e, "Parallel effect task failed");
                        }
                    }
                },
                Effect::Sequential(effects) => {
                    metrics::counter!("store.effects.executed", "type" => "sequential")
                        .increment(1);
                    for sub in effects {
                        store.run_effect(sub, tracking.clone()).await;
                    }
                },
            }
        })
    }

    /// Feed an effect-produced action back through the reducer, broadcasting
    /// it to observers first.
    async fn feed_back(&self, action: A, tracking: EffectTracking) {
        let _ = self.action_broadcast.send(action.clone());

        // Run the feedback action through the reducer ourselves rather than
        // via `send`, so the follow-on effects stay tied to the originating
        // EffectHandle.
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Dropping feedback action: store is shutting down");
            return;
        }

        let effects = {
            let mut state = self.state.write().await;
            self.reducer.reduce(&mut state, action, &self.environment)
        };

        for effect in effects {
            self.spawn_effect(effect, tracking.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use repant_core::reducer::Effects;
    use repant_core::smallvec;

    #[derive(Clone, Debug, Default)]
    struct CounterState {
        count: i64,
        pinged: bool,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum CounterAction {
        Increment,
        IncrementThenPing,
        Ping,
    }

    #[derive(Clone)]
    struct CounterEnv;

    #[derive(Clone)]
    struct CounterReducer;

    impl Reducer for CounterReducer {
        type State = CounterState;
        type Action = CounterAction;
        type Environment = CounterEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            _env: &Self::Environment,
        ) -> Effects<Self::Action> {
            match action {
                CounterAction::Increment => {
                    state.count += 1;
                    smallvec![]
                },
                CounterAction::IncrementThenPing => {
                    state.count += 1;
                    smallvec![Effect::future(async { Some(CounterAction::Ping) })]
                },
                CounterAction::Ping => {
                    state.pinged = true;
                    smallvec![]
                },
            }
        }
    }

    fn store() -> Store<CounterState, CounterAction, CounterEnv, CounterReducer> {
        Store::new(CounterState::default(), CounterReducer, CounterEnv)
    }

    #[tokio::test]
    async fn send_mutates_state() {
        let store = store();
        store.send(CounterAction::Increment).await.unwrap();
        assert_eq!(store.state(|s| s.count).await, 1);
    }

    #[tokio::test]
    async fn effect_feedback_reaches_reducer() {
        let store = store();
        let handle = store.send(CounterAction::IncrementThenPing).await.unwrap();
        handle
            .wait_with_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(store.state(|s| s.pinged).await);
        assert_eq!(store.state(|s| s.count).await, 1);
    }

    #[tokio::test]
    async fn send_and_wait_for_matches_feedback_action() {
        let store = store();
        let result = store
            .send_and_wait_for(
                CounterAction::IncrementThenPing,
                |a| *a == CounterAction::Ping,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(result, CounterAction::Ping);
    }

    #[tokio::test]
    async fn send_and_wait_for_times_out_without_match() {
        let store = store();
        let result = store
            .send_and_wait_for(
                CounterAction::Increment,
                |a| *a == CounterAction::Ping,
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Timeout)));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_actions() {
        let store = store();
        store.shutdown(Duration::from_secs(1)).await.unwrap();
        let result = store.send(CounterAction::Increment).await;
        assert!(matches!(result, Err(StoreError::ShutdownInProgress)));
    }

    #[tokio::test]
    async fn concurrent_sends_serialize_at_the_reducer() {
        let store = Arc::new(store());
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.send(CounterAction::Increment).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.state(|s| s.count).await, 64);
    }
}
