//! Optimistic status reconciliation.
//!
//! Gives the UI an instantly-updated message status while a background task
//! persists that status remotely. The optimistic write and its event
//! emission are synchronous - no I/O stands between the caller and the
//! visible state change. Confirmation, conflict detection, retry with
//! exponential backoff, and rollback all happen in background tasks.
//!
//! # Invariants
//!
//! - The optimistic status always reflects the most recently requested
//!   transition (last-writer-wins), regardless of how confirmations for
//!   earlier requests resolve
//! - At most one persist task is active per message id; each write attempt
//!   re-reads the current optimistic target so retries chase the latest
//!   desired state
//! - A confirmation that disagrees with a newer optimistic value never
//!   overwrites it; it is reported as a rollback event instead
//! - Exhausting retries emits exactly one permanent-failure event

mod error;
mod status;

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
pub use error::{ReconcileError, StatusStoreError};
pub use status::{MessageStatus, StatusEvent};
use tokio::sync::broadcast;

use crate::env::Environment;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default cap on remote write attempts per message.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Capacity of the status-event broadcast channel.
///
/// A subscriber that falls further behind than this observes
/// `RecvError::Lagged` and should resubscribe and re-render from its own
/// state rather than replaying the gap.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Doubling the delay stops here; further failures reuse the cap.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Retry/backoff tuning knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles per subsequent attempt.
    pub base_delay: Duration,
    /// Total write attempts before declaring permanent failure.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: DEFAULT_BASE_DELAY, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt after `failures` consecutive
    /// failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// The remote status-write collaborator.
///
/// Implementations talk to the backing data service; they may fail or time
/// out, and they classify failures via [`StatusStoreError::is_transient`].
#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
    /// Persist one status value for one message.
    async fn write_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StatusStoreError>;

    /// Persist several statuses in one call.
    ///
    /// The default implementation writes sequentially; stores with a real
    /// bulk endpoint should override it.
    async fn write_statuses(
        &self,
        updates: &[(String, MessageStatus)],
    ) -> Result<(), StatusStoreError> {
        for (message_id, status) in updates {
            self.write_status(message_id, *status).await?;
        }
        Ok(())
    }
}

struct StatusRecord<I> {
    optimistic: MessageStatus,
    confirmed: Option<MessageStatus>,
    last_transition_at: I,
    retry_count: u32,
    persist_active: bool,
}

struct ReconcilerState<I> {
    records: HashMap<String, StatusRecord<I>>,
}

/// What a successful remote write meant once compared against the current
/// optimistic value.
enum WriteOutcome {
    /// Written value matches the optimistic value: steady state reached.
    Confirmed,
    /// A newer optimistic value arrived while the write was in flight.
    Superseded,
    /// The record disappeared (already settled or permanently failed).
    Gone,
}

/// Optimistic/confirmed status tracker with background persistence.
///
/// Clones share the same tables, event stream, and store; the composition
/// root constructs one and hands copies to the send and receive paths.
pub struct StatusReconciler<E: Environment, S: StatusStore> {
    env: E,
    store: Arc<S>,
    policy: RetryPolicy,
    state: Arc<Mutex<ReconcilerState<E::Instant>>>,
    events: broadcast::Sender<StatusEvent>,
}

impl<E: Environment, S: StatusStore> Clone for StatusReconciler<E, S> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        }
    }
}

impl<E: Environment, S: StatusStore> StatusReconciler<E, S> {
    /// Create a reconciler over the given remote store.
    pub fn new(env: E, store: S, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            env,
            store: Arc::new(store),
            policy,
            state: Arc::new(Mutex::new(ReconcilerState { records: HashMap::new() })),
            events,
        }
    }

    /// Subscribe to the status-change event stream.
    ///
    /// Every subscriber sees every event from the moment it subscribes.
    pub fn status_updates(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Request a status transition for a message.
    ///
    /// With `optimistic = true` (the normal path) the new status is written
    /// locally and the event emitted before this call returns - nothing
    /// here waits on I/O. Remote persistence is scheduled in the
    /// background; its outcome arrives on the event stream.
    ///
    /// With `optimistic = false` (externally driven changes that must never
    /// show an unconfirmed state, e.g. read receipts) the remote write
    /// happens first and a single confirmed event is emitted after it
    /// succeeds.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if the message's current optimistic status
    ///   does not admit `status`
    pub fn update_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        optimistic: bool,
    ) -> Result<(), ReconcileError> {
        if optimistic {
            self.update_optimistic(message_id, status)
        } else {
            self.update_direct(message_id, status);
            Ok(())
        }
    }

    /// Apply the optimistic path to every entry synchronously, then persist
    /// the batch with one bulk remote write.
    ///
    /// Entries whose transition is illegal are skipped with a warning -
    /// status updates are independent per message and one bad entry must
    /// not sink the rest. Bulk-write failure degrades to an individual
    /// retry per message; there is no cross-message atomicity.
    pub fn batch_update_statuses(&self, updates: &[(String, MessageStatus)]) {
        let mut emitted = Vec::with_capacity(updates.len());
        let mut batch = Vec::with_capacity(updates.len());
        {
            let now = self.env.now();
            let mut state = self.lock_state();
            for (message_id, status) in updates {
                match apply_optimistic(&mut state, message_id, *status, now) {
                    Ok(newly_active) => {
                        emitted.push((message_id.clone(), *status));
                        if newly_active {
                            batch.push((message_id.clone(), *status));
                        }
                    },
                    Err(error) => {
                        tracing::warn!(%error, "skipping batch entry with illegal transition");
                    },
                }
            }
        }

        for (message_id, status) in emitted {
            self.emit(StatusEvent { is_optimistic: true, ..self.event(&message_id, status) });
        }

        if batch.is_empty() {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            match this.store.write_statuses(&batch).await {
                Ok(()) => {
                    for (message_id, written) in batch {
                        this.settle_write(&message_id, written);
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        %error,
                        messages = batch.len(),
                        "bulk status write failed, retrying messages individually"
                    );
                    for (message_id, _) in batch {
                        let this = this.clone();
                        tokio::spawn(async move { this.persist_loop(message_id).await });
                    }
                },
            }
        });
    }

    fn update_optimistic(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), ReconcileError> {
        let newly_active = {
            let now = self.env.now();
            let mut state = self.lock_state();
            apply_optimistic(&mut state, message_id, status, now)?
        };

        self.emit(StatusEvent { is_optimistic: true, ..self.event(message_id, status) });

        if newly_active {
            let this = self.clone();
            let message_id = message_id.to_string();
            tokio::spawn(async move { this.persist_loop(message_id).await });
        }
        Ok(())
    }

    fn update_direct(&self, message_id: &str, status: MessageStatus) {
        let this = self.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match this.store.write_status(&message_id, status).await {
                    Ok(()) => {
                        // If the message happens to be tracked optimistically
                        // at the same value, it is settled now.
                        {
                            let mut state = this.lock_state();
                            if state
                                .records
                                .get(&message_id)
                                .is_some_and(|record| record.optimistic == status)
                            {
                                state.records.remove(&message_id);
                            }
                        }
                        this.emit(StatusEvent {
                            is_confirmed: true,
                            ..this.event(&message_id, status)
                        });
                        return;
                    },
                    Err(error) if error.is_transient() => {
                        failures += 1;
                        if failures >= this.policy.max_attempts {
                            tracing::error!(
                                message_id = %message_id,
                                %error,
                                "direct status write exhausted retries"
                            );
                            this.emit(StatusEvent {
                                has_error: true,
                                is_permanent_failure: true,
                                ..this.event(&message_id, status)
                            });
                            return;
                        }
                        let delay = this.policy.delay_for(failures);
                        tracing::warn!(
                            message_id = %message_id,
                            attempt = failures,
                            %error,
                            ?delay,
                            "direct status write failed, backing off"
                        );
                        this.env.sleep(delay).await;
                    },
                    Err(error) => {
                        tracing::error!(
                            message_id = %message_id,
                            %error,
                            "direct status write rejected"
                        );
                        this.emit(StatusEvent {
                            has_error: true,
                            is_permanent_failure: true,
                            ..this.event(&message_id, status)
                        });
                        return;
                    },
                }
            }
        });
    }

    /// The single persist task for one message id.
    ///
    /// Loops until the record reaches steady state (confirmed == optimistic),
    /// disappears, or retries are exhausted. Every iteration re-reads the
    /// current optimistic target, so a newer update simply redirects the
    /// task instead of racing it.
    async fn persist_loop(self, message_id: String) {
        loop {
            let target = {
                let state = self.lock_state();
                match state.records.get(&message_id) {
                    Some(record) => record.optimistic,
                    None => return,
                }
            };

            match self.store.write_status(&message_id, target).await {
                Ok(()) => {
                    if !self.settle_write(&message_id, target) {
                        return;
                    }
                },
                Err(error) if error.is_transient() => {
                    let now = self.env.now();
                    let (failures, unsettled_for) = {
                        let mut state = self.lock_state();
                        match state.records.get_mut(&message_id) {
                            Some(record) => {
                                record.retry_count += 1;
                                (record.retry_count, now - record.last_transition_at)
                            },
                            None => return,
                        }
                    };
                    if failures >= self.policy.max_attempts {
                        tracing::error!(
                            message_id = %message_id,
                            attempts = failures,
                            ?unsettled_for,
                            %error,
                            "status write exhausted retries"
                        );
                        self.fail_permanently(&message_id);
                        return;
                    }
                    let delay = self.policy.delay_for(failures);
                    tracing::warn!(
                        message_id = %message_id,
                        attempt = failures,
                        ?unsettled_for,
                        %error,
                        ?delay,
                        "status write failed, backing off"
                    );
                    self.env.sleep(delay).await;
                },
                Err(error) => {
                    tracing::error!(message_id = %message_id, %error, "status write rejected");
                    self.fail_permanently(&message_id);
                    return;
                },
            }
        }
    }

    /// Compare a successful write against the current optimistic value and
    /// emit the matching event. Returns true if the persist task should
    /// keep chasing a newer target.
    fn settle_write(&self, message_id: &str, written: MessageStatus) -> bool {
        let outcome = {
            let mut state = self.lock_state();
            let current = state.records.get(message_id).map(|record| record.optimistic);
            match current {
                Some(optimistic) if optimistic == written => {
                    // Steady state: confirmed history for settled messages
                    // is not retained in memory.
                    state.records.remove(message_id);
                    WriteOutcome::Confirmed
                },
                Some(_) => {
                    if let Some(record) = state.records.get_mut(message_id) {
                        record.confirmed = Some(written);
                        record.retry_count = 0;
                    }
                    WriteOutcome::Superseded
                },
                None => WriteOutcome::Gone,
            }
        };

        match outcome {
            WriteOutcome::Confirmed => {
                self.emit(StatusEvent { is_confirmed: true, ..self.event(message_id, written) });
                false
            },
            WriteOutcome::Superseded => {
                tracing::debug!(
                    message_id,
                    confirmed = %written,
                    "confirmation superseded by newer optimistic value"
                );
                self.emit(StatusEvent { is_rollback: true, ..self.event(message_id, written) });
                true
            },
            WriteOutcome::Gone => false,
        }
    }

    /// Drop the record and emit the single permanent-failure event.
    fn fail_permanently(&self, message_id: &str) {
        {
            let mut state = self.lock_state();
            state.records.remove(message_id);
        }
        self.emit(StatusEvent {
            has_error: true,
            is_permanent_failure: true,
            ..self.event(message_id, MessageStatus::Failed)
        });
    }

    fn event(&self, message_id: &str, status: MessageStatus) -> StatusEvent {
        StatusEvent {
            message_id: message_id.to_string(),
            status,
            is_optimistic: false,
            is_confirmed: false,
            is_rollback: false,
            has_error: false,
            is_permanent_failure: false,
            timestamp_ms: self.env.wall_clock_millis(),
        }
    }

    fn emit(&self, event: StatusEvent) {
        // Err means no live subscribers, which is fine.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, ReconcilerState<E::Instant>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write the optimistic value into the table. Returns true if a persist
/// task must be started (none is active for this message yet).
fn apply_optimistic<I>(
    state: &mut ReconcilerState<I>,
    message_id: &str,
    status: MessageStatus,
    now: I,
) -> Result<bool, ReconcileError> {
    match state.records.entry(message_id.to_string()) {
        Entry::Occupied(mut occupied) => {
            let record = occupied.get_mut();
            if !record.optimistic.can_transition_to(status) {
                return Err(ReconcileError::InvalidTransition {
                    message_id: message_id.to_string(),
                    from: record.optimistic,
                    to: status,
                });
            }
            record.optimistic = status;
            record.last_transition_at = now;
            if record.persist_active {
                Ok(false)
            } else {
                record.persist_active = true;
                Ok(true)
            }
        },
        Entry::Vacant(vacant) => {
            vacant.insert(StatusRecord {
                optimistic: status,
                confirmed: None,
                last_transition_at: now,
                retry_count: 0,
                persist_active: true,
            });
            Ok(true)
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = tokio::time::Instant;

        fn now(&self) -> Self::Instant {
            tokio::time::Instant::now()
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            tokio::time::sleep(duration)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0);
        }

        fn wall_clock_millis(&self) -> u64 {
            7
        }
    }

    /// Store that records writes and can be told to fail or hang.
    #[derive(Default)]
    struct MockStore {
        writes: Mutex<Vec<(String, MessageStatus)>>,
        fail_first: AtomicU32,
        hang: bool,
    }

    impl MockStore {
        fn hanging() -> Self {
            Self { hang: true, ..Self::default() }
        }

        fn failing_first(count: u32) -> Self {
            let store = Self::default();
            store.fail_first.store(count, Ordering::SeqCst);
            store
        }

        fn written(&self) -> Vec<(String, MessageStatus)> {
            self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl StatusStore for Arc<MockStore> {
        async fn write_status(
            &self,
            message_id: &str,
            status: MessageStatus,
        ) -> Result<(), StatusStoreError> {
            if self.hang {
                futures::future::pending::<()>().await;
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(StatusStoreError::Unavailable { reason: "mock outage".to_string() });
            }
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((message_id.to_string(), status));
            Ok(())
        }
    }

    fn reconciler(
        store: Arc<MockStore>,
    ) -> StatusReconciler<TestEnv, Arc<MockStore>> {
        StatusReconciler::new(TestEnv, store, RetryPolicy::default())
    }

    #[tokio::test]
    async fn optimistic_event_is_emitted_before_any_io_completes() {
        let store = Arc::new(MockStore::hanging());
        let reconciler = reconciler(Arc::clone(&store));
        let mut events = reconciler.status_updates();

        reconciler.update_status("m1", MessageStatus::Sending, true).unwrap();

        // The event is already in the channel: no await happened between the
        // call and the emission.
        let event = events.try_recv().unwrap();
        assert_eq!(event.status, MessageStatus::Sending);
        assert!(event.is_optimistic);
        assert!(!event.is_confirmed);
        assert_eq!(event.timestamp_ms, 7);
        assert!(store.written().is_empty());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_synchronously() {
        let reconciler = reconciler(Arc::new(MockStore::default()));

        reconciler.update_status("m1", MessageStatus::Delivered, true).unwrap();
        let result = reconciler.update_status("m1", MessageStatus::Sending, true);

        assert_eq!(
            result,
            Err(ReconcileError::InvalidTransition {
                message_id: "m1".to_string(),
                from: MessageStatus::Delivered,
                to: MessageStatus::Sending,
            })
        );
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let reconciler = reconciler(Arc::new(MockStore::hanging()));
        let mut first = reconciler.status_updates();
        let mut second = reconciler.status_updates();

        reconciler.update_status("m1", MessageStatus::Sending, true).unwrap();

        assert_eq!(first.try_recv().unwrap().status, MessageStatus::Sending);
        assert_eq!(second.try_recv().unwrap().status, MessageStatus::Sending);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_write_confirms_and_clears_the_record() {
        let store = Arc::new(MockStore::default());
        let reconciler = reconciler(Arc::clone(&store));
        let mut events = reconciler.status_updates();

        reconciler.update_status("m1", MessageStatus::Sending, true).unwrap();

        let optimistic = events.recv().await.unwrap();
        assert!(optimistic.is_optimistic);

        let confirmed = events.recv().await.unwrap();
        assert!(confirmed.is_confirmed);
        assert_eq!(confirmed.status, MessageStatus::Sending);
        assert_eq!(store.written(), vec![("m1".to_string(), MessageStatus::Sending)]);

        // Steady state: the record is gone, so a fresh record (and task)
        // serves the next transition.
        assert!(reconciler.lock_state().records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let store = Arc::new(MockStore::failing_first(2));
        let reconciler = reconciler(Arc::clone(&store));
        let mut events = reconciler.status_updates();

        reconciler.update_status("m1", MessageStatus::Sending, true).unwrap();

        let _optimistic = events.recv().await.unwrap();
        let confirmed = events.recv().await.unwrap();
        assert!(confirmed.is_confirmed);
        assert_eq!(store.written(), vec![("m1".to_string(), MessageStatus::Sending)]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_applies_every_entry_optimistically() {
        let store = Arc::new(MockStore::default());
        let reconciler = reconciler(Arc::clone(&store));
        let mut events = reconciler.status_updates();

        reconciler.batch_update_statuses(&[
            ("m1".to_string(), MessageStatus::Sending),
            ("m2".to_string(), MessageStatus::Sending),
        ]);

        let first = events.try_recv().unwrap();
        let second = events.try_recv().unwrap();
        assert!(first.is_optimistic && second.is_optimistic);

        // Both confirmations arrive via the bulk write.
        let mut confirmed = Vec::new();
        for _ in 0..2 {
            let event = events.recv().await.unwrap();
            assert!(event.is_confirmed);
            confirmed.push(event.message_id);
        }
        confirmed.sort();
        assert_eq!(confirmed, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(store.written().len(), 2);
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(500), max_attempts: 5 };

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
    }

    #[test]
    fn backoff_growth_is_capped() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(500), max_attempts: 5 };
        assert_eq!(policy.delay_for(200), policy.delay_for(MAX_BACKOFF_SHIFT + 1));
    }
}
