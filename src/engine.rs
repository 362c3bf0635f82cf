//! The election engine: one participant's state machine and timing loop
//!
//! The engine owns a single background task that alternates between two
//! cadences — retrying acquisition while seeking, renewing while leading —
//! and funnels every store call through one internal gate so the same engine
//! never has two operations in flight. Leadership transitions are delivered
//! synchronously to registered listeners, exactly once per actual transition.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ElectionError, Result};
use crate::lease::{LeaseRecord, LeadershipChange};
use crate::options::ElectionOptions;
use crate::store::LeaseStore;

type Listener = Box<dyn Fn(&LeadershipChange) + Send + Sync>;

/// Lifecycle state of an [`ElectionEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Constructed, not started
    Idle,
    /// Started and competing for the lease
    Seeking,
    /// Holds a currently-valid lease
    Leading,
    /// Stopped; terminal
    Stopped,
}

/// One participant competing for leadership of a named election
///
/// The engine is bound to a [`LeaseStore`] at construction and drives the
/// acquire/renew/retry loop against it. `start()` makes one immediate
/// attempt and then (by default) keeps a background loop running; `stop()`
/// cancels the loop and releases the lease best-effort.
///
/// # Example
///
/// ```rust
/// use leasehold::{ElectionEngine, ElectionOptions, InMemoryLeaseStore};
/// use std::sync::Arc;
///
/// # async fn example() -> leasehold::Result<()> {
/// let store = Arc::new(InMemoryLeaseStore::new());
/// let engine = ElectionEngine::new(store, "cache-warmer", ElectionOptions::default())?;
///
/// engine.on_leadership_changed(|change| {
///     if change.leadership_gained() {
///         println!("this instance now runs the singleton work");
///     }
/// });
///
/// if engine.start().await {
///     // do leader-only work
/// }
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ElectionEngine {
    inner: Arc<Inner>,
    loop_handle: TokioMutex<Option<JoinHandle<()>>>,
}

struct Inner {
    election_name: String,
    participant_id: String,
    options: ElectionOptions,
    store: Arc<dyn LeaseStore>,
    is_leader: AtomicBool,
    started: AtomicBool,
    current_leader: Mutex<Option<LeaseRecord>>,
    listeners: Mutex<Vec<Listener>>,
    cancel: CancellationToken,
    /// Serializes loop ticks, direct calls, and the shutdown release
    op_gate: TokioMutex<()>,
}

impl ElectionEngine {
    /// Create an engine with a generated participant id
    ///
    /// Options are validated (corrected, never rejected); an empty election
    /// name fails fast.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        election_name: impl Into<String>,
        options: ElectionOptions,
    ) -> Result<Self> {
        Self::with_participant(store, election_name, Uuid::new_v4().to_string(), options)
    }

    /// Create an engine with an explicit participant id
    pub fn with_participant(
        store: Arc<dyn LeaseStore>,
        election_name: impl Into<String>,
        participant_id: impl Into<String>,
        options: ElectionOptions,
    ) -> Result<Self> {
        let election_name = election_name.into();
        if election_name.trim().is_empty() {
            return Err(ElectionError::InvalidElectionName(
                "must not be empty".to_string(),
            ));
        }
        let participant_id = participant_id.into();
        if participant_id.trim().is_empty() {
            return Err(ElectionError::InvalidElectionName(
                "participant id must not be empty".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                election_name,
                participant_id,
                options: options.validate(),
                store,
                is_leader: AtomicBool::new(false),
                started: AtomicBool::new(false),
                current_leader: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                op_gate: TokioMutex::new(()),
            }),
            loop_handle: TokioMutex::new(None),
        })
    }

    /// Register a leadership-change listener
    ///
    /// Listeners run synchronously in the transitioning context and must not
    /// block for long; per engine, they observe transitions in the order they
    /// occur.
    pub fn on_leadership_changed(&self, listener: impl Fn(&LeadershipChange) + Send + Sync + 'static) {
        self.inner
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Start competing: one immediate attempt, then the background loop
    ///
    /// The immediate attempt runs under the loop's catch-and-log policy, so a
    /// transient store failure here means "not leader yet", not an error —
    /// use [`try_acquire_leadership`](Self::try_acquire_leadership) when the
    /// failure itself matters. Returns whether this participant is leader
    /// after the attempt. Calling `start` again while running is a no-op.
    pub async fn start(&self) -> bool {
        if self.inner.cancel.is_cancelled() {
            warn!(
                election = %self.inner.election_name,
                "start() called on a stopped engine"
            );
            return false;
        }
        self.inner.started.store(true, Ordering::SeqCst);

        if let Err(e) = self.inner.acquire_once().await {
            warn!(
                election = %self.inner.election_name,
                participant = %self.inner.participant_id,
                error = %e,
                "initial acquisition attempt failed"
            );
        }

        if self.inner.options.enable_continuous_check {
            let mut handle = self.loop_handle.lock().await;
            if handle.is_none() && !self.inner.cancel.is_cancelled() {
                let inner = Arc::clone(&self.inner);
                *handle = Some(tokio::spawn(run_loop(inner)));
                debug!(
                    election = %self.inner.election_name,
                    participant = %self.inner.participant_id,
                    "election loop started"
                );
            }
        }

        self.is_leader()
    }

    /// Stop the engine: cancel the loop, then release the lease best-effort
    ///
    /// Waits for the loop to observe cancellation before releasing, so the
    /// release never races a renewal. Release failures are logged, not
    /// surfaced — callers are typically shutting down and cannot act on
    /// them. The engine is terminal afterward.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(
                    election = %self.inner.election_name,
                    error = %e,
                    "election loop ended abnormally"
                );
            }
        }

        if self.inner.is_leader() {
            self.inner.release_best_effort().await;
        }

        info!(
            election = %self.inner.election_name,
            participant = %self.inner.participant_id,
            "election engine stopped"
        );
    }

    /// One explicit acquisition attempt
    ///
    /// Store failures propagate on this path — the caller asked explicitly
    /// and can act on the error. On success the engine transitions to leader
    /// and emits a change event; on contention it refreshes
    /// [`current_leader`](Self::current_leader) from a fresh store read so
    /// non-leaders always see who holds the lease, without emitting any
    /// gain/loss event.
    pub async fn try_acquire_leadership(&self) -> Result<bool> {
        self.inner.acquire_once().await
    }

    /// Voluntarily give up leadership; best-effort, never fails
    ///
    /// Returns whether a lease this participant held was actually removed
    /// from the store. Meaningful only while leader.
    pub async fn release_leadership(&self) -> bool {
        self.inner.release_best_effort().await
    }

    /// Whether this participant currently believes it is leader
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    /// Last known lease state, including when held by a competitor
    pub fn current_leader(&self) -> Option<LeaseRecord> {
        self.inner
            .current_leader
            .lock()
            .expect("lease lock poisoned")
            .clone()
    }

    /// This participant's identifier
    pub fn participant_id(&self) -> &str {
        &self.inner.participant_id
    }

    /// The election this engine competes in
    pub fn election_name(&self) -> &str {
        &self.inner.election_name
    }

    /// Validated options in effect for this engine
    pub fn options(&self) -> &ElectionOptions {
        &self.inner.options
    }

    /// Current lifecycle state
    pub fn state(&self) -> ElectionState {
        if self.inner.cancel.is_cancelled() {
            ElectionState::Stopped
        } else if self.inner.is_leader() {
            ElectionState::Leading
        } else if self.inner.started.load(Ordering::SeqCst) {
            ElectionState::Seeking
        } else {
            ElectionState::Idle
        }
    }
}

impl Drop for ElectionEngine {
    fn drop(&mut self) {
        // The loop task holds its own Arc<Inner>; cancelling here keeps it
        // from outliving the engine. No release happens on drop — call
        // `stop()` for the best-effort shutdown release.
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Bound a store call by the configured operation timeout
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.options.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ElectionError::Timeout {
                operation,
                timeout: self.options.operation_timeout,
            }),
        }
    }

    /// One acquisition attempt; shared by `start`, the loop, and direct calls
    async fn acquire_once(&self) -> Result<bool> {
        let _gate = self.op_gate.lock().await;

        let acquired = self
            .bounded(
                "try_acquire",
                self.store.try_acquire(
                    &self.election_name,
                    &self.participant_id,
                    self.options.lease_duration,
                    self.options.metadata.as_ref(),
                ),
            )
            .await?;

        match acquired {
            Some(record) => {
                self.transition_to_leader(record);
                Ok(true)
            }
            None => {
                // Contention: refresh the observed holder so callers can see
                // who won, but emit no gain/loss event for it.
                let holder = self
                    .bounded("get_current", self.store.get_current(&self.election_name))
                    .await?;
                self.observe_current(holder);
                Ok(false)
            }
        }
    }

    /// One renewal attempt from the loop; never propagates
    async fn renew_tick(&self) {
        let _gate = self.op_gate.lock().await;
        if !self.is_leader() {
            return;
        }

        let renewed = self
            .bounded(
                "try_renew",
                self.store.try_renew(
                    &self.election_name,
                    &self.participant_id,
                    self.options.lease_duration,
                    self.options.metadata.as_ref(),
                ),
            )
            .await;

        match renewed {
            Ok(Some(record)) => {
                debug!(
                    election = %self.election_name,
                    participant = %self.participant_id,
                    expires_at = %record.expires_at,
                    "lease renewed"
                );
                // Same holder, fresh expiry: supersede the record, no event.
                self.observe_current(Some(record));
            }
            Ok(None) => {
                warn!(
                    election = %self.election_name,
                    participant = %self.participant_id,
                    "lease no longer held by this participant"
                );
                self.transition_to_follower(None);
            }
            Err(e) => {
                warn!(
                    election = %self.election_name,
                    participant = %self.participant_id,
                    error = %e,
                    "lease renewal failed"
                );
                self.transition_to_follower(None);
            }
        }
        // No immediate re-acquisition here: the next wake runs the seeking
        // branch at the retry cadence.
    }

    /// One acquisition attempt from the loop; never propagates
    async fn seek_tick(&self) {
        match self.acquire_once().await {
            Ok(true) | Ok(false) => {}
            Err(e) => {
                warn!(
                    election = %self.election_name,
                    participant = %self.participant_id,
                    error = %e,
                    "acquisition attempt failed; will retry"
                );
            }
        }
    }

    async fn release_best_effort(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let _gate = self.op_gate.lock().await;
        if !self.is_leader() {
            return false;
        }

        match self
            .bounded(
                "release",
                self.store.release(&self.election_name, &self.participant_id),
            )
            .await
        {
            Ok(released) => {
                if released {
                    info!(
                        election = %self.election_name,
                        participant = %self.participant_id,
                        "leadership released"
                    );
                } else {
                    debug!(
                        election = %self.election_name,
                        participant = %self.participant_id,
                        "no lease to release"
                    );
                }
                // Either way the lease is not ours anymore.
                self.transition_to_follower(None);
                released
            }
            Err(e) => {
                warn!(
                    election = %self.election_name,
                    participant = %self.participant_id,
                    error = %e,
                    "best-effort release failed"
                );
                false
            }
        }
    }

    fn transition_to_leader(&self, record: LeaseRecord) {
        let previous = {
            let mut current = self.current_leader.lock().expect("lease lock poisoned");
            let previous = current.clone();
            *current = Some(record.clone());
            previous
        };
        let was_leader = self.is_leader.swap(true, Ordering::SeqCst);

        if !was_leader {
            info!(
                election = %self.election_name,
                participant = %self.participant_id,
                expires_at = %record.expires_at,
                "leadership acquired"
            );
            self.emit(LeadershipChange {
                was_leader: false,
                is_leader: true,
                previous,
                current: Some(record),
            });
        }
    }

    fn transition_to_follower(&self, observed: Option<LeaseRecord>) {
        let previous = {
            let mut current = self.current_leader.lock().expect("lease lock poisoned");
            let previous = current.clone();
            *current = observed.clone();
            previous
        };
        let was_leader = self.is_leader.swap(false, Ordering::SeqCst);

        if was_leader {
            self.emit(LeadershipChange {
                was_leader: true,
                is_leader: false,
                previous,
                current: observed,
            });
        }
    }

    /// Update the observed holder without any self-transition
    fn observe_current(&self, observed: Option<LeaseRecord>) {
        let mut current = self.current_leader.lock().expect("lease lock poisoned");
        *current = observed;
    }

    fn emit(&self, change: LeadershipChange) {
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener(&change);
        }
    }
}

/// The background loop: sleep at the role's cadence, then one store operation
///
/// The interval is re-armed after each iteration based on the current role.
/// Every sleep and every tick is cancellable; nothing a store throws can end
/// the loop.
async fn run_loop(inner: Arc<Inner>) {
    loop {
        let interval = if inner.is_leader() {
            inner.options.renewal_interval
        } else {
            inner.options.retry_interval
        };

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if inner.is_leader() {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.renew_tick() => {}
            }
        } else {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.seek_tick() => {}
            }
        }
    }

    debug!(
        election = %inner.election_name,
        participant = %inner.participant_id,
        "election loop exited"
    );
}
