//! Flush coordination: moving buffered events into the store and rolling
//! them up, one pass at a time.
//!
//! # Design
//!
//! ```text
//!  timer tick ──┐
//!               ├──► flush() ── buffer empty ──────────► Empty
//!  volume hit ──┘       │
//!                       ├── guard held ──► warn(backlog) ► Busy
//!                       ▼
//!              take_all() + spawn_blocking
//!                       │
//!              record_batch (one transaction)
//!                       │
//!              aggregate(periods) ──► guard released
//! ```
//!
//! The guard is a `tokio::sync::Mutex<()>`. [`FlushCoordinator::flush`] only
//! ever tries it, so a trigger never waits behind a running pass;
//! [`FlushCoordinator::drain`] awaits it, so shutdown runs after the pass in
//! flight.
//!
//! If committing a batch fails, the drained events are dropped unless
//! `requeue_on_failure` is set, in which case they go back to the buffer. A
//! failed rollup loses nothing: raw rows stay in place for the next pass.
//!
//! Failures that another pass cannot fix (see
//! [`TallyError::is_unrecoverable`]) are also recorded as the coordinator's
//! fault. [`FlushCoordinator::faulted`] resolves once one is recorded, which
//! is how the server learns that it has to stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::buffer::IngestBuffer;
use crate::error::{Result, StoreError, TallyError};
use crate::event::Event;
use crate::period::Period;
use crate::rollup::RollupReport;
use crate::store::{BatchSummary, Store};

/// Default number of pushes between volume-triggered flushes.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

/// Tunables for a [`FlushCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOptions {
    /// Periods rolled up by every pass.
    pub periods: Vec<Period>,
    /// A flush is triggered on every `threshold`-th push since the
    /// coordinator was created, whatever the buffer length is at that point.
    /// Zero disables the volume trigger.
    pub threshold: usize,
    /// Put drained events back into the buffer when committing them fails.
    pub requeue_on_failure: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            periods: Period::DEFAULT.to_vec(),
            threshold: DEFAULT_FLUSH_THRESHOLD,
            requeue_on_failure: false,
        }
    }
}

/// What one completed pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Events drained from the buffer.
    pub drained: usize,
    /// Result of committing them.
    pub batch: BatchSummary,
    /// Result of the rollup that followed.
    pub rollup: RollupReport,
    /// Wall-clock time of the pass.
    pub elapsed: Duration,
}

/// Result of [`FlushCoordinator::flush`].
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// Another pass holds the guard; the events stay buffered.
    Busy {
        /// Events waiting in the buffer.
        backlog: usize,
    },
    /// A pass was started on the blocking pool.
    Dispatched(JoinHandle<Result<FlushReport>>),
}

/// Drains the [`IngestBuffer`] into the [`Store`] with at most one pass in
/// flight.
///
/// Cloning is cheap; every clone shares the buffer, store and guard.
#[derive(Debug, Clone)]
pub struct FlushCoordinator {
    buffer: Arc<IngestBuffer>,
    store: Arc<Mutex<Store>>,
    periods: Arc<[Period]>,
    threshold: usize,
    requeue_on_failure: bool,
    pushed: Arc<AtomicUsize>,
    guard: Arc<AsyncMutex<()>>,
    fault: Arc<watch::Sender<Option<Arc<TallyError>>>>,
}

impl FlushCoordinator {
    /// Creates a coordinator over a shared buffer and store.
    ///
    /// An empty period list means [`Period::DEFAULT`]; a zero threshold
    /// disables the volume trigger.
    pub fn new(buffer: Arc<IngestBuffer>, store: Arc<Mutex<Store>>, options: FlushOptions) -> Self {
        let periods: Arc<[Period]> = if options.periods.is_empty() {
            Period::DEFAULT.into()
        } else {
            options.periods.into()
        };
        let (fault, _) = watch::channel(None);
        Self {
            buffer,
            store,
            periods,
            threshold: options.threshold,
            requeue_on_failure: options.requeue_on_failure,
            pushed: Arc::new(AtomicUsize::new(0)),
            guard: Arc::new(AsyncMutex::new(())),
            fault: Arc::new(fault),
        }
    }

    /// The shared buffer.
    pub fn buffer(&self) -> &Arc<IngestBuffer> {
        &self.buffer
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<Mutex<Store>> {
        &self.store
    }

    /// Periods rolled up by every pass.
    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    /// Returns true while a pass holds the guard.
    pub fn in_flight(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    /// The first unrecoverable failure of any pass, if one happened.
    pub fn fault(&self) -> Option<Arc<TallyError>> {
        self.fault.borrow().clone()
    }

    /// Resolves with the first unrecoverable failure of any pass.
    pub async fn faulted(&self) -> Arc<TallyError> {
        let mut rx = self.fault.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().as_ref() {
                return Arc::clone(err);
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`; this cannot happen while we wait
                std::future::pending::<()>().await;
            }
        }
    }

    /// Buffers an event and applies the volume trigger.
    ///
    /// Returns the flush outcome when this push crossed the threshold.
    /// Must be called from within a tokio runtime.
    pub fn push(&self, event: Event) -> Option<FlushOutcome> {
        self.buffer.push(event);
        let pushed = self.pushed.fetch_add(1, Ordering::Relaxed) + 1;
        (self.threshold > 0 && pushed % self.threshold == 0).then(|| self.flush())
    }

    /// Starts a pass over everything buffered, unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn flush(&self) -> FlushOutcome {
        if self.buffer.is_empty() {
            return FlushOutcome::Empty;
        }
        let Ok(permit) = Arc::clone(&self.guard).try_lock_owned() else {
            let backlog = self.buffer.len();
            tracing::warn!(backlog, "flush already in flight, events stay buffered");
            return FlushOutcome::Busy { backlog };
        };

        let events = self.buffer.take_all();
        if events.is_empty() {
            return FlushOutcome::Empty;
        }
        FlushOutcome::Dispatched(self.dispatch(permit, events))
    }

    /// Waits for any pass in flight, then commits and rolls up whatever is
    /// left in the buffer.
    ///
    /// The rollup runs even when the buffer is empty, so raw rows left by an
    /// earlier failed rollup are consumed.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the final pass, or
    /// [`StoreError::Task`] if the blocking task panicked.
    pub async fn drain(&self) -> Result<FlushReport> {
        let permit = Arc::clone(&self.guard).lock_owned().await;
        let events = self.buffer.take_all();
        self.dispatch(permit, events)
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }

    /// Flushes on a fixed interval until the returned task is aborted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_timer(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let _ = this.flush();
            }
        })
    }

    fn dispatch(&self, permit: OwnedMutexGuard<()>, events: Vec<Event>) -> JoinHandle<Result<FlushReport>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match this.run_pass(events) {
                Err(err) if err.is_unrecoverable() => Err(this.record_fault(err)),
                result => result,
            }
        })
    }

    /// Keeps the first fault and hands back an error pointing at it.
    fn record_fault(&self, err: TallyError) -> TallyError {
        let err = match err {
            TallyError::Store(StoreError::Fatal(shared)) => shared,
            other => Arc::new(other),
        };
        let recorded = self.fault.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(Arc::clone(&err));
                true
            } else {
                false
            }
        });
        if recorded {
            tracing::error!(error = %err, "unrecoverable storage failure");
        }
        StoreError::Fatal(err).into()
    }

    fn run_pass(&self, events: Vec<Event>) -> Result<FlushReport> {
        let start = Instant::now();
        let drained = events.len();
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);

        let batch = if events.is_empty() {
            BatchSummary::default()
        } else {
            match store.record_batch(&events) {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(error = %err, events = drained, "committing buffered events failed");
                    if self.requeue_on_failure {
                        self.buffer.requeue(events);
                        tracing::warn!(events = drained, "events requeued for the next flush");
                    } else {
                        tracing::warn!(events = drained, "events dropped");
                    }
                    return Err(err);
                }
            }
        };

        let rollup = store.aggregate(&self.periods)?;
        let elapsed = start.elapsed();
        tracing::debug!(
            drained,
            recorded = batch.recorded,
            dropped = batch.dropped,
            raw_rows = rollup.raw_rows(),
            elapsed_ms = elapsed.as_millis(),
            "flush complete"
        );

        Ok(FlushReport {
            drained,
            batch,
            rollup,
            elapsed,
        })
    }
}
