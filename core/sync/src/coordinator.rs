//! Sync coordinator: drains the mutation queue against the remote endpoint.
//!
//! ```text
//! Idle --(offline→online edge | explicit trigger | backoff timer)--> Syncing
//! Syncing --(snapshot exhausted | pass-level error)--> Idle
//! ```
//!
//! Per-mutation failures only bump that mutation's retry count; the rest of
//! the snapshot is still attempted. Pass-level failures (the store cannot be
//! read or written) schedule another pass with exponential backoff, up to
//! [`BackoffConfig::max_attempts`] times.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use offsync_common::Result;
use offsync_storage::{Clock, MutationQueue, MutationStatus, QueuedMutation, ResponseCache};

use crate::retry::BackoffConfig;
use crate::state::SyncState;
use crate::transport::{is_success, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Tunables of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time budget of each remote call.
    pub request_timeout: Duration,
    /// Backoff schedule for pass-level failures.
    pub backoff: BackoffConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Mutations sent to the remote.
    pub attempted: usize,
    /// Mutations accepted (2xx).
    pub synced: usize,
    /// Mutations that failed this pass, including those that became permanent.
    pub failed: usize,
    /// Mutations that exhausted their retries during this pass.
    pub permanently_failed: usize,
    /// The pass stopped early because connectivity was lost.
    pub interrupted: bool,
    pub duration: Duration,
}

/// Result of asking for a sync pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A pass ran over the pending snapshot.
    Completed(SyncReport),
    /// Another pass was in flight; this request was ignored.
    AlreadyRunning,
    /// The device is offline; nothing was attempted.
    Offline,
}

/// Notifications for calling subsystems.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass finished draining its snapshot.
    PassCompleted(SyncReport),
    /// A pass hit a systemic failure. `retry_in` is `None` once backoff is exhausted.
    PassFailed {
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },
    /// A mutation exceeded its retry budget and needs user attention.
    MutationFailedPermanently(QueuedMutation),
}

/// Where a pass request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Caller request or connectivity edge.
    External,
    /// Scheduled pass-level retry.
    Backoff,
}

/// Drives queue drainage. One per engine.
pub struct SyncCoordinator {
    queue: MutationQueue,
    cache: ResponseCache,
    transport: Arc<dyn Transport>,
    state: Arc<SyncState>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    events: broadcast::Sender<SyncEvent>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    passes_started: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(
        queue: MutationQueue,
        cache: ResponseCache,
        transport: Arc<dyn Transport>,
        state: Arc<SyncState>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            queue,
            cache,
            transport,
            state,
            clock,
            config,
            events,
            retry_task: Mutex::new(None),
            passes_started: AtomicU64::new(0),
        }
    }

    /// Run a pass now unless one is already running or the device is offline.
    ///
    /// # Errors
    /// - Pass-level failures (store unavailable); a backoff retry has been
    ///   scheduled if the budget allows
    pub async fn sync(self: &Arc<Self>) -> Result<SyncOutcome> {
        self.run(Trigger::External).await
    }

    /// Fire-and-log variant of [`SyncCoordinator::sync`] for event sources.
    pub async fn trigger(self: &Arc<Self>) {
        match self.sync().await {
            Ok(SyncOutcome::Completed(report)) => debug!("Triggered pass finished: {:?}", report),
            Ok(outcome) => debug!("Triggered pass skipped: {:?}", outcome),
            Err(e) => warn!("Triggered pass failed: {}", e),
        }
    }

    /// Number of passes that got past the idle and online checks.
    pub fn passes_started(&self) -> u64 {
        self.passes_started.load(Ordering::SeqCst)
    }

    /// Subscribe to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Whether a backoff retry is waiting to fire.
    pub fn retry_scheduled(&self) -> bool {
        self.retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel any scheduled backoff retry.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            debug!("Cancelled scheduled sync retry");
        }
    }

    async fn run(self: &Arc<Self>, trigger: Trigger) -> Result<SyncOutcome> {
        let result = {
            let Some(_guard) = self.state.try_begin_pass() else {
                debug!("Sync pass already running, ignoring {:?} trigger", trigger);
                return Ok(SyncOutcome::AlreadyRunning);
            };

            match trigger {
                Trigger::External => {
                    self.cancel_scheduled_retry();
                    if self.state.pass_attempt() > self.config.backoff.max_attempts {
                        self.state.reset_pass_attempts();
                    }
                }
                Trigger::Backoff => {
                    // This pass is the timer firing; detach its own handle.
                    self.retry_task
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                }
            }

            if !self.state.is_online() {
                debug!("Offline, skipping sync pass");
                return Ok(SyncOutcome::Offline);
            }

            self.passes_started.fetch_add(1, Ordering::SeqCst);
            self.drain().await
        };

        match result {
            Ok(report) => {
                if !report.interrupted {
                    self.state.record_success(self.clock.now());
                }
                info!(
                    "Sync pass finished in {:?}: {} attempted, {} synced, {} failed",
                    report.duration, report.attempted, report.synced, report.failed
                );
                let _ = self.events.send(SyncEvent::PassCompleted(report.clone()));
                if report.interrupted {
                    tokio::spawn(Self::resume_after_interruption(Arc::clone(self)));
                }
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                let (attempt, retry_in) = self.schedule_retry();
                warn!("Sync pass failed (stage {}): {}", attempt, e);
                let _ = self.events.send(SyncEvent::PassFailed {
                    attempt,
                    error: e.to_string(),
                    retry_in,
                });
                Err(e)
            }
        }
    }

    /// Attempt every pending mutation of the current snapshot, oldest first.
    async fn drain(&self) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::default();

        self.cache.clear_expired().await?;

        let pending = self.queue.list_pending().await?;
        info!(
            "Sync pass started with {} pending mutations over {}",
            pending.len(),
            self.transport.name()
        );

        for mutation in pending {
            if !self.state.is_online() {
                info!("Connectivity lost mid-pass, stopping");
                report.interrupted = true;
                break;
            }

            report.attempted += 1;
            if self.attempt(&mutation).await {
                self.queue.mark_synced(&mutation.id).await?;
                report.synced += 1;
                continue;
            }

            let updated = self.queue.mark_failed(&mutation.id).await?;
            report.failed += 1;
            if updated.status == MutationStatus::FailedPermanently {
                report.permanently_failed += 1;
                let _ = self
                    .events
                    .send(SyncEvent::MutationFailedPermanently(updated));
            }
        }

        report.duration = start.elapsed();
        Ok(report)
    }

    /// Send one mutation. Anything but a 2xx within the time budget is a failure.
    async fn attempt(&self, mutation: &QueuedMutation) -> bool {
        match timeout(self.config.request_timeout, self.transport.execute(mutation)).await {
            Ok(Ok(status)) if is_success(status) => {
                debug!("{} {} -> {}", mutation.method, mutation.endpoint, status);
                true
            }
            Ok(Ok(status)) => {
                warn!(
                    "{} {} rejected with {} (mutation {})",
                    mutation.method, mutation.endpoint, status, mutation.id
                );
                false
            }
            Ok(Err(e)) if e.is_transient() => {
                warn!("{} {} failed: {}", mutation.method, mutation.endpoint, e);
                false
            }
            Ok(Err(e)) => {
                error!(
                    "{} {} cannot be sent (mutation {}): {}",
                    mutation.method, mutation.endpoint, mutation.id, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "{} {} timed out after {:?}",
                    mutation.method, mutation.endpoint, self.config.request_timeout
                );
                false
            }
        }
    }

    /// Count a pass-level failure and arm the backoff timer if within budget.
    fn schedule_retry(self: &Arc<Self>) -> (u32, Option<Duration>) {
        let attempt = self.state.record_pass_failure();
        if !self.config.backoff.allows(attempt) {
            warn!(
                "Sync pass failed {} times, waiting for connectivity change or manual sync",
                attempt + 1
            );
            return (attempt, None);
        }

        let delay = self.config.backoff.delay_for_attempt(attempt);
        info!("Retrying sync pass in {:?}", delay);

        let task = tokio::spawn(Self::retry_after(Arc::downgrade(self), delay));
        if let Some(previous) = self
            .retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
        (attempt, Some(delay))
    }

    fn retry_after(coordinator: Weak<Self>, delay: Duration) -> BoxFuture<'static, ()> {
        async move {
            sleep(delay).await;
            if let Some(coordinator) = coordinator.upgrade() {
                if let Err(e) = coordinator.run(Trigger::Backoff).await {
                    debug!("Backoff pass failed: {}", e);
                }
            }
        }
        .boxed()
    }

    /// An online edge that arrived while the interrupted pass still held the
    /// guard was answered with `AlreadyRunning`; look again once it is free.
    fn resume_after_interruption(coordinator: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if coordinator.state.is_online() {
                info!("Back online after an interrupted pass, resuming");
                coordinator.trigger().await;
            }
        }
        .boxed()
    }

    fn cancel_scheduled_retry(&self) {
        let task = self
            .retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
