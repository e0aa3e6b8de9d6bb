//! Flush scheduling and the per-item reconciliation protocol.
//!
//! [`SyncOrchestrator`] runs a single control loop fed by [`SyncEvent`]s. At
//! most one flush cycle runs at a time; requests arriving meanwhile collapse
//! into one follow-up cycle. A cycle runs as its own task with a child
//! cancellation token so the loop can stop it on disconnect.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::clock::Clock;
use super::conflict::{ConflictResolver, Resolution};
use super::connectivity::ConnectionState;
use super::error::{SyncError, SyncResult};
use super::event::{FlushReason, SyncEvent};
use super::queue::PendingChangeQueue;
use super::status::SyncStatusReporter;
use crate::api::SyncServer;
use crate::db::{
    ChangeStatus, Database, DbError, PendingChange, SessionOutcome, SessionRepository, SyncSession,
};

#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    pub batch_size: usize,
    /// Upper bound for every server request.
    pub request_timeout: Duration,
    /// Per-item retry schedule for transient failures.
    pub item_retry: BackoffPolicy,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            request_timeout: Duration::from_secs(15),
            item_retry: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 5),
        }
    }
}

/// What happened to one queued change during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Applied,
    Discarded,
    Held,
    Failed,
    /// Transient failure: stop the cycle, retry after the delay.
    RetryAfter(Duration),
}

/// Result of one flush cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub session: SyncSession,
    pub retry_after: Option<Duration>,
    /// The batch was full; more pending changes may be waiting.
    pub more_pending: bool,
}

/// Everything a flush cycle needs, shared with the spawned cycle task.
pub struct Flusher<D: Database, S: SyncServer> {
    db: Arc<D>,
    queue: Arc<PendingChangeQueue<D>>,
    server: Arc<S>,
    resolver: ConflictResolver,
    status: SyncStatusReporter,
    clock: Arc<dyn Clock>,
    config: FlushConfig,
}

impl<D: Database, S: SyncServer> Flusher<D, S> {
    pub fn new(
        db: Arc<D>,
        queue: Arc<PendingChangeQueue<D>>,
        server: Arc<S>,
        resolver: ConflictResolver,
        status: SyncStatusReporter,
        clock: Arc<dyn Clock>,
        config: FlushConfig,
    ) -> Self {
        Self {
            db,
            queue,
            server,
            resolver,
            status,
            clock,
            config,
        }
    }

    /// Whether anything is waiting to be sent.
    pub async fn has_pending(&self) -> bool {
        match self.queue.peek_batch(1).await {
            Ok(batch) => !batch.is_empty(),
            Err(e) => {
                warn!(error = %e, "Could not read the queue");
                false
            }
        }
    }

    /// Run one flush cycle to completion, interruption, or cancellation.
    ///
    /// The session is published and persisted before returning.
    pub async fn flush(&self, cancel: CancellationToken) -> CycleReport {
        let mut session = SyncSession::start(self.clock.now());
        info!(session = %session.id, "Flush started");

        let (outcome, retry_after, more_pending) = match self.drain(&mut session, &cancel).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Flush aborted by storage error");
                self.status.record_error(e.to_string());
                (SessionOutcome::Failed(e.to_string()), None, false)
            }
        };

        if outcome.is_completed() {
            session.server_message = Some(self.trigger().await);
            self.refresh_remote().await;
        }
        session.finish(outcome, self.clock.now());

        info!(
            session = %session.id,
            attempted = session.attempted,
            succeeded = session.succeeded,
            conflicted = session.conflicted,
            failed = session.failed,
            outcome = ?session.outcome,
            "Flush finished"
        );

        if let Err(e) = self.db.sessions().record(&session).await {
            warn!(error = %e, "Failed to persist sync session");
        }
        if let Ok(counts) = self.queue.counts().await {
            self.status.set_queue(counts);
        }
        if session.outcome.is_completed() && session.failed == 0 {
            self.status.clear_error();
        }
        self.status.record_session(&session);

        CycleReport {
            session,
            retry_after,
            more_pending,
        }
    }

    async fn drain(
        &self,
        session: &mut SyncSession,
        cancel: &CancellationToken,
    ) -> SyncResult<(SessionOutcome, Option<Duration>, bool)> {
        let batch = self.queue.peek_batch(self.config.batch_size).await?;
        let batch_full = batch.len() >= self.config.batch_size;

        // Resource -> queue position of its earliest held change.
        let mut held: HashMap<String, i64> = HashMap::new();
        for c in self.queue.all().await? {
            if c.status == ChangeStatus::NeedsAttention {
                hold_resource(&mut held, &c);
            }
        }

        for change in batch {
            if cancel.is_cancelled() {
                return Ok((SessionOutcome::Aborted("cancelled".to_string()), None, false));
            }
            if held
                .get(&change.target.resource)
                .is_some_and(|seq| *seq < change.seq)
            {
                debug!(id = %change.id, target = %change.target, "Skipping change behind a held conflict");
                continue;
            }

            let change = match self.queue.mark_in_flight(&change.id).await {
                Ok(change) => change,
                Err(SyncError::Storage(DbError::NotFound { .. } | DbError::InvalidState { .. })) => {
                    debug!(id = %change.id, "Change no longer pending; skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            session.attempted += 1;

            let outcome = match self.submit(change.clone(), session).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release(&change.id, &e).await;
                    return Err(e);
                }
            };
            match outcome {
                ItemOutcome::Applied => session.succeeded += 1,
                ItemOutcome::Discarded => {}
                ItemOutcome::Held => hold_resource(&mut held, &change),
                ItemOutcome::Failed => session.failed += 1,
                ItemOutcome::RetryAfter(delay) => {
                    let reason = format!("{} failed transiently", change.target);
                    return Ok((SessionOutcome::Interrupted(reason), Some(delay), false));
                }
            }
        }

        // Skipped changes alone must not keep the loop spinning.
        let more_pending = batch_full && session.attempted > 0;
        Ok((SessionOutcome::Completed, None, more_pending))
    }

    /// Put a claimed change back in line after its outcome could not be stored.
    async fn release(&self, id: &str, cause: &SyncError) {
        match self.queue.record_transient_failure(id, &cause.to_string()).await {
            Ok(_) => debug!(id, "Released change after storage error"),
            Err(e) => warn!(id, error = %e, "Change stays in flight until restart"),
        }
    }

    async fn send(&self, change: &PendingChange) -> SyncResult<()> {
        match timeout(self.config.request_timeout, self.server.submit_change(change)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::TransientNetwork {
                message: format!(
                    "request timed out after {}ms",
                    self.config.request_timeout.as_millis()
                ),
            }),
        }
    }

    /// Submit one in-flight change and settle it in the queue.
    async fn submit(
        &self,
        mut change: PendingChange,
        session: &mut SyncSession,
    ) -> SyncResult<ItemOutcome> {
        let mut conflicted = false;
        loop {
            match self.send(&change).await {
                Ok(()) => {
                    self.queue.mark_applied(&change.id).await?;
                    debug!(id = %change.id, target = %change.target, "Change applied");
                    return Ok(ItemOutcome::Applied);
                }
                Err(SyncError::ConflictDetected(server)) => {
                    if !conflicted {
                        conflicted = true;
                        session.conflicted += 1;
                    }
                    info!(id = %change.id, target = %change.target, strategy = %self.resolver.strategy(), "Conflict detected");

                    match self.resolver.resolve(&change, &server) {
                        Resolution::Discard => {
                            self.queue.discard(&change.id).await?;
                            info!(id = %change.id, "Local change discarded in favour of the server");
                            return Ok(ItemOutcome::Discarded);
                        }
                        Resolution::Hold { reason } => {
                            self.queue.hold(&change.id, &reason).await?;
                            return Ok(ItemOutcome::Held);
                        }
                        Resolution::Resubmit { .. } if change.force => {
                            let reason = format!(
                                "{} still conflicts after a forced submission",
                                change.target
                            );
                            self.queue.hold(&change.id, &reason).await?;
                            return Ok(ItemOutcome::Held);
                        }
                        Resolution::Resubmit { target, payload } => {
                            change = self.queue.resubmit(&change.id, target, payload).await?;
                            info!(id = %change.id, "Resubmitting with overwrite");
                        }
                    }
                }
                Err(e) if e.is_transient() => return self.transient_failure(&change, e).await,
                Err(e) => {
                    warn!(id = %change.id, target = %change.target, error = %e, "Change rejected");
                    self.queue.mark_failed(&change.id, &e.to_string()).await?;
                    self.status.record_error(format!("{}: {}", change.target, e));
                    return Ok(ItemOutcome::Failed);
                }
            }
        }
    }

    async fn transient_failure(
        &self,
        change: &PendingChange,
        err: SyncError,
    ) -> SyncResult<ItemOutcome> {
        let updated = self
            .queue
            .record_transient_failure(&change.id, &err.to_string())
            .await?;
        self.status.record_error(err.to_string());

        if self.config.item_retry.is_exhausted(updated.attempts) {
            let give_up = SyncError::MaxRetriesExceeded {
                attempts: updated.attempts,
                last_error: err.to_string(),
            };
            warn!(id = %change.id, target = %change.target, error = %give_up, "Change failed permanently");
            self.queue.mark_failed(&change.id, &give_up.to_string()).await?;
            self.status.record_error(format!("{}: {}", change.target, give_up));
            return Ok(ItemOutcome::Failed);
        }

        let delay = self.config.item_retry.delay(updated.attempts);
        info!(
            id = %change.id,
            attempts = updated.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure; retry scheduled"
        );
        Ok(ItemOutcome::RetryAfter(delay))
    }

    /// Ask the server to reconcile. Never fails the cycle.
    async fn trigger(&self) -> String {
        match timeout(self.config.request_timeout, self.server.trigger_sync()).await {
            Ok(Ok(response)) if response.success => response.message,
            Ok(Ok(response)) => {
                warn!(message = %response.message, "Server-side sync reported failure");
                format!("server sync failed: {}", response.message)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Server-side sync trigger failed");
                format!("server sync trigger failed: {}", e)
            }
            Err(_) => {
                warn!("Server-side sync trigger timed out");
                "server sync trigger timed out".to_string()
            }
        }
    }

    /// Pull the server's own sync bookkeeping into the status snapshot.
    async fn refresh_remote(&self) {
        match timeout(self.config.request_timeout, self.server.sync_status()).await {
            Ok(Ok(remote)) => self.status.set_remote(remote),
            Ok(Err(e)) => debug!(error = %e, "Could not read server sync status"),
            Err(_) => debug!("Server sync status timed out"),
        }
    }
}

struct RunningCycle {
    /// `None` when a sweep found nothing to send.
    handle: JoinHandle<Option<CycleReport>>,
    cancel: CancellationToken,
}

/// The control loop. Owns the in-progress flag and the follow-up flag.
pub struct SyncOrchestrator<D: Database, S: SyncServer> {
    flusher: Arc<Flusher<D, S>>,
    events: mpsc::Receiver<SyncEvent>,
    status: SyncStatusReporter,
    connection: ConnectionState,
    running: Option<RunningCycle>,
    follow_up: bool,
    retry_at: Option<Instant>,
}

impl<D: Database + 'static, S: SyncServer> SyncOrchestrator<D, S> {
    pub fn new(
        flusher: Arc<Flusher<D, S>>,
        events: mpsc::Receiver<SyncEvent>,
        status: SyncStatusReporter,
    ) -> Self {
        Self {
            flusher,
            events,
            status,
            connection: ConnectionState::default(),
            running: None,
            follow_up: false,
            retry_at: None,
        }
    }

    /// Process events until cancelled, then let a running cycle wind down.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.handle(event, &cancel),
                result = wait_cycle(&mut self.running) => self.finished(result, &cancel),
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.request(FlushReason::Retry, &cancel);
                }
            }
        }

        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Ok(Some(report)) = running.handle.await {
                debug!(session = %report.session.id, "Final cycle wound down");
            }
            self.status.set_in_progress(false);
        }
        debug!("Orchestrator stopped");
    }

    fn handle(&mut self, event: SyncEvent, root: &CancellationToken) {
        match event {
            SyncEvent::Connectivity(state) => {
                self.connection = state;
                if state != ConnectionState::Online {
                    self.retry_at = None;
                    self.interrupt("connection lost");
                }
            }
            SyncEvent::FlushRequested(reason) => self.request(reason, root),
            SyncEvent::ChannelUp => self.request(FlushReason::ChannelRestored, root),
            SyncEvent::ChannelDown => self.interrupt("realtime channel lost"),
        }
    }

    fn request(&mut self, reason: FlushReason, root: &CancellationToken) {
        if self.connection != ConnectionState::Online {
            debug!(%reason, "Flush deferred until online");
            return;
        }
        if self.running.is_some() {
            if reason == FlushReason::Sweep {
                return;
            }
            debug!(%reason, "Flush in progress; follow-up queued");
            self.follow_up = true;
            return;
        }
        if self.retry_at.is_some() && !reason.overrides_backoff() {
            debug!(%reason, "Flush absorbed into scheduled retry");
            return;
        }

        self.retry_at = None;
        let sweep = reason == FlushReason::Sweep;
        if sweep {
            debug!("Sweeping queue");
        } else {
            info!(%reason, "Starting flush");
        }
        let cancel = root.child_token();
        let flusher = self.flusher.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if sweep && !flusher.has_pending().await {
                return None;
            }
            Some(flusher.flush(token).await)
        });
        self.running = Some(RunningCycle { handle, cancel });
        self.status.set_in_progress(true);
    }

    /// Stop the running cycle after its in-flight request.
    fn interrupt(&mut self, why: &str) {
        if let Some(running) = &self.running {
            info!(reason = why, "Cancelling running flush");
            running.cancel.cancel();
            self.follow_up = false;
        }
    }

    fn finished(
        &mut self,
        result: Result<Option<CycleReport>, JoinError>,
        root: &CancellationToken,
    ) {
        self.running = None;
        self.status.set_in_progress(false);

        match result {
            Ok(None) => {}
            Ok(Some(report)) => {
                if let Some(delay) = report.retry_after {
                    info!(delay_ms = delay.as_millis() as u64, "Next flush scheduled");
                    self.retry_at = Some(Instant::now() + delay);
                }
                if report.more_pending {
                    self.follow_up = true;
                }
            }
            Err(e) => error!(error = %e, "Flush task failed"),
        }

        if std::mem::take(&mut self.follow_up) {
            self.request(FlushReason::FollowUp, root);
        }
    }
}

fn hold_resource(held: &mut HashMap<String, i64>, change: &PendingChange) {
    let seq = held.entry(change.target.resource.clone()).or_insert(change.seq);
    *seq = (*seq).min(change.seq);
}

async fn wait_cycle(
    running: &mut Option<RunningCycle>,
) -> Result<Option<CycleReport>, JoinError> {
    match running {
        Some(running) => (&mut running.handle).await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
