//! Process-wide wiring of the sync components.
//!
//! [`SyncEngine`] is built once per process. Starting it spawns the
//! connectivity monitor, the orchestrator loop, and optionally the realtime
//! channel, each under a child of one root [`CancellationToken`]. The
//! returned [`SyncHandle`] is the only way the rest of the app talks to them.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::conflict::ConflictResolver;
use super::connectivity::{ConnectivityMonitor, NetworkHint};
use super::error::SyncResult;
use super::event::{FlushReason, SyncEvent};
use super::orchestrator::{Flusher, SyncOrchestrator};
use super::queue::{Keep, PendingChangeQueue};
use super::realtime::{ChannelCommand, ChannelTransport, RealtimeChannel, WsTransport};
use super::status::{SyncStatus, SyncStatusReporter};
use crate::api::{ApiClient, HttpSyncServer, SyncServer};
use crate::config::Config;
use crate::db::{ChangeTarget, Database, PendingChange, SqliteDatabase};

const EVENT_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 8;

pub struct SyncEngine<D: Database, S: SyncServer> {
    config: Config,
    db: Arc<D>,
    server: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine<SqliteDatabase, HttpSyncServer> {
    /// Open the configured database and build an HTTP-backed engine.
    pub async fn open(config: Config) -> SyncResult<Self> {
        let db = SqliteDatabase::open(&config.db_path).await?;
        db.migrate().await?;
        let client = ApiClient::new(config.server_url.clone(), config.flush.request_timeout)?;
        Ok(Self::new(config, db, HttpSyncServer::new(client)))
    }

    /// Start with the websocket channel at [`Config::realtime_url`].
    pub async fn start_online(self) -> SyncResult<SyncHandle<SqliteDatabase>> {
        let transport = WsTransport::new(self.config.realtime_url());
        self.start_with_realtime(transport).await
    }
}

impl<D: Database + 'static, S: SyncServer> SyncEngine<D, S> {
    pub fn new(config: Config, db: D, server: S) -> Self {
        Self {
            config,
            db: Arc::new(db),
            server: Arc::new(server),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start without a realtime channel; flushes are driven by connectivity
    /// changes, local changes and manual requests only.
    pub async fn start(self) -> SyncResult<SyncHandle<D>> {
        let (handle, _events) = self.launch().await?;
        Ok(handle)
    }

    pub async fn start_with_realtime<T: ChannelTransport>(
        self,
        transport: T,
    ) -> SyncResult<SyncHandle<D>> {
        let realtime = self.config.realtime;
        let (mut handle, events) = self.launch().await?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let channel = RealtimeChannel::new(
            transport,
            realtime,
            commands_rx,
            events,
            handle.status.clone(),
        );
        let task = tokio::spawn(channel.run(handle.cancel.child_token()));
        handle.tasks.lock().await.push(task);
        handle.commands = Some(commands_tx);
        Ok(handle)
    }

    async fn launch(self) -> SyncResult<(SyncHandle<D>, mpsc::Sender<SyncEvent>)> {
        let status = SyncStatusReporter::new();
        let queue = Arc::new(PendingChangeQueue::with_clock(
            self.db.clone(),
            self.clock.clone(),
        ));
        queue.recover().await?;
        status.set_queue(queue.counts().await?);

        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (hints_tx, hints_rx) = mpsc::channel(COMMAND_BUFFER);

        let monitor = ConnectivityMonitor::new(
            self.server.clone(),
            self.config.monitor,
            hints_rx,
            events_tx.clone(),
            status.clone(),
        );

        let flusher = Arc::new(Flusher::new(
            self.db.clone(),
            queue.clone(),
            self.server.clone(),
            ConflictResolver::new(self.config.conflict_strategy),
            status.clone(),
            self.clock.clone(),
            self.config.flush,
        ));
        let orchestrator = SyncOrchestrator::new(flusher, events_rx, status.clone());

        let tasks = vec![
            tokio::spawn(orchestrator.run(cancel.child_token())),
            tokio::spawn(monitor.run(cancel.child_token())),
        ];

        info!(
            server = %self.config.server_url,
            strategy = %self.config.conflict_strategy,
            "Sync engine started"
        );

        let handle = SyncHandle {
            queue,
            status,
            events: events_tx.clone(),
            hints: hints_tx,
            commands: None,
            cancel,
            tasks: Arc::new(Mutex::new(tasks)),
        };
        Ok((handle, events_tx))
    }
}

/// Cloneable access to a running engine.
pub struct SyncHandle<D: Database> {
    queue: Arc<PendingChangeQueue<D>>,
    status: SyncStatusReporter,
    events: mpsc::Sender<SyncEvent>,
    hints: mpsc::Sender<NetworkHint>,
    commands: Option<mpsc::Sender<ChannelCommand>>,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<D: Database> Clone for SyncHandle<D> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
            hints: self.hints.clone(),
            commands: self.commands.clone(),
            cancel: self.cancel.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<D: Database> SyncHandle<D> {
    /// Queue a local mutation and ask for a flush.
    pub async fn enqueue(&self, target: ChangeTarget, payload: Value) -> SyncResult<PendingChange> {
        let change = self.queue.enqueue(target, payload).await?;
        self.refresh_counts().await?;
        self.flush(FlushReason::LocalChange).await;
        Ok(change)
    }

    /// User-initiated "sync now".
    pub async fn request_flush(&self) {
        self.flush(FlushReason::Manual).await;
    }

    /// Put a failed or held change back in line.
    pub async fn retry(&self, id: &str) -> SyncResult<PendingChange> {
        let change = self.queue.retry(id).await?;
        self.refresh_counts().await?;
        self.flush(FlushReason::Manual).await;
        Ok(change)
    }

    pub async fn discard(&self, id: &str) -> SyncResult<bool> {
        let removed = self.queue.discard(id).await?;
        self.refresh_counts().await?;
        Ok(removed)
    }

    /// Settle a held conflict by hand.
    pub async fn resolve(&self, id: &str, keep: Keep) -> SyncResult<Option<PendingChange>> {
        let requeued = self.queue.resolve(id, keep).await?;
        self.refresh_counts().await?;
        if requeued.is_some() {
            self.flush(FlushReason::Manual).await;
        }
        Ok(requeued)
    }

    /// Forward a host network-change notification to the monitor.
    pub async fn network_hint(&self, hint: NetworkHint) {
        if self.hints.send(hint).await.is_err() {
            debug!("Connectivity monitor is not running");
        }
    }

    /// The app came to the foreground.
    pub async fn set_foreground(&self) {
        self.command(ChannelCommand::Foreground).await;
        self.network_hint(NetworkHint::Online).await;
    }

    /// Reconnect the realtime channel now, resetting its attempt counter.
    pub async fn reconnect(&self) {
        self.command(ChannelCommand::Reconnect).await;
    }

    /// Close the realtime channel until [`SyncHandle::reconnect`].
    pub async fn disconnect(&self) {
        self.command(ChannelCommand::Disconnect).await;
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn queue(&self) -> &PendingChangeQueue<D> {
        &self.queue
    }

    /// Stop every task and wait for them. A running flush finishes its
    /// in-flight request first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
        info!("Sync engine stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn flush(&self, reason: FlushReason) {
        if self
            .events
            .send(SyncEvent::FlushRequested(reason))
            .await
            .is_err()
        {
            debug!(%reason, "Orchestrator is not running; flush request dropped");
        }
    }

    async fn command(&self, command: ChannelCommand) {
        match &self.commands {
            Some(tx) => {
                if tx.send(command).await.is_err() {
                    debug!(?command, "Realtime channel is not running");
                }
            }
            None => debug!(?command, "No realtime channel configured"),
        }
    }

    async fn refresh_counts(&self) -> SyncResult<()> {
        self.status.set_queue(self.queue.counts().await?);
        Ok(())
    }
}
