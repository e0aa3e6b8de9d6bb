//! Tests for the realtime channel state machine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelCommand, ChannelState, DisconnectReason, RealtimeChannel, RealtimeConfig};
use super::protocol::ChannelMessage;
use super::transport::{ChannelConnection, ChannelTransport, Incoming, TransportError, WsTransport};
use crate::sync::backoff::BackoffPolicy;
use crate::sync::event::{FlushReason, SyncEvent};
use crate::sync::status::SyncStatusReporter;

struct FakeConnection {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    outgoing: mpsc::UnboundedSender<String>,
}

/// The server's half of a fake connection.
struct ServerEnd {
    to_client: mpsc::UnboundedSender<Incoming>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    fn send(&self, message: ChannelMessage) {
        let _ = self.to_client.send(Incoming::Text(message.encode()));
    }

    fn close(&self, code: u16) {
        let _ = self.to_client.send(Incoming::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    async fn next(&mut self) -> ChannelMessage {
        let text = self.from_client.recv().await.unwrap();
        ChannelMessage::decode(&text).unwrap()
    }
}

fn pair() -> (FakeConnection, ServerEnd) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    (
        FakeConnection { incoming, outgoing },
        ServerEnd {
            to_client,
            from_client,
        },
    )
}

impl ChannelConnection for FakeConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing.send(text).map_err(|_| TransportError::Io {
            message: "peer gone".into(),
        })
    }

    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {}
}

/// Hands out scripted connections; refuses once the script runs out.
#[derive(Clone, Default)]
struct FakeTransport {
    accepts: Arc<Mutex<VecDeque<Option<FakeConnection>>>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl FakeTransport {
    fn accept(&self) -> ServerEnd {
        let (conn, server) = pair();
        self.accepts.lock().unwrap().push_back(Some(conn));
        server
    }

    fn refuse(&self) {
        self.accepts.lock().unwrap().push_back(None);
    }

    /// Make every connect attempt take `delay` before answering.
    fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl ChannelTransport for FakeTransport {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.accepts.lock().unwrap().pop_front().flatten();
        next.ok_or_else(|| TransportError::Connect {
            message: "connection refused".into(),
        })
    }
}

struct Harness {
    commands: mpsc::Sender<ChannelCommand>,
    events: mpsc::Receiver<SyncEvent>,
    status: SyncStatusReporter,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    async fn wait_for(&self, predicate: impl FnMut(&ChannelState) -> bool) -> ChannelState {
        let mut predicate = predicate;
        let mut rx = self.status.subscribe();
        let status = rx.wait_for(|s| predicate(&s.channel)).await.unwrap();
        status.channel.clone()
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

fn config(max_attempts: u32) -> RealtimeConfig {
    RealtimeConfig {
        reconnect: BackoffPolicy::new(
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            max_attempts,
        ),
        ..RealtimeConfig::default()
    }
}

fn start<T: ChannelTransport>(transport: T, config: RealtimeConfig) -> Harness {
    let (commands, command_rx) = mpsc::channel(8);
    let (event_tx, events) = mpsc::channel(64);
    let status = SyncStatusReporter::new();
    let cancel = CancellationToken::new();
    let channel = RealtimeChannel::new(transport, config, command_rx, event_tx, status.clone());
    let task = tokio::spawn(channel.run(cancel.clone()));
    Harness {
        commands,
        events,
        status,
        cancel,
        task,
    }
}

/// Accept the client's `connect` and acknowledge it.
async fn handshake(server: &mut ServerEnd, h: &mut Harness) {
    assert_eq!(server.next().await, ChannelMessage::Connect);
    server.send(ChannelMessage::Connected {
        client_id: "client-7".into(),
    });
    assert_eq!(h.events.recv().await, Some(SyncEvent::ChannelUp));
}

fn gaps(attempts: &[Instant]) -> Vec<u128> {
    attempts
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_handshake_reports_connected() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport, config(5));

    handshake(&mut server, &mut h).await;
    assert!(h.status.snapshot().channel.is_connected());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_event_requests_flush() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport, config(5));
    handshake(&mut server, &mut h).await;

    server.send(ChannelMessage::Sync);
    assert_eq!(
        h.events.recv().await,
        Some(SyncEvent::FlushRequested(FlushReason::ServerSignal))
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_frame_is_ignored() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport, config(5));
    handshake(&mut server, &mut h).await;

    let _ = server.to_client.send(Incoming::Text("{{ not json".into()));
    server.send(ChannelMessage::Sync);
    assert_eq!(
        h.events.recv().await,
        Some(SyncEvent::FlushRequested(FlushReason::ServerSignal))
    );
    assert!(h.status.snapshot().channel.is_connected());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_ping_is_answered_with_pong() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport, config(5));
    handshake(&mut server, &mut h).await;

    server.send(ChannelMessage::Ping);
    assert_eq!(server.next().await, ChannelMessage::Pong);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_schedules_reconnect_at_base_delay() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport, config(5));
    handshake(&mut server, &mut h).await;
    let connected_at = Instant::now();

    let state = h
        .wait_for(|s| matches!(s, ChannelState::Reconnecting { .. }))
        .await;

    assert_eq!(
        state,
        ChannelState::Reconnecting {
            attempt: 1,
            delay_ms: 1000
        }
    );
    assert_eq!(server.next().await, ChannelMessage::Ping);
    assert!(connected_at.elapsed() >= Duration::from_secs(35));
    assert_eq!(h.events.recv().await, Some(SyncEvent::ChannelDown));
    assert!(
        h.status
            .snapshot()
            .last_error
            .unwrap()
            .contains("timed out")
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeats_keep_channel_open() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let attempts = transport.attempts.clone();
    let mut h = start(transport, config(5));
    handshake(&mut server, &mut h).await;

    let responder = tokio::spawn(async move {
        loop {
            if server.next().await == ChannelMessage::Ping {
                server.send(ChannelMessage::Heartbeat);
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(h.status.snapshot().channel.is_connected());
    assert_eq!(attempts.lock().unwrap().len(), 1);

    responder.abort();
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_double_and_stop_at_ceiling() {
    let transport = FakeTransport::default();
    let h = start(transport.clone(), config(5));

    let state = h.wait_for(ChannelState::is_exhausted).await;
    assert_eq!(
        state,
        ChannelState::Disconnected(DisconnectReason::RetriesExhausted)
    );

    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 6);
    assert_eq!(gaps(&attempts), vec![1000, 2000, 4000, 8000, 16000]);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.attempts().len(), 6);
    assert!(
        h.status
            .snapshot()
            .last_error
            .unwrap()
            .contains("Gave up after 5 attempts")
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_delays_are_capped_at_max() {
    let transport = FakeTransport::default();
    let h = start(transport.clone(), config(8));

    h.wait_for(ChannelState::is_exhausted).await;

    assert_eq!(
        gaps(&transport.attempts()),
        vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_foreground_revives_exhausted_channel() {
    let transport = FakeTransport::default();
    let mut h = start(transport.clone(), config(2));
    h.wait_for(ChannelState::is_exhausted).await;
    assert_eq!(transport.attempts().len(), 3);

    let mut server = transport.accept();
    h.commands.send(ChannelCommand::Foreground).await.unwrap();
    handshake(&mut server, &mut h).await;

    assert_eq!(transport.attempts().len(), 4);
    assert!(h.status.snapshot().channel.is_connected());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_resets_attempts() {
    let transport = FakeTransport::default();
    let h = start(transport.clone(), config(5));
    h.wait_for(|s| matches!(s, ChannelState::Reconnecting { attempt: 3, .. }))
        .await;

    h.commands.send(ChannelCommand::Reconnect).await.unwrap();
    let state = h
        .wait_for(|s| matches!(s, ChannelState::Reconnecting { attempt: 1, .. }))
        .await;
    assert_eq!(
        state,
        ChannelState::Reconnecting {
            attempt: 1,
            delay_ms: 1000
        }
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_successful_handshake_resets_backoff() {
    let transport = FakeTransport::default();
    transport.refuse();
    transport.refuse();
    let mut server = transport.accept();
    let mut h = start(transport.clone(), config(5));

    handshake(&mut server, &mut h).await;
    server.close(1006);

    let state = h
        .wait_for(|s| matches!(s, ChannelState::Reconnecting { .. }))
        .await;
    assert_eq!(
        state,
        ChannelState::Reconnecting {
            attempt: 1,
            delay_ms: 1000
        }
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_close_frame_does_not_reconnect() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport.clone(), config(5));
    handshake(&mut server, &mut h).await;

    server.close(1000);
    h.wait_for(|s| *s == ChannelState::Disconnected(DisconnectReason::ServerClosed))
        .await;
    assert_eq!(h.events.recv().await, Some(SyncEvent::ChannelDown));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.attempts().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_disconnect_event_does_not_reconnect() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport.clone(), config(5));
    handshake(&mut server, &mut h).await;

    server.send(ChannelMessage::Disconnect {
        reason: "server".into(),
    });
    h.wait_for(|s| *s == ChannelState::Disconnected(DisconnectReason::ServerClosed))
        .await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.attempts().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_disconnect_event_reconnects() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut second = transport.accept();
    let mut h = start(transport.clone(), config(5));
    handshake(&mut server, &mut h).await;

    server.send(ChannelMessage::Disconnect {
        reason: "transport close".into(),
    });
    assert_eq!(h.events.recv().await, Some(SyncEvent::ChannelDown));
    handshake(&mut second, &mut h).await;

    assert_eq!(transport.attempts().len(), 2);
    assert!(h.status.snapshot().channel.is_connected());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_foreground_while_connecting_resets_backoff() {
    let transport = FakeTransport::default();
    transport.slow(Duration::from_millis(500));
    let h = start(transport.clone(), config(5));

    h.wait_for(|s| matches!(s, ChannelState::Reconnecting { attempt: 2, .. }))
        .await;
    h.wait_for(|s| *s == ChannelState::Connecting).await;
    h.commands.send(ChannelCommand::Foreground).await.unwrap();

    let state = h
        .wait_for(|s| matches!(s, ChannelState::Reconnecting { .. }))
        .await;
    assert_eq!(
        state,
        ChannelState::Reconnecting {
            attempt: 1,
            delay_ms: 1000
        }
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_while_connecting_restarts_attempt() {
    let transport = FakeTransport::default();
    transport.slow(Duration::from_millis(500));
    let mut server = transport.accept();
    let mut h = start(transport.clone(), config(5));

    h.wait_for(|s| *s == ChannelState::Connecting).await;
    h.commands.send(ChannelCommand::Reconnect).await.unwrap();
    handshake(&mut server, &mut h).await;

    assert_eq!(transport.attempts().len(), 2);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_reconnects() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut second = transport.accept();
    let mut h = start(transport.clone(), config(5));
    handshake(&mut server, &mut h).await;

    drop(server);
    assert_eq!(h.events.recv().await, Some(SyncEvent::ChannelDown));
    handshake(&mut second, &mut h).await;

    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(gaps(&attempts), vec![1000]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_cancels_pending_reconnect() {
    let transport = FakeTransport::default();
    let h = start(transport.clone(), config(5));
    h.wait_for(|s| matches!(s, ChannelState::Reconnecting { .. }))
        .await;

    h.commands.send(ChannelCommand::Disconnect).await.unwrap();
    h.wait_for(|s| *s == ChannelState::Disconnected(DisconnectReason::Manual))
        .await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.attempts().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_ignores_foreground_until_reconnect() {
    let transport = FakeTransport::default();
    let mut server = transport.accept();
    let mut h = start(transport.clone(), config(5));
    handshake(&mut server, &mut h).await;

    h.commands.send(ChannelCommand::Disconnect).await.unwrap();
    h.wait_for(|s| *s == ChannelState::Disconnected(DisconnectReason::Manual))
        .await;

    h.commands.send(ChannelCommand::Foreground).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempts().len(), 1);

    let mut again = transport.accept();
    h.commands.send(ChannelCommand::Reconnect).await.unwrap();
    assert_eq!(h.events.recv().await, Some(SyncEvent::ChannelDown));
    handshake(&mut again, &mut h).await;
    assert_eq!(transport.attempts().len(), 2);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_websocket_transport_against_live_server() {
    use axum::{
        Router,
        extract::ws::{Message, WebSocket, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
    };

    async fn handle(mut socket: WebSocket) {
        while let Some(Ok(Message::Text(text))) = socket.recv().await {
            if ChannelMessage::decode(text.as_str()).ok() == Some(ChannelMessage::Connect) {
                let connected = ChannelMessage::Connected {
                    client_id: "ws-1".into(),
                };
                let _ = socket.send(Message::Text(connected.encode().into())).await;
                let _ = socket
                    .send(Message::Text(ChannelMessage::Sync.encode().into()))
                    .await;
            }
        }
    }

    async fn upgrade(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(handle)
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/ws", get(upgrade)))
            .await
            .unwrap();
    });

    let mut h = start(WsTransport::new(format!("ws://{}/ws", addr)), config(3));

    let up = tokio::time::timeout(Duration::from_secs(5), h.events.recv()).await;
    assert_eq!(up.unwrap(), Some(SyncEvent::ChannelUp));
    let sync = tokio::time::timeout(Duration::from_secs(5), h.events.recv()).await;
    assert_eq!(
        sync.unwrap(),
        Some(SyncEvent::FlushRequested(FlushReason::ServerSignal))
    );

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_websocket_transport_speaks_tls_for_wss() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let transport = WsTransport::new(format!("wss://{}/ws", addr));
    let result = tokio::time::timeout(Duration::from_secs(5), transport.connect())
        .await
        .unwrap();
    let Err(err) = result else {
        panic!("plain TCP peer cannot complete a TLS handshake");
    };
    assert!(
        !err.to_string().contains("TLS support not compiled in"),
        "unexpected error: {}",
        err
    );
}
