//! WebSocket listener and connection lifecycle.
//!
//! A client connects with its secret in the query string (`?password=` or
//! `?guid=`). Unauthenticated sockets are closed before they are ever
//! registered, so broadcasts only reach authenticated clients.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::auth::{authenticate, handshake_secret};
use super::chunks::ChunkError;
use super::cipher::CipherError;
use super::envelope::{event_frame_text, AckReply, ChannelReply, Reply};
use super::router::route;
use super::supervisor::ListenerControl;
use super::GatewayContext;

/// Grace period for the old listener to drain on restart or shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const CLOSE_POLICY: u16 = 1008;
const CLOSE_RESTART: u16 = 1012;
const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Chunks(#[from] ChunkError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// One client socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: Uuid,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            authenticated: false,
            created_at: Utc::now(),
        }
    }

    /// A connection that passed the credential gate.
    pub fn accepted() -> Self {
        Self {
            authenticated: true,
            ..Self::new()
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

struct ConnectionHandle {
    info: Connection,
    tx: mpsc::UnboundedSender<Message>,
}

/// Live, authenticated connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<Uuid, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an authenticated connection. Unauthenticated ones are ignored.
    pub fn register(&self, info: Connection, tx: mpsc::UnboundedSender<Message>) -> bool {
        if !info.authenticated {
            return false;
        }
        self.conns.lock().insert(info.id, ConnectionHandle { info, tx });
        true
    }

    pub fn remove(&self, id: Uuid) -> Option<Connection> {
        self.conns.lock().remove(&id).map(|handle| handle.info)
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send an `{event, data}` frame to every connection. Connections whose
    /// send side is gone are dropped. Returns how many were reached.
    pub fn broadcast(&self, event: &str, payload: &Value) -> usize {
        let text = match event_frame_text(event, payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(target: "ws", event, error = %e, "failed to encode broadcast");
                return 0;
            }
        };
        let mut conns = self.conns.lock();
        let mut dead = Vec::new();
        let mut reached = 0;
        for (id, conn) in conns.iter() {
            if conn.tx.send(Message::Text(text.clone().into())).is_ok() {
                reached += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            conns.remove(&id);
        }
        reached
    }

    /// Close and forget every connection.
    pub fn close_all(&self, code: u16, reason: &str) {
        let drained: Vec<_> = self.conns.lock().drain().collect();
        for (_, conn) in drained {
            let _ = send_close(&conn.tx, code, reason);
        }
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) -> Result<(), ()> {
    // Close reasons are capped at 123 bytes on the wire.
    let truncated: String = reason.chars().take(123).collect();
    let frame = CloseFrame {
        code,
        reason: truncated.into(),
    };
    tx.send(Message::Close(Some(frame))).map_err(|_| ())
}

#[derive(Clone)]
struct ListenerState {
    ctx: Arc<GatewayContext>,
    shutdown: watch::Receiver<bool>,
}

struct RunningListener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the client listener. Can be stopped and started again, which is
/// how the liveness supervisor recovers a dead port.
pub struct GatewayServer {
    ctx: Arc<GatewayContext>,
    bind_ip: IpAddr,
    running: tokio::sync::Mutex<Option<RunningListener>>,
}

impl GatewayServer {
    /// Listen on all interfaces at the configured port.
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Bind and start serving. Returns the bound address; if already
    /// running, returns the existing one.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(listener) = running.as_ref() {
            return Ok(listener.local_addr);
        }
        let listener = self.bind().await?;
        let local_addr = listener.local_addr;
        *running = Some(listener);
        drop(running);

        tracing::info!(target: "ws", addr = %local_addr, "socket server listening");
        self.ctx.connections.broadcast("hello-world", &Value::Null);
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<RunningListener, ServerError> {
        let port = self.ctx.config.socket_port();
        let bind_err = |source| ServerError::Bind { port, source };
        let listener = tokio::net::TcpListener::bind((self.bind_ip, port))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = Router::new().route("/", get(ws_handler)).with_state(ListenerState {
            ctx: self.ctx.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let mut shutdown_watch = shutdown_rx;
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_watch.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(target: "ws", error = %e, "socket server stopped");
            }
        });

        Ok(RunningListener {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// Close every client and stop listening.
    pub async fn stop(&self) {
        let current = self.running.lock().await.take();
        if let Some(listener) = current {
            self.teardown(listener, CLOSE_GOING_AWAY, "server shutting down")
                .await;
        }
    }

    /// Stop, re-read the config file and start again. The port may have
    /// changed in between.
    pub async fn restart(&self) -> Result<SocketAddr, ServerError> {
        let current = self.running.lock().await.take();
        if let Some(listener) = current {
            self.teardown(listener, CLOSE_RESTART, "server restarting")
                .await;
        }
        if let Err(e) = self.ctx.config.reload() {
            tracing::warn!(target: "config", error = %e, "config reload failed; keeping current values");
        }
        self.start().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|l| l.local_addr)
    }

    async fn teardown(&self, listener: RunningListener, code: u16, reason: &str) {
        self.ctx.connections.close_all(code, reason);
        let _ = listener.shutdown_tx.send(true);
        let mut task = listener.task;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(target: "ws", "listener did not drain in time; aborting");
            task.abort();
        }
        tracing::info!(target: "ws", addr = %listener.local_addr, "socket server stopped");
    }
}

#[async_trait]
impl ListenerControl for GatewayServer {
    fn current_port(&self) -> u16 {
        self.ctx.config.socket_port()
    }

    async fn restart(&self) -> Result<(), ServerError> {
        GatewayServer::restart(self).await.map(|_| ())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ListenerState>,
    RawQuery(query): RawQuery,
) -> Response {
    let secret = handshake_secret(query.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, secret))
}

async fn handle_socket(socket: WebSocket, state: ListenerState, secret: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let configured = state.ctx.config.password();
    if !authenticate(secret.as_deref(), &configured) {
        tracing::warn!(target: "auth", "Closing client connection. Authentication failed.");
        let _ = send_close(&tx, CLOSE_POLICY, "authentication failed");
        drop(tx);
        let _ = send_task.await;
        return;
    }

    let conn = Connection::accepted();
    tracing::info!(target: "auth", conn_id = %conn.id, "Client authenticated successfully");
    state.ctx.connections.register(conn.clone(), tx.clone());

    let reason = run_connection(&mut receiver, &tx, &state).await;

    state.ctx.connections.remove(conn.id);
    tracing::info!(
        target: "ws",
        conn_id = %conn.id,
        "Client {} disconnected! Reason: {}",
        conn.id,
        reason
    );

    drop(tx);
    let _ = send_task.await;
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack: Option<u64>,
}

enum Inbound {
    Frame(InboundFrame),
    Control,
    Closed,
    Rejected(&'static str),
}

fn decode_inbound(msg: Message) -> Inbound {
    let text = match msg {
        Message::Text(text) => text,
        Message::Binary(_) => return Inbound::Rejected("binary messages not supported"),
        Message::Close(_) => return Inbound::Closed,
        Message::Ping(_) | Message::Pong(_) => return Inbound::Control,
    };
    match serde_json::from_str::<InboundFrame>(text.as_str()) {
        Ok(frame) => Inbound::Frame(frame),
        Err(_) => Inbound::Rejected("invalid event frame"),
    }
}

/// Read frames until the client leaves, goes quiet or the server stops.
/// Returns the disconnect reason.
async fn run_connection(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &ListenerState,
) -> &'static str {
    let config = state.ctx.config.snapshot();
    let ping_timeout = config.ping_timeout();
    let mut ping = tokio::time::interval(config.ping_interval());
    ping.tick().await;
    let mut shutdown = state.shutdown.clone();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(_)) => return "transport error",
                    None => return "transport close",
                };
                last_seen = Instant::now();
                match decode_inbound(msg) {
                    Inbound::Frame(frame) => {
                        let reply: Arc<dyn Reply> = match frame.ack {
                            Some(ack) => Arc::new(AckReply::new(tx.clone(), ack)),
                            None => Arc::new(ChannelReply::new(tx.clone())),
                        };
                        tokio::spawn(route(state.ctx.clone(), frame.event, frame.data, reply));
                    }
                    Inbound::Control => {}
                    Inbound::Closed => return "client namespace disconnect",
                    Inbound::Rejected(reason) => {
                        let _ = send_close(tx, CLOSE_POLICY, reason);
                        return reason;
                    }
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > ping_timeout {
                    let _ = send_close(tx, CLOSE_GOING_AWAY, "ping timeout");
                    return "ping timeout";
                }
                if tx.send(Message::Ping(Vec::new().into())).is_err() {
                    return "transport close";
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                return "server shutting down";
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(msg: Message) -> Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_prunes_dead_connections() {
        let registry = ConnectionRegistry::new();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        registry.register(Connection::accepted(), live_tx);
        registry.register(Connection::accepted(), dead_tx);

        let reached = registry.broadcast("hello-world", &Value::Null);
        assert_eq!(reached, 1);
        assert_eq!(registry.len(), 1);

        let frame = text_of(live_rx.try_recv().unwrap());
        assert_eq!(frame["event"], "hello-world");
        assert_eq!(frame["data"], Value::Null);
    }

    #[test]
    fn test_close_all_sends_close_frames() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(Connection::accepted(), tx);
        registry.close_all(CLOSE_RESTART, "server restarting");
        assert!(registry.is_empty());
        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_RESTART),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unauthenticated_never_registered() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!registry.register(Connection::new(), tx));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_close_truncates_reason() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        send_close(&tx, CLOSE_POLICY, &"x".repeat(300)).unwrap();
        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str().len(), 123),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_inbound() {
        let frame = r#"{"event":"get-chats","data":{"limit":5},"ack":2}"#;
        match decode_inbound(Message::Text(frame.into())) {
            Inbound::Frame(frame) => {
                assert_eq!(frame.event, "get-chats");
                assert_eq!(frame.ack, Some(2));
                assert_eq!(frame.data["limit"], 5);
            }
            _ => panic!("expected a frame"),
        }
        match decode_inbound(Message::Text(r#"{"event":"open-chat"}"#.into())) {
            Inbound::Frame(frame) => {
                assert_eq!(frame.data, Value::Null);
                assert_eq!(frame.ack, None);
            }
            _ => panic!("expected a frame"),
        }
        assert!(matches!(
            decode_inbound(Message::Text("not json".into())),
            Inbound::Rejected(_)
        ));
        assert!(matches!(
            decode_inbound(Message::Binary(vec![1, 2].into())),
            Inbound::Rejected(_)
        ));
        assert!(matches!(decode_inbound(Message::Close(None)), Inbound::Closed));
    }

    #[tokio::test]
    async fn test_restart_rebinds() {
        let h = crate::gateway::test_support::harness_with(|c| c.socket_port = 0).await;
        let server = GatewayServer::new(h.ctx.clone()).with_bind_ip(Ipv4Addr::LOCALHOST.into());
        let first = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), first);

        let second = server.restart().await.unwrap();
        assert_eq!(server.local_addr().await, Some(second));

        server.stop().await;
        assert_eq!(server.local_addr().await, None);
    }
}
