//! WebSocket sync server.
//!
//! Serves `/ws` upgrades, tracks each peer's subscription set, and fans
//! events out to subscribed peers. Events received from a peer are
//! persisted to the event log before any broadcast, and the originating
//! peer is excluded from the fan-out so frontends never see their own
//! mutations echoed back. A send failure only drops the affected peer.

use crate::models::{EventType, SyncEvent};
use crate::storage::EventRepository;
use crate::sync::protocol::{WireMessage, MAX_PAYLOAD_BYTES};
use crate::{Error, Result, SharedStore};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

/// Close code sent when the connection cap is reached.
const POLICY_VIOLATION: u16 = 1008;

/// Server settings.
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Bind address; port 0 picks an ephemeral port.
    pub addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub max_connections: usize,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        SyncServerConfig {
            addr: ([127, 0, 0, 1], 0).into(),
            heartbeat_interval: Duration::from_secs(30),
            max_connections: 100,
        }
    }
}

type PeerId = u64;

#[derive(Default)]
struct PeerTable {
    senders: HashMap<PeerId, mpsc::UnboundedSender<Message>>,
    subscriptions: HashMap<PeerId, HashSet<EventType>>,
}

#[derive(Clone)]
struct ServerState {
    store: SharedStore,
    peers: Arc<Mutex<PeerTable>>,
    next_peer_id: Arc<AtomicU64>,
    config: Arc<SyncServerConfig>,
}

/// A running sync server. Dropping the handle does not stop it; call
/// [`SyncServer::stop`].
pub struct SyncServer {
    state: ServerState,
    local_addr: SocketAddr,
    serve_task: tokio::task::JoinHandle<()>,
}

impl SyncServer {
    /// Bind and start serving. Returns once the listener is accepting.
    pub async fn bind(store: SharedStore, config: SyncServerConfig) -> Result<SyncServer> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|e| Error::Connection(format!("cannot bind {}: {}", config.addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Connection(e.to_string()))?;

        let state = ServerState {
            store,
            peers: Arc::new(Mutex::new(PeerTable::default())),
            next_peer_id: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());

        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "sync server terminated");
            }
        });

        tracing::info!(addr = %local_addr, "sync server listening");
        Ok(SyncServer {
            state,
            local_addr,
            serve_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn client_count(&self) -> usize {
        self.state.peers.lock().await.senders.len()
    }

    /// Persist an event, then fan it out to every subscribed peer.
    pub async fn broadcast(&self, event: &SyncEvent) -> Result<()> {
        persist_event(&self.state.store, event).await?;
        fan_out(&self.state, event, None).await;
        Ok(())
    }

    /// Stop accepting connections and drop all peers.
    pub async fn stop(self) {
        self.serve_task.abort();
        let mut peers = self.state.peers.lock().await;
        peers.senders.clear();
        peers.subscriptions.clear();
        tracing::info!("sync server stopped");
    }
}

async fn persist_event(store: &SharedStore, event: &SyncEvent) -> Result<()> {
    let store = store.lock().await;
    EventRepository::new(store.conn()).insert(event)
}

/// Deliver to every peer subscribed to the event's topic, except the
/// originating one. Peers whose channel is gone are dropped from the table.
async fn fan_out(state: &ServerState, event: &SyncEvent, exclude: Option<PeerId>) {
    let frame = match (WireMessage::SyncEvent {
        data: event.clone(),
    })
    .encode()
    {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(error = %e, "dropping unencodable event");
            return;
        }
    };

    let mut peers = state.peers.lock().await;
    let mut dead: Vec<PeerId> = Vec::new();
    for (peer_id, sender) in &peers.senders {
        if Some(*peer_id) == exclude {
            continue;
        }
        let subscribed = peers
            .subscriptions
            .get(peer_id)
            .map(|topics| topics.contains(&event.event_type))
            .unwrap_or(false);
        if !subscribed {
            continue;
        }
        if sender.send(Message::Text(frame.clone())).is_err() {
            dead.push(*peer_id);
        }
    }
    for peer_id in dead {
        tracing::warn!(peer = peer_id, "dropping unreachable peer");
        peers.senders.remove(&peer_id);
        peers.subscriptions.remove(&peer_id);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sink, mut stream) = socket.split();

    // Enforce the connection cap before registering the peer.
    let peer_id = {
        let mut peers = state.peers.lock().await;
        if peers.senders.len() >= state.config.max_connections {
            drop(peers);
            tracing::warn!("rejecting connection: server at capacity");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "Server at capacity".into(),
                })))
                .await;
            return;
        }
        let peer_id = state.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        peers.senders.insert(peer_id, tx);
        peers.subscriptions.insert(peer_id, HashSet::new());
        tracing::debug!(peer = peer_id, "peer connected");
        // Outbound frames for this peer flow through the channel so the
        // fan-out path never blocks on a slow socket.
        tokio::spawn(forward_outbound(rx, sink));
        peer_id
    };

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if send_to_peer(&state, peer_id, Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&state, peer_id, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if send_to_peer(&state, peer_id, Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(peer = peer_id, error = %e, "peer socket error");
                        break;
                    }
                }
            }
        }
    }

    let mut peers = state.peers.lock().await;
    peers.senders.remove(&peer_id);
    peers.subscriptions.remove(&peer_id);
    tracing::debug!(peer = peer_id, "peer disconnected");
}

async fn forward_outbound(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn send_to_peer(state: &ServerState, peer_id: PeerId, message: Message) -> Result<()> {
    let peers = state.peers.lock().await;
    let sender = peers
        .senders
        .get(&peer_id)
        .ok_or_else(|| Error::Connection(format!("peer {} is gone", peer_id)))?;
    sender
        .send(message)
        .map_err(|_| Error::Connection(format!("peer {} channel closed", peer_id)))
}

/// Process one text frame from a peer. Returns `Err` only when the peer is
/// unreachable; protocol errors are answered with an error frame instead.
async fn handle_frame(state: &ServerState, peer_id: PeerId, text: &str) -> Result<()> {
    let message = match WireMessage::decode(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(peer = peer_id, error = %e, "bad frame");
            let reply = WireMessage::Error {
                message: "Invalid message format".to_string(),
            };
            return send_wire(state, peer_id, &reply).await;
        }
    };

    match message {
        WireMessage::Ping => send_wire(state, peer_id, &WireMessage::Pong).await,
        WireMessage::Pong => Ok(()),
        WireMessage::Subscribe { event_types } => {
            let mut peers = state.peers.lock().await;
            if let Some(topics) = peers.subscriptions.get_mut(&peer_id) {
                topics.extend(event_types);
            }
            Ok(())
        }
        WireMessage::Unsubscribe { event_types } => {
            let mut peers = state.peers.lock().await;
            if let Some(topics) = peers.subscriptions.get_mut(&peer_id) {
                if event_types.is_empty() {
                    topics.clear();
                } else {
                    for topic in &event_types {
                        topics.remove(topic);
                    }
                }
            }
            Ok(())
        }
        WireMessage::SyncEvent { data } => {
            // Persist first so the log is complete even if no peer is
            // subscribed, then fan out to everyone but the origin.
            if let Err(e) = persist_event(&state.store, &data).await {
                tracing::error!(event = %data.id, error = %e, "failed to persist event");
                let reply = WireMessage::Error {
                    message: format!("event not accepted: {}", e),
                };
                return send_wire(state, peer_id, &reply).await;
            }
            fan_out(state, &data, Some(peer_id)).await;
            Ok(())
        }
        WireMessage::Error { message } => {
            tracing::warn!(peer = peer_id, message = %message, "error frame from peer");
            Ok(())
        }
    }
}

async fn send_wire(state: &ServerState, peer_id: PeerId, message: &WireMessage) -> Result<()> {
    let frame = message.encode()?;
    send_to_peer(state, peer_id, Message::Text(frame)).await
}
