//! WebSocket sync client.
//!
//! Connects to a sync server, keeps the connection alive with heartbeats,
//! and reconnects with a fixed backoff when the link drops. Subscriptions
//! are remembered across reconnects and re-sent after every successful
//! connect. After the configured number of consecutive failed attempts the
//! client gives up and reports it.

use crate::models::{EventType, SyncEvent};
use crate::sync::protocol::WireMessage;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client settings.
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:4500/ws`.
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl SyncClientConfig {
    pub fn new(url: &str) -> Self {
        SyncClientConfig {
            url: url.to_string(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Notifications surfaced to the embedding code.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// An event received from the server.
    Event(SyncEvent),
    /// Reconnection abandoned after the configured number of attempts.
    GaveUp,
}

/// Handle to a running sync client task.
pub struct SyncClient {
    outgoing: mpsc::UnboundedSender<WireMessage>,
    shutdown: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<HashSet<EventType>>>,
    run_task: tokio::task::JoinHandle<()>,
}

impl SyncClient {
    /// Spawn the connection loop. Client events (including received sync
    /// events) arrive on the returned receiver.
    pub fn connect(config: SyncClientConfig) -> (SyncClient, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));

        let worker = ClientWorker {
            config,
            outgoing_rx,
            event_tx,
            shutdown_rx,
            connected: connected.clone(),
            subscriptions: subscriptions.clone(),
        };
        let run_task = tokio::spawn(worker.run());

        (
            SyncClient {
                outgoing: outgoing_tx,
                shutdown: shutdown_tx,
                connected,
                subscriptions,
                run_task,
            },
            event_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queue an event for the server. Queued frames flush once connected.
    pub fn send_event(&self, event: SyncEvent) -> Result<()> {
        self.outgoing
            .send(WireMessage::SyncEvent { data: event })
            .map_err(|_| Error::Connection("sync client has shut down".to_string()))
    }

    /// Subscribe to topics. The set survives reconnects.
    pub fn subscribe(&self, event_types: &[EventType]) -> Result<()> {
        if let Ok(mut topics) = self.subscriptions.lock() {
            topics.extend(event_types.iter().copied());
        }
        self.outgoing
            .send(WireMessage::Subscribe {
                event_types: event_types.to_vec(),
            })
            .map_err(|_| Error::Connection("sync client has shut down".to_string()))
    }

    /// Unsubscribe from topics; an empty list clears everything.
    pub fn unsubscribe(&self, event_types: &[EventType]) -> Result<()> {
        if let Ok(mut topics) = self.subscriptions.lock() {
            if event_types.is_empty() {
                topics.clear();
            } else {
                for t in event_types {
                    topics.remove(t);
                }
            }
        }
        self.outgoing
            .send(WireMessage::Unsubscribe {
                event_types: event_types.to_vec(),
            })
            .map_err(|_| Error::Connection("sync client has shut down".to_string()))
    }

    /// Stop reconnecting and drop the connection.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        let _ = self.run_task.await;
    }
}

struct ClientWorker {
    config: SyncClientConfig,
    outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<HashSet<EventType>>>,
}

impl ClientWorker {
    async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.connect_once().await {
                Ok(stream) => {
                    attempts = 0;
                    self.connected.store(true, Ordering::Relaxed);
                    let _ = self.event_tx.send(ClientEvent::Connected);
                    let outcome = self.drive_connection(stream).await;
                    self.connected.store(false, Ordering::Relaxed);
                    let _ = self.event_tx.send(ClientEvent::Disconnected);
                    match outcome {
                        ConnectionEnd::Shutdown => break,
                        ConnectionEnd::Lost => {}
                    }
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        attempt = attempts,
                        max = self.config.max_reconnect_attempts,
                        error = %e,
                        "sync connection failed"
                    );
                    if attempts >= self.config.max_reconnect_attempts {
                        let _ = self.event_tx.send(ClientEvent::GaveUp);
                        break;
                    }
                }
            }

            // Fixed backoff between attempts, interruptible by shutdown.
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = self.shutdown_rx.changed() => break,
            }
        }
    }

    async fn connect_once(&self) -> Result<WsStream> {
        tracing::debug!(url = %self.config.url, "connecting to sync server");
        let connect = connect_async(&self.config.url);
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| Error::Connection("connection timeout".to_string()))?
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(stream)
    }

    async fn drive_connection(&mut self, stream: WsStream) -> ConnectionEnd {
        let (mut write, mut read) = stream.split();

        // Re-establish the remembered subscription set.
        let topics: Vec<EventType> = self
            .subscriptions
            .lock()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default();
        if !topics.is_empty() {
            let frame = WireMessage::Subscribe {
                event_types: topics,
            };
            if send_frame(&mut write, &frame).await.is_err() {
                return ConnectionEnd::Lost;
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    if send_frame(&mut write, &WireMessage::Ping).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
                outgoing = self.outgoing_rx.recv() => {
                    match outgoing {
                        Some(frame) => {
                            if send_frame(&mut write, &frame).await.is_err() {
                                return ConnectionEnd::Lost;
                            }
                        }
                        // All handles dropped; nothing more to send.
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return ConnectionEnd::Shutdown;
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return ConnectionEnd::Lost;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "sync socket error");
                            return ConnectionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match WireMessage::decode(text) {
            Ok(WireMessage::SyncEvent { data }) => {
                let _ = self.event_tx.send(ClientEvent::Event(data));
            }
            Ok(WireMessage::Pong) => {}
            Ok(WireMessage::Ping) => {}
            Ok(WireMessage::Error { message }) => {
                tracing::warn!(message = %message, "error frame from server");
            }
            Ok(other) => {
                tracing::debug!(frame = ?other, "ignoring unexpected frame");
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable frame from server");
            }
        }
    }
}

enum ConnectionEnd {
    Shutdown,
    Lost,
}

async fn send_frame(
    write: &mut futures::stream::SplitSink<WsStream, Message>,
    frame: &WireMessage,
) -> Result<()> {
    let text = frame.encode()?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}
