//! WebSocket broadcast hub for reload notifications.
//!
//! A single actor task owns the client registry. Registration, removal and
//! broadcast are all messages to that task, so the registry map is never
//! shared. Each connected socket gets two pumps:
//!
//! - a reader that drains inbound frames and tracks the pong deadline
//! - a writer that drains the client's bounded queue and sends pings
//!
//! A client whose queue is full when a broadcast arrives is a slow consumer
//! and is dropped instead of holding up everyone else.

use crate::error::{DevError, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Outbound messages buffered per client before it counts as slow.
pub const CLIENT_QUEUE_CAPACITY: usize = 16;

/// Largest inbound frame a client may send.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// How long a client may stay silent before it is dropped.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval; must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Deadline for a single frame write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Identity of a connected client.
pub type ClientId = u64;

/// Messages pushed to browsers.
///
/// Clients ignore `type` values they do not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReloadMessage {
    /// A watched file changed
    Reload {
        /// Changed path, relative to the project root when possible
        path: String,
    },
    /// Greeting sent once after the socket is registered
    Connected {
        /// Assigned client id
        id: ClientId,
    },
}

/// Timing and sizing knobs for client pumps.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Capacity of each client's outbound queue
    pub queue_capacity: usize,
    /// Maximum inbound message size
    pub max_message_size: usize,
    /// Liveness deadline, extended on every pong
    pub pong_wait: Duration,
    /// Keepalive ping interval
    pub ping_period: Duration,
    /// Deadline for a single write
    pub write_wait: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: CLIENT_QUEUE_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            write_wait: WRITE_WAIT,
        }
    }
}

/// Hands out client ids. Owned by one hub, so separate hubs never collide.
#[derive(Debug, Default)]
pub struct ClientIdGenerator {
    next: AtomicU64,
}

impl ClientIdGenerator {
    /// Generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next unused id.
    pub fn next_id(&self) -> ClientId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A registered client as seen from outside the hub: its id and the
/// receiving end of its outbound queue.
///
/// The queue is closed by the hub, exactly once, when the client is removed.
#[derive(Debug)]
pub struct ClientHandle {
    /// Client identity
    pub id: ClientId,
    /// Outbound queue, in enqueue order
    pub queue: mpsc::Receiver<Utf8Bytes>,
}

enum Command {
    Register {
        id: ClientId,
        queue: mpsc::Sender<Utf8Bytes>,
        ack: oneshot::Sender<bool>,
    },
    Unregister {
        id: ClientId,
    },
    Broadcast {
        payload: Utf8Bytes,
        ack: Option<oneshot::Sender<usize>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct HubInner {
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    ids: ClientIdGenerator,
    clients: Arc<AtomicUsize>,
    closed: AtomicBool,
    settings: HubSettings,
}

/// Handle to the reload hub. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}

impl BroadcastHub {
    /// Create a hub. Nothing runs until [`start`](Self::start).
    pub fn new(settings: HubSettings) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(HubInner {
                commands,
                pending: Mutex::new(Some(pending)),
                ids: ClientIdGenerator::new(),
                clients: Arc::new(AtomicUsize::new(0)),
                closed: AtomicBool::new(false),
                settings,
            }),
        }
    }

    /// Spawn the registry actor. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(commands) = self.inner.pending.lock().take() else {
            return;
        };
        let counter = self.inner.clients.clone();
        tokio::spawn(registry_loop(commands, counter));
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a client with the default queue capacity.
    pub async fn register(&self) -> Result<ClientHandle> {
        self.register_with_capacity(self.inner.settings.queue_capacity)
            .await
    }

    /// Register a client whose outbound queue holds `capacity` messages.
    ///
    /// # Errors
    ///
    /// Returns [`DevError::HubClosed`] once the hub is closed and
    /// [`DevError::HubNotStarted`] before [`start`](Self::start).
    pub async fn register_with_capacity(&self, capacity: usize) -> Result<ClientHandle> {
        if self.is_closed() {
            return Err(DevError::HubClosed);
        }
        self.ensure_started()?;

        let id = self.inner.ids.next_id();
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let (ack, accepted) = oneshot::channel();

        self.send(Command::Register { id, queue, ack })?;
        match accepted.await {
            Ok(true) => Ok(ClientHandle { id, queue: rx }),
            _ => Err(DevError::HubClosed),
        }
    }

    /// Remove a client. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        let _ = self.send(Command::Unregister { id });
    }

    /// Enqueue `message` for every client without waiting.
    pub fn notify(&self, message: &ReloadMessage) -> Result<()> {
        let payload = encode(message)?;
        self.send(Command::Broadcast { payload, ack: None })
    }

    /// Enqueue `message` for every client.
    ///
    /// The message is serialized once. Resolves once the registry has
    /// processed it, with the number of clients it was queued for; clients
    /// dropped as slow consumers are not counted.
    pub async fn broadcast(&self, message: &ReloadMessage) -> Result<usize> {
        self.ensure_started()?;
        let payload = encode(message)?;
        let (ack, delivered) = oneshot::channel();
        self.send(Command::Broadcast {
            payload,
            ack: Some(ack),
        })?;
        delivered.await.map_err(|_| DevError::HubClosed)
    }

    /// Stop accepting clients and close every live one. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (done, finished) = oneshot::channel();
        if self.send(Command::Close { done }).is_ok() {
            // An actor that was never started has no clients to close.
            if self.inner.pending.lock().take().is_none() {
                let _ = finished.await;
            }
        }
        tracing::debug!("reload hub closed");
    }

    /// Complete a WebSocket handshake and attach the socket to the hub.
    ///
    /// # Errors
    ///
    /// Returns [`DevError::HubClosed`] when the hub no longer accepts clients.
    pub fn handle_upgrade(&self, upgrade: WebSocketUpgrade) -> Result<Response> {
        if self.is_closed() {
            return Err(DevError::HubClosed);
        }

        let hub = self.clone();
        Ok(upgrade
            .max_message_size(self.inner.settings.max_message_size)
            .max_frame_size(self.inner.settings.max_message_size)
            .on_upgrade(move |socket| async move { hub.serve_socket(socket).await }))
    }

    /// Run both pumps for an upgraded socket until the client goes away.
    pub async fn serve_socket(&self, socket: WebSocket) {
        let handle = match self.register().await {
            Ok(handle) => handle,
            Err(_) => {
                let mut socket = socket;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        let id = handle.id;
        tracing::debug!(client_id = id, "reload client connected");

        let settings = self.inner.settings;
        let (sink, stream) = socket.split();
        let stop = CancellationToken::new();

        let writer = tokio::spawn(write_pump(
            sink,
            handle,
            settings,
            stop.clone(),
            self.clone(),
        ));

        read_pump(stream, id, settings, stop.clone()).await;
        self.unregister(id);
        stop.cancel();
        let _ = writer.await;

        tracing::debug!(client_id = id, "reload client disconnected");
    }

    fn ensure_started(&self) -> Result<()> {
        if self.inner.pending.lock().is_some() {
            return Err(DevError::HubNotStarted);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| DevError::HubClosed)
    }
}

fn encode(message: &ReloadMessage) -> Result<Utf8Bytes> {
    Ok(serde_json::to_string(message)?.into())
}

async fn registry_loop(mut commands: mpsc::UnboundedReceiver<Command>, counter: Arc<AtomicUsize>) {
    let mut clients: HashMap<ClientId, mpsc::Sender<Utf8Bytes>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { id, queue, ack } => {
                clients.insert(id, queue);
                counter.store(clients.len(), Ordering::Release);
                let _ = ack.send(true);
            }
            Command::Unregister { id } => {
                // Dropping the sender closes the client's queue.
                clients.remove(&id);
                counter.store(clients.len(), Ordering::Release);
            }
            Command::Broadcast { payload, ack } => {
                let mut slow = Vec::new();
                for (id, queue) in &clients {
                    if let Err(e) = queue.try_send(payload.clone()) {
                        match e {
                            mpsc::error::TrySendError::Full(_) => {
                                tracing::warn!(client_id = id, "dropping slow reload client")
                            }
                            mpsc::error::TrySendError::Closed(_) => {}
                        }
                        slow.push(*id);
                    }
                }
                for id in &slow {
                    clients.remove(id);
                }
                counter.store(clients.len(), Ordering::Release);
                if let Some(ack) = ack {
                    let _ = ack.send(clients.len());
                }
            }
            Command::Close { done } => {
                clients.clear();
                counter.store(0, Ordering::Release);
                commands.close();
                // Reject registrations that raced with close.
                while let Ok(pending) = commands.try_recv() {
                    if let Command::Register { ack, .. } = pending {
                        let _ = ack.send(false);
                    }
                }
                let _ = done.send(());
                return;
            }
        }
    }
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    id: ClientId,
    settings: HubSettings,
    stop: CancellationToken,
) {
    let mut deadline = tokio::time::Instant::now() + settings.pong_wait;

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::debug!(client_id = id, "reload client missed pong deadline");
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(client_id = id, error = %e, "reload client read error");
                return;
            }
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = tokio::time::Instant::now() + settings.pong_wait;
            }
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut handle: ClientHandle,
    settings: HubSettings,
    stop: CancellationToken,
    hub: BroadcastHub,
) {
    let id = handle.id;
    let greeting = match encode(&ReloadMessage::Connected { id }) {
        Ok(greeting) => greeting,
        Err(_) => return,
    };

    if write(&mut sink, Message::Text(greeting), settings.write_wait)
        .await
        .is_err()
    {
        hub.unregister(id);
        stop.cancel();
        return;
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.ping_period,
        settings.ping_period,
    );

    loop {
        let outcome = tokio::select! {
            _ = stop.cancelled() => break,
            queued = handle.queue.recv() => match queued {
                Some(first) => {
                    // Fold in anything queued behind it into one frame.
                    let mut batch = first.as_str().to_string();
                    while let Ok(more) = handle.queue.try_recv() {
                        batch.push('\n');
                        batch.push_str(more.as_str());
                    }
                    write(&mut sink, Message::Text(batch.into()), settings.write_wait).await
                }
                None => {
                    // Queue closed by the hub.
                    let _ = write(&mut sink, Message::Close(None), settings.write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => write(&mut sink, Message::Ping(Bytes::new()), settings.write_wait).await,
        };

        if let Err(e) = outcome {
            tracing::debug!(client_id = id, error = %e, "reload client write error");
            hub.unregister(id);
            break;
        }
    }

    stop.cancel();
    let _ = sink.close().await;
}

async fn write(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    wait: Duration,
) -> std::result::Result<(), String> {
    match tokio::time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}
