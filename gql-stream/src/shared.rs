//! One socket per endpoint, shared by many subscriptions.
//!
//! [`SharedChannelProvider`] wraps another provider. The first `open` of an
//! endpoint dials a real channel and spawns a dispatcher task that owns its
//! read half; every `open` returns a *lane*, a [`Channel`] view of the shared
//! socket. Lane writes go through the socket's single [`ChannelSender`], so
//! writers are serialized.
//!
//! Routing: a lane learns its subscription id from the `start` frame it
//! writes. Inbound frames with an `id` go to that lane only; unknown ids are
//! dropped; frames without an `id` are broadcast to every lane.
//!
//! Handshake: only the first `connection_init` reaches the server. Later ones
//! are swallowed while the handshake is pending (the broadcast ack reaches
//! every lane) and answered locally with a `connection_ack` once it is done.
//! A connection-scoped `connection_error`, or the initiating lane leaving
//! before the ack, reopens the handshake for the next `connection_init`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use socket_channel::{
    Channel, ChannelError, ChannelProvider, ChannelSender, Frame, FrameSink, FrameSource,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type LaneTx = mpsc::UnboundedSender<Result<Frame, ChannelError>>;

/// The `{id, type}` envelope common to every frame.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl Envelope {
    fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    NotStarted,
    /// Sent by the given lane, no ack yet
    Pending(u64),
    Acked,
}

/// A [`ChannelProvider`] multiplexing subscriptions over one channel per
/// endpoint.
pub struct SharedChannelProvider {
    inner: Arc<dyn ChannelProvider>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<SharedConnection>>>,
}

impl SharedChannelProvider {
    /// Share channels opened by `inner`.
    pub fn new(inner: Arc<dyn ChannelProvider>) -> Self {
        Self {
            inner,
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Number of endpoints with a live shared socket.
    pub async fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|conn| !conn.is_closed())
            .count()
    }

    /// Number of lanes attached to the socket for `endpoint`.
    pub async fn lane_count(&self, endpoint: &str) -> usize {
        match self.connections.lock().await.get(endpoint) {
            Some(conn) if !conn.is_closed() => conn.lanes.len(),
            _ => 0,
        }
    }
}

#[async_trait]
impl ChannelProvider for SharedChannelProvider {
    async fn open(&self, endpoint: &str) -> Result<Channel, ChannelError> {
        let mut connections = self.connections.lock().await;

        if let Some(conn) = connections.get(endpoint) {
            if let Some(lane) = SharedConnection::attach(conn) {
                tracing::trace!("Attached lane to shared connection for {}", endpoint);
                return Ok(lane);
            }
        }

        let (sender, source) = self.inner.open(endpoint).await?.into_parts();
        let conn = Arc::new(SharedConnection::new(endpoint, sender));
        tokio::spawn(run_dispatcher(Arc::clone(&conn), source));
        tracing::info!("Opened shared connection to {}", endpoint);

        let lane = SharedConnection::attach(&conn).ok_or(ChannelError::Closed)?;
        connections.insert(endpoint.to_string(), conn);
        Ok(lane)
    }
}

struct SharedConnection {
    endpoint: String,
    sender: ChannelSender,
    lanes: DashMap<u64, LaneTx>,
    /// Subscription id to lane
    routes: DashMap<String, u64>,
    handshake: parking_lot::Mutex<Handshake>,
    /// Guards lane membership; `true` once the socket is gone
    closed: parking_lot::Mutex<bool>,
    next_lane: AtomicU64,
    shutdown: CancellationToken,
}

impl SharedConnection {
    fn new(endpoint: &str, sender: ChannelSender) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            sender,
            lanes: DashMap::new(),
            routes: DashMap::new(),
            handshake: parking_lot::Mutex::new(Handshake::NotStarted),
            closed: parking_lot::Mutex::new(false),
            next_lane: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Add a lane, or `None` if the socket is already gone.
    fn attach(conn: &Arc<Self>) -> Option<Channel> {
        let closed = conn.closed.lock();
        if *closed {
            return None;
        }

        let lane = conn.next_lane.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        conn.lanes.insert(lane, tx);
        drop(closed);

        Some(Channel::new(
            Box::new(LaneSink {
                conn: Arc::clone(conn),
                lane,
                detached: false,
            }),
            Box::new(LaneSource { inbound: rx }),
        ))
    }

    /// Remove a lane. The socket closes with its last lane.
    fn detach(&self, lane: u64) {
        let mut closed = self.closed.lock();
        self.lanes.remove(&lane);
        self.routes.retain(|_, owner| *owner != lane);
        self.reopen_handshake_if(|handshake| handshake == Handshake::Pending(lane));

        if self.lanes.is_empty() && !*closed {
            *closed = true;
            self.shutdown.cancel();
            tracing::debug!("Last lane detached from {}, closing", self.endpoint);
        }
    }

    /// Tear down after the socket failed or closed; every lane sees `error`,
    /// or a clean close when `error` is `None`.
    fn fail(&self, error: Option<ChannelError>) {
        *self.closed.lock() = true;

        if let Some(error) = error {
            for lane in self.lanes.iter() {
                let _ = lane.value().send(Err(error.clone()));
            }
        }
        self.lanes.clear();
        self.routes.clear();
    }

    fn reopen_handshake_if(&self, f: impl FnOnce(Handshake) -> bool) {
        let mut handshake = self.handshake.lock();
        if f(*handshake) {
            *handshake = Handshake::NotStarted;
            tracing::debug!("Handshake on {} reopened", self.endpoint);
        }
    }

    fn route(&self, text: String) {
        let envelope = Envelope::parse(&text).unwrap_or_default();

        match (envelope.kind.as_deref(), envelope.id.is_some()) {
            (Some("connection_ack"), _) => *self.handshake.lock() = Handshake::Acked,
            (Some("connection_error"), false) => {
                self.reopen_handshake_if(|handshake| matches!(handshake, Handshake::Pending(_)))
            }
            _ => {}
        }

        match envelope.id {
            Some(id) => {
                let Some(lane) = self.routes.get(&id).map(|owner| *owner) else {
                    tracing::trace!("Dropping frame for unknown subscription {}", id);
                    return;
                };
                if let Some(tx) = self.lanes.get(&lane) {
                    let _ = tx.send(Ok(Frame::Text(text)));
                }
            }
            None => {
                for lane in self.lanes.iter() {
                    let _ = lane.value().send(Ok(Frame::Text(text.clone())));
                }
            }
        }
    }

    fn reply_locally(&self, lane: u64, text: String) {
        if let Some(tx) = self.lanes.get(&lane) {
            let _ = tx.send(Ok(Frame::Text(text)));
        }
    }
}

async fn run_dispatcher(conn: Arc<SharedConnection>, mut source: Box<dyn FrameSource>) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        match frame {
            Some(Ok(Frame::Text(text))) => conn.route(text),
            Some(Ok(Frame::Close)) | None => {
                tracing::info!("Shared connection to {} closed by peer", conn.endpoint);
                conn.fail(None);
                break;
            }
            Some(Ok(other)) => {
                tracing::trace!("Shared connection ignoring {:?}", other);
            }
            Some(Err(e)) => {
                tracing::warn!("Shared connection to {} failed: {}", conn.endpoint, e);
                conn.fail(Some(e));
                break;
            }
        }
    }

    if let Err(e) = conn.sender.close().await {
        tracing::trace!("Closing shared connection to {}: {}", conn.endpoint, e);
    }
    tracing::info!("Shared connection to {} released", conn.endpoint);
}

struct LaneSink {
    conn: Arc<SharedConnection>,
    lane: u64,
    detached: bool,
}

#[async_trait]
impl FrameSink for LaneSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        if self.detached || self.conn.is_closed() {
            return Err(ChannelError::Closed);
        }

        let envelope = Envelope::parse(&text).unwrap_or_default();
        match envelope.kind.as_deref() {
            Some("connection_init") => {
                let previous = {
                    let mut handshake = self.conn.handshake.lock();
                    let previous = *handshake;
                    if previous == Handshake::NotStarted {
                        *handshake = Handshake::Pending(self.lane);
                    }
                    previous
                };
                match previous {
                    Handshake::NotStarted => {}
                    Handshake::Pending(_) => return Ok(()),
                    Handshake::Acked => {
                        self.conn
                            .reply_locally(self.lane, r#"{"type":"connection_ack"}"#.to_string());
                        return Ok(());
                    }
                }
            }
            Some("start") => {
                if let Some(id) = envelope.id.clone() {
                    self.conn.routes.insert(id, self.lane);
                }
            }
            Some("connection_terminate") => {
                tracing::trace!("Lane {} may not terminate a shared connection", self.lane);
                return Ok(());
            }
            _ => {}
        }

        self.conn.sender.send_text(text).await?;

        if envelope.kind.as_deref() == Some("stop") {
            // A newer lane may own the id by now
            if let Some(id) = envelope.id {
                self.conn.routes.remove_if(&id, |_, owner| *owner == self.lane);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if !self.detached {
            self.detached = true;
            self.conn.detach(self.lane);
        }
        Ok(())
    }
}

impl Drop for LaneSink {
    fn drop(&mut self) {
        if !self.detached {
            self.conn.detach(self.lane);
        }
    }
}

struct LaneSource {
    inbound: mpsc::UnboundedReceiver<Result<Frame, ChannelError>>,
}

#[async_trait]
impl FrameSource for LaneSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, ChannelError>> {
        self.inbound.recv().await
    }
}
