//! # Rampart Server
//!
//! The relay that lockstep clients connect to. It assigns client ids
//! through the version handshake, stamps and relays packets between
//! clients, and — once the game begins — paces net-frames on a timer:
//! every interval it broadcasts each client's (possibly empty) queued
//! order batches to the other clients and acknowledges the sender, so
//! every client receives its own frame packet through ack synthesis.
//!
//! Relay rules per packet category:
//! - immediates: relayed instantly to *all* clients, sender included, so
//!   every peer applies them exactly once;
//! - sync hashes: relayed instantly to the *other* clients (the sender
//!   already sees its own through local echo);
//! - frame orders: queued per client and drained by the frame pacer;
//! - disconnects: broadcast to the remaining clients when a socket dies.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use rampart_connection::NetRuntime;
use rampart_protocol::{wire, ClientId, NetFrame, Packet, PacketKind, TAG_ACK, TAG_DISCONNECT};

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on.
    pub listen_addr: String,

    /// Wall-clock duration of one net-frame.
    pub frame_interval: Duration,

    /// Connections beyond this are refused.
    pub max_clients: usize,

    /// Begin frame pacing automatically once this many clients are
    /// connected. `None` waits for an explicit `start_game`.
    pub start_when_clients: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1234".to_string(),
            frame_interval: Duration::from_millis(120),
            max_clients: 8,
            start_when_clients: Some(2),
        }
    }
}

/// Relay failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Socket-level failure on the listener.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct Peer {
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    pending: VecDeque<Bytes>,
}

struct ServerShared {
    settings: ServerSettings,
    clients: Mutex<BTreeMap<ClientId, Peer>>,
    next_client_id: AtomicU32,
    started: AtomicBool,
    frame: AtomicU32,
}

impl ServerShared {
    fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(BTreeMap::new()),
            next_client_id: AtomicU32::new(1),
            started: AtomicBool::new(false),
            frame: AtomicU32::new(1),
        }
    }

    fn start_game(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            tracing::info!("frame pacing started");
        }
    }

    fn connected_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Frames the payload with the sender stamp and fans it out.
    fn broadcast(&self, from: ClientId, payload: &[u8], include_sender: bool) {
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.put_u32_le(payload.len() as u32);
        framed.put_u32_le(from);
        framed.extend_from_slice(payload);

        let clients = self.clients.lock().unwrap();
        for (&id, peer) in clients.iter() {
            if !include_sender && id == from {
                continue;
            }
            let _ = peer.to_client.send(framed.clone());
        }
    }

    fn queue_orders(&self, from: ClientId, payload: &Bytes) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(peer) = clients.get_mut(&from) {
            // The frame field is not trusted for sequencing; only the
            // order bytes are kept.
            peer.pending.push_back(payload.slice(4..));
        }
    }

    /// One net-frame: drain every client's queued batches, broadcast them
    /// to the other clients, ack the sender. A zero-count ack still goes
    /// out so the sender synthesizes its own (empty) frame packet.
    fn pace_frame(&self) {
        let frame = self.frame.fetch_add(1, Ordering::SeqCst);
        let mut clients = self.clients.lock().unwrap();

        let mut per_client: Vec<(ClientId, Vec<Bytes>)> = Vec::with_capacity(clients.len());
        for (&id, peer) in clients.iter_mut() {
            let take = peer.pending.len().min(usize::from(u16::MAX));
            per_client.push((id, peer.pending.drain(..take).collect()));
        }

        for (id, batches) in &per_client {
            let mut frame_packet = Vec::new();
            frame_packet.put_u32_le(
                4 + batches.iter().map(|b| b.len()).sum::<usize>() as u32,
            );
            frame_packet.put_u32_le(*id);
            frame_packet.put_u32_le(frame);
            for batch in batches {
                frame_packet.extend_from_slice(batch);
            }

            let mut ack = Vec::with_capacity(15);
            ack.put_u32_le(7);
            ack.put_u32_le(*id);
            ack.put_u32_le(frame);
            ack.put_u8(TAG_ACK);
            ack.put_u16_le(batches.len() as u16);

            for (&other, peer) in clients.iter() {
                if other == *id {
                    let _ = peer.to_client.send(ack.clone());
                } else {
                    let _ = peer.to_client.send(frame_packet.clone());
                }
            }
        }
    }

    fn drop_client(&self, client: ClientId) {
        let removed = self.clients.lock().unwrap().remove(&client).is_some();
        if !removed {
            return;
        }
        tracing::info!(client, "client disconnected");

        let mut payload = Vec::with_capacity(5);
        payload.put_u32_le(self.frame.load(Ordering::SeqCst));
        payload.put_u8(TAG_DISCONNECT);
        self.broadcast(client, &payload, false);
    }
}

/// Handle for controlling a running relay from another thread or task.
#[derive(Clone)]
pub struct ServerController {
    shared: Arc<ServerShared>,
}

impl ServerController {
    /// Begins frame pacing. Idempotent.
    pub fn start_game(&self) {
        self.shared.start_game();
    }

    /// Number of currently connected clients.
    pub fn connected_clients(&self) -> usize {
        self.shared.connected_clients()
    }

    /// The net-frame the pacer will emit next.
    pub fn current_frame(&self) -> NetFrame {
        self.shared.frame.load(Ordering::SeqCst)
    }
}

/// The lockstep relay server.
pub struct RelayServer {
    listener: TcpListener,
    shared: Arc<ServerShared>,
}

impl RelayServer {
    /// Binds the listen address without accepting yet.
    pub async fn bind(settings: ServerSettings) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(&settings.listen_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: settings.listen_addr.clone(),
                    source,
                })?;
        tracing::info!(addr = %settings.listen_addr, "relay listening");
        Ok(Self {
            listener,
            shared: Arc::new(ServerShared::new(settings)),
        })
    }

    /// The actual bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Control handle usable while the server runs.
    pub fn controller(&self) -> ServerController {
        ServerController {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts clients and paces frames until the task is dropped.
    pub async fn run(self) -> Result<(), ServerError> {
        let shared = Arc::clone(&self.shared);
        let interval = shared.settings.frame_interval;
        tokio::spawn(pacing_loop(Arc::clone(&shared), interval));

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            tracing::debug!(%peer_addr, "incoming connection");
            tokio::spawn(handle_client(stream, Arc::clone(&shared)));
        }
    }
}

async fn pacing_loop(shared: Arc<ServerShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if shared.started.load(Ordering::SeqCst) {
            shared.pace_frame();
        }
    }
}

async fn handle_client(stream: TcpStream, shared: Arc<ServerShared>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (to_client, from_server) = mpsc::unbounded_channel();

    let client_id = {
        let mut clients = shared.clients.lock().unwrap();
        if clients.len() >= shared.settings.max_clients {
            tracing::warn!("connection refused: server full");
            return;
        }
        let client_id = shared.next_client_id.fetch_add(1, Ordering::SeqCst);
        clients.insert(
            client_id,
            Peer {
                to_client: to_client.clone(),
                pending: VecDeque::new(),
            },
        );
        client_id
    };
    tracing::info!(client_id, "client joined");

    let mut handshake = Vec::new();
    wire::write_handshake(&mut handshake, client_id);
    let _ = to_client.send(handshake);

    if let Some(threshold) = shared.settings.start_when_clients {
        if shared.connected_clients() >= threshold {
            shared.start_game();
        }
    }

    tokio::spawn(client_write_loop(write_half, from_server));

    if let Err(e) = client_read_loop(read_half, client_id, &shared).await {
        tracing::debug!(client_id, error = %e, "client read loop ended");
    }
    shared.drop_client(client_id);
}

async fn client_write_loop(
    mut writer: OwnedWriteHalf,
    mut from_server: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(buf) = from_server.recv().await {
        if writer.write_all(&buf).await.is_err() {
            return;
        }
    }
}

async fn client_read_loop(
    mut reader: OwnedReadHalf,
    client_id: ClientId,
    shared: &ServerShared,
) -> Result<(), rampart_protocol::WireError> {
    loop {
        let payload = wire::read_frame(&mut reader).await?;
        let packet = Packet::new(client_id, payload);
        match packet.kind() {
            PacketKind::Immediate => shared.broadcast(client_id, &packet.payload, true),
            PacketKind::SyncHash => shared.broadcast(client_id, &packet.payload, false),
            PacketKind::Disconnect => return Ok(()),
            PacketKind::FrameOrders => shared.queue_orders(client_id, &packet.payload),
            PacketKind::Malformed => {
                tracing::warn!(client_id, len = packet.payload.len(), "malformed frame");
                return Ok(());
            }
        }
    }
}

/// A relay running on its own background runtime, for synchronous callers
/// (tests, the game shell's host mode).
pub struct ServerHandle {
    runtime: NetRuntime,
    controller: ServerController,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Binds and runs the relay on a dedicated runtime.
    pub fn launch(settings: ServerSettings) -> Result<Self, ServerError> {
        let runtime = NetRuntime::spawn_new();
        let server = runtime.handle().block_on(RelayServer::bind(settings))?;
        let controller = server.controller();
        let local_addr = server.local_addr()?;
        runtime.handle().spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "relay stopped");
            }
        });
        Ok(Self {
            runtime,
            controller,
            local_addr,
        })
    }

    /// The bound address clients should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Control handle for the running relay.
    pub fn controller(&self) -> &ServerController {
        &self.controller
    }

    /// Stops the relay and drops every client socket.
    pub fn shutdown(&mut self) {
        self.runtime.shutdown();
    }
}
