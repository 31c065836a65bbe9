//! Framed TCP transport
//!
//! One background runtime per connection runs the connect race, a receiver
//! task and a writer task. The game thread composes send buffers itself and
//! hands them to the writer channel; write failures are swallowed there —
//! the receiver independently notices the dead socket and publishes
//! `NotConnected` with the error message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use rampart_protocol::{
    wire, ClientId, ConnectionState, NetFrame, Packet, WireError, IMMEDIATE_FRAME,
};

use crate::runtime::{NetRuntime, PacketQueue};
use crate::{Connection, ConnectionError, ReplaySink};

/// How to reach the server.
///
/// Every endpoint is attempted in parallel; the first successful socket
/// wins and the rest are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Candidate `host:port` endpoints, raced in parallel.
    pub endpoints: Vec<String>,

    /// Deadline for the whole connect race.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl ConnectionSettings {
    /// Settings for a single endpoint with the default timeout.
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// State shared between the game thread and the receiver task.
///
/// The receiver is the only writer after the connect race; the game thread
/// only reads.
struct SharedState {
    state: AtomicU8,
    client_id: AtomicU32,
    error_message: Mutex<Option<String>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::PreConnecting.as_u8()),
            client_id: AtomicU32::new(0),
            error_message: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Stores `next` only if the state machine allows it. `NotConnected`
    /// stays terminal even under racing publishes.
    fn publish(&self, next: ConnectionState) {
        let current = self.state();
        if current.can_transition_to(next) {
            self.state.store(next.as_u8(), Ordering::SeqCst);
        }
    }

    fn fail(&self, message: String) {
        tracing::warn!(error = %message, "connection failed");
        *self.error_message.lock().unwrap() = Some(message);
        self.publish(ConnectionState::NotConnected);
    }
}

/// TCP transport speaking the framed lockstep protocol.
pub struct NetworkConnection {
    runtime: NetRuntime,
    shared: Arc<SharedState>,
    inbound: PacketQueue<Packet>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    awaiting_ack: Arc<Mutex<VecDeque<Bytes>>>,
    queued_syncs: Vec<Bytes>,
    recorder: Option<Box<dyn ReplaySink>>,
    disposed: bool,
}

impl NetworkConnection {
    /// Starts the connect race and returns immediately; observe `state()`
    /// for the outcome.
    pub fn connect(settings: ConnectionSettings) -> Self {
        let runtime = NetRuntime::spawn_new();
        let shared = Arc::new(SharedState::new());
        let inbound = PacketQueue::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let awaiting_ack = Arc::new(Mutex::new(VecDeque::new()));

        shared.publish(ConnectionState::Connecting);
        runtime.handle().spawn(run_connection(
            settings,
            Arc::clone(&shared),
            inbound.sender(),
            outbound_rx,
            Arc::clone(&awaiting_ack),
        ));

        Self {
            runtime,
            shared,
            inbound,
            outbound: Some(outbound_tx),
            awaiting_ack,
            queued_syncs: Vec::new(),
            recorder: None,
            disposed: false,
        }
    }

    /// Pending order batches that the server has not acknowledged yet.
    pub fn awaiting_ack_len(&self) -> usize {
        self.awaiting_ack.lock().unwrap().len()
    }

    fn transmit(&self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        if let Some(tx) = &self.outbound {
            // Send failures are ignored; the receiver reports the death.
            let _ = tx.send(buf);
        }
    }

    fn flush_queued_syncs(&mut self, buf: &mut Vec<u8>) {
        if self.queued_syncs.is_empty() {
            return;
        }
        wire::write_queued_sync_packets(buf, &self.queued_syncs);
        let local = self.local_client_id();
        for payload in self.queued_syncs.drain(..) {
            self.inbound.push(Packet::new(local, payload));
        }
    }
}

impl Connection for NetworkConnection {
    fn local_client_id(&self) -> ClientId {
        self.shared.client_id.load(Ordering::SeqCst)
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn error_message(&self) -> Option<String> {
        self.shared.error_message.lock().unwrap().clone()
    }

    fn send_frame(&mut self, frame: NetFrame, orders: &[Bytes]) {
        if self.disposed {
            return;
        }
        let mut buf = Vec::new();
        if !orders.is_empty() {
            let mut batch = Vec::with_capacity(orders.iter().map(|o| o.len()).sum());
            for order in orders {
                batch.extend_from_slice(order);
            }
            self.awaiting_ack
                .lock()
                .unwrap()
                .push_back(Bytes::from(batch));
            wire::write_order_packet(&mut buf, frame, orders);
        }
        self.flush_queued_syncs(&mut buf);
        self.transmit(buf);
    }

    fn send_immediate(&mut self, orders: &[Bytes]) {
        if self.disposed {
            return;
        }
        let mut buf = Vec::new();
        for order in orders {
            wire::write_order_packet(&mut buf, IMMEDIATE_FRAME, std::slice::from_ref(order));
        }
        self.transmit(buf);
    }

    fn send_sync(&mut self, frame: NetFrame, hash_bytes: &[u8]) {
        self.queued_syncs.push(wire::sync_payload(frame, hash_bytes));
    }

    fn receive(&mut self, visitor: &mut dyn FnMut(ClientId, Bytes)) {
        for packet in self.inbound.drain() {
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.record(packet.from_client, &packet.payload);
            }
            visitor(packet.from_client, packet.payload);
        }
    }

    fn start_recording(&mut self, sink: Box<dyn ReplaySink>) {
        self.recorder = Some(sink);
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.outbound = None;
        self.runtime.shutdown();
        self.shared.publish(ConnectionState::NotConnected);
        tracing::debug!("network connection disposed");
    }
}

async fn run_connection(
    settings: ConnectionSettings,
    shared: Arc<SharedState>,
    inbound: mpsc::UnboundedSender<Packet>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    awaiting_ack: Arc<Mutex<VecDeque<Bytes>>>,
) {
    let stream = match connect_race(&settings).await {
        Ok(stream) => stream,
        Err(e) => {
            shared.fail(e.to_string());
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(write_loop(write_half, outbound));

    match receive_loop(read_half, &shared, &inbound, &awaiting_ack).await {
        Ok(()) => shared.publish(ConnectionState::NotConnected),
        Err(e) => shared.fail(e.to_string()),
    }
}

/// Races one connect attempt per endpoint; first success wins, the rest
/// are dropped. Aborts when the deadline passes or every attempt failed.
async fn connect_race(settings: &ConnectionSettings) -> Result<TcpStream, ConnectionError> {
    if settings.endpoints.is_empty() {
        return Err(ConnectionError::ConnectFailure(
            "no endpoints configured".to_string(),
        ));
    }

    let mut attempts = FuturesUnordered::new();
    for endpoint in &settings.endpoints {
        let endpoint = endpoint.clone();
        attempts.push(async move {
            tracing::debug!(endpoint = %endpoint, "connect attempt");
            TcpStream::connect(endpoint.as_str())
                .await
                .map_err(|e| format!("{endpoint}: {e}"))
        });
    }

    let deadline = tokio::time::sleep(settings.connect_timeout);
    tokio::pin!(deadline);

    let mut errors = Vec::new();
    loop {
        tokio::select! {
            attempt = attempts.next() => match attempt {
                Some(Ok(stream)) => return Ok(stream),
                Some(Err(e)) => errors.push(e),
                None => return Err(ConnectionError::ConnectFailure(errors.join("; "))),
            },
            _ = &mut deadline => {
                return Err(ConnectionError::ConnectFailure(format!(
                    "timed out after {:?}",
                    settings.connect_timeout
                )));
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(buf) = outbound.recv().await {
        if let Err(e) = writer.write_all(&buf).await {
            tracing::debug!(error = %e, "socket write failed");
            return;
        }
    }
}

/// Handshake, then the read loop. Acks addressed to the local client are
/// intercepted here and never reach the inbound queue directly; everything
/// else is enqueued in arrival order.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    shared: &SharedState,
    inbound: &mpsc::UnboundedSender<Packet>,
    awaiting_ack: &Mutex<VecDeque<Bytes>>,
) -> Result<(), ConnectionError> {
    let client_id = wire::read_handshake(&mut reader).await?;
    shared.client_id.store(client_id, Ordering::SeqCst);
    shared.publish(ConnectionState::Connected);
    tracing::info!(client_id, "handshake complete");

    loop {
        let packet = match wire::read_packet(&mut reader).await {
            Ok(packet) => packet,
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::info!("server closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if packet.is_ack(client_id) {
            let synthesized = acknowledge(&packet.payload, awaiting_ack, client_id)?;
            let _ = inbound.send(synthesized);
        } else {
            let _ = inbound.send(packet);
        }
    }
}

/// Applies one ack: dequeues exactly `frames_to_ack` pending batches and
/// synthesizes the inbound packet `frame_received | batches...` attributed
/// to the local client, feeding the replay sink and local order visibility.
fn acknowledge(
    payload: &Bytes,
    awaiting_ack: &Mutex<VecDeque<Bytes>>,
    local_client: ClientId,
) -> Result<Packet, ConnectionError> {
    let mut cursor = payload.clone();
    let frame_received = cursor.get_u32_le();
    let _tag = cursor.get_u8();
    let frames_to_ack = cursor.get_u16_le();

    let mut queue = awaiting_ack.lock().unwrap();
    if queue.len() < frames_to_ack as usize {
        return Err(ConnectionError::AckUnderflow {
            requested: frames_to_ack,
            available: queue.len(),
        });
    }

    let mut body = Vec::new();
    body.put_u32_le(frame_received);
    for _ in 0..frames_to_ack {
        if let Some(batch) = queue.pop_front() {
            body.extend_from_slice(&batch);
        }
    }
    Ok(Packet::new(local_client, body.into()))
}
