//! In-process loopback transport
//!
//! Solo games and the shellmap run through the same lockstep code path as
//! multiplayer: everything sent comes straight back as if relayed by a
//! server, attributed to the fixed local client id.

use bytes::Bytes;
use rampart_protocol::{wire, ClientId, ConnectionState, NetFrame, Packet};

use crate::{Connection, ReplaySink};

/// The client id an echo connection assigns itself.
pub const ECHO_CLIENT_ID: ClientId = 1;

/// Loopback transport: sends bypass the network and re-enter the inbound
/// queue directly. The state never leaves `PreConnecting`.
pub struct EchoConnection {
    inbound: Vec<Packet>,
    queued_syncs: Vec<Bytes>,
    recorder: Option<Box<dyn ReplaySink>>,
    disposed: bool,
}

impl EchoConnection {
    /// Creates an empty loopback connection.
    pub fn new() -> Self {
        Self {
            inbound: Vec::new(),
            queued_syncs: Vec::new(),
            recorder: None,
            disposed: false,
        }
    }

    fn echo(&mut self, payload: Bytes) {
        self.inbound.push(Packet::new(ECHO_CLIENT_ID, payload));
    }

    fn flush_queued_syncs(&mut self) {
        let queued = std::mem::take(&mut self.queued_syncs);
        for payload in queued {
            self.echo(payload);
        }
    }
}

impl Default for EchoConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for EchoConnection {
    fn local_client_id(&self) -> ClientId {
        ECHO_CLIENT_ID
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::PreConnecting
    }

    fn send_frame(&mut self, frame: NetFrame, orders: &[Bytes]) {
        if self.disposed {
            return;
        }
        if !orders.is_empty() {
            let mut payload = Vec::new();
            payload.extend_from_slice(&frame.to_le_bytes());
            for order in orders {
                payload.extend_from_slice(order);
            }
            self.echo(payload.into());
        }
        self.flush_queued_syncs();
    }

    fn send_immediate(&mut self, orders: &[Bytes]) {
        if self.disposed {
            return;
        }
        for order in orders {
            let mut payload = Vec::with_capacity(4 + order.len());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(order);
            self.echo(payload.into());
        }
    }

    fn send_sync(&mut self, frame: NetFrame, hash_bytes: &[u8]) {
        self.queued_syncs.push(wire::sync_payload(frame, hash_bytes));
    }

    fn receive(&mut self, visitor: &mut dyn FnMut(ClientId, Bytes)) {
        for packet in self.inbound.drain(..) {
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
        self.disposed = true;
        self.inbound.clear();
    }
}
