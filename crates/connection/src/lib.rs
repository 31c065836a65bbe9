//! # Rampart Connection
//!
//! Sequenced transports for the lockstep core. All variants share one
//! synchronous, game-thread contract: sends never block, and `receive`
//! only drains what has already arrived.
//!
//! - [`NetworkConnection`]: framed TCP to a relay server. Network I/O runs
//!   on a background tokio runtime; the game thread talks to it through
//!   channels.
//! - [`EchoConnection`]: in-process loopback for solo games and the
//!   shellmap, so single-player shares the multiplayer code path.
//! - [`ReplayConnection`]: plays back a recorded session; sends are
//!   ignored.

pub mod echo;
pub mod network;
pub mod replay;
pub mod runtime;

pub use echo::{EchoConnection, ECHO_CLIENT_ID};
pub use network::{ConnectionSettings, NetworkConnection};
pub use replay::{FileReplaySink, ReplayConnection, ReplayMeta};
pub use runtime::{NetRuntime, PacketQueue};

use bytes::Bytes;
use rampart_protocol::{ClientId, ConnectionState, NetFrame, WireError};

/// Game-thread contract shared by all transport variants.
///
/// `send_frame` atomically registers the order batch for acknowledgement
/// and transmits it; `send_sync` only queues — sync packets ride piggyback
/// on the next `send_frame` and are simultaneously echoed to the local
/// inbound queue so the local client observes its own hashes.
pub trait Connection: Send {
    /// The id the server assigned during the handshake (0 until then).
    fn local_client_id(&self) -> ClientId;

    /// Current transport state, published by the receiver.
    fn state(&self) -> ConnectionState;

    /// The failure that moved the transport to `NotConnected`, if any.
    fn error_message(&self) -> Option<String> {
        None
    }

    /// True for playback transports; sync reports are not generated for
    /// them.
    fn is_replay(&self) -> bool {
        false
    }

    /// Enqueues the batch onto the awaiting-ack FIFO and transmits
    /// `frame | orders`, flushing any queued sync packets after it. An
    /// empty batch transmits nothing of its own (only queued syncs flush).
    fn send_frame(&mut self, frame: NetFrame, orders: &[Bytes]);

    /// Transmits one frame-0 packet per order. Immediates are never
    /// acknowledged and never enter the awaiting-ack FIFO.
    fn send_immediate(&mut self, orders: &[Bytes]);

    /// Queues `frame | hash_bytes` for the next `send_frame` flush.
    fn send_sync(&mut self, frame: NetFrame, hash_bytes: &[u8]);

    /// Drains inbound packets in arrival order, invoking the visitor on
    /// the calling thread.
    fn receive(&mut self, visitor: &mut dyn FnMut(ClientId, Bytes));

    /// Installs a sink that observes every packet dispatched by
    /// `receive` from now on.
    fn start_recording(&mut self, sink: Box<dyn ReplaySink>);

    /// Closes the transport and publishes `NotConnected`. Idempotent.
    fn dispose(&mut self);
}

/// Side channel fed with every inbound packet as it is dispatched.
pub trait ReplaySink: Send {
    /// Records one packet. Failures must not take down the session.
    fn record(&mut self, from_client: ClientId, payload: &[u8]);
}

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No endpoint could be resolved or reached before the deadline.
    #[error("failed to resolve any endpoint: {0}")]
    ConnectFailure(String),

    /// The server acknowledged more order packets than were in flight.
    #[error("server acked {requested} order packets but only {available} were awaiting")]
    AckUnderflow { requested: u16, available: usize },

    /// The replay file could not be parsed.
    #[error("replay file corrupt: {0}")]
    ReplayCorrupt(String),

    /// A wire-level failure from the framed stream.
    #[error(transparent)]
    Wire(#[from] WireError),
}
