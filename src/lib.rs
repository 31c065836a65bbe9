//! # Rampart
//!
//! The deterministic lockstep networking core of a real-time-strategy engine.
//! Every participating client executes the identical sequence of orders at
//! the identical net-frames; divergence is detected through periodic sync
//! hashes, and jitter is absorbed by per-client frame buffering.
//!
//! ## Components
//!
//! - `rampart-protocol`: wire format, packet tags, handshake, connection states
//! - `rampart-connection`: framed TCP transport plus echo and replay variants
//! - `rampart-lockstep`: frame queues, sync checking, and the order manager
//! - `rampart-server`: the relay server that paces net-frames and acks orders
//!
//! See the workspace `tests/` directory for end-to-end sessions.

pub use rampart_connection as connection;
pub use rampart_lockstep as lockstep;
pub use rampart_protocol as protocol;
pub use rampart_server as server;
