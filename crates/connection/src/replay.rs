//! Replay recording and playback
//!
//! A replay file is a single JSON metadata line followed by framed binary
//! records, one per inbound packet in dispatch order:
//!
//! ```text
//! ┌──────────────┬──────┬───────────┐
//! │ from client  │ u32  │ 4 bytes   │
//! ├──────────────┼──────┼───────────┤
//! │ len          │ u32  │ 4 bytes   │
//! ├──────────────┼──────┼───────────┤
//! │ payload      │ [u8] │ len bytes │
//! └──────────────┴──────┴───────────┘
//! ```
//!
//! Playback feeds the records back through the normal `receive` path on a
//! synthetic clock: each call releases roughly one net-frame of traffic.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rampart_protocol::{ClientId, ConnectionState, NetFrame, Packet, PacketKind, HANDSHAKE_VERSION};

use crate::{Connection, ConnectionError, ReplaySink};

/// Metadata header written as the first line of every replay file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMeta {
    /// Unique id of the recorded game.
    pub game_id: Uuid,

    /// The id the recording client held; playback presents it as its own.
    pub local_client_id: ClientId,

    /// Wire version the session spoke.
    pub handshake_version: u32,
}

impl ReplayMeta {
    /// Metadata for a fresh recording by the given client.
    pub fn new(local_client_id: ClientId) -> Self {
        Self {
            game_id: Uuid::new_v4(),
            local_client_id,
            handshake_version: HANDSHAKE_VERSION,
        }
    }
}

/// Sink that appends every dispatched packet to a replay file.
pub struct FileReplaySink {
    writer: BufWriter<File>,
}

impl FileReplaySink {
    /// Creates the file and writes the metadata header.
    pub fn create(path: &Path, meta: &ReplayMeta) -> std::io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        let header = serde_json::to_string(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(header.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(Self { writer })
    }
}

impl ReplaySink for FileReplaySink {
    fn record(&mut self, from_client: ClientId, payload: &[u8]) {
        let mut record = Vec::with_capacity(8 + payload.len());
        record.put_u32_le(from_client);
        record.put_u32_le(payload.len() as u32);
        record.extend_from_slice(payload);
        if let Err(e) = self.writer.write_all(&record) {
            tracing::warn!(error = %e, "replay record dropped");
        }
    }
}

impl Drop for FileReplaySink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Playback transport: sends are ignored, `receive` feeds the recorded
/// packets back in recorded order.
pub struct ReplayConnection {
    meta: ReplayMeta,
    packets: Vec<Packet>,
    cursor: usize,
    disposed: bool,
}

impl ReplayConnection {
    /// Loads a replay file, validating the metadata header.
    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let mut reader = BufReader::new(
            File::open(path).map_err(|e| ConnectionError::ReplayCorrupt(e.to_string()))?,
        );

        let mut header = String::new();
        reader
            .read_line(&mut header)
            .map_err(|e| ConnectionError::ReplayCorrupt(e.to_string()))?;
        let meta: ReplayMeta = serde_json::from_str(header.trim_end())
            .map_err(|e| ConnectionError::ReplayCorrupt(format!("bad metadata: {e}")))?;
        if meta.handshake_version != HANDSHAKE_VERSION {
            return Err(ConnectionError::ReplayCorrupt(format!(
                "recorded with wire version {}, ours is {}",
                meta.handshake_version, HANDSHAKE_VERSION
            )));
        }

        let mut packets = Vec::new();
        loop {
            let mut head = [0u8; 8];
            match reader.read_exact(&mut head) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(ConnectionError::ReplayCorrupt(e.to_string())),
            }
            let from_client = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
            let mut payload = vec![0u8; len as usize];
            reader
                .read_exact(&mut payload)
                .map_err(|e| ConnectionError::ReplayCorrupt(format!("truncated record: {e}")))?;
            packets.push(Packet::new(from_client, payload.into()));
        }

        Ok(Self {
            meta,
            packets,
            cursor: 0,
            disposed: false,
        })
    }

    /// Metadata of the loaded recording.
    pub fn meta(&self) -> &ReplayMeta {
        &self.meta
    }

    /// True once every recorded packet has been released.
    pub fn at_end(&self) -> bool {
        self.cursor >= self.packets.len()
    }
}

impl Connection for ReplayConnection {
    fn local_client_id(&self) -> ClientId {
        self.meta.local_client_id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::PreConnecting
    }

    fn is_replay(&self) -> bool {
        true
    }

    fn send_frame(&mut self, _frame: NetFrame, _orders: &[Bytes]) {}

    fn send_immediate(&mut self, _orders: &[Bytes]) {}

    fn send_sync(&mut self, _frame: NetFrame, _hash_bytes: &[u8]) {}

    /// Releases recorded packets until a second frame-order packet from the
    /// same client would be dispatched — one net-frame of traffic per call.
    fn receive(&mut self, visitor: &mut dyn FnMut(ClientId, Bytes)) {
        if self.disposed {
            return;
        }
        let mut framed_clients: HashSet<ClientId> = HashSet::new();
        while self.cursor < self.packets.len() {
            let packet = &self.packets[self.cursor];
            if packet.kind() == PacketKind::FrameOrders
                && !framed_clients.insert(packet.from_client)
            {
                break;
            }
            visitor(packet.from_client, packet.payload.clone());
            self.cursor += 1;
        }
    }

    fn start_recording(&mut self, _sink: Box<dyn ReplaySink>) {
        // Re-recording a replay would duplicate the file byte for byte.
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_replay_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rampart-replay-{tag}-{}.rpl", Uuid::new_v4()))
    }

    fn frame_payload(frame: u32, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&frame.to_le_bytes());
        payload.extend_from_slice(body);
        payload
    }

    #[test]
    fn test_record_and_load_round_trip() {
        let path = temp_replay_path("roundtrip");
        let meta = ReplayMeta::new(2);

        {
            let mut sink = FileReplaySink::create(&path, &meta).unwrap();
            sink.record(1, &frame_payload(1, &[10]));
            sink.record(2, &frame_payload(1, &[20]));
        }

        let replay = ReplayConnection::load(&path).unwrap();
        assert_eq!(replay.meta().game_id, meta.game_id);
        assert_eq!(replay.local_client_id(), 2);
        assert!(replay.is_replay());
        assert_eq!(replay.packets.len(), 2);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_playback_releases_one_frame_per_call() {
        let path = temp_replay_path("pacing");
        let meta = ReplayMeta::new(1);

        {
            let mut sink = FileReplaySink::create(&path, &meta).unwrap();
            // Two net-frames of traffic from clients 1 and 2, with an
            // immediate interleaved.
            sink.record(1, &frame_payload(1, &[11]));
            sink.record(2, &frame_payload(1, &[21]));
            sink.record(3, &frame_payload(0, &[99])); // immediate
            sink.record(1, &frame_payload(2, &[12]));
            sink.record(2, &frame_payload(2, &[22]));
        }

        let mut replay = ReplayConnection::load(&path).unwrap();

        let mut first = Vec::new();
        replay.receive(&mut |from, payload| first.push((from, payload)));
        // Frame 1 from both clients plus the immediate, but not frame 2.
        assert_eq!(first.len(), 3);
        assert!(!replay.at_end());

        let mut second = Vec::new();
        replay.receive(&mut |from, payload| second.push((from, payload)));
        assert_eq!(second.len(), 2);
        assert!(replay.at_end());

        let mut third = Vec::new();
        replay.receive(&mut |from, payload| third.push((from, payload)));
        assert!(third.is_empty());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sends_are_ignored() {
        let path = temp_replay_path("sends");
        let meta = ReplayMeta::new(1);
        {
            let mut sink = FileReplaySink::create(&path, &meta).unwrap();
            sink.record(1, &frame_payload(1, &[1]));
        }

        let mut replay = ReplayConnection::load(&path).unwrap();
        replay.send_frame(1, &[Bytes::from_static(&[9])]);
        replay.send_immediate(&[Bytes::from_static(&[9])]);
        replay.send_sync(1, &[0xAA; 5]);

        let mut seen = Vec::new();
        replay.receive(&mut |from, payload| seen.push((from, payload)));
        // Only the recorded packet, nothing of what was "sent".
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 1);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let path = temp_replay_path("version");
        let meta = ReplayMeta {
            game_id: Uuid::new_v4(),
            local_client_id: 1,
            handshake_version: HANDSHAKE_VERSION + 1,
        };
        {
            let _sink = FileReplaySink::create(&path, &meta).unwrap();
        }

        assert!(matches!(
            ReplayConnection::load(&path),
            Err(ConnectionError::ReplayCorrupt(_))
        ));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_truncated_record_rejected() {
        let path = temp_replay_path("truncated");
        let meta = ReplayMeta::new(1);
        {
            let mut sink = FileReplaySink::create(&path, &meta).unwrap();
            sink.record(1, &frame_payload(1, &[1, 2, 3]));
        }

        // Chop the last byte off.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        assert!(matches!(
            ReplayConnection::load(&path),
            Err(ConnectionError::ReplayCorrupt(_))
        ));

        std::fs::remove_file(&path).unwrap();
    }
}
