//! Framed stream encoding and decoding
//!
//! Write helpers compose into a plain `Vec<u8>` send buffer. Each helper
//! reserves its exact output size up front, so a buffer with sufficient
//! capacity never reallocates and a growing buffer grows to an exact fit.
//! Read helpers consume a framed tokio stream.

use bytes::{BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{WireError, WireResult};
use crate::packet::{Packet, TAG_SYNC_HASH};
use crate::{ClientId, NetFrame};

/// Version number exchanged at the head of every connection. Both sides
/// must agree exactly; there is no negotiation.
pub const HANDSHAKE_VERSION: u32 = 7;

/// Writes an order packet: `u32 len | u32 frame | orders...` where `len`
/// covers the frame field plus the concatenated orders.
pub fn write_order_packet(buf: &mut Vec<u8>, frame: NetFrame, orders: &[Bytes]) {
    let body: usize = orders.iter().map(|o| o.len()).sum();
    buf.reserve_exact(8 + body);
    buf.put_u32_le((body + 4) as u32);
    buf.put_u32_le(frame);
    for order in orders {
        buf.put_slice(order);
    }
}

/// Writes a single framed payload: `u32 len | payload`.
pub fn write_framed(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.reserve_exact(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Flushes queued sync payloads into the send buffer, each as a framed
/// packet. The queue entries already carry their frame field.
pub fn write_queued_sync_packets(buf: &mut Vec<u8>, queued: &[Bytes]) {
    let total: usize = queued.iter().map(|p| 4 + p.len()).sum();
    buf.reserve_exact(total);
    for payload in queued {
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
    }
}

/// Builds a sync payload from an arbitrary hash body: `u32 frame | body`.
/// The length prefix is added by the outer framer on flush.
pub fn sync_payload(frame: NetFrame, hash_bytes: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(4 + hash_bytes.len());
    buf.put_u32_le(frame);
    buf.put_slice(hash_bytes);
    buf.into()
}

/// Builds the canonical nine-byte sync payload:
/// `u32 frame | TAG_SYNC_HASH | u32 hash`.
pub fn sync_hash_payload(frame: NetFrame, hash: u32) -> Bytes {
    let mut buf = Vec::with_capacity(9);
    buf.put_u32_le(frame);
    buf.put_u8(TAG_SYNC_HASH);
    buf.put_u32_le(hash);
    buf.into()
}

/// The hash portion of a sync payload: `TAG_SYNC_HASH | u32 hash`. The
/// frame field is prepended by `send_sync`.
pub fn sync_hash_body(hash: u32) -> [u8; 5] {
    let mut body = [0u8; 5];
    body[0] = TAG_SYNC_HASH;
    body[1..].copy_from_slice(&hash.to_le_bytes());
    body
}

/// Writes the server-side handshake: `u32 HANDSHAKE_VERSION | u32 client_id`.
pub fn write_handshake(buf: &mut Vec<u8>, client_id: ClientId) {
    buf.reserve_exact(8);
    buf.put_u32_le(HANDSHAKE_VERSION);
    buf.put_u32_le(client_id);
}

/// Reads and validates the handshake, returning the assigned client id.
pub async fn read_handshake<R>(reader: &mut R) -> WireResult<ClientId>
where
    R: AsyncRead + Unpin,
{
    let version = reader.read_u32_le().await?;
    if version != HANDSHAKE_VERSION {
        return Err(WireError::VersionMismatch {
            ours: HANDSHAKE_VERSION,
            theirs: version,
        });
    }
    let client_id = reader.read_u32_le().await?;
    Ok(client_id)
}

/// Reads one server->client packet: `u32 len | u32 from | bytes[len]`.
/// A zero length is a protocol error, not an empty packet.
pub async fn read_packet<R>(reader: &mut R) -> WireResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await?;
    if len == 0 {
        return Err(WireError::ZeroLengthPacket);
    }
    let from_client = reader.read_u32_le().await?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Packet::new(from_client, payload.into()))
}

/// Reads one client->server frame: `u32 len | bytes[len]` (no sender field;
/// the server stamps it when relaying).
pub async fn read_frame<R>(reader: &mut R) -> WireResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await?;
    if len == 0 {
        return Err(WireError::ZeroLengthPacket);
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framed_write_within_capacity() {
        // A five-byte payload framed into a buffer with room to spare:
        // the length prefix plus payload land without reallocation.
        let mut buf = Vec::with_capacity(10);
        write_framed(&mut buf, &[1, 2, 3, 4, 5]);

        assert_eq!(buf.len(), 9);
        assert_eq!(buf.capacity(), 10);
        assert_eq!(&buf[..4], &5u32.to_le_bytes());
        assert_eq!(&buf[4..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_queued_sync_flush_within_capacity() {
        let queued = vec![
            sync_payload(1, &[0xAA]),
            sync_payload(2, &[0xBB]),
        ];
        assert!(queued.iter().all(|p| p.len() == 5));

        let mut buf = Vec::with_capacity(18);
        write_queued_sync_packets(&mut buf, &queued);

        assert_eq!(buf.len(), 18);
        assert_eq!(buf.capacity(), 18);
    }

    #[test]
    fn test_queued_sync_flush_grows_to_exact_fit() {
        let queued = vec![
            sync_payload(1, &[0xAA]),
            sync_payload(2, &[0xBB]),
        ];

        let mut buf = Vec::with_capacity(10);
        write_queued_sync_packets(&mut buf, &queued);

        assert_eq!(buf.len(), 18);
        assert_eq!(buf.capacity(), 18);
    }

    #[test]
    fn test_order_packet_composes_sized_buffer() {
        // 4-byte length + 4-byte frame + 2-byte order fills the buffer
        // exactly.
        let mut buf = Vec::with_capacity(10);
        write_order_packet(&mut buf, 1, &[Bytes::from_static(&[0, 0])]);

        assert_eq!(buf.len(), 10);
        assert_eq!(buf.capacity(), 10);
        assert_eq!(&buf[..4], &6u32.to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..], &[0, 0]);
    }

    #[test]
    fn test_order_packet_concatenates_orders() {
        let mut buf = Vec::new();
        let orders = [Bytes::from_static(&[1, 2]), Bytes::from_static(&[3])];
        write_order_packet(&mut buf, 9, &orders);

        assert_eq!(&buf[..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..8], &9u32.to_le_bytes());
        assert_eq!(&buf[8..], &[1, 2, 3]);
    }

    #[test]
    fn test_sync_hash_payload_shape() {
        let payload = sync_hash_payload(42, 0xDEADBEEF);
        assert_eq!(payload.len(), 9);
        assert_eq!(&payload[..4], &42u32.to_le_bytes());
        assert_eq!(payload[4], TAG_SYNC_HASH);
        assert_eq!(&payload[5..], &0xDEADBEEFu32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_packet_round_trip() {
        let mut wire = Vec::new();
        write_order_packet(&mut wire, 5, &[Bytes::from_static(&[7, 8, 9])]);
        // Stamp a sender the way the server does when relaying.
        let mut stamped = Vec::new();
        stamped.extend_from_slice(&wire[..4]);
        stamped.extend_from_slice(&3u32.to_le_bytes());
        stamped.extend_from_slice(&wire[4..]);

        let mut reader = stamped.as_slice();
        let packet = read_packet(&mut reader).await.unwrap();
        assert_eq!(packet.from_client, 3);
        assert_eq!(packet.frame(), Some(5));
        assert_eq!(&packet.payload[4..], &[7, 8, 9]);
    }

    #[tokio::test]
    async fn test_zero_length_is_protocol_error() {
        let wire = 0u32.to_le_bytes();
        let mut reader = wire.as_slice();
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(WireError::ZeroLengthPacket)
        ));
        let mut reader = wire.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::ZeroLengthPacket)
        ));
    }

    #[tokio::test]
    async fn test_handshake_round_trip() {
        let mut wire = Vec::new();
        write_handshake(&mut wire, 4);

        let mut reader = wire.as_slice();
        assert_eq!(read_handshake(&mut reader).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(HANDSHAKE_VERSION + 1).to_le_bytes());
        wire.extend_from_slice(&1u32.to_le_bytes());

        let mut reader = wire.as_slice();
        match read_handshake(&mut reader).await {
            Err(WireError::VersionMismatch { ours, theirs }) => {
                assert_eq!(ours, HANDSHAKE_VERSION);
                assert_eq!(theirs, HANDSHAKE_VERSION + 1);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_stream_is_io_error() {
        // Length says 8, only 3 bytes follow the sender field.
        let mut wire = Vec::new();
        wire.extend_from_slice(&8u32.to_le_bytes());
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.extend_from_slice(&[1, 2, 3]);

        let mut reader = wire.as_slice();
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(WireError::Io(_))
        ));
    }
}
