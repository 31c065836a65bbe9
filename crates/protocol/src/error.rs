use thiserror::Error;

/// Errors raised while encoding or decoding the framed stream.
#[derive(Error, Debug)]
pub enum WireError {
    /// A length prefix of zero is reserved and never valid on the wire.
    #[error("zero-length packet")]
    ZeroLengthPacket,

    /// The peer spoke a different handshake version.
    #[error("handshake version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    /// The underlying socket failed or closed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations.
pub type WireResult<T> = std::result::Result<T, WireError>;
