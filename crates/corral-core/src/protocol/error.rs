//! Protocol error types.

use std::path::PathBuf;

use thiserror::Error;

/// Maximum payload size of a single frame (16 MiB).
///
/// Compressed OS images are the largest payloads that legitimately cross
/// the wire; anything beyond this cap is treated as a framing fault rather
/// than allocated.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Convenience alias for protocol results.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the framing and message layers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying stream I/O failed.
    #[error("protocol i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A frame declared a payload larger than the protocol cap.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The header carried a kind discriminant no message maps to.
    #[error("unknown packet kind {kind}")]
    UnknownPacketKind {
        /// The offending discriminant.
        kind: u32,
    },

    /// A response arrived with a different kind than the exchange expects.
    #[error("unexpected packet kind: expected {expected}, got {actual}")]
    UnexpectedPacket {
        /// Kind the exchange expected.
        expected: &'static str,
        /// Kind that actually arrived.
        actual: String,
    },

    /// Payload (de)serialization failed.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A payload referenced a file that does not exist on the dispatcher.
    #[error("referenced file missing: {}", path.display())]
    FileMissing {
        /// The missing path.
        path: PathBuf,
    },
}

pub(crate) const fn unknown_kind(kind: u32) -> ProtocolError {
    ProtocolError::UnknownPacketKind { kind }
}

impl ProtocolError {
    /// Build a [`ProtocolError::FrameTooLarge`].
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }
}
