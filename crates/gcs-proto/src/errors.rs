//! Protocol error types.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message shorter than the fixed fragment header
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    MessageTooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes present
        actual: usize,
    },

    /// Header magic does not match
    #[error("invalid magic: 0x{found:08x}")]
    InvalidMagic {
        /// Magic value found in the header
        found: u32,
    },

    /// Header version is not supported
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Action type byte does not name a known action type
    #[error("invalid action type: {0}")]
    InvalidActionType(u8),

    /// Declared fragment length disagrees with the bytes present
    #[error("fragment length mismatch: header says {declared}, got {actual}")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Payload bytes actually present
        actual: usize,
    },

    /// Packet size leaves no room for payload after the header
    #[error("packet size {pkt_size} must exceed the {header} byte header")]
    PacketTooSmall {
        /// Requested packet size
        pkt_size: usize,
        /// Fixed header size
        header: usize,
    },

    /// Action would need more fragments than the position marker can count
    #[error("action of {0} bytes needs too many fragments")]
    ActionTooLarge(u64),

    /// CBOR encoding failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR decoding failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
