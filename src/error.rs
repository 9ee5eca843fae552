//! Error types shared across the driver.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SlcanxResult<T> = Result<T, SlcanxError>;

/// Why a received line failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The leading character is not one of the known record types.
    UnknownType,
    /// A hex digit could not be parsed.
    BadHex,
    /// The DLC nibble is out of range for the frame kind.
    BadDlc,
    /// The line is shorter than the declared id/dlc/data would require.
    Truncated,
    /// An RTR frame was combined with an FD type, which is invalid.
    RtrWithFd,
    /// An unknown error tag appeared in a legacy `e` record.
    UnknownErrorTag,
    /// A structured `E` record was shorter than its fixed 9-byte payload.
    ShortStructuredError,
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::UnknownType => write!(f, "unknown record type"),
            DecodeErrorKind::BadHex => write!(f, "invalid hex digit"),
            DecodeErrorKind::BadDlc => write!(f, "DLC out of range"),
            DecodeErrorKind::Truncated => write!(f, "line shorter than declared length"),
            DecodeErrorKind::RtrWithFd => write!(f, "RTR combined with FD"),
            DecodeErrorKind::UnknownErrorTag => write!(f, "unknown legacy error tag"),
            DecodeErrorKind::ShortStructuredError => {
                write!(f, "structured error record too short")
            }
        }
    }
}

/// Errors raised by the driver, one variant per row of the error handling
/// design table.
#[derive(Debug, Error)]
pub enum SlcanxError {
    /// A send or command path found the transport detached.
    #[error("transport is gone")]
    TransportGone,

    /// The outbound buffer has insufficient headroom for another record.
    #[error("outbound buffer is full")]
    BufferFull,

    /// A received line failed to decode.
    #[error("failed to decode line: {0}")]
    DecodeError(DecodeErrorKind),

    /// A received line exceeded the inbound buffer capacity.
    #[error("inbound line overflowed the receive buffer")]
    InboundOverflow,

    /// A command rendezvous timed out after one second.
    #[error("command timed out waiting for acknowledgement")]
    CommandTimeout,

    /// A command rendezvous was interrupted before completion.
    #[error("command wait was interrupted")]
    CommandInterrupted,

    /// An open request could not be satisfied with the current configuration.
    #[error("invalid channel configuration: {0}")]
    ConfigurationInvalid(&'static str),

    /// The channel is not open.
    #[error("channel is not open")]
    NotOpen,

    /// The channel index requested does not exist on this port.
    #[error("no channel at index {0}")]
    NoSuchChannel(u8),
}
