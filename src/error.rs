//! Crate-level error types.

use thiserror::Error;

use crate::transport::TransportError;

/// Crate-level error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A point count, rate or name was rejected before touching the device.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A frame transfer is already in flight on this session.
    #[error("device busy: a frame transfer is already in flight")]
    Busy,

    /// The underlying channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No open device at the given index.
    #[error("no open device at index {index}")]
    NotFound { index: usize },

    /// The session has been closed.
    #[error("device session is closed")]
    Closed,

    /// The device answered a control request with an unexpected packet.
    #[error("unexpected response to control command 0x{command:02X} (got 0x{got:02X})")]
    InvalidResponse { command: u8, got: u8 },

    /// A byte sequence could not be parsed as a frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a malformed-frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Returns true if retrying after polling status may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
