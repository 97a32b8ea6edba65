//! Transport seam between device sessions and the host I/O stack.
//!
//! A [`Transport`] enumerates devices and hands out one [`DeviceLink`] per
//! device. A link offers two channels:
//!
//! - a synchronous control channel of fixed 32-byte packets
//!   ([`DeviceLink::write_control`] / [`DeviceLink::read_control`]), and
//! - an asynchronous streaming channel ([`DeviceLink::submit`]) that takes
//!   ownership of an encoded frame and reports back through a
//!   [`Completion`] on whatever thread the transport uses.
//!
//! The USB implementation lives in [`usb`] (feature `usb`); [`mock`]
//! provides an in-process simulation with controllable timing.

pub mod mock;
#[cfg(feature = "usb")]
pub mod usb;

use std::fmt;

use thiserror::Error;

/// Size of every control packet exchanged with the device.
pub const CONTROL_PACKET_SIZE: usize = 32;

/// Errors raised by the underlying channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// libusb reported an error.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The transfer did not finish in time.
    #[error("transfer timed out")]
    Timeout,

    /// The transfer was cancelled before completing.
    #[error("transfer cancelled")]
    Cancelled,

    /// The device is gone.
    #[error("device disconnected")]
    Disconnected,

    /// Fewer bytes were moved than requested.
    #[error("short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Outcome of a single streaming transfer.
pub type TransferResult = std::result::Result<(), TransportError>;

type Notify = Box<dyn FnOnce(Vec<u8>, TransferResult) + Send + 'static>;

/// One-shot completion notifier for a streaming transfer.
///
/// The transport must eventually call [`Completion::complete`], handing the
/// frame buffer back. If a `Completion` is dropped without being fired it
/// reports [`TransportError::Cancelled`], so a session is never left waiting
/// on a transfer the transport has forgotten about.
pub struct Completion {
    notify: Option<Notify>,
}

impl Completion {
    /// Create a completion that runs `f` exactly once.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Vec<u8>, TransferResult) + Send + 'static,
    {
        Self {
            notify: Some(Box::new(f)),
        }
    }

    /// Report the transfer outcome and return the buffer to its owner.
    pub fn complete(mut self, buffer: Vec<u8>, outcome: TransferResult) {
        if let Some(notify) = self.notify.take() {
            notify(buffer, outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            notify(Vec::new(), Err(TransportError::Cancelled));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.notify.is_some())
            .finish()
    }
}

/// Device discovery.
pub trait Transport: Send + Sync + 'static {
    /// Per-device link type.
    type Link: DeviceLink;

    /// Find and open every attached device.
    ///
    /// Devices that cannot be opened are skipped rather than failing the
    /// whole scan.
    fn enumerate(&self) -> Result<Vec<Self::Link>, TransportError>;
}

/// An opened device.
///
/// Control calls are not internally paired: the caller must serialize a
/// `write_control` with the `read_control` that answers it.
pub trait DeviceLink: Send + Sync + 'static {
    /// Send a control request.
    fn write_control(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Read one control response packet. Returns the number of bytes read.
    fn read_control(
        &self,
        response: &mut [u8; CONTROL_PACKET_SIZE],
    ) -> Result<usize, TransportError>;

    /// Start an asynchronous frame transfer.
    ///
    /// The link owns `buffer` until it fires `completion`. Submission never
    /// fails synchronously; every outcome, including immediate rejection,
    /// is delivered through the completion.
    fn submit(&self, buffer: Vec<u8>, completion: Completion);

    /// Cancel every outstanding transfer.
    ///
    /// Cancelled transfers still fire their completion, with
    /// [`TransportError::Cancelled`].
    fn cancel(&self);
}
