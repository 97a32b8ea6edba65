//! Host-side driver for the Helios USB laser DAC.
//!
//! The driver streams frames (ordered batches of points plus a playback
//! rate) to each attached device and reports when a device can take the
//! next frame.
//!
//! # Getting Started
//!
//! ```no_run
//! use helios_dac::{DeviceStatus, FrameFlags, HeliosDac, Point};
//! use std::thread;
//! use std::time::Duration;
//!
//! let dac = HeliosDac::new()?;
//! let count = dac.open_devices()?;
//! println!("Found {} devices", count);
//!
//! let points = vec![
//!     Point::new(0, 0, 255, 0, 0, 255),
//!     Point::new(4095, 4095, 0, 255, 0, 255),
//! ];
//!
//! for _ in 0..100 {
//!     // The device is double buffered: wait until it has room.
//!     while dac.get_status(0)? != DeviceStatus::Ready {
//!         thread::sleep(Duration::from_millis(1));
//!     }
//!     dac.write_frame(0, 30_000, FrameFlags::empty(), &points)?;
//! }
//!
//! dac.stop(0)?;
//! # Ok::<(), helios_dac::Error>(())
//! ```
//!
//! # Readiness
//!
//! Two things must hold before a frame can be written:
//!
//! - the session has no transfer in flight (software side, see
//!   [`DeviceSession::query_status`]); writing while one is in flight fails
//!   with [`Error::Busy`] rather than queueing;
//! - the device's double buffer has a free slot (hardware side, see
//!   [`DeviceSession::device_status`]).
//!
//! [`HeliosDac::get_status`] checks both.
//!
//! # Transports
//!
//! - [`transport::usb`] (feature `usb`, default): libusb through `rusb`.
//! - [`transport::mock`]: simulated devices for tests and demos.
//!
//! # Coordinate System
//!
//! Points use native device units: 12-bit X/Y (0-4095) and 8-bit color and
//! intensity. [`Point::from_normalized`] converts from -1.0..1.0 coordinates.

pub mod control;
mod dac;
mod error;
pub mod frame;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use dac::HeliosDac;
pub use error::{Error, Result};
pub use registry::SessionRegistry;
pub use session::{DeviceSession, SessionConfig};
pub use transport::{Completion, DeviceLink, TransferResult, Transport, TransportError};
pub use types::{DeviceStatus, Frame, FrameFlags, Point, MAX_POINTS, MAX_RATE, MIN_RATE};

#[cfg(feature = "usb")]
pub use transport::usb::{UsbConfig, UsbTransport};

// Re-export rusb for consumers that need the Context type
#[cfg(feature = "usb")]
pub use rusb;
