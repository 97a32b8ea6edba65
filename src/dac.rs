//! Caller-facing API addressing devices by index.

use std::sync::Arc;

use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::session::{DeviceSession, SessionConfig};
use crate::transport::Transport;
#[cfg(feature = "usb")]
use crate::transport::usb::UsbTransport;
use crate::types::{DeviceStatus, FrameFlags, Point};

/// Driver for every Helios DAC reachable through a transport.
///
/// Typical use: [`open_devices`](Self::open_devices), then for each frame
/// poll [`get_status`](Self::get_status) until it reports
/// [`DeviceStatus::Ready`] and call [`write_frame`](Self::write_frame).
/// Dropping the driver closes every device.
pub struct HeliosDac<T: Transport> {
    registry: SessionRegistry<T>,
}

#[cfg(feature = "usb")]
impl HeliosDac<UsbTransport> {
    /// Creates a driver over libusb.
    pub fn new() -> Result<Self> {
        Ok(Self::with_transport(UsbTransport::new()?))
    }
}

impl<T: Transport> HeliosDac<T> {
    /// Creates a driver over a custom transport.
    pub fn with_transport(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Creates a driver over a custom transport and session configuration.
    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            registry: SessionRegistry::new(transport, config),
        }
    }

    /// Opens every attached device and returns how many are available.
    ///
    /// To rescan for newly attached devices, call
    /// [`close_devices`](Self::close_devices) first.
    pub fn open_devices(&self) -> Result<usize> {
        self.registry.open()
    }

    /// Closes every device.
    pub fn close_devices(&self) {
        self.registry.close();
    }

    /// Number of open devices.
    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// Session for the device at `index`.
    pub fn session(&self, index: usize) -> Result<Arc<DeviceSession<T::Link>>> {
        self.registry.get(index)
    }

    /// The underlying registry.
    pub fn registry(&self) -> &SessionRegistry<T> {
        &self.registry
    }

    /// Writes a frame to a device.
    ///
    /// Blocks until the transfer completes unless `flags` contains
    /// [`FrameFlags::DONT_BLOCK`]. See [`DeviceSession::submit_frame`].
    pub fn write_frame(
        &self,
        index: usize,
        pps: u32,
        flags: FrameFlags,
        points: &[Point],
    ) -> Result<()> {
        self.registry.get(index)?.submit_frame(points, pps, flags)
    }

    /// Whether the device can take a new frame.
    pub fn get_status(&self, index: usize) -> Result<DeviceStatus> {
        self.registry.get(index)?.status()
    }

    /// Firmware version of the device.
    pub fn get_firmware_version(&self, index: usize) -> Result<u32> {
        self.registry.get(index)?.firmware_version()
    }

    /// Name of the device.
    pub fn get_name(&self, index: usize) -> Result<String> {
        self.registry.get(index)?.name()
    }

    /// Renames the device (at most 30 bytes).
    pub fn set_name(&self, index: usize, name: &str) -> Result<()> {
        self.registry.get(index)?.set_name(name)
    }

    /// Stops output until the next frame. Blocks for about 100 ms.
    pub fn stop(&self, index: usize) -> Result<()> {
        self.registry.get(index)?.halt()
    }

    /// Opens or closes the shutter.
    pub fn set_shutter(&self, index: usize, open: bool) -> Result<()> {
        self.registry.get(index)?.set_shutter(open)
    }

    /// Erases the device firmware, leaving it in its bootloader.
    pub fn erase_firmware(&self, index: usize) -> Result<()> {
        self.registry.get(index)?.erase_firmware()
    }
}
