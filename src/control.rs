//! Control channel protocol.
//!
//! Control requests are short packets on the interrupt OUT endpoint. Requests
//! that produce an answer are followed by a 32-byte packet on the interrupt
//! IN endpoint whose first byte echoes the command with the high bit set.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::error::{Error, Result};
use crate::transport::{DeviceLink, TransportError, CONTROL_PACKET_SIZE};
use crate::types::DeviceStatus;

pub const CMD_STOP: u8 = 0x01;
pub const CMD_SET_SHUTTER: u8 = 0x02;
pub const CMD_GET_STATUS: u8 = 0x03;
pub const CMD_GET_FIRMWARE_VERSION: u8 = 0x04;
pub const CMD_GET_NAME: u8 = 0x05;
pub const CMD_SET_NAME: u8 = 0x06;
pub const CMD_SEND_SDK_VERSION: u8 = 0x07;
pub const CMD_ERASE_FIRMWARE: u8 = 0xDE;

/// Bit set in byte 0 of every response packet.
pub const RESPONSE_FLAG: u8 = 0x80;

/// SDK protocol version announced to the device when it is opened.
pub const SDK_VERSION: u8 = 6;

/// Longest device name in bytes, excluding the NUL terminator.
pub const MAX_NAME_LEN: usize = 30;

/// A control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest<'a> {
    /// Stop output until a new frame is written.
    Stop,
    /// Open (`true`) or close the shutter.
    SetShutter(bool),
    /// Ask whether the device buffer can take another frame.
    GetStatus,
    /// Read the firmware version.
    GetFirmwareVersion,
    /// Read the stored device name.
    GetName,
    /// Store a new device name.
    SetName(&'a str),
    /// Announce the host SDK version.
    SendSdkVersion,
    /// Erase the firmware, dropping the device into its bootloader.
    EraseFirmware,
}

impl ControlRequest<'_> {
    /// Command byte for this request.
    pub fn command(&self) -> u8 {
        match self {
            ControlRequest::Stop => CMD_STOP,
            ControlRequest::SetShutter(_) => CMD_SET_SHUTTER,
            ControlRequest::GetStatus => CMD_GET_STATUS,
            ControlRequest::GetFirmwareVersion => CMD_GET_FIRMWARE_VERSION,
            ControlRequest::GetName => CMD_GET_NAME,
            ControlRequest::SetName(_) => CMD_SET_NAME,
            ControlRequest::SendSdkVersion => CMD_SEND_SDK_VERSION,
            ControlRequest::EraseFirmware => CMD_ERASE_FIRMWARE,
        }
    }

    /// Whether the device answers this request.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            ControlRequest::GetStatus
                | ControlRequest::GetFirmwareVersion
                | ControlRequest::GetName
        )
    }

    /// Serialize the request packet.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let command = self.command();
        let bytes = match self {
            ControlRequest::SetShutter(open) => vec![command, *open as u8],
            ControlRequest::SendSdkVersion => vec![command, SDK_VERSION],
            ControlRequest::SetName(name) => {
                validate_name(name)?;
                let mut packet = vec![0u8; CONTROL_PACKET_SIZE];
                packet[0] = command;
                packet[1..1 + name.len()].copy_from_slice(name.as_bytes());
                packet
            }
            _ => vec![command, 0],
        };
        Ok(bytes)
    }
}

/// Check that a name fits in the device's name field.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "name is {} bytes, maximum is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(Error::invalid_argument("name contains a NUL byte"));
    }
    Ok(())
}

/// Send a request without waiting for an answer.
pub fn send<L: DeviceLink + ?Sized>(link: &L, request: ControlRequest<'_>) -> Result<()> {
    let bytes = request.to_bytes()?;
    trace!("control request 0x{:02X}", request.command());
    link.write_control(&bytes)?;
    Ok(())
}

/// Send a request and read the matching response packet.
pub fn exchange<L: DeviceLink + ?Sized>(
    link: &L,
    request: ControlRequest<'_>,
) -> Result<[u8; CONTROL_PACKET_SIZE]> {
    send(link, request)?;

    let mut response = [0u8; CONTROL_PACKET_SIZE];
    let read = link.read_control(&mut response)?;
    if read == 0 {
        return Err(TransportError::ShortTransfer {
            expected: CONTROL_PACKET_SIZE,
            actual: 0,
        }
        .into());
    }

    let expected = request.command() | RESPONSE_FLAG;
    if response[0] != expected {
        return Err(Error::InvalidResponse {
            command: request.command(),
            got: response[0],
        });
    }
    Ok(response)
}

/// Drain stale packets left in the interrupt IN endpoint.
///
/// Stops at the first read that fails (normally a timeout) or after
/// `max_packets` packets. Returns the number of packets discarded.
pub fn flush<L: DeviceLink + ?Sized>(link: &L, max_packets: usize) -> usize {
    let mut discard = [0u8; CONTROL_PACKET_SIZE];
    let mut flushed = 0;
    while flushed < max_packets {
        match link.read_control(&mut discard) {
            Ok(n) if n > 0 => flushed += 1,
            _ => break,
        }
    }
    flushed
}

/// Parse a status response.
pub fn parse_status(response: &[u8; CONTROL_PACKET_SIZE]) -> DeviceStatus {
    if response[1] == 0 {
        DeviceStatus::NotReady
    } else {
        DeviceStatus::Ready
    }
}

/// Parse a firmware version response.
pub fn parse_firmware_version(response: &[u8; CONTROL_PACKET_SIZE]) -> u32 {
    LittleEndian::read_u32(&response[1..5])
}

/// Parse a name response. Returns `None` if no name is stored.
pub fn parse_name(response: &[u8; CONTROL_PACKET_SIZE]) -> Option<String> {
    let field = &response[1..CONTROL_PACKET_SIZE - 1];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&field[..end]).into_owned())
}
