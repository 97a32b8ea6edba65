//! Point, frame and status types for the Helios DAC.
//!
//! These are the plain values a caller builds and the device understands.
//! Coordinates are native 12-bit device units; colors are 8-bit.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

use bitflags::bitflags;

use crate::error::Result;

/// Maximum number of points in a single frame.
pub const MAX_POINTS: usize = 0x1000;

/// Minimum supported output rate in points per second.
pub const MIN_RATE: u32 = 7;

/// Maximum supported output rate in points per second.
pub const MAX_RATE: u32 = 0xFFFF;

/// Largest value a 12-bit coordinate can take.
pub const COORDINATE_MAX: u16 = 0x0FFF;

/// A single deflection point in native device units.
///
/// - x, y: 12-bit unsigned (0-4095). The upper four bits of the field are
///   reserved and are masked off when the point is constructed or encoded.
/// - r, g, b, i: 8-bit color and intensity channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Point {
    /// X coordinate, 0 to 4095
    pub x: u16,
    /// Y coordinate, 0 to 4095
    pub y: u16,
    /// Red channel (0-255)
    pub r: u8,
    /// Green channel (0-255)
    pub g: u8,
    /// Blue channel (0-255)
    pub b: u8,
    /// Intensity (0-255)
    pub i: u8,
}

impl Point {
    /// Creates a new point. Coordinates are truncated to 12 bits.
    pub fn new(x: u16, y: u16, r: u8, g: u8, b: u8, i: u8) -> Self {
        Self {
            x: x & COORDINATE_MAX,
            y: y & COORDINATE_MAX,
            r,
            g,
            b,
            i,
        }
    }

    /// Creates a blanked point (laser off) at the given position.
    pub fn blanked(x: u16, y: u16) -> Self {
        Self::new(x, y, 0, 0, 0, 0)
    }

    /// Creates a point from normalized coordinates.
    ///
    /// `x` runs from -1.0 (left) to 1.0 (right) and `y` from -1.0 (bottom)
    /// to 1.0 (top). Both are clamped, then mapped onto the device's
    /// inverted 12-bit range.
    pub fn from_normalized(x: f32, y: f32, r: u8, g: u8, b: u8, i: u8) -> Self {
        Self::new(
            Self::to_device_axis(x),
            Self::to_device_axis(y),
            r,
            g,
            b,
            i,
        )
    }

    fn to_device_axis(v: f32) -> u16 {
        let max = COORDINATE_MAX as f32;
        let clamped = v.clamp(-1.0, 1.0);
        (max - ((clamped + 1.0) * 0.5 * max)).round() as u16
    }

    /// Returns true if all color channels and intensity are zero.
    pub fn is_blank(&self) -> bool {
        self.r == 0 && self.g == 0 && self.b == 0 && self.i == 0
    }
}

bitflags! {
    /// Playback flags sent with each frame.
    ///
    /// Bits 3-7 are reserved by the device and carried through untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct FrameFlags: u8 {
        /// Start output immediately instead of waiting for the current frame
        /// to finish playing.
        const START_IMMEDIATELY = 1 << 0;
        /// Play the frame once, instead of repeating until another frame is
        /// written.
        const SINGLE_MODE = 1 << 1;
        /// Return from `write_frame` as soon as the transfer is submitted.
        ///
        /// The call may then report success for a transfer that later fails;
        /// the failure is surfaced by the next status query.
        const DONT_BLOCK = 1 << 2;
    }
}

impl FrameFlags {
    /// Returns true if the submit call should wait for transfer completion.
    pub fn is_blocking(&self) -> bool {
        !self.contains(FrameFlags::DONT_BLOCK)
    }
}

/// A frame: ordered points plus playback parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    /// Output rate in points per second.
    pub pps: u32,
    /// Playback flags.
    pub flags: FrameFlags,
    /// Points in output order.
    pub points: Vec<Point>,
}

impl Frame {
    /// Creates a frame with default flags.
    pub fn new(pps: u32, points: Vec<Point>) -> Self {
        Self {
            pps,
            flags: FrameFlags::empty(),
            points,
        }
    }

    /// Sets the playback flags.
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encodes the frame into the device's streaming layout.
    pub fn encode(&self) -> Result<Vec<u8>> {
        crate::frame::encode(&self.points, self.pps, self.flags)
    }
}

/// Readiness of a device for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceStatus {
    /// A new frame may be written.
    Ready,
    /// A frame is still in flight, or the device's buffer is full.
    NotReady,
}

impl DeviceStatus {
    /// Returns true for [`DeviceStatus::Ready`].
    pub fn is_ready(&self) -> bool {
        matches!(self, DeviceStatus::Ready)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Ready => write!(f, "ready"),
            DeviceStatus::NotReady => write!(f, "not ready"),
        }
    }
}
