//! Frame encoding for the Helios streaming endpoint.
//!
//! Wire layout (no length prefix, the USB bulk transfer is the framing):
//!
//! ```text
//! per point (7 bytes):
//! ┌──────────┬──────────────────────┬──────────┬───┬───┬───┬───┐
//! │ x[11:4]  │ x[3:0] << 4 | y[11:8]│ y[7:0]   │ r │ g │ b │ i │
//! └──────────┴──────────────────────┴──────────┴───┴───┴───┴───┘
//! trailer (5 bytes):
//! ┌────────────┬──────────────┬───────┐
//! │ pps u16 LE │ count u16 LE │ flags │
//! └────────────┴──────────────┴───────┘
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::types::{Frame, FrameFlags, Point, COORDINATE_MAX, MAX_POINTS, MAX_RATE, MIN_RATE};

/// Bytes per encoded point.
pub const POINT_SIZE: usize = 7;

/// Bytes in the trailing metadata block.
pub const TRAILER_SIZE: usize = 5;

/// Size of the largest possible encoded frame.
pub const MAX_FRAME_SIZE: usize = MAX_POINTS * POINT_SIZE + TRAILER_SIZE;

/// Check a point count and rate against the device limits.
pub fn validate(point_count: usize, pps: u32) -> Result<()> {
    if point_count == 0 || point_count > MAX_POINTS {
        return Err(Error::invalid_argument(format!(
            "point count {} out of range (1..={})",
            point_count, MAX_POINTS
        )));
    }
    if !(MIN_RATE..=MAX_RATE).contains(&pps) {
        return Err(Error::invalid_argument(format!(
            "rate {} pps out of range ({}..={})",
            pps, MIN_RATE, MAX_RATE
        )));
    }
    Ok(())
}

/// Number of bytes a frame of `point_count` points encodes to.
pub fn encoded_len(point_count: usize) -> usize {
    point_count * POINT_SIZE + TRAILER_SIZE
}

/// Encode a frame into a new buffer.
pub fn encode(points: &[Point], pps: u32, flags: FrameFlags) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    encode_into(points, pps, flags, &mut buffer)?;
    Ok(buffer)
}

/// Encode a frame into `buffer`, replacing its contents.
///
/// Validation happens first; on error the buffer is left untouched.
pub fn encode_into(
    points: &[Point],
    pps: u32,
    flags: FrameFlags,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    validate(points.len(), pps)?;
    write_validated(points, pps, flags, buffer);
    Ok(())
}

/// Encode without checking limits. Callers must have run [`validate`].
pub(crate) fn write_validated(
    points: &[Point],
    pps: u32,
    flags: FrameFlags,
    buffer: &mut Vec<u8>,
) {
    buffer.clear();
    buffer.reserve(encoded_len(points.len()));

    for p in points {
        let x = p.x & COORDINATE_MAX;
        let y = p.y & COORDINATE_MAX;
        buffer.extend_from_slice(&[
            (x >> 4) as u8,
            (((x & 0x0F) << 4) | (y >> 8)) as u8,
            (y & 0xFF) as u8,
            p.r,
            p.g,
            p.b,
            p.i,
        ]);
    }

    let mut trailer = [0u8; TRAILER_SIZE];
    LittleEndian::write_u16(&mut trailer[0..2], pps as u16);
    LittleEndian::write_u16(&mut trailer[2..4], points.len() as u16);
    trailer[4] = flags.bits();
    buffer.extend_from_slice(&trailer);
}

/// Decode a byte sequence produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < POINT_SIZE + TRAILER_SIZE {
        return Err(Error::malformed(format!(
            "{} bytes is too short",
            bytes.len()
        )));
    }
    let body_len = bytes.len() - TRAILER_SIZE;
    if body_len % POINT_SIZE != 0 {
        return Err(Error::malformed(format!(
            "point data length {} is not a multiple of {}",
            body_len, POINT_SIZE
        )));
    }

    let (body, trailer) = bytes.split_at(body_len);
    let pps = LittleEndian::read_u16(&trailer[0..2]) as u32;
    let count = LittleEndian::read_u16(&trailer[2..4]) as usize;
    let flags = FrameFlags::from_bits_retain(trailer[4]);

    if count != body_len / POINT_SIZE {
        return Err(Error::malformed(format!(
            "trailer declares {} points but {} are present",
            count,
            body_len / POINT_SIZE
        )));
    }
    validate(count, pps).map_err(|e| Error::malformed(e.to_string()))?;

    let points = body
        .chunks_exact(POINT_SIZE)
        .map(|c| Point {
            x: ((c[0] as u16) << 4) | ((c[1] as u16) >> 4),
            y: (((c[1] & 0x0F) as u16) << 8) | c[2] as u16,
            r: c[3],
            g: c[4],
            b: c[5],
            i: c[6],
        })
        .collect();

    Ok(Frame { pps, flags, points })
}
