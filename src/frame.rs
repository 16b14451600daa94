//! Helios frame type and its wire encoding.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::protocol::{MAX_POINTS, MAX_RATE, MIN_RATE};
use crate::types::Point;

/// Bytes per encoded point: `x_hi, x_lo|y_hi, y_lo, r, g, b, i`.
pub const POINT_SIZE_BYTES: usize = 7;

/// Bytes in the trailer: `pps_lo, pps_hi, count_lo, count_hi, flags`.
pub const TRAILER_SIZE_BYTES: usize = 5;

bitflags! {
    /// Flags for WriteFrame operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct WriteFrameFlags: u8 {
        /// Bit 0 (LSB) = if 1, start output immediately, instead of waiting for current frame (if there is one) to finish playing
        const START_IMMEDIATELY = 0b0000_0001;
        /// Bit 1 = if 1, play frame only once, instead of repeating until another frame is written
        const SINGLE_MODE = 0b0000_0010;
        /// Bit 2 = if 1, don't let WriteFrame() block execution while waiting for the transfer to finish
        const DONT_BLOCK = 0b0000_0100;
    }
}

/// A frame to be sent to the Helios DAC.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Rate of output in points per second
    pub pps: u32,
    /// Frame flags (default is empty)
    pub flags: WriteFrameFlags,
    /// Points in this frame
    pub points: Vec<Point>,
}

impl Frame {
    /// Create a new frame with the given point rate and points.
    pub fn new(pps: u32, points: Vec<Point>) -> Self {
        Frame {
            pps,
            points,
            flags: WriteFrameFlags::empty(),
        }
    }

    /// Create a new frame with specific flags.
    pub fn new_with_flags(pps: u32, points: Vec<Point>, flags: WriteFrameFlags) -> Self {
        Frame { pps, points, flags }
    }

    /// Encode this frame into the buffer written to the bulk endpoint.
    pub fn encode(&self) -> Result<EncodedFrame> {
        encode(&self.points, self.pps, self.flags)
    }
}

/// A frame serialized into the exact bytes the DAC expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    bytes: Vec<u8>,
    point_count: u16,
    pps: u16,
    flags: WriteFrameFlags,
}

impl EncodedFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of points actually sent, after the transfer-size workaround.
    pub fn point_count(&self) -> u16 {
        self.point_count
    }

    /// Point rate actually sent, after the transfer-size workaround.
    pub fn pps(&self) -> u16 {
        self.pps
    }

    pub fn flags(&self) -> WriteFrameFlags {
        self.flags
    }
}

/// Returns true for point counts the firmware fails to receive.
///
/// Transfers of `45 + 64k` points are mishandled by the MCU.
pub fn needs_point_drop(count: usize) -> bool {
    count >= 45 && (count - 45) % 64 == 0
}

/// Scale `pps` so `kept` points take as long as `count` points would,
/// rounding half up.
fn rescale_pps(pps: u32, kept: usize, count: usize) -> u32 {
    let pps = pps as u64;
    let kept = kept as u64;
    let count = count as u64;
    // floor(pps * kept / count + 0.5) without floating point
    ((2 * pps * kept + count) / (2 * count)) as u32
}

/// Validate and encode a list of points for the DAC.
pub fn encode(points: &[Point], pps: u32, flags: WriteFrameFlags) -> Result<EncodedFrame> {
    if points.is_empty() {
        return Err(Error::NullPoints);
    }
    if points.len() > MAX_POINTS {
        return Err(Error::TooManyPoints(points.len()));
    }
    if pps > MAX_RATE {
        return Err(Error::PpsTooHigh(pps));
    }
    if pps < MIN_RATE {
        return Err(Error::PpsTooLow(pps));
    }

    let (points, pps_actual) = if needs_point_drop(points.len()) {
        let kept = points.len() - 1;
        (&points[..kept], rescale_pps(pps, kept, points.len()))
    } else {
        (points, pps)
    };

    let mut bytes = Vec::with_capacity(points.len() * POINT_SIZE_BYTES + TRAILER_SIZE_BYTES);
    for point in points {
        bytes.extend_from_slice(&encode_point(point));
    }

    // Both fit in u16: pps <= MAX_RATE and count <= MAX_POINTS.
    let pps_actual = pps_actual as u16;
    let count = points.len() as u16;
    bytes.extend_from_slice(&pps_actual.to_le_bytes());
    bytes.extend_from_slice(&count.to_le_bytes());
    bytes.push(flags.bits());

    Ok(EncodedFrame {
        bytes,
        point_count: count,
        pps: pps_actual,
        flags,
    })
}

/// Pack one point into its 7-byte wire form.
pub fn encode_point(point: &Point) -> [u8; POINT_SIZE_BYTES] {
    let x = (point.x as u16) & 0x0FFF;
    let y = (point.y as u16) & 0x0FFF;

    let (r, g, b, i) = if point.blanked {
        (0, 0, 0, 0)
    } else {
        (point.color.r, point.color.g, point.color.b, point.intensity)
    };

    [
        (x >> 4) as u8,
        (((x & 0x0F) << 4) | (y >> 8)) as u8,
        (y & 0xFF) as u8,
        r,
        g,
        b,
        i,
    ]
}
