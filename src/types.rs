//! Point, color and configuration types shared by the encoder, the session
//! and the ILDA decoder.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::SDK_VERSION;

/// RGB color for a laser point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Color {
    /// Red channel (0-255)
    pub r: u8,
    /// Green channel (0-255)
    pub g: u8,
    /// Blue channel (0-255)
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const RED: Color = Color::new(255, 0, 0);
    pub const WHITE: Color = Color::new(255, 255, 255);

    /// Create a new color.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }

    /// Unpack a `0xRRGGBB` value. Bits above 24 are ignored.
    pub const fn from_rgb24(rgb: u32) -> Self {
        Color {
            r: ((rgb >> 16) & 0xFF) as u8,
            g: ((rgb >> 8) & 0xFF) as u8,
            b: (rgb & 0xFF) as u8,
        }
    }

    /// Pack into a `0xRRGGBB` value.
    pub const fn to_rgb24(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }
}

impl From<u32> for Color {
    fn from(rgb: u32) -> Self {
        Color::from_rgb24(rgb)
    }
}

/// A single laser point in device coordinates.
///
/// Only the low 12 bits of `x` and `y` reach the DAC; negative values wrap as
/// 12-bit two's complement. When `blanked` is set the laser is off for this
/// point whatever `color` and `intensity` hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Point {
    pub x: i16,
    pub y: i16,
    pub color: Color,
    /// Intensity (0-255)
    pub intensity: u8,
    pub blanked: bool,
}

impl Point {
    /// A full-intensity red point.
    pub const fn new(x: i16, y: i16) -> Self {
        Point {
            x,
            y,
            color: Color::RED,
            intensity: 255,
            blanked: false,
        }
    }

    /// A blanked (laser off) point used for travel moves.
    pub const fn blank(x: i16, y: i16) -> Self {
        Point {
            x,
            y,
            color: Color::BLACK,
            intensity: 0,
            blanked: true,
        }
    }

    pub fn with_color(mut self, color: impl Into<Color>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_intensity(mut self, intensity: u8) -> Self {
        self.intensity = intensity;
        self
    }

    /// Mark the point as blanked, keeping its stored color.
    pub fn blanked(mut self, blanked: bool) -> Self {
        self.blanked = blanked;
        self
    }
}

impl From<(i16, i16)> for Point {
    fn from((x, y): (i16, i16)) -> Self {
        Point::new(x, y)
    }
}

/// Configuration for a device session and its playback worker.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// SDK version announced to the firmware when the session opens.
    pub sdk_version: u8,
    /// Timeout applied to every USB transfer.
    pub transfer_timeout: Duration,
    /// How long `stop()` waits before the device accepts new frames.
    pub stop_settle_delay: Duration,
    /// Pause between status polls while waiting for the device to finish a
    /// frame. Zero means a pure busy-wait.
    pub status_poll_interval: Duration,
    /// Give up on an unresponsive device after this long. `None` waits forever.
    pub status_timeout: Option<Duration>,
    /// Reset the USB device before claiming it.
    pub reset_on_open: bool,
    /// Maximum number of stale interrupt reads discarded during open.
    pub drain_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sdk_version: SDK_VERSION,
            transfer_timeout: Duration::from_millis(32),
            stop_settle_delay: Duration::from_millis(100),
            status_poll_interval: Duration::from_micros(100),
            status_timeout: None,
            reset_on_open: false,
            drain_attempts: 8,
        }
    }
}

impl SessionConfig {
    /// Set the announced SDK version (builder pattern).
    pub fn with_sdk_version(mut self, version: u8) -> Self {
        self.sdk_version = version;
        self
    }

    /// Set the USB transfer timeout (builder pattern).
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Set the settle delay after `stop()` (builder pattern).
    pub fn with_stop_settle_delay(mut self, delay: Duration) -> Self {
        self.stop_settle_delay = delay;
        self
    }

    /// Set the status poll interval (builder pattern).
    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// Bound how long the playback worker waits for the device (builder pattern).
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = Some(timeout);
        self
    }

    /// Reset the device before claiming it (builder pattern).
    pub fn with_reset_on_open(mut self, reset: bool) -> Self {
        self.reset_on_open = reset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_rgb24_roundtrip() {
        let color = Color::from_rgb24(0x12_34_56);
        assert_eq!(color, Color::new(0x12, 0x34, 0x56));
        assert_eq!(color.to_rgb24(), 0x12_34_56);
    }

    #[test]
    fn test_color_ignores_high_bits() {
        assert_eq!(Color::from_rgb24(0xFF_00_00_FF), Color::new(0, 0, 0xFF));
    }

    #[test]
    fn test_point_defaults_match_driver() {
        let p = Point::new(-5, 5);
        assert_eq!(p.color, Color::RED);
        assert_eq!(p.intensity, 255);
        assert!(!p.blanked);
    }

    #[test]
    fn test_point_builders() {
        let p = Point::new(1, 2)
            .with_color(0x00_FF_00)
            .with_intensity(10)
            .blanked(true);
        assert_eq!(p.color, Color::new(0, 255, 0));
        assert_eq!(p.intensity, 10);
        assert!(p.blanked);

        let b = Point::blank(3, 4);
        assert!(b.blanked);
        assert_eq!((b.x, b.y), (3, 4));
    }

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::default()
            .with_sdk_version(5)
            .with_status_timeout(Duration::from_secs(1))
            .with_reset_on_open(true);
        assert_eq!(config.sdk_version, 5);
        assert_eq!(config.status_timeout, Some(Duration::from_secs(1)));
        assert!(config.reset_on_open);
        assert_eq!(config.stop_settle_delay, Duration::from_millis(100));
    }
}
