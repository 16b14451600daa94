//! Error types for the helios-dac crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a Helios DAC or decoding ILDA data.
#[derive(Error, Debug)]
pub enum Error {
    /// A command was issued before the session was opened.
    #[error("device session is not initialized")]
    NotInitialized,

    /// A device index did not match any enumerated DAC.
    #[error("invalid device number {index} (found {found} devices)")]
    InvalidDeviceNumber { index: usize, found: usize },

    /// A frame was submitted without any points.
    #[error("frame contains no points")]
    NullPoints,

    /// A frame was submitted with more than 4096 points.
    #[error("frame has {0} points, maximum is 4096")]
    TooManyPoints(usize),

    /// The requested point rate is above the device maximum.
    #[error("point rate {0} pps is above the maximum of 65535")]
    PpsTooHigh(u32),

    /// The requested point rate is below the device minimum.
    #[error("point rate {0} pps is below the minimum of 7")]
    PpsTooLow(u32),

    /// The session has been closed; no further I/O is possible.
    #[error("device is closed")]
    DeviceClosed,

    /// A non-blocking frame was submitted while the queue had no free slot.
    #[error("previous frame has not been sent yet")]
    FrameNotReady,

    /// The transport accepted fewer control bytes than were sent.
    #[error("control transfer wrote {written} of {expected} bytes")]
    SendControlFailed { written: usize, expected: usize },

    /// The device answered with an unexpected tag or payload.
    #[error("unexpected device response: {0}")]
    UnexpectedResult(String),

    /// A control transfer was attempted with an empty buffer.
    #[error("control buffer is empty")]
    NullBuffer,

    /// A control transfer was attempted with more than 32 bytes.
    #[error("control signal of {0} bytes exceeds 32 bytes")]
    SignalTooLong(usize),

    /// The device did not report ready within the configured timeout.
    #[error("device not ready after {0:?}")]
    StatusTimeout(Duration),

    /// USB transport failure.
    #[error("USB error: {0}")]
    Transport(#[from] rusb::Error),

    /// The ILDA data is not well formed.
    #[error("malformed ILDA file: {0}")]
    MalformedFile(String),

    /// I/O failure while reading a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed-file error with a message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFile(msg.into())
    }

    /// Create an unexpected-result error with a message.
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Error::UnexpectedResult(msg.into())
    }

    /// Returns true if this is a DeviceClosed error.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::DeviceClosed)
    }

    /// Returns true if the error came from the USB transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Result type for helios-dac operations.
pub type Result<T> = std::result::Result<T, Error>;
