//! High-level abstractions around a Helios USB DAC.

pub mod session;

pub use self::session::DeviceSession;

use std::fmt;

/// Lifecycle of a [`DeviceSession`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Transport exists but the device has not been claimed yet.
    #[default]
    Uninitialized = 0,
    /// Device claimed and SDK version announced.
    Open = 1,
    /// Terminal; every operation fails with `DeviceClosed`.
    Closed = 2,
}

impl SessionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Uninitialized,
            1 => SessionState::Open,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
