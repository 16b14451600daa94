//! Driver for the Helios USB laser DAC.
//!
//! This crate talks to Helios DACs over USB, encodes point lists into the
//! device's native frame format, streams frames from a background playback
//! thread and decodes ILDA animation files into the same point type.
//!
//! # Overview
//!
//! - [`HeliosController`] finds connected DACs and opens a [`DeviceSession`].
//! - [`DeviceSession`] owns the USB link and issues control commands
//!   (status, name, shutter, stop).
//! - [`PlaybackWorker`] queues encoded frames and plays them back one at a
//!   time, waiting for the DAC to finish each frame.
//! - [`ilda`] decodes `.ild` files into [`Point`]s.
//!
//! # Coordinate System
//!
//! Points carry signed device coordinates. Only the low 12 bits reach the
//! DAC, so `0..=4095` covers the full scan range; negative values wrap as
//! 12-bit two's complement. Colors are 8-bit RGB plus an 8-bit intensity.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use helios_dac::{HeliosController, PlaybackWorker, Point, SessionConfig, WriteFrameFlags};
//!
//! let controller = HeliosController::new()?;
//! let session = Arc::new(controller.open_session(0, SessionConfig::default())?);
//! let worker = PlaybackWorker::spawn(session);
//!
//! let square = [
//!     Point::new(1000, 1000),
//!     Point::new(3000, 1000),
//!     Point::new(3000, 3000),
//!     Point::new(1000, 3000),
//! ];
//! worker.submit_frame(&square, 30_000, WriteFrameFlags::START_IMMEDIATELY)?;
//! worker.close();
//! # Ok::<(), helios_dac::Error>(())
//! ```

pub mod dac;
mod error;
pub mod frame;
pub mod ilda;
pub mod protocol;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod transport;
pub mod types;
pub mod worker;

// Error types
pub use error::{Error, Result};

// Session and transport
pub use dac::{DeviceSession, SessionState};
pub use transport::{HeliosController, Transport, UsbTransport};

// Frames and playback
pub use frame::{encode, EncodedFrame, Frame, WriteFrameFlags};
pub use protocol::DeviceStatus;
pub use worker::PlaybackWorker;

// Types
pub use types::{Color, Point, SessionConfig};
