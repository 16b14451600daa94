//! USB transport for Helios DACs.
//!
//! [`Transport`] is the seam between the protocol logic and the raw USB
//! transfers. [`UsbTransport`] implements it with libusb through `rusb`;
//! tests substitute an in-memory implementation.

use rusb::{DeviceHandle, UsbContext};
use std::time::Duration;

use crate::dac::DeviceSession;
use crate::error::{Error, Result};
use crate::protocol::{
    ALT_SETTING, EP_BULK_IN, EP_BULK_OUT, EP_INT_IN, EP_INT_OUT, HELIOS_PID, HELIOS_VID, INTERFACE,
};
use crate::types::SessionConfig;

/// Default timeout for USB transfers.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(32);

/// Raw transfer primitives needed to talk to a Helios DAC.
///
/// "Control" transfers go to the interrupt endpoints; "bulk" transfers carry
/// frame data.
pub trait Transport: Send + 'static {
    /// Write a control packet, returning the number of bytes transferred.
    fn write_control(&mut self, data: &[u8]) -> rusb::Result<usize>;

    /// Read up to `max_len` bytes from the control-in endpoint.
    fn read_control(&mut self, max_len: usize) -> rusb::Result<Vec<u8>>;

    /// Write frame data, returning the number of bytes transferred.
    fn write_bulk(&mut self, data: &[u8]) -> rusb::Result<usize>;

    /// Read up to `max_len` bytes from the bulk-in endpoint.
    fn read_bulk(&mut self, max_len: usize) -> rusb::Result<Vec<u8>>;

    /// Claim the DAC interface.
    fn claim(&mut self) -> rusb::Result<()>;

    /// Reset the device.
    fn reset(&mut self) -> rusb::Result<()>;

    /// Select the alternate setting that enables the bulk endpoints.
    fn set_alt_setting(&mut self) -> rusb::Result<()>;

    /// Detach the kernel driver if one is bound to the interface.
    fn detach_kernel_driver(&mut self) -> rusb::Result<()>;

    /// Apply a per-transfer timeout. Implementations without timeouts ignore it.
    fn set_timeout(&mut self, _timeout: Duration) {}
}

/// [`Transport`] over a libusb device handle.
pub struct UsbTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    timeout: Duration,
    claimed: bool,
}

impl<T: UsbContext> UsbTransport<T> {
    /// Open the given USB device. Interfaces are claimed later by the session.
    pub fn open(device: &rusb::Device<T>) -> Result<Self> {
        Ok(Self::from_handle(device.open()?))
    }

    pub fn from_handle(handle: DeviceHandle<T>) -> Self {
        UsbTransport {
            handle,
            timeout: DEFAULT_TIMEOUT,
            claimed: false,
        }
    }
}

impl<T: UsbContext + 'static> Transport for UsbTransport<T> {
    fn write_control(&mut self, data: &[u8]) -> rusb::Result<usize> {
        self.handle.write_interrupt(EP_INT_OUT, data, self.timeout)
    }

    fn read_control(&mut self, max_len: usize) -> rusb::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max_len];
        let read = self
            .handle
            .read_interrupt(EP_INT_IN, &mut buffer, self.timeout)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write_bulk(&mut self, data: &[u8]) -> rusb::Result<usize> {
        // Frames take several ms on the wire; allow one timeout per 512-byte packet
        let timeout = self.timeout + self.timeout * (data.len() / 512) as u32;
        self.handle.write_bulk(EP_BULK_OUT, data, timeout)
    }

    fn read_bulk(&mut self, max_len: usize) -> rusb::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max_len];
        let read = self.handle.read_bulk(EP_BULK_IN, &mut buffer, self.timeout)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn claim(&mut self) -> rusb::Result<()> {
        self.handle.claim_interface(INTERFACE)?;
        self.claimed = true;
        Ok(())
    }

    fn reset(&mut self) -> rusb::Result<()> {
        self.handle.reset()
    }

    fn set_alt_setting(&mut self) -> rusb::Result<()> {
        self.handle.set_alternate_setting(INTERFACE, ALT_SETTING)
    }

    fn detach_kernel_driver(&mut self) -> rusb::Result<()> {
        match self.handle.kernel_driver_active(INTERFACE) {
            Ok(true) => self.handle.detach_kernel_driver(INTERFACE),
            Ok(false) | Err(rusb::Error::NotSupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl<T: UsbContext> Drop for UsbTransport<T> {
    fn drop(&mut self) {
        if self.claimed {
            let _ = self.handle.release_interface(INTERFACE);
        }
    }
}

/// A controller for finding and opening Helios DACs.
pub struct HeliosController {
    context: rusb::Context,
}

impl HeliosController {
    /// Create a new controller.
    ///
    /// This initializes the USB context for device discovery.
    pub fn new() -> Result<Self> {
        Ok(HeliosController {
            context: rusb::Context::new()?,
        })
    }

    /// List all connected Helios devices.
    pub fn list_devices(&self) -> Result<Vec<rusb::Device<rusb::Context>>> {
        let devices = self.context.devices()?;
        let mut dacs = Vec::new();

        for device in devices.iter() {
            if is_helios_device(&device) {
                dacs.push(device);
            }
        }

        Ok(dacs)
    }

    /// Open the transport for the device at `index` in [`list_devices`](Self::list_devices).
    pub fn open_transport(&self, index: usize) -> Result<UsbTransport<rusb::Context>> {
        let devices = self.list_devices()?;
        let device = devices.get(index).ok_or(Error::InvalidDeviceNumber {
            index,
            found: devices.len(),
        })?;
        UsbTransport::open(device)
    }

    /// Open and initialize a session on the device at `index`.
    pub fn open_session(
        &self,
        index: usize,
        config: SessionConfig,
    ) -> Result<DeviceSession<UsbTransport<rusb::Context>>> {
        let transport = self.open_transport(index)?;
        let session = DeviceSession::new(transport, config);
        session.open()?;
        Ok(session)
    }
}

/// Check if a USB device is a Helios DAC.
pub fn is_helios_device<T: UsbContext>(device: &rusb::Device<T>) -> bool {
    device
        .device_descriptor()
        .map_or(false, |d| d.vendor_id() == HELIOS_VID && d.product_id() == HELIOS_PID)
}
