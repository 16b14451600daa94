//! Device session: lifecycle and control commands for one Helios DAC.

use log::{debug, trace, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::dac::SessionState;
use crate::error::{Error, Result};
use crate::frame::EncodedFrame;
use crate::protocol::{
    check_control_payload, decode_response, Command, DeviceName, DeviceStatus, FirmwareVersion,
    Response, StatusResponse, RESPONSE_LEN,
};
use crate::transport::Transport;
use crate::types::SessionConfig;

/// An exclusive connection to one Helios DAC.
///
/// The session is `Sync`: control commands may be issued from any thread
/// while a [`PlaybackWorker`](crate::PlaybackWorker) streams frames. Each
/// command holds the transport for its write/read pair, so answers never
/// interleave.
///
/// Any transport failure closes the session. A closed session never touches
/// the transport again and every call returns [`Error::DeviceClosed`].
pub struct DeviceSession<T: Transport> {
    transport: Mutex<T>,
    state: AtomicU8,
    config: SessionConfig,
}

impl<T: Transport> DeviceSession<T> {
    /// Wrap a transport. The device is not touched until [`open`](Self::open).
    pub fn new(transport: T, config: SessionConfig) -> Self {
        DeviceSession {
            transport: Mutex::new(transport),
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// SDK version announced to the firmware.
    pub fn sdk_version(&self) -> u8 {
        self.config.sdk_version
    }

    /// Claim the device and announce the SDK version.
    ///
    /// Opening an already open session does nothing. If any setup step
    /// fails the session is closed.
    pub fn open(&self) -> Result<()> {
        let mut transport = self.lock();
        match self.state() {
            SessionState::Open => return Ok(()),
            SessionState::Closed => return Err(Error::DeviceClosed),
            SessionState::Uninitialized => {}
        }

        match self.setup(&mut *transport) {
            Ok(()) => {
                self.state.store(SessionState::Open as u8, Ordering::Release);
                debug!("Helios: session open (SDK version {})", self.config.sdk_version);
                Ok(())
            }
            Err(e) => {
                self.state.store(SessionState::Closed as u8, Ordering::Release);
                warn!("Helios: failed to open session: {}", e);
                Err(e)
            }
        }
    }

    fn setup(&self, transport: &mut T) -> Result<()> {
        transport.set_timeout(self.config.transfer_timeout);
        if self.config.reset_on_open {
            transport.reset()?;
        }
        transport.detach_kernel_driver()?;
        transport.claim()?;
        transport.set_alt_setting()?;

        Self::drain_stale_responses(transport, self.config.drain_attempts);

        // The firmware does not answer this command
        Self::write_control(transport, &Command::SetSdkVersion(self.config.sdk_version).to_bytes())
    }

    /// Discard answers left in the interrupt buffer by a previous session.
    ///
    /// Errors are ignored; a timeout simply means the buffer is empty.
    fn drain_stale_responses(transport: &mut T, attempts: usize) {
        for _ in 0..attempts {
            match transport.read_control(RESPONSE_LEN) {
                Ok(stale) if !stale.is_empty() => {
                    trace!("Helios: discarded {} stale response bytes", stale.len());
                }
                _ => break,
            }
        }
    }

    /// Read the device name.
    pub fn name(&self) -> Result<String> {
        let DeviceName(name) = self.request(Command::GetName)?;
        Ok(name)
    }

    /// Read the firmware version.
    pub fn firmware_version(&self) -> Result<u32> {
        let FirmwareVersion(version) = self.request(Command::GetFirmwareVersion)?;
        Ok(version)
    }

    /// Ask whether the device can take a new frame.
    pub fn status(&self) -> Result<DeviceStatus> {
        let StatusResponse(status) = self.request(Command::GetStatus)?;
        trace!("Helios: status {:?}", status);
        Ok(status)
    }

    /// Open or close the shutter.
    pub fn set_shutter(&self, open: bool) -> Result<()> {
        self.send_command(Command::Shutter(open))
    }

    /// Store a new device name. Names longer than 30 bytes are truncated.
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.send_command(Command::SetName(name.to_owned()))
    }

    /// Stop output, then wait for the device to settle.
    ///
    /// The session stays open; the next frame starts output again.
    pub fn stop(&self) -> Result<()> {
        self.send_command(Command::Stop)?;
        thread::sleep(self.config.stop_settle_delay);
        Ok(())
    }

    /// Erase the firmware so the device boots into its bootloader.
    pub fn erase_firmware(&self) -> Result<()> {
        warn!("Helios: erasing firmware");
        self.send_command(Command::EraseFirmware)
    }

    /// Write a raw control packet (1 to 32 bytes).
    pub fn send_control(&self, payload: &[u8]) -> Result<()> {
        check_control_payload(payload)?;
        self.with_transport(|transport| Self::write_control(transport, payload))
    }

    /// Write an encoded frame to the bulk endpoint.
    pub fn write_frame(&self, frame: &EncodedFrame) -> Result<()> {
        let bytes = frame.as_bytes();
        self.with_transport(|transport| {
            let written = transport.write_bulk(bytes)?;
            if written != bytes.len() {
                return Err(Error::Transport(rusb::Error::Io));
            }
            trace!(
                "Helios: wrote frame ({} points at {} pps)",
                frame.point_count(),
                frame.pps()
            );
            Ok(())
        })
    }

    /// Stop output (best effort) and close the session for good.
    pub fn close(&self) {
        let mut transport = self.lock();
        if self.state() == SessionState::Open {
            if let Err(e) = Self::write_control(&mut *transport, &Command::Stop.to_bytes()) {
                debug!("Helios: stop on close failed: {}", e);
            }
        }
        self.mark_closed();
    }

    fn mark_closed(&self) {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous != SessionState::Closed as u8 {
            debug!("Helios: session closed");
        }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        let packet = command.to_bytes();
        check_control_payload(&packet)?;
        self.with_transport(|transport| Self::write_control(transport, &packet))
    }

    fn request<P: Response>(&self, command: Command) -> Result<P> {
        let packet = command.to_bytes();
        self.with_transport(|transport| {
            Self::write_control(transport, &packet)?;
            let response = transport.read_control(RESPONSE_LEN)?;
            decode_response(&response)
        })
    }

    fn write_control(transport: &mut T, packet: &[u8]) -> Result<()> {
        let written = transport.write_control(packet)?;
        if written != packet.len() {
            return Err(Error::SendControlFailed {
                written,
                expected: packet.len(),
            });
        }
        Ok(())
    }

    /// Run `f` with exclusive access to an open transport.
    ///
    /// Transport errors close the session.
    fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut transport = self.lock();
        match self.state() {
            SessionState::Open => {}
            SessionState::Uninitialized => return Err(Error::NotInitialized),
            SessionState::Closed => return Err(Error::DeviceClosed),
        }

        let result = f(&mut *transport);
        if let Err(Error::Transport(e)) = &result {
            warn!("Helios: USB error, closing session: {}", e);
            self.mark_closed();
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode, WriteFrameFlags};
    use crate::protocol::{CMD_GET_NAME, CMD_SET_SDK_VERSION, CMD_STOP, SDK_VERSION};
    use crate::testutils::MockTransport;
    use crate::types::Point;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::default().with_stop_settle_delay(Duration::ZERO)
    }

    fn open_session() -> (DeviceSession<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        let session = DeviceSession::new(mock.clone(), config());
        session.open().unwrap();
        (session, mock)
    }

    #[test]
    fn test_commands_before_open_fail() {
        let mock = MockTransport::new();
        let session = DeviceSession::new(mock.clone(), config());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(matches!(session.name(), Err(Error::NotInitialized)));
        assert!(matches!(session.status(), Err(Error::NotInitialized)));
        assert!(mock.control_writes().is_empty());
    }

    #[test]
    fn test_open_sequence() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.stale_responses = 3);
        let session = DeviceSession::new(mock.clone(), config());
        session.open().unwrap();

        assert!(session.is_open());
        mock.with_state(|s| {
            assert!(s.kernel_driver_detached);
            assert!(s.claimed);
            assert!(s.alt_setting_selected);
            assert!(!s.reset);
            assert_eq!(s.stale_responses, 0);
        });
        assert_eq!(
            mock.control_writes(),
            vec![vec![CMD_SET_SDK_VERSION, SDK_VERSION]]
        );
    }

    #[test]
    fn test_open_twice_is_noop() {
        let (session, mock) = open_session();
        session.open().unwrap();
        assert_eq!(mock.control_writes().len(), 1);
    }

    #[test]
    fn test_open_failure_closes_session() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.fail_claim = Some(rusb::Error::Busy));
        let session = DeviceSession::new(mock, config());
        assert!(matches!(session.open(), Err(Error::Transport(rusb::Error::Busy))));
        assert!(session.is_closed());
        assert!(matches!(session.open(), Err(Error::DeviceClosed)));
    }

    #[test]
    fn test_name_and_firmware_version() {
        let (session, mock) = open_session();
        mock.with_state(|s| {
            s.name = "Helios Test".into();
            s.firmware_version = 7;
        });
        assert_eq!(session.name().unwrap(), "Helios Test");
        assert_eq!(session.firmware_version().unwrap(), 7);
        assert_eq!(mock.control_writes()[1], vec![CMD_GET_NAME, 0]);
    }

    #[test]
    fn test_status_reflects_ready_byte() {
        let (session, mock) = open_session();
        mock.with_state(|s| s.ready = false);
        assert_eq!(session.status().unwrap(), DeviceStatus::NotReady);
        mock.with_state(|s| s.ready = true);
        assert_eq!(session.status().unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_mismatched_tag_is_unexpected_result() {
        let (session, mock) = open_session();
        mock.with_state(|s| s.scripted_responses.push_back(vec![0x85, 0, 0, 0, 0]));
        assert!(matches!(
            session.firmware_version(),
            Err(Error::UnexpectedResult(_))
        ));
        // Not fatal
        assert!(session.is_open());
    }

    #[test]
    fn test_missing_response_is_unexpected_result() {
        let (session, mock) = open_session();
        mock.with_state(|s| s.scripted_responses.push_back(Vec::new()));
        assert!(matches!(session.status(), Err(Error::UnexpectedResult(_))));
    }

    #[test]
    fn test_send_control_validation() {
        let (session, mock) = open_session();
        assert!(matches!(session.send_control(&[]), Err(Error::NullBuffer)));
        assert!(matches!(
            session.send_control(&[0u8; 40]),
            Err(Error::SignalTooLong(40))
        ));
        assert_eq!(mock.control_writes().len(), 1);
        session.send_control(&[CMD_STOP, 0]).unwrap();
        assert_eq!(mock.control_writes().len(), 2);
    }

    #[test]
    fn test_short_control_write() {
        let (session, mock) = open_session();
        mock.with_state(|s| s.short_control_writes = true);
        assert!(matches!(
            session.set_shutter(true),
            Err(Error::SendControlFailed {
                written: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn test_stop_keeps_session_open() {
        let (session, mock) = open_session();
        session.stop().unwrap();
        assert!(session.is_open());
        assert_eq!(mock.control_writes().last().unwrap(), &vec![CMD_STOP, 0]);
    }

    #[test]
    fn test_transport_error_closes_session() {
        let (session, mock) = open_session();
        mock.with_state(|s| s.fail_control = Some(rusb::Error::NoDevice));
        assert!(matches!(
            session.set_shutter(true),
            Err(Error::Transport(rusb::Error::NoDevice))
        ));
        assert!(session.is_closed());

        mock.with_state(|s| s.fail_control = None);
        let writes_before = mock.control_writes().len();
        assert!(matches!(session.name(), Err(Error::DeviceClosed)));
        assert_eq!(mock.control_writes().len(), writes_before);
    }

    #[test]
    fn test_close_sends_stop_once() {
        let (session, mock) = open_session();
        session.close();
        session.close();
        assert!(session.is_closed());
        let stops = mock
            .control_writes()
            .iter()
            .filter(|w| w[0] == CMD_STOP)
            .count();
        assert_eq!(stops, 1);

        let frame = encode(&[Point::new(0, 0)], 1000, WriteFrameFlags::empty()).unwrap();
        assert!(matches!(session.write_frame(&frame), Err(Error::DeviceClosed)));
        assert!(mock.bulk_writes().is_empty());
    }

    #[test]
    fn test_write_frame_goes_to_bulk() {
        let (session, mock) = open_session();
        let frame = encode(&[Point::new(1, 2)], 1000, WriteFrameFlags::empty()).unwrap();
        session.write_frame(&frame).unwrap();
        assert_eq!(mock.bulk_writes(), vec![frame.as_bytes().to_vec()]);
    }
}
