//! Low-level USB protocol types and constants for Helios DAC communication.
//!
//! Control commands are short packets written to the interrupt-out endpoint.
//! Commands that expect an answer are followed by one 32-byte interrupt-in
//! read whose first byte is a tag (`0x80 | command code`).

use byteorder::{ReadBytesExt, LE};
use std::io::{self, Cursor, Read};

use crate::error::{Error, Result};

/// USB Vendor ID for Helios devices.
pub const HELIOS_VID: u16 = 0x1209;

/// USB Product ID for Helios devices.
pub const HELIOS_PID: u16 = 0xE500;

/// Frame data endpoint (bulk out).
pub const EP_BULK_OUT: u8 = 0x02;

/// Bulk in endpoint.
pub const EP_BULK_IN: u8 = 0x81;

/// Control endpoint (interrupt out).
pub const EP_INT_OUT: u8 = 0x06;

/// Control response endpoint (interrupt in).
pub const EP_INT_IN: u8 = 0x83;

/// Interface carrying all endpoints.
pub const INTERFACE: u8 = 0;

/// Alternate setting that enables the bulk endpoints.
pub const ALT_SETTING: u8 = 1;

/// Maximum number of points in one frame.
pub const MAX_POINTS: usize = 0x1000;

/// Maximum point rate in points per second.
pub const MAX_RATE: u32 = 0xFFFF;

/// Minimum point rate in points per second.
pub const MIN_RATE: u32 = 7;

/// SDK version announced to the firmware.
pub const SDK_VERSION: u8 = 6;

/// Maximum length of a control packet.
pub const MAX_CONTROL_LEN: usize = 32;

/// Size of every control response transfer.
pub const RESPONSE_LEN: usize = 32;

/// Longest name accepted by `SET_NAME`; the last packet byte stays NUL.
pub const MAX_NAME_LEN: usize = 30;

// Command codes
pub const CMD_STOP: u8 = 0x01;
pub const CMD_SHUTTER: u8 = 0x02;
pub const CMD_GET_STATUS: u8 = 0x03;
pub const CMD_GET_FWVERSION: u8 = 0x04;
pub const CMD_GET_NAME: u8 = 0x05;
pub const CMD_SET_NAME: u8 = 0x06;
pub const CMD_SET_SDK_VERSION: u8 = 0x07;
pub const CMD_ERASE_FIRMWARE: u8 = 0xDE;

/// Bit set in a response tag on top of the command code.
const RESPONSE_TAG_BIT: u8 = 0x80;

/// Device status returned by the Helios DAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceStatus {
    /// Device is ready to receive frame
    Ready = 1,
    /// Device is not ready to receive frame
    NotReady = 0,
}

impl DeviceStatus {
    pub fn is_ready(self) -> bool {
        self == DeviceStatus::Ready
    }
}

/// Control commands understood by the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stop,
    Shutter(bool),
    GetStatus,
    GetFirmwareVersion,
    GetName,
    SetName(String),
    SetSdkVersion(u8),
    EraseFirmware,
}

impl Command {
    /// The command code (low byte of the header).
    pub fn code(&self) -> u8 {
        match self {
            Command::Stop => CMD_STOP,
            Command::Shutter(_) => CMD_SHUTTER,
            Command::GetStatus => CMD_GET_STATUS,
            Command::GetFirmwareVersion => CMD_GET_FWVERSION,
            Command::GetName => CMD_GET_NAME,
            Command::SetName(_) => CMD_SET_NAME,
            Command::SetSdkVersion(_) => CMD_SET_SDK_VERSION,
            Command::EraseFirmware => CMD_ERASE_FIRMWARE,
        }
    }

    /// The parameter byte (high byte of the header).
    fn param(&self) -> u8 {
        match self {
            Command::Shutter(open) => *open as u8,
            Command::SetSdkVersion(version) => *version,
            _ => 0,
        }
    }

    /// Serialize the command into the packet written to the control endpoint.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Command::SetName(name) => {
                let bytes = name.as_bytes();
                let len = bytes.len().min(MAX_NAME_LEN);
                let mut packet = Vec::with_capacity(MAX_CONTROL_LEN);
                packet.push(self.code());
                packet.extend_from_slice(&bytes[..len]);
                packet.resize(MAX_CONTROL_LEN, 0);
                packet
            }
            _ => {
                let header = u16::from(self.code()) | (u16::from(self.param()) << 8);
                header.to_le_bytes().to_vec()
            }
        }
    }

    /// The tag the device prefixes to its answer for this command.
    pub fn response_tag(&self) -> u8 {
        RESPONSE_TAG_BIT | self.code()
    }
}

/// Validate a raw control payload before it touches the transport.
pub fn check_control_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::NullBuffer);
    }
    if payload.len() > MAX_CONTROL_LEN {
        return Err(Error::SignalTooLong(payload.len()));
    }
    Ok(())
}

/// A tagged answer read back from the control-in endpoint.
pub trait Response: Sized {
    /// Tag byte that must precede the payload.
    const TAG: u8;

    fn read_payload<R: Read>(reader: R) -> io::Result<Self>;
}

/// Decode a response buffer, checking the tag first.
pub fn decode_response<P: Response>(bytes: &[u8]) -> Result<P> {
    let (&tag, payload) = bytes
        .split_first()
        .ok_or_else(|| Error::unexpected("empty response"))?;
    if tag != P::TAG {
        return Err(Error::unexpected(format!(
            "expected tag {:#04x}, got {:#04x}",
            P::TAG,
            tag
        )));
    }
    P::read_payload(Cursor::new(payload))
        .map_err(|e| Error::unexpected(format!("short response payload: {}", e)))
}

/// Answer to `GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse(pub DeviceStatus);

/// Answer to `GET_FWVERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion(pub u32);

/// Answer to `GET_NAME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceName(pub String);

impl Response for StatusResponse {
    const TAG: u8 = RESPONSE_TAG_BIT | CMD_GET_STATUS;

    fn read_payload<R: Read>(mut reader: R) -> io::Result<Self> {
        let status = match reader.read_u8()? {
            0 => DeviceStatus::NotReady,
            _ => DeviceStatus::Ready,
        };
        Ok(StatusResponse(status))
    }
}

impl Response for FirmwareVersion {
    const TAG: u8 = RESPONSE_TAG_BIT | CMD_GET_FWVERSION;

    fn read_payload<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(FirmwareVersion(reader.read_u32::<LE>()?))
    }
}

impl Response for DeviceName {
    const TAG: u8 = RESPONSE_TAG_BIT | CMD_GET_NAME;

    fn read_payload<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut raw = Vec::with_capacity(RESPONSE_LEN - 1);
        reader.read_to_end(&mut raw)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(DeviceName(String::from_utf8_lossy(&raw[..end]).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_headers_are_little_endian() {
        assert_eq!(Command::Stop.to_bytes(), vec![0x01, 0x00]);
        assert_eq!(Command::GetStatus.to_bytes(), vec![0x03, 0x00]);
        assert_eq!(Command::GetFirmwareVersion.to_bytes(), vec![0x04, 0x00]);
        assert_eq!(Command::EraseFirmware.to_bytes(), vec![0xDE, 0x00]);
    }

    #[test]
    fn test_command_params_go_in_high_byte() {
        assert_eq!(Command::Shutter(true).to_bytes(), vec![0x02, 0x01]);
        assert_eq!(Command::Shutter(false).to_bytes(), vec![0x02, 0x00]);
        assert_eq!(
            Command::SetSdkVersion(SDK_VERSION).to_bytes(),
            vec![CMD_SET_SDK_VERSION, SDK_VERSION]
        );
    }

    #[test]
    fn test_set_name_packet_is_padded() {
        let packet = Command::SetName("Laser".into()).to_bytes();
        assert_eq!(packet.len(), MAX_CONTROL_LEN);
        assert_eq!(packet[0], CMD_SET_NAME);
        assert_eq!(&packet[1..6], b"Laser");
        assert!(packet[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_name_truncates_long_names() {
        let long = "x".repeat(40);
        let packet = Command::SetName(long).to_bytes();
        assert_eq!(packet.len(), MAX_CONTROL_LEN);
        assert_eq!(packet[MAX_CONTROL_LEN - 1], 0);
        assert!(check_control_payload(&packet).is_ok());
    }

    #[test]
    fn test_response_tags() {
        assert_eq!(Command::GetStatus.response_tag(), 0x83);
        assert_eq!(Command::GetFirmwareVersion.response_tag(), 0x84);
        assert_eq!(Command::GetName.response_tag(), 0x85);
    }

    #[test]
    fn test_check_control_payload() {
        assert!(matches!(check_control_payload(&[]), Err(Error::NullBuffer)));
        assert!(matches!(
            check_control_payload(&[0u8; 33]),
            Err(Error::SignalTooLong(33))
        ));
        assert!(check_control_payload(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_decode_status() {
        let mut buf = [0u8; RESPONSE_LEN];
        buf[0] = 0x83;
        buf[1] = 1;
        let StatusResponse(status) = decode_response(&buf).unwrap();
        assert_eq!(status, DeviceStatus::Ready);

        buf[1] = 0;
        let StatusResponse(status) = decode_response(&buf).unwrap();
        assert_eq!(status, DeviceStatus::NotReady);
    }

    #[test]
    fn test_decode_firmware_version() {
        let buf = [0x84, 0x2A, 0x00, 0x00, 0x00];
        let FirmwareVersion(version) = decode_response(&buf).unwrap();
        assert_eq!(version, 42);
    }

    #[test]
    fn test_decode_name_stops_at_nul() {
        let mut buf = vec![0x85];
        buf.extend_from_slice(b"Helios 1\0garbage");
        let DeviceName(name) = decode_response(&buf).unwrap();
        assert_eq!(name, "Helios 1");
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let buf = [0x85, 1, 0, 0, 0];
        let result = decode_response::<FirmwareVersion>(&buf);
        assert!(matches!(result, Err(Error::UnexpectedResult(_))));
    }

    #[test]
    fn test_decode_rejects_empty_and_short() {
        assert!(matches!(
            decode_response::<StatusResponse>(&[]),
            Err(Error::UnexpectedResult(_))
        ));
        assert!(matches!(
            decode_response::<FirmwareVersion>(&[0x84, 1, 2]),
            Err(Error::UnexpectedResult(_))
        ));
    }
}
