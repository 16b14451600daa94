//! In-memory [`Transport`] that behaves like a Helios DAC, for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::{CMD_GET_FWVERSION, CMD_GET_NAME, CMD_GET_STATUS, RESPONSE_LEN};
use crate::transport::Transport;

/// Observable state of a [`MockTransport`].
#[derive(Debug)]
pub struct MockState {
    /// Every control packet written, in order.
    pub control_writes: Vec<Vec<u8>>,
    /// Every bulk transfer written, in order.
    pub bulk_writes: Vec<Vec<u8>>,
    /// Answers returned before any generated response.
    pub scripted_responses: VecDeque<Vec<u8>>,
    /// Leftover answers waiting in the interrupt buffer at open.
    pub stale_responses: usize,
    /// Value of the status byte.
    pub ready: bool,
    pub name: String,
    pub firmware_version: u32,
    pub status_polls: usize,
    pub fail_control: Option<rusb::Error>,
    pub fail_bulk: Option<rusb::Error>,
    pub fail_claim: Option<rusb::Error>,
    pub short_control_writes: bool,
    pub kernel_driver_detached: bool,
    pub claimed: bool,
    pub alt_setting_selected: bool,
    pub reset: bool,
    pending_command: Option<u8>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            control_writes: Vec::new(),
            bulk_writes: Vec::new(),
            scripted_responses: VecDeque::new(),
            stale_responses: 0,
            ready: true,
            name: "Helios Mock".to_string(),
            firmware_version: 1,
            status_polls: 0,
            fail_control: None,
            fail_bulk: None,
            fail_claim: None,
            short_control_writes: false,
            kernel_driver_detached: false,
            claimed: false,
            alt_setting_selected: false,
            reset: false,
            pending_command: None,
        }
    }
}

/// Cloneable handle to a shared [`MockState`]; clones see the same device.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect or modify the device state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.control_writes.clone())
    }

    pub fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.bulk_writes.clone())
    }

    pub fn status_polls(&self) -> usize {
        self.with_state(|s| s.status_polls)
    }

    /// Poll `condition` until it holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, condition: impl Fn(&MockState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.with_state(|s| condition(s)) {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.with_state(|s| condition(s))
    }
}

fn response(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; RESPONSE_LEN];
    bytes[0] = tag;
    let len = payload.len().min(RESPONSE_LEN - 1);
    bytes[1..1 + len].copy_from_slice(&payload[..len]);
    bytes
}

impl Transport for MockTransport {
    fn write_control(&mut self, data: &[u8]) -> rusb::Result<usize> {
        self.with_state(|s| {
            if let Some(e) = s.fail_control {
                return Err(e);
            }
            s.control_writes.push(data.to_vec());
            s.pending_command = data.first().copied();
            if s.pending_command == Some(CMD_GET_STATUS) {
                s.status_polls += 1;
            }
            if s.short_control_writes {
                Ok(data.len().saturating_sub(1))
            } else {
                Ok(data.len())
            }
        })
    }

    fn read_control(&mut self, max_len: usize) -> rusb::Result<Vec<u8>> {
        self.with_state(|s| {
            if let Some(e) = s.fail_control {
                return Err(e);
            }
            if let Some(mut scripted) = s.scripted_responses.pop_front() {
                s.pending_command = None;
                scripted.truncate(max_len);
                return Ok(scripted);
            }
            let bytes = match s.pending_command.take() {
                Some(CMD_GET_STATUS) => response(0x83, &[s.ready as u8]),
                Some(CMD_GET_FWVERSION) => response(0x84, &s.firmware_version.to_le_bytes()),
                Some(CMD_GET_NAME) => response(0x85, s.name.as_bytes()),
                _ if s.stale_responses > 0 => {
                    s.stale_responses -= 1;
                    response(0x83, &[0])
                }
                _ => return Err(rusb::Error::Timeout),
            };
            Ok(bytes.into_iter().take(max_len).collect())
        })
    }

    fn write_bulk(&mut self, data: &[u8]) -> rusb::Result<usize> {
        self.with_state(|s| {
            if let Some(e) = s.fail_bulk {
                return Err(e);
            }
            s.bulk_writes.push(data.to_vec());
            Ok(data.len())
        })
    }

    fn read_bulk(&mut self, _max_len: usize) -> rusb::Result<Vec<u8>> {
        Err(rusb::Error::Timeout)
    }

    fn claim(&mut self) -> rusb::Result<()> {
        self.with_state(|s| match s.fail_claim {
            Some(e) => Err(e),
            None => {
                s.claimed = true;
                Ok(())
            }
        })
    }

    fn reset(&mut self) -> rusb::Result<()> {
        self.with_state(|s| s.reset = true);
        Ok(())
    }

    fn set_alt_setting(&mut self) -> rusb::Result<()> {
        self.with_state(|s| s.alt_setting_selected = true);
        Ok(())
    }

    fn detach_kernel_driver(&mut self) -> rusb::Result<()> {
        self.with_state(|s| s.kernel_driver_detached = true);
        Ok(())
    }
}
