//! In-process simulated transport.
//!
//! [`MockDevice`] answers control requests like a Helios device and completes
//! frame transfers on a background thread after a configurable delay. Tests
//! keep a clone of each device to steer it and inspect what it received after
//! the transport has been handed to a [`HeliosDac`](crate::HeliosDac).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::control::{
    CMD_ERASE_FIRMWARE, CMD_GET_FIRMWARE_VERSION, CMD_GET_NAME, CMD_GET_STATUS,
    CMD_SEND_SDK_VERSION, CMD_SET_NAME, CMD_SET_SHUTTER, CMD_STOP, RESPONSE_FLAG,
};
use crate::error::Result;
use crate::frame;
use crate::transport::{
    Completion, DeviceLink, TransferResult, Transport, TransportError, CONTROL_PACKET_SIZE,
};
use crate::types::Frame;

/// A transport over a fixed list of simulated devices.
#[derive(Clone, Default)]
pub struct MockTransport {
    devices: Vec<MockDevice>,
}

impl MockTransport {
    /// Creates a transport with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device.
    pub fn with_device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Returns a handle to the device at `index`.
    pub fn device(&self, index: usize) -> Option<MockDevice> {
        self.devices.get(index).cloned()
    }
}

impl Transport for MockTransport {
    type Link = MockDevice;

    fn enumerate(&self) -> std::result::Result<Vec<MockDevice>, TransportError> {
        Ok(self.devices.clone())
    }
}

struct HeldTransfer {
    id: u64,
    buffer: Vec<u8>,
    outcome: TransferResult,
    completion: Completion,
}

struct MockState {
    name: Option<String>,
    firmware_version: u32,
    device_ready: bool,
    shutter_open: bool,
    erased: bool,
    sdk_version: Option<u8>,
    stop_count: usize,
    cancel_count: usize,
    disconnected: bool,

    completion_delay: Duration,
    hold_completions: bool,
    honor_cancel: bool,
    fail_next: Option<TransportError>,
    cancelled_before: u64,

    submitted: Vec<Vec<u8>>,
    control_log: Vec<Vec<u8>>,
    responses: VecDeque<[u8; CONTROL_PACKET_SIZE]>,
    held: Vec<HeldTransfer>,
}

struct MockInner {
    state: Mutex<MockState>,
    cancelled: Condvar,
    next_id: AtomicU64,
}

/// A simulated Helios device.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<MockInner>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Creates a ready device that completes transfers immediately.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    name: None,
                    firmware_version: 6,
                    device_ready: true,
                    shutter_open: false,
                    erased: false,
                    sdk_version: None,
                    stop_count: 0,
                    cancel_count: 0,
                    disconnected: false,
                    completion_delay: Duration::ZERO,
                    hold_completions: false,
                    honor_cancel: true,
                    fail_next: None,
                    cancelled_before: 0,
                    submitted: Vec::new(),
                    control_log: Vec::new(),
                    responses: VecDeque::new(),
                    held: Vec::new(),
                }),
                cancelled: Condvar::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the stored device name.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.state().name = Some(name.into());
        self
    }

    /// Sets the reported firmware version.
    pub fn with_firmware_version(self, version: u32) -> Self {
        self.state().firmware_version = version;
        self
    }

    /// Completes each transfer after `delay`.
    pub fn with_completion_delay(self, delay: Duration) -> Self {
        self.state().completion_delay = delay;
        self
    }

    /// Keeps transfers outstanding until [`complete_next`](Self::complete_next).
    pub fn holding_completions(self) -> Self {
        self.state().hold_completions = true;
        self
    }

    /// Records cancel requests but lets transfers finish normally.
    pub fn ignoring_cancel(self) -> Self {
        self.state().honor_cancel = false;
        self
    }

    /// Queues `count` unsolicited packets on the control IN endpoint.
    pub fn with_stale_responses(self, count: usize) -> Self {
        {
            let mut state = self.state();
            for _ in 0..count {
                state.responses.push_back([0xFF; CONTROL_PACKET_SIZE]);
            }
        }
        self
    }

    /// Sets the device-side double buffer readiness.
    pub fn set_device_ready(&self, ready: bool) {
        self.state().device_ready = ready;
    }

    /// Makes the next transfer complete with `error`.
    pub fn fail_next_transfer(&self, error: TransportError) {
        self.state().fail_next = Some(error);
    }

    /// Simulates unplugging (or replugging) the device.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().disconnected = disconnected;
    }

    /// Completes the oldest held transfer with `outcome`.
    ///
    /// Returns false if no transfer was held.
    pub fn complete_next(&self, outcome: TransferResult) -> bool {
        let held = {
            let mut state = self.state();
            if state.held.is_empty() {
                return false;
            }
            state.held.remove(0)
        };
        trace!("mock: completing held transfer {}", held.id);
        held.completion.complete(held.buffer, outcome);
        true
    }

    /// Completes the oldest held transfer with the outcome it was given at
    /// submission (normally success).
    pub fn release_next(&self) -> bool {
        let held = {
            let mut state = self.state();
            if state.held.is_empty() {
                return false;
            }
            state.held.remove(0)
        };
        held.completion.complete(held.buffer, held.outcome);
        true
    }

    /// Number of transfers waiting for manual completion.
    pub fn held_count(&self) -> usize {
        self.state().held.len()
    }

    /// Raw buffers received on the streaming channel, in order.
    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.state().submitted.clone()
    }

    /// Frames received on the streaming channel, decoded.
    pub fn submitted_frames(&self) -> Result<Vec<Frame>> {
        self.submitted().iter().map(|b| frame::decode(b)).collect()
    }

    /// Raw control requests received, in order.
    pub fn control_log(&self) -> Vec<Vec<u8>> {
        self.state().control_log.clone()
    }

    /// Current stored name.
    pub fn name(&self) -> Option<String> {
        self.state().name.clone()
    }

    /// Number of stop commands received.
    pub fn stop_count(&self) -> usize {
        self.state().stop_count
    }

    /// Last shutter level set.
    pub fn shutter_open(&self) -> bool {
        self.state().shutter_open
    }

    /// Whether an erase command was received.
    pub fn erased(&self) -> bool {
        self.state().erased
    }

    /// SDK version announced by the host, if any.
    pub fn sdk_version(&self) -> Option<u8> {
        self.state().sdk_version
    }

    /// Number of cancel requests received.
    pub fn cancel_count(&self) -> usize {
        self.state().cancel_count
    }

    fn respond(state: &mut MockState, command: u8, payload: &[u8]) {
        let mut packet = [0u8; CONTROL_PACKET_SIZE];
        packet[0] = command | RESPONSE_FLAG;
        packet[1..1 + payload.len()].copy_from_slice(payload);
        state.responses.push_back(packet);
    }
}

impl DeviceLink for MockDevice {
    fn write_control(&self, request: &[u8]) -> std::result::Result<(), TransportError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        state.control_log.push(request.to_vec());

        let command = request.first().copied().unwrap_or_default();
        let arg = request.get(1).copied().unwrap_or_default();
        match command {
            CMD_STOP => state.stop_count += 1,
            CMD_SET_SHUTTER => state.shutter_open = arg != 0,
            CMD_GET_STATUS => {
                let ready = state.device_ready as u8;
                Self::respond(&mut state, command, &[ready]);
            }
            CMD_GET_FIRMWARE_VERSION => {
                let mut version = [0u8; 4];
                LittleEndian::write_u32(&mut version, state.firmware_version);
                Self::respond(&mut state, command, &version);
            }
            CMD_GET_NAME => {
                let name = state.name.clone().unwrap_or_default();
                Self::respond(&mut state, command, name.as_bytes());
            }
            CMD_SET_NAME => {
                let field = request.get(1..).unwrap_or_default();
                let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                state.name = Some(String::from_utf8_lossy(&field[..end]).into_owned());
            }
            CMD_SEND_SDK_VERSION => state.sdk_version = Some(arg),
            CMD_ERASE_FIRMWARE => state.erased = true,
            other => {
                return Err(TransportError::Other(format!(
                    "unknown control command 0x{:02X}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn read_control(
        &self,
        response: &mut [u8; CONTROL_PACKET_SIZE],
    ) -> std::result::Result<usize, TransportError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        match state.responses.pop_front() {
            Some(packet) => {
                *response = packet;
                Ok(CONTROL_PACKET_SIZE)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn submit(&self, buffer: Vec<u8>, completion: Completion) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.submitted.push(buffer.clone());

        let outcome = if state.disconnected {
            Err(TransportError::Disconnected)
        } else {
            state.fail_next.take().map_or(Ok(()), Err)
        };

        if state.hold_completions {
            trace!("mock: holding transfer {}", id);
            state.held.push(HeldTransfer {
                id,
                buffer,
                outcome,
                completion,
            });
            return;
        }

        let delay = state.completion_delay;
        drop(state);

        let inner = self.inner.clone();
        thread::spawn(move || {
            let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (state, _) = inner
                .cancelled
                .wait_timeout_while(state, delay, |s| !(s.honor_cancel && s.cancelled_before > id))
                .unwrap_or_else(PoisonError::into_inner);
            let cancelled = state.honor_cancel && state.cancelled_before > id;
            drop(state);

            let outcome = if cancelled {
                Err(TransportError::Cancelled)
            } else {
                outcome
            };
            trace!("mock: transfer {} done: {:?}", id, outcome);
            completion.complete(buffer, outcome);
        });
    }

    fn cancel(&self) {
        let held = {
            let mut state = self.state();
            state.cancel_count += 1;
            if !state.honor_cancel {
                return;
            }
            state.cancelled_before = self.inner.next_id.load(Ordering::SeqCst);
            std::mem::take(&mut state.held)
        };
        self.inner.cancelled.notify_all();

        for transfer in held {
            transfer
                .completion
                .complete(transfer.buffer, Err(TransportError::Cancelled));
        }
    }
}
