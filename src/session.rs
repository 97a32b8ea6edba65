//! Per-device session: frame transfer state and control calls.
//!
//! A [`DeviceSession`] allows at most one frame transfer in flight. The
//! encoded frame buffer is owned by the session while idle, moved into the
//! transport for the duration of a transfer, and handed back by the
//! transfer's [`Completion`]. Completions arrive on the transport's own
//! thread and reach the session through a weak reference, so a completion
//! that outlives its session does nothing.
//!
//! ```text
//!            submit_frame                 completion
//!   Idle ─────────────────▶ Transferring ─────────────▶ Idle
//!    ▲  │                        │
//!    │  └─ submit_frame: Busy ◀──┘
//!    └── close: cancel + wait (bounded)
//! ```

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::control::{self, ControlRequest};
use crate::error::{Error, Result};
use crate::frame::{self, MAX_FRAME_SIZE};
use crate::transport::{Completion, DeviceLink, TransferResult, TransportError};
use crate::types::{DeviceStatus, FrameFlags, Point};

/// Settling time the device needs after a stop command.
pub const DEFAULT_HALT_SETTLE: Duration = Duration::from_millis(100);

/// How long closing waits for a cancelled transfer to report back.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Most stale control packets discarded when a session opens.
pub const DEFAULT_FLUSH_LIMIT: usize = 32;

/// Session timing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long [`DeviceSession::halt`] blocks after sending the stop command.
    pub halt_settle: Duration,
    /// Upper bound on how long [`DeviceSession::close`] waits for an
    /// outstanding transfer to be cancelled.
    pub close_timeout: Duration,
    /// Most stale control packets drained at open.
    pub flush_limit: usize,
}

impl SessionConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            halt_settle: DEFAULT_HALT_SETTLE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            flush_limit: DEFAULT_FLUSH_LIMIT,
        }
    }

    /// Sets the stop settling time.
    pub fn with_halt_settle(mut self, settle: Duration) -> Self {
        self.halt_settle = settle;
        self
    }

    /// Sets the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the number of stale packets drained at open.
    pub fn with_flush_limit(mut self, limit: usize) -> Self {
        self.flush_limit = limit;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Transfer slot. The buffer exists only while idle.
enum Slot {
    Idle {
        buffer: Vec<u8>,
        /// Failure of a non-blocking transfer not yet reported to the caller.
        failure: Option<TransportError>,
    },
    Transferring {
        generation: u64,
    },
}

struct SessionState {
    slot: Slot,
    next_generation: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<SessionState>,
    settled: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion handler, run on the transport's thread.
fn finish_transfer(
    shared: &Weak<Shared>,
    generation: u64,
    buffer: Vec<u8>,
    outcome: TransferResult,
    waiter: Option<mpsc::SyncSender<TransferResult>>,
) {
    let Some(shared) = shared.upgrade() else {
        debug!("transfer {} completed after its session was dropped", generation);
        return;
    };

    {
        let mut state = shared.lock();
        match state.slot {
            Slot::Transferring { generation: current } if current == generation => {}
            _ => {
                warn!("ignoring stale completion for transfer {}", generation);
                return;
            }
        }

        // A blocked caller receives the outcome directly; only failures
        // nobody is waiting for are kept for the next status query.
        let failure = match (&outcome, &waiter) {
            (Err(e), None) => Some(e.clone()),
            _ => None,
        };
        trace!("transfer {} completed: {:?}", generation, outcome);
        state.slot = Slot::Idle { buffer, failure };
    }
    shared.settled.notify_all();

    if let Some(waiter) = waiter {
        let _ = waiter.send(outcome);
    }
}

#[derive(Debug, Clone)]
struct Identity {
    firmware_version: Option<u32>,
    name: String,
}

fn default_name(index: usize) -> String {
    format!("Helios {}", index)
}

/// One opened device.
///
/// All methods take `&self`; a session is shared between caller threads
/// behind an `Arc`. Concurrent [`submit_frame`](Self::submit_frame) calls
/// never queue: whichever loses the race gets [`Error::Busy`].
pub struct DeviceSession<L: DeviceLink> {
    index: usize,
    link: L,
    shared: Arc<Shared>,
    /// Pairs each control request with its response.
    control: Mutex<()>,
    identity: Mutex<Identity>,
    config: SessionConfig,
}

impl<L: DeviceLink> DeviceSession<L> {
    /// Opens a session over `link`.
    ///
    /// Drains stale control packets, reads the firmware version, announces
    /// the SDK version and reads the stored name. A failed version or name
    /// read is not fatal; the values are fetched again on demand.
    pub fn open(index: usize, link: L, config: SessionConfig) -> Result<Self> {
        let flushed = control::flush(&link, config.flush_limit);
        if flushed > 0 {
            debug!("device {}: discarded {} stale control packets", index, flushed);
        }

        let version = control::exchange(&link, ControlRequest::GetFirmwareVersion);
        let firmware_version = match version {
            Ok(response) => Some(control::parse_firmware_version(&response)),
            Err(e) => {
                warn!("device {}: firmware version unavailable: {}", index, e);
                None
            }
        };

        control::send(&link, ControlRequest::SendSdkVersion)?;

        let name = control::exchange(&link, ControlRequest::GetName)
            .ok()
            .and_then(|response| control::parse_name(&response))
            .unwrap_or_else(|| default_name(index));

        debug!(
            "device {}: opened \"{}\" (firmware {:?})",
            index, name, firmware_version
        );

        Ok(Self {
            index,
            link,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    slot: Slot::Idle {
                        buffer: Vec::with_capacity(MAX_FRAME_SIZE),
                        failure: None,
                    },
                    next_generation: 0,
                    closed: false,
                }),
                settled: Condvar::new(),
            }),
            control: Mutex::new(()),
            identity: Mutex::new(Identity {
                firmware_version,
                name,
            }),
            config,
        })
    }

    /// Index of this device in its registry.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Returns true while a frame transfer is in flight.
    pub fn is_transferring(&self) -> bool {
        matches!(self.shared.lock().slot, Slot::Transferring { .. })
    }

    /// Encodes and submits a frame.
    ///
    /// Limits are checked before any shared state is touched. With
    /// [`FrameFlags::DONT_BLOCK`] the call returns once the transfer has been
    /// handed to the transport; otherwise it waits for the transfer to
    /// complete and returns its outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an empty or oversized frame, or a rate
    ///   outside the device range.
    /// - [`Error::Busy`] while another transfer is in flight.
    /// - [`Error::Transport`] for a failed blocking transfer, or for an
    ///   unreported failure of an earlier non-blocking one.
    /// - [`Error::Closed`] after [`close`](Self::close).
    pub fn submit_frame(&self, points: &[Point], pps: u32, flags: FrameFlags) -> Result<()> {
        frame::validate(points.len(), pps)?;

        let (buffer, generation) = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::Closed);
            }

            let generation = state.next_generation;
            let taken = std::mem::replace(&mut state.slot, Slot::Transferring { generation });
            let mut buffer = match taken {
                Slot::Idle {
                    buffer,
                    failure: None,
                } => buffer,
                Slot::Idle {
                    buffer,
                    failure: Some(err),
                } => {
                    state.slot = Slot::Idle {
                        buffer,
                        failure: None,
                    };
                    return Err(err.into());
                }
                in_flight @ Slot::Transferring { .. } => {
                    state.slot = in_flight;
                    return Err(Error::Busy);
                }
            };

            state.next_generation += 1;
            frame::write_validated(points, pps, flags, &mut buffer);
            (buffer, generation)
        };

        trace!(
            "device {}: transfer {} ({} points at {} pps, flags {:?})",
            self.index,
            generation,
            points.len(),
            pps,
            flags
        );

        let (waiter, done) = if flags.is_blocking() {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let shared = Arc::downgrade(&self.shared);
        self.link.submit(
            buffer,
            Completion::new(move |buffer, outcome| {
                finish_transfer(&shared, generation, buffer, outcome, waiter)
            }),
        );

        match done {
            Some(done) => done
                .recv()
                .unwrap_or(Err(TransportError::Cancelled))
                .map_err(Error::from),
            None => Ok(()),
        }
    }

    /// Session-level readiness.
    ///
    /// `Ready` exactly when no transfer is in flight. Never blocks on I/O.
    /// A failure of an earlier non-blocking transfer is returned once as an
    /// error, after which the session reports `Ready` again.
    pub fn query_status(&self) -> Result<DeviceStatus> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        match &mut state.slot {
            Slot::Transferring { .. } => Ok(DeviceStatus::NotReady),
            Slot::Idle { failure, .. } => match failure.take() {
                Some(err) => Err(err.into()),
                None => Ok(DeviceStatus::Ready),
            },
        }
    }

    /// Device-level readiness: whether the device's frame buffer has room.
    pub fn device_status(&self) -> Result<DeviceStatus> {
        self.with_control(|link| {
            let response = control::exchange(link, ControlRequest::GetStatus)?;
            Ok(control::parse_status(&response))
        })
    }

    /// Combined readiness: the session must be idle and the device must
    /// have room for another frame.
    pub fn status(&self) -> Result<DeviceStatus> {
        match self.query_status()? {
            DeviceStatus::NotReady => Ok(DeviceStatus::NotReady),
            DeviceStatus::Ready => self.device_status(),
        }
    }

    /// Stops output until a new frame is written.
    ///
    /// Blocks for the configured settling time (100 ms by default) after the
    /// stop command so the device can act on it. An in-flight transfer is
    /// left alone; its own completion still moves the session back to idle.
    pub fn halt(&self) -> Result<()> {
        if self.is_transferring() {
            debug!("device {}: stopping with a transfer in flight", self.index);
        }
        self.with_control(|link| control::send(link, ControlRequest::Stop))?;
        thread::sleep(self.config.halt_settle);
        Ok(())
    }

    /// Firmware version, read at open and cached.
    pub fn firmware_version(&self) -> Result<u32> {
        if let Some(version) = self.identity().firmware_version {
            return Ok(version);
        }
        let version = self.with_control(|link| {
            let response = control::exchange(link, ControlRequest::GetFirmwareVersion)?;
            Ok(control::parse_firmware_version(&response))
        })?;
        self.identity().firmware_version = Some(version);
        Ok(version)
    }

    /// Reads the device name, refreshing the cached copy.
    ///
    /// Falls back to `"Helios <index>"` if the device has no stored name.
    pub fn name(&self) -> Result<String> {
        let stored = self.with_control(|link| {
            let response = control::exchange(link, ControlRequest::GetName)?;
            Ok(control::parse_name(&response))
        })?;
        let mut identity = self.identity();
        if let Some(name) = stored {
            identity.name = name;
        }
        Ok(identity.name.clone())
    }

    /// Name cached from the last read, without touching the device.
    pub fn cached_name(&self) -> String {
        self.identity().name.clone()
    }

    /// Stores a new device name (at most 30 bytes).
    pub fn set_name(&self, name: &str) -> Result<()> {
        control::validate_name(name)?;
        self.with_control(|link| control::send(link, ControlRequest::SetName(name)))?;
        self.identity().name = name.to_string();
        Ok(())
    }

    /// Opens or closes the shutter.
    pub fn set_shutter(&self, open: bool) -> Result<()> {
        self.with_control(|link| control::send(link, ControlRequest::SetShutter(open)))
    }

    /// Erases the firmware so the device boots into its bootloader.
    pub fn erase_firmware(&self) -> Result<()> {
        warn!("device {}: erasing firmware", self.index);
        self.with_control(|link| control::send(link, ControlRequest::EraseFirmware))
    }

    /// Closes the session.
    ///
    /// New submissions fail with [`Error::Closed`] from here on. An in-flight
    /// transfer is cancelled through the transport and waited for, up to the
    /// configured close timeout. Calling `close` again is a no-op.
    pub fn close(&self) {
        let in_flight = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            matches!(state.slot, Slot::Transferring { .. })
        };

        if in_flight {
            debug!("device {}: cancelling in-flight transfer", self.index);
            // The lock must be free here: the transport may complete the
            // cancelled transfer on this thread.
            self.link.cancel();

            let state = self.shared.lock();
            let (_state, wait) = self
                .shared
                .settled
                .wait_timeout_while(state, self.config.close_timeout, |s| {
                    matches!(s.slot, Slot::Transferring { .. })
                })
                .unwrap_or_else(PoisonError::into_inner);
            if wait.timed_out() {
                warn!(
                    "device {}: transfer still outstanding after {:?}; its completion will be ignored",
                    self.index, self.config.close_timeout
                );
            }
        }
        debug!("device {}: closed", self.index);
    }

    fn identity(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_control<T>(&self, f: impl FnOnce(&L) -> Result<T>) -> Result<T> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let _guard = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        f(&self.link)
    }
}

impl<L: DeviceLink> Drop for DeviceSession<L> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockDevice;
    use std::time::Instant;

    fn points() -> Vec<Point> {
        vec![
            Point::new(0, 0, 255, 0, 0, 255),
            Point::new(4095, 4095, 0, 255, 0, 255),
        ]
    }

    fn open(device: &MockDevice) -> DeviceSession<MockDevice> {
        let config = SessionConfig::new()
            .with_halt_settle(Duration::from_millis(20))
            .with_close_timeout(Duration::from_millis(200));
        DeviceSession::open(0, device.clone(), config).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_open_reads_identity() {
        let device = MockDevice::new()
            .with_name("Bench")
            .with_firmware_version(7);
        let session = open(&device);

        assert_eq!(device.sdk_version(), Some(control::SDK_VERSION));
        assert_eq!(session.firmware_version().unwrap(), 7);
        assert_eq!(session.cached_name(), "Bench");
    }

    #[test]
    fn test_open_falls_back_to_default_name() {
        let device = MockDevice::new();
        let session = DeviceSession::open(3, device, SessionConfig::default()).unwrap();
        assert_eq!(session.cached_name(), "Helios 3");
        assert_eq!(session.name().unwrap(), "Helios 3");
    }

    #[test]
    fn test_open_flushes_stale_packets() {
        let device = MockDevice::new()
            .with_stale_responses(3)
            .with_firmware_version(5);
        let session = open(&device);
        assert_eq!(session.firmware_version().unwrap(), 5);
    }

    #[test]
    fn test_second_submit_is_busy() {
        let device = MockDevice::new().holding_completions();
        let session = open(&device);

        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();
        let first = device.submitted()[0].clone();

        let other = vec![Point::new(1, 1, 1, 1, 1, 1); 10];
        assert_eq!(
            session.submit_frame(&other, 2000, FrameFlags::DONT_BLOCK),
            Err(Error::Busy)
        );
        assert_eq!(device.submitted(), vec![first]);

        assert!(device.release_next());
        assert_eq!(device.submitted_frames().unwrap()[0].points, points());
    }

    #[test]
    fn test_status_becomes_ready_once_per_submission() {
        let device = MockDevice::new().holding_completions();
        let session = open(&device);
        assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));

        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();
        for _ in 0..5 {
            assert_eq!(session.query_status(), Ok(DeviceStatus::NotReady));
        }

        device.release_next();
        for _ in 0..5 {
            assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));
        }
    }

    #[test]
    fn test_invalid_frame_leaves_state_alone() {
        let device = MockDevice::new().holding_completions();
        let session = open(&device);

        assert!(matches!(
            session.submit_frame(&[], 1000, FrameFlags::DONT_BLOCK),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.submit_frame(&points(), 6, FrameFlags::DONT_BLOCK),
            Err(Error::InvalidArgument(_))
        ));
        assert!(device.submitted().is_empty());
        assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));
    }

    #[test]
    fn test_blocking_submit_returns_failure() {
        let device = MockDevice::new();
        let session = open(&device);
        device.fail_next_transfer(TransportError::Timeout);

        assert_eq!(
            session.submit_frame(&points(), 1000, FrameFlags::empty()),
            Err(Error::Transport(TransportError::Timeout))
        );
        // Already reported; not surfaced a second time.
        assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));
    }

    #[test]
    fn test_non_blocking_failure_reported_by_status() {
        let device = MockDevice::new().holding_completions();
        let session = open(&device);
        device.fail_next_transfer(TransportError::Disconnected);

        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();
        device.release_next();

        assert_eq!(
            session.query_status(),
            Err(Error::Transport(TransportError::Disconnected))
        );
        assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));
    }

    #[test]
    fn test_non_blocking_failure_reported_by_next_submit() {
        let device = MockDevice::new().holding_completions();
        let session = open(&device);
        device.fail_next_transfer(TransportError::Timeout);

        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();
        device.release_next();

        assert_eq!(
            session.submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK),
            Err(Error::Transport(TransportError::Timeout))
        );
        assert_eq!(device.submitted().len(), 1);
        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();
        assert_eq!(device.submitted().len(), 2);
    }

    #[test]
    fn test_blocking_submit_waits_for_completion() {
        let device = MockDevice::new().holding_completions();
        let session = Arc::new(open(&device));

        let submitter = {
            let session = session.clone();
            thread::spawn(move || session.submit_frame(&points(), 1000, FrameFlags::empty()))
        };

        wait_until(|| device.held_count() == 1);
        thread::sleep(Duration::from_millis(20));
        assert!(!submitter.is_finished());
        assert_eq!(session.query_status(), Ok(DeviceStatus::NotReady));

        device.release_next();
        assert_eq!(submitter.join().unwrap(), Ok(()));
        assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));
    }

    #[test]
    fn test_close_unblocks_waiting_submit() {
        let device = MockDevice::new().holding_completions();
        let session = Arc::new(open(&device));

        let submitter = {
            let session = session.clone();
            thread::spawn(move || session.submit_frame(&points(), 1000, FrameFlags::empty()))
        };
        wait_until(|| device.held_count() == 1);

        session.close();

        assert_eq!(
            submitter.join().unwrap(),
            Err(Error::Transport(TransportError::Cancelled))
        );
        assert_eq!(device.cancel_count(), 1);
        assert!(!session.is_transferring());
    }

    #[test]
    fn test_closed_session_rejects_calls() {
        let device = MockDevice::new();
        let session = open(&device);
        session.close();
        session.close();

        assert!(session.is_closed());
        assert_eq!(
            session.submit_frame(&points(), 1000, FrameFlags::empty()),
            Err(Error::Closed)
        );
        assert_eq!(session.query_status(), Err(Error::Closed));
        assert_eq!(session.halt(), Err(Error::Closed));
        assert_eq!(device.cancel_count(), 0);
    }

    #[test]
    fn test_late_completion_after_drop_is_noop() {
        let device = MockDevice::new().holding_completions().ignoring_cancel();
        let config = SessionConfig::new().with_close_timeout(Duration::from_millis(10));
        let session = DeviceSession::open(0, device.clone(), config).unwrap();

        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();
        drop(session);

        assert_eq!(device.cancel_count(), 1);
        assert!(device.release_next());
    }

    #[test]
    fn test_halt_blocks_for_settle_time() {
        let device = MockDevice::new().holding_completions();
        let session = open(&device);
        session
            .submit_frame(&points(), 1000, FrameFlags::DONT_BLOCK)
            .unwrap();

        let start = Instant::now();
        session.halt().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));

        assert_eq!(device.stop_count(), 1);
        assert!(session.is_transferring());
        device.release_next();
        assert!(!session.is_transferring());
    }

    #[test]
    fn test_device_status_is_separate_from_session_status() {
        let device = MockDevice::new();
        let session = open(&device);
        device.set_device_ready(false);

        assert_eq!(session.query_status(), Ok(DeviceStatus::Ready));
        assert_eq!(session.device_status(), Ok(DeviceStatus::NotReady));
        assert_eq!(session.status(), Ok(DeviceStatus::NotReady));
    }

    #[test]
    fn test_control_operations() {
        let device = MockDevice::new();
        let session = open(&device);

        session.set_shutter(true).unwrap();
        assert!(device.shutter_open());

        session.set_name("Left").unwrap();
        assert_eq!(device.name().as_deref(), Some("Left"));
        assert_eq!(session.name().unwrap(), "Left");

        let too_long = "n".repeat(control::MAX_NAME_LEN + 1);
        let before = device.control_log().len();
        assert!(matches!(
            session.set_name(&too_long),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(device.control_log().len(), before);

        session.erase_firmware().unwrap();
        assert!(device.erased());
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new()
            .with_halt_settle(Duration::from_millis(5))
            .with_close_timeout(Duration::from_secs(1))
            .with_flush_limit(4);
        assert_eq!(config.halt_settle, Duration::from_millis(5));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(config.flush_limit, 4);
        assert_eq!(SessionConfig::default().halt_settle, DEFAULT_HALT_SETTLE);
    }
}
