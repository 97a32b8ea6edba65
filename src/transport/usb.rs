//! libusb transport for Helios devices.
//!
//! rusb only exposes synchronous transfers, so each opened device gets a
//! worker thread that owns the streaming side: submitted frames are queued
//! to it, written with a blocking bulk transfer, and completed from the
//! worker. Control packets go straight over the interrupt endpoints on the
//! caller's thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::transport::{Completion, DeviceLink, Transport, TransportError, CONTROL_PACKET_SIZE};

/// Helios USB vendor ID.
pub const VENDOR_ID: u16 = 0x1209;
/// Helios USB product ID.
pub const PRODUCT_ID: u16 = 0xE500;

/// Interface claimed on open.
pub const INTERFACE: u8 = 0;
/// Alternate setting selected on [`INTERFACE`].
pub const ALT_SETTING: u8 = 1;

/// Bulk OUT endpoint carrying frames.
pub const ENDPOINT_BULK_OUT: u8 = 0x02;
/// Bulk IN endpoint (unused by the current firmware protocol).
pub const ENDPOINT_BULK_IN: u8 = 0x81;
/// Interrupt OUT endpoint carrying control requests.
pub const ENDPOINT_INT_OUT: u8 = 0x06;
/// Interrupt IN endpoint carrying control responses.
pub const ENDPOINT_INT_IN: u8 = 0x83;

/// Timeouts for USB transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConfig {
    /// Timeout for each control packet, in either direction.
    pub control_timeout: Duration,
    /// Fixed part of the frame transfer timeout. One extra millisecond is
    /// added per 32 bytes of frame data.
    pub frame_timeout_base: Duration,
}

impl UsbConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            control_timeout: Duration::from_millis(32),
            frame_timeout_base: Duration::from_millis(8),
        }
    }

    /// Sets the control packet timeout.
    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Sets the fixed part of the frame transfer timeout.
    pub fn with_frame_timeout_base(mut self, timeout: Duration) -> Self {
        self.frame_timeout_base = timeout;
        self
    }

    /// Timeout for a frame transfer of `len` bytes.
    pub fn frame_timeout(&self, len: usize) -> Duration {
        self.frame_timeout_base + Duration::from_millis((len >> 5) as u64)
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerates Helios devices through libusb.
pub struct UsbTransport {
    context: Context,
    config: UsbConfig,
}

impl UsbTransport {
    /// Initializes libusb with the default configuration.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_config(UsbConfig::default())
    }

    /// Initializes libusb with a custom configuration.
    pub fn with_config(config: UsbConfig) -> Result<Self, TransportError> {
        Ok(Self {
            context: Context::new()?,
            config,
        })
    }

    /// Returns the libusb context.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Transport for UsbTransport {
    type Link = UsbLink;

    fn enumerate(&self) -> Result<Vec<UsbLink>, TransportError> {
        let mut links = Vec::new();

        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                continue;
            }

            match UsbLink::open(&device, self.config.clone()) {
                Ok(link) => links.push(link),
                Err(e) => warn!(
                    "skipping Helios at bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        debug!("found {} Helios device(s)", links.len());
        Ok(links)
    }
}

struct Job {
    id: u64,
    buffer: Vec<u8>,
    completion: Completion,
}

/// An opened Helios device.
pub struct UsbLink {
    handle: Arc<DeviceHandle<Context>>,
    /// Wrapped in Mutex because Sender is Send but not Sync.
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Option<JoinHandle<()>>,
    next_id: AtomicU64,
    cancelled_before: Arc<AtomicU64>,
    config: UsbConfig,
    label: String,
}

impl UsbLink {
    /// Opens a device, claims its interface and starts the transfer worker.
    pub fn open(device: &Device<Context>, config: UsbConfig) -> Result<Self, TransportError> {
        let label = format!("{:03}:{:03}", device.bus_number(), device.address());

        let handle = device.open()?;
        handle.claim_interface(INTERFACE)?;
        handle.set_alternate_setting(INTERFACE, ALT_SETTING)?;
        let handle = Arc::new(handle);

        let (tx, rx) = mpsc::channel();
        let cancelled_before = Arc::new(AtomicU64::new(0));
        let worker = {
            let handle = handle.clone();
            let cancelled_before = cancelled_before.clone();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("helios-usb-{}", label))
                .spawn(move || run_worker(handle, rx, cancelled_before, config))
                .map_err(|e| TransportError::Other(format!("failed to spawn worker: {}", e)))?
        };

        debug!("opened Helios at {}", label);
        Ok(Self {
            handle,
            jobs: Mutex::new(Some(tx)),
            worker: Some(worker),
            next_id: AtomicU64::new(0),
            cancelled_before,
            config,
            label,
        })
    }

    /// Bus and address of the device, as `bus:address`.
    pub fn label(&self) -> &str {
        &self.label
    }
}

fn run_worker(
    handle: Arc<DeviceHandle<Context>>,
    jobs: Receiver<Job>,
    cancelled_before: Arc<AtomicU64>,
    config: UsbConfig,
) {
    for job in jobs {
        if job.id < cancelled_before.load(Ordering::SeqCst) {
            job.completion
                .complete(job.buffer, Err(TransportError::Cancelled));
            continue;
        }

        let timeout = config.frame_timeout(job.buffer.len());
        let outcome = match handle.write_bulk(ENDPOINT_BULK_OUT, &job.buffer, timeout) {
            Ok(n) if n == job.buffer.len() => Ok(()),
            Ok(n) => Err(TransportError::ShortTransfer {
                expected: job.buffer.len(),
                actual: n,
            }),
            Err(rusb::Error::NoDevice) => Err(TransportError::Disconnected),
            Err(rusb::Error::Timeout) => Err(TransportError::Timeout),
            Err(e) => Err(e.into()),
        };
        trace!("transfer {} finished: {:?}", job.id, outcome);
        job.completion.complete(job.buffer, outcome);
    }
}

impl DeviceLink for UsbLink {
    fn write_control(&self, request: &[u8]) -> Result<(), TransportError> {
        let written =
            self.handle
                .write_interrupt(ENDPOINT_INT_OUT, request, self.config.control_timeout)?;
        if written != request.len() {
            return Err(TransportError::ShortTransfer {
                expected: request.len(),
                actual: written,
            });
        }
        Ok(())
    }

    fn read_control(
        &self,
        response: &mut [u8; CONTROL_PACKET_SIZE],
    ) -> Result<usize, TransportError> {
        let read = self.handle.read_interrupt(
            ENDPOINT_INT_IN,
            &mut response[..],
            self.config.control_timeout,
        )?;
        Ok(read)
    }

    fn submit(&self, buffer: Vec<u8>, completion: Completion) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            id,
            buffer,
            completion,
        };

        let rejected = {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match jobs.as_ref() {
                Some(tx) => tx.send(job).err().map(|mpsc::SendError(job)| job),
                None => Some(job),
            }
        };

        if let Some(job) = rejected {
            warn!("Helios {}: transfer worker is gone", self.label);
            job.completion
                .complete(job.buffer, Err(TransportError::Disconnected));
        }
    }

    fn cancel(&self) {
        let upto = self.next_id.load(Ordering::SeqCst);
        self.cancelled_before.fetch_max(upto, Ordering::SeqCst);
        debug!("Helios {}: cancelled transfers below {}", self.label, upto);
    }
}

impl Drop for UsbLink {
    fn drop(&mut self) {
        self.cancelled_before.store(u64::MAX, Ordering::SeqCst);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Helios {}: transfer worker panicked", self.label);
            }
        }

        let _ = self.handle.release_interface(INTERFACE);
        debug!("closed Helios at {}", self.label);
    }
}
