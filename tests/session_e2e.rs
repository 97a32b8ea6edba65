//! End-to-end tests for the driver with simulated devices.
//!
//! These tests drive the full open -> write -> status -> stop -> close
//! lifecycle through [`HeliosDac`] against [`MockTransport`].

use std::thread;
use std::time::{Duration, Instant};

use helios_dac::control::{CMD_ERASE_FIRMWARE, CMD_STOP};
use helios_dac::frame;
use helios_dac::transport::mock::{MockDevice, MockTransport};
use helios_dac::{
    DeviceStatus, Error, FrameFlags, HeliosDac, Point, SessionConfig, TransportError,
};

fn two_points() -> Vec<Point> {
    vec![
        Point::new(0x0ABC, 0x0123, 255, 0, 0, 255),
        Point::new(0, 0, 0, 0, 0, 0),
    ]
}

fn open_single(device: MockDevice) -> HeliosDac<MockTransport> {
    let dac = HeliosDac::with_transport(MockTransport::new().with_device(device));
    assert_eq!(dac.open_devices().unwrap(), 1);
    dac
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

// =============================================================================
// Streaming
// =============================================================================

#[test]
fn test_blocking_write_waits_for_transfer() {
    let device = MockDevice::new().with_completion_delay(Duration::from_millis(50));
    let dac = open_single(device.clone());
    let points = vec![
        Point::new(0, 0, 255, 0, 0, 255),
        Point::new(4095, 4095, 0, 255, 0, 255),
    ];

    let start = Instant::now();
    dac.write_frame(0, 1000, FrameFlags::empty(), &points).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::Ready);

    let sent = device.submitted();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0],
        vec![
            0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF, //
            0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0x00, 0xFF, //
            0xE8, 0x03, 0x02, 0x00, 0x00,
        ]
    );
}

#[test]
fn test_coordinate_packing() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    dac.write_frame(0, 1000, FrameFlags::empty(), &two_points())
        .unwrap();
    assert_eq!(
        &device.submitted()[0][..7],
        &[0xAB, 0xC1, 0x23, 0xFF, 0x00, 0x00, 0xFF]
    );
}

#[test]
fn test_non_blocking_write_returns_early() {
    let device = MockDevice::new().with_completion_delay(Duration::from_millis(100));
    let dac = open_single(device);

    let start = Instant::now();
    dac.write_frame(0, 1000, FrameFlags::DONT_BLOCK, &two_points())
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::NotReady);

    assert!(wait_until(Duration::from_secs(2), || {
        dac.get_status(0).unwrap() == DeviceStatus::Ready
    }));
}

#[test]
fn test_write_while_busy_is_rejected() {
    let device = MockDevice::new().holding_completions();
    let dac = open_single(device.clone());

    dac.write_frame(0, 1000, FrameFlags::DONT_BLOCK, &two_points())
        .unwrap();
    let err = dac
        .write_frame(0, 1000, FrameFlags::DONT_BLOCK, &two_points())
        .unwrap_err();
    assert_eq!(err, Error::Busy);
    assert!(err.is_retryable());
    assert_eq!(device.submitted().len(), 1);

    assert!(device.release_next());
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::Ready);
    dac.write_frame(0, 1000, FrameFlags::DONT_BLOCK, &two_points())
        .unwrap();
    assert_eq!(device.submitted().len(), 2);
}

#[test]
fn test_device_buffer_full_reports_not_ready() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    device.set_device_ready(false);
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::NotReady);
    assert_eq!(
        dac.session(0).unwrap().query_status().unwrap(),
        DeviceStatus::Ready
    );

    device.set_device_ready(true);
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::Ready);
}

#[test]
fn test_non_blocking_failure_is_reported_once() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    device.fail_next_transfer(TransportError::Timeout);
    dac.write_frame(0, 1000, FrameFlags::DONT_BLOCK, &two_points())
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        !dac.session(0).unwrap().is_transferring()
    }));
    assert_eq!(
        dac.get_status(0).unwrap_err(),
        Error::Transport(TransportError::Timeout)
    );
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::Ready);
}

#[test]
fn test_blocking_failure_is_returned() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    device.fail_next_transfer(TransportError::Disconnected);
    assert_eq!(
        dac.write_frame(0, 1000, FrameFlags::empty(), &two_points())
            .unwrap_err(),
        Error::Transport(TransportError::Disconnected)
    );
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::Ready);
}

#[test]
fn test_frames_decode_to_what_was_written() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    let points: Vec<Point> = (0..500u16)
        .map(|i| Point::new(i * 8, 4095 - i * 8, i as u8, 0, 255, 128))
        .collect();
    dac.write_frame(0, 30_000, FrameFlags::START_IMMEDIATELY, &points)
        .unwrap();

    let frames = device.submitted_frames().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pps, 30_000);
    assert_eq!(frames[0].flags, FrameFlags::START_IMMEDIATELY);
    assert_eq!(frames[0].points, points);
    assert_eq!(
        device.submitted()[0].len(),
        frame::encoded_len(points.len())
    );
}

// =============================================================================
// Argument Validation
// =============================================================================

#[test]
fn test_invalid_frames_are_rejected_before_transfer() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());
    let max = vec![Point::default(); helios_dac::MAX_POINTS];
    let over = vec![Point::default(); helios_dac::MAX_POINTS + 1];
    let points = two_points();

    let invalid: [(&[Point], u32); 4] = [
        (&[], 1000),
        (&over, 1000),
        (&points, 6),
        (&points, 65_536),
    ];
    for (frame, pps) in invalid {
        let err = dac
            .write_frame(0, pps, FrameFlags::empty(), frame)
            .unwrap_err();
        assert!(
            matches!(err, Error::InvalidArgument(_)),
            "{} points at {} pps: {:?}",
            frame.len(),
            pps,
            err
        );
    }
    assert!(device.submitted().is_empty());
    assert_eq!(dac.get_status(0).unwrap(), DeviceStatus::Ready);

    dac.write_frame(0, helios_dac::MIN_RATE, FrameFlags::empty(), &max)
        .unwrap();
    dac.write_frame(0, helios_dac::MAX_RATE, FrameFlags::empty(), &points)
        .unwrap();
    assert_eq!(device.submitted().len(), 2);
}

#[test]
fn test_unknown_index_is_not_found() {
    let dac = open_single(MockDevice::new());

    assert_eq!(
        dac.get_status(1).unwrap_err(),
        Error::NotFound { index: 1 }
    );
    assert_eq!(
        dac.write_frame(3, 1000, FrameFlags::empty(), &two_points())
            .unwrap_err(),
        Error::NotFound { index: 3 }
    );
    assert_eq!(dac.stop(1).unwrap_err(), Error::NotFound { index: 1 });
}

// =============================================================================
// Device Control
// =============================================================================

#[test]
fn test_identity() {
    let dac = HeliosDac::with_transport(
        MockTransport::new()
            .with_device(MockDevice::new().with_name("Left").with_firmware_version(7))
            .with_device(MockDevice::new()),
    );
    assert_eq!(dac.open_devices().unwrap(), 2);
    assert_eq!(dac.device_count(), 2);

    assert_eq!(dac.get_name(0).unwrap(), "Left");
    assert_eq!(dac.get_firmware_version(0).unwrap(), 7);
    assert_eq!(dac.get_name(1).unwrap(), "Helios 1");

    dac.set_name(1, "Right").unwrap();
    assert_eq!(dac.get_name(1).unwrap(), "Right");

    let long = "x".repeat(31);
    assert!(matches!(
        dac.set_name(1, &long),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(dac.get_name(1).unwrap(), "Right");
}

#[test]
fn test_stop_waits_for_device() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    let start = Instant::now();
    dac.stop(0).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(device.stop_count(), 1);
    assert_eq!(device.control_log().last().map(|r| r[0]), Some(CMD_STOP));
}

#[test]
fn test_stop_with_short_settle() {
    let device = MockDevice::new();
    let dac = HeliosDac::with_config(
        MockTransport::new().with_device(device.clone()),
        SessionConfig::new().with_halt_settle(Duration::from_millis(5)),
    );
    dac.open_devices().unwrap();

    let start = Instant::now();
    dac.stop(0).unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(device.stop_count(), 1);
}

#[test]
fn test_shutter_and_erase() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    dac.set_shutter(0, true).unwrap();
    assert!(device.shutter_open());
    dac.set_shutter(0, false).unwrap();
    assert!(!device.shutter_open());

    dac.erase_firmware(0).unwrap();
    assert!(device.erased());
    assert_eq!(
        device.control_log().last().map(|r| r[0]),
        Some(CMD_ERASE_FIRMWARE)
    );
}

#[test]
fn test_disconnected_device_errors() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());

    device.set_disconnected(true);
    assert_eq!(
        dac.get_status(0).unwrap_err(),
        Error::Transport(TransportError::Disconnected)
    );
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_close_cancels_outstanding_transfer() {
    let device = MockDevice::new().holding_completions().ignoring_cancel();
    let dac = HeliosDac::with_config(
        MockTransport::new().with_device(device.clone()),
        SessionConfig::new().with_close_timeout(Duration::from_millis(20)),
    );
    dac.open_devices().unwrap();
    let session = dac.session(0).unwrap();

    dac.write_frame(0, 1000, FrameFlags::DONT_BLOCK, &two_points())
        .unwrap();
    dac.close_devices();

    assert_eq!(device.cancel_count(), 1);
    assert_eq!(dac.device_count(), 0);
    assert_eq!(
        dac.get_status(0).unwrap_err(),
        Error::NotFound { index: 0 }
    );

    // The transfer completes after close; nothing observes it.
    drop(session);
    assert!(device.release_next());
}

#[test]
fn test_close_unblocks_blocking_writer() {
    let device = MockDevice::new().holding_completions();
    let dac = open_single(device.clone());
    let session = dac.session(0).unwrap();

    let writer = thread::spawn(move || {
        session.submit_frame(&two_points(), 1000, FrameFlags::empty())
    });
    assert!(wait_until(Duration::from_secs(2), || device.held_count() == 1));

    dac.close_devices();
    assert_eq!(
        writer.join().unwrap(),
        Err(Error::Transport(TransportError::Cancelled))
    );
}

#[test]
fn test_reopen_after_close() {
    let device = MockDevice::new();
    let dac = open_single(device.clone());
    dac.write_frame(0, 1000, FrameFlags::empty(), &two_points())
        .unwrap();

    dac.close_devices();
    assert_eq!(dac.open_devices().unwrap(), 1);
    assert_eq!(dac.open_devices().unwrap(), 1);
    dac.write_frame(0, 1000, FrameFlags::empty(), &two_points())
        .unwrap();
    assert_eq!(device.submitted().len(), 2);
}

#[test]
fn test_no_devices() {
    let dac = HeliosDac::with_transport(MockTransport::new());
    assert_eq!(dac.open_devices().unwrap(), 0);
    assert_eq!(
        dac.get_status(0).unwrap_err(),
        Error::NotFound { index: 0 }
    );
}
