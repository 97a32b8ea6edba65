//! Frame streaming example.
//!
//! Opens every attached Helios DAC and plays a shape on the first one,
//! polling for readiness before each frame.
//!
//! Run with: `cargo run --example frame -- circle --frames 300`
//!
//! Without hardware, add `--mock` to stream to a simulated device.

use std::f32::consts::TAU;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use helios_dac::transport::mock::{MockDevice, MockTransport};
use helios_dac::{DeviceStatus, Error, FrameFlags, HeliosDac, Point, Result, Transport};
use log::{error, info, warn};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Shape {
    Circle,
    Square,
    Line,
}

#[derive(Parser)]
#[command(about = "Stream a test shape to a Helios DAC")]
struct Args {
    /// Shape to render
    #[arg(value_enum, default_value_t = Shape::Circle)]
    shape: Shape,

    /// Points per frame
    #[arg(short, long, default_value_t = 600)]
    points: usize,

    /// Point rate
    #[arg(long, default_value_t = 30_000)]
    pps: u32,

    /// Number of frames to play
    #[arg(short, long, default_value_t = 300)]
    frames: usize,

    /// Return from each write without waiting for the transfer
    #[arg(long)]
    no_block: bool,

    /// Use a simulated device instead of USB
    #[arg(long)]
    mock: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.mock {
        let device = MockDevice::new()
            .with_name("Simulated Helios")
            .with_completion_delay(frame_duration(args.points, args.pps));
        return run(HeliosDac::with_transport(MockTransport::new().with_device(device)), &args);
    }

    #[cfg(feature = "usb")]
    {
        run(HeliosDac::new()?, &args)
    }

    #[cfg(not(feature = "usb"))]
    {
        error!("built without USB support, pass --mock");
        Ok(())
    }
}

fn run<T: Transport>(dac: HeliosDac<T>, args: &Args) -> Result<()> {
    info!("Scanning for Helios DACs...");
    let count = dac.open_devices()?;
    if count == 0 {
        error!("No Helios DACs found!");
        return Ok(());
    }

    for index in 0..count {
        info!(
            "Device {}: {} (firmware {})",
            index,
            dac.get_name(index)?,
            dac.get_firmware_version(index)?
        );
    }

    let points = create_points(args.shape, args.points);
    let flags = if args.no_block {
        FrameFlags::DONT_BLOCK
    } else {
        FrameFlags::empty()
    };

    dac.set_shutter(0, true)?;
    info!(
        "Playing {:?} ({} points at {} pps) for {} frames",
        args.shape,
        points.len(),
        args.pps,
        args.frames
    );

    let mut written = 0;
    while written < args.frames {
        match dac.get_status(0) {
            Ok(DeviceStatus::Ready) => {}
            Ok(DeviceStatus::NotReady) => {
                thread::sleep(Duration::from_micros(500));
                continue;
            }
            // A failed non-blocking transfer is reported once; the
            // session is idle again afterwards.
            Err(e @ Error::Transport(_)) => {
                warn!("Previous frame failed: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        }

        dac.write_frame(0, args.pps, flags, &points)?;
        written += 1;
        if written % 100 == 0 {
            log::debug!("Frames: {}", written);
        }
    }

    dac.stop(0)?;
    dac.set_shutter(0, false)?;
    dac.close_devices();
    info!("Done");
    Ok(())
}

fn frame_duration(points: usize, pps: u32) -> Duration {
    Duration::from_secs_f64(points as f64 / pps.max(1) as f64)
}

fn create_points(shape: Shape, n: usize) -> Vec<Point> {
    let n = n.max(1);
    (0..n)
        .map(|i| {
            let t = i as f32 / n as f32;
            let (x, y) = match shape {
                Shape::Circle => ((t * TAU).cos() * 0.8, (t * TAU).sin() * 0.8),
                Shape::Square => square(t),
                Shape::Line => (t * 1.6 - 0.8, 0.0),
            };
            Point::from_normalized(x, y, 0, 255, 0, 255)
        })
        .collect()
}

fn square(t: f32) -> (f32, f32) {
    let side = (t * 4.0) as usize;
    let s = (t * 4.0).fract() * 1.6 - 0.8;
    match side {
        0 => (s, -0.8),
        1 => (0.8, s),
        2 => (-s, 0.8),
        _ => (-0.8, -s),
    }
}
