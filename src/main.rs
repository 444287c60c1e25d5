use std::process::exit;
use std::thread;

use anyhow::Result;
use clap::Parser;

use _core::logging::init_rust_logging;
use _core::{
    AcquisitionRequest, AutoStartOptions, CancelToken, DriverConfig, Magnetometer, ReadAxis,
    ZeroingOptions, ZeroingThresholds,
};

#[derive(Parser, Debug)]
#[command(name = "qzfm-demo", about = "Start a QZFM magnetometer and read field data")]
struct Args {
    /// Serial port (e.g., /dev/ttyUSB0 or COM3)
    port: String,
    /// Number of field samples to read (200 Hz)
    #[arg(long, default_value_t = 200)]
    samples: usize,
    /// Axis to read: x, y or z
    #[arg(long, default_value = "z")]
    axis: ReadAxis,
    /// Return right after the start command and poll for lock
    #[arg(long)]
    no_block: bool,
    /// Field zero and calibrate after lock
    #[arg(long)]
    zero_calibrate: bool,
    /// Zeroing convergence threshold on Bz (pT)
    #[arg(long)]
    dbz: Option<f64>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging();

    println!("--- Opening {} ---", args.port);
    let mut mag = Magnetometer::connect_serial(&args.port, DriverConfig::default())?;

    let options = AutoStartOptions {
        block: !args.no_block,
        zero_and_calibrate: args.zero_calibrate,
        zeroing: ZeroingOptions {
            thresholds: ZeroingThresholds::disabled().with_bz(args.dbz.unwrap_or(f64::INFINITY)),
            ..ZeroingOptions::default()
        },
    };
    println!("Starting...");
    mag.auto_start(options, &CancelToken::new())?;
    if args.no_block && !args.zero_calibrate {
        while !mag.poll_startup()? {
            thread::sleep(mag.config().poll_interval);
        }
    }
    println!("Ready ({})", mag.state());

    let samples = mag.read_data(AcquisitionRequest::samples(args.samples, args.axis))?;
    for (i, s) in samples.iter().enumerate().step_by(20) {
        println!("[{:4}] t={} us | B{} = {:.2} pT", i, s.timestamp_us, args.axis, s.field[0]);
    }

    let snapshot = mag.snapshot();
    println!(
        "gain={} V/nT axis_mode={} zeroed={} calibrated={} messages={}",
        snapshot.gain,
        snapshot.axis_mode,
        snapshot.field_zeroed,
        snapshot.calibration_ok,
        snapshot.message_count
    );
    for entry in mag.last_messages(5) {
        println!("  # {}", entry.text);
    }

    println!("Disconnecting...");
    mag.disconnect();
    println!("Done.");
    Ok(())
}
