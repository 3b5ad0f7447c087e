//! Demo binary: boots a simulated device, runs one scan, and prints the
//! rendered data stream. The real protocol layer lives elsewhere; this
//! exists to exercise the simulator end to end from a shell.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rga_sim::{Device, Settings, END_OF_DATA};

#[derive(Parser, Debug)]
#[command(name = "rga_sim", about = "Programmable RGA instrument simulator")]
struct Args {
    /// Optional TOML settings file (RGASIM_* env vars override it).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First swept mass of the demo scan.
    #[arg(long, default_value_t = 1.0)]
    start: f64,

    /// Last swept mass of the demo scan.
    #[arg(long, default_value_t = 10.0)]
    stop: f64,

    /// Sweep step.
    #[arg(long, default_value_t = 1.0)]
    step: f64,

    /// Per-point dwell in milliseconds.
    #[arg(long, default_value_t = 10)]
    dwell: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    let mut device = Device::new(settings);
    tracing::info!(name = device.name(), "device ready");

    // A small hydrogen/helium atmosphere so the sweep has something to see.
    device.set_gas_pressure("H2", 1.2e-7);
    device.set_gas_pressure("He", 4.0e-8);
    device.set_gas_pressure("H2O", 8.0e-9);

    device.select_scan("Ascans");
    device.set_row(0);
    device.set_row_bounds(args.start, args.stop, args.step);
    device.set_dwell(args.dwell, false);
    device.set_settle(0, false);
    device.set_cycles(1);

    device.start("Ascans").await;
    loop {
        let page = device.poll_data(false);
        if page == END_OF_DATA {
            break;
        }
        if !page.is_empty() {
            println!("{page}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    device.stop_abort(None).await;
    Ok(())
}
