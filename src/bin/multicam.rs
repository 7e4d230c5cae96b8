//! multicam - synchronized multi-camera live view
//!
//! This binary:
//! 1. Discovers cameras and reports how many were found
//! 2. Initializes each camera for software trigger with hardware timestamps
//! 3. Waits for the user to start the feeds
//! 4. Runs one capture thread per camera plus the compositor until quit (Ctrl-C or frame limit)
//! 5. Ends acquisition and releases every camera

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use multicam_sync::config::{frame_interval_for, MulticamConfig};
use multicam_sync::{
    AlignmentPolicy, HeadlessDisplay, NoCamerasDetected, PixelFormat, RunController,
    SyntheticDriver,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of synthetic cameras (overrides config).
    #[arg(long)]
    cameras: Option<usize>,
    /// Synthetic capture rate per camera.
    #[arg(long)]
    fps: Option<u32>,
    /// Stop after this many composites (default: run until Ctrl-C).
    #[arg(long)]
    frames: Option<u64>,
    /// Synthetic pixel format: mono8, rgb8 or bgr8.
    #[arg(long)]
    format: Option<String>,
    /// Only present rounds whose timestamps lie within this window.
    #[arg(long)]
    tolerance_ns: Option<u64>,
    /// Start immediately instead of waiting for Enter.
    #[arg(long, short = 'y')]
    yes: bool,
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = MulticamConfig::load()?;
    if let Some(cameras) = args.cameras {
        cfg.synthetic.cameras = cameras;
    }
    if let Some(fps) = args.fps {
        cfg.synthetic.frame_interval = frame_interval_for(fps)?;
    }
    if let Some(format) = args.format.as_deref() {
        cfg.synthetic.format = PixelFormat::parse(format)?;
    }
    if let Some(tolerance_ns) = args.tolerance_ns {
        cfg.pipeline.compositor.alignment = AlignmentPolicy::Window { tolerance_ns };
    }

    let driver = SyntheticDriver::new(cfg.synthetic.clone());
    let prepared = match RunController::new(driver, cfg.pipeline).prepare() {
        Ok(prepared) => prepared,
        Err(err) if err.downcast_ref::<NoCamerasDetected>().is_some() => {
            println!("Number of cameras detected: 0");
            println!("No cameras detected!");
            prompt("Press Enter to exit...")?;
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err),
    };

    println!("Number of cameras detected: {}", prepared.camera_count());
    for (index, info) in prepared.camera_info().iter().enumerate() {
        println!("  [{}] {} {}", index, info.model, info.serial);
    }
    if !args.yes {
        prompt("Press Enter to start synchronized video feeds (Ctrl-C to stop)...")?;
    }

    let mut display = HeadlessDisplay::new();
    if let Some(limit) = args.frames {
        display = display.with_frame_limit(limit);
    }
    let quit = display.quit_handle();
    ctrlc::set_handler(move || {
        quit.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    let summary = prepared.run(Box::new(display))?;

    println!("run summary:");
    println!("  cameras: {}", summary.cameras);
    println!("  composites presented: {}", summary.compositor.rounds);
    println!("  frames captured: {}", summary.frames_captured());
    for (worker, queue) in summary.workers.iter().zip(&summary.queues) {
        println!(
            "  camera {}: frames={} incomplete={} errors={} dropped={}",
            worker.camera_index,
            worker.frames,
            worker.incomplete,
            worker.driver_errors + worker.decode_errors,
            queue.dropped
        );
    }
    for err in &summary.teardown_errors {
        println!("  teardown error: {}", err);
    }

    if !args.yes {
        prompt("Press Enter to exit...")?;
    }
    Ok(if summary.teardown_errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn prompt(message: &str) -> Result<()> {
    println!("{}", message);
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read from stdin")?;
    Ok(())
}
