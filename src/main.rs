//! v4l2-stream binary: dumps raw frames from a capture device into a file.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use v4l2_stream::{CaptureConfig, Format, FourCC, StreamController};

/// Stream raw frames from a V4L2 capture device into a file
#[derive(Parser, Debug)]
#[command(name = "v4l2-stream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File that receives the raw frames
    output: PathBuf,

    /// Capture device node
    #[arg(short, long, default_value = v4l2_stream::config::DEFAULT_DEVICE)]
    device: PathBuf,

    /// Number of mmap buffers in the ring
    #[arg(short = 'n', long, default_value_t = v4l2_stream::config::DEFAULT_FRAME_COUNT)]
    frames: u32,

    /// Frame width in pixels
    #[arg(long, default_value_t = Format::DEFAULT_WIDTH)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = Format::DEFAULT_HEIGHT)]
    height: u32,

    /// Pixel format as four characters, e.g. YUYV or MJPG
    #[arg(long, default_value = "YUYV")]
    fourcc: FourCC,

    /// How long to stream before stopping
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Give up on a frame after this many milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = CaptureConfig::new(&args.device)
        .with_frame_count(args.frames)
        .with_format(Format::new(args.width, args.height, args.fourcc))
        .with_dequeue_timeout(Duration::from_millis(args.timeout_ms));

    let output = File::create(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let mut controller = StreamController::from_config(&config);
    controller
        .init(Some(config.effective_format()))
        .with_context(|| format!("failed to initialise {}", config.device.display()))?;
    controller
        .start(BufWriter::new(output))
        .context("failed to start streaming")?;

    info!(seconds = args.seconds, output = %args.output.display(), "streaming");
    thread::sleep(Duration::from_secs(args.seconds));

    let sink = controller.stop();
    controller.destroy();

    let stats = controller.stats();
    info!(
        cycles = stats.cycles,
        frames = stats.frames_written,
        bytes = stats.bytes_written,
        capture_errors = stats.capture_errors,
        write_errors = stats.write_errors,
        "done"
    );

    if let Some(sink) = sink {
        sink.into_inner()
            .map_err(|err| err.into_error())
            .context("failed to flush output")?;
    }
    Ok(())
}
