//! Stereo-cam-capture binary: capture synchronized frame pairs to disk.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::Layer;

use stereo_cam_capture::config::ScanKind;
use stereo_cam_capture::{prepare, CaptureConfig, FileSink, SyncCapture, V4L2Device};

/// Capture synchronized MJPEG pairs from two V4L2 cameras
#[derive(Parser, Debug)]
#[command(
    name = "stereo-cam-capture",
    version,
    about = "Synchronized dual-camera MJPEG capture",
    long_about = "Captures frame pairs from a primary and a secondary V4L2 camera, \
                  discards the stale leading pairs, splices the standard Huffman \
                  tables into each frame and writes 0.jpg and 1.jpg."
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "STEREO_CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the primary device path
    #[arg(long)]
    primary: Option<PathBuf>,

    /// Override the secondary device path
    #[arg(long)]
    secondary: Option<PathBuf>,

    /// Number of pairs to capture
    #[arg(short = 'n', long)]
    frames: Option<u32>,

    /// Number of leading pairs to discard
    #[arg(long)]
    skip: Option<u32>,

    /// Directory receiving 0.jpg and 1.jpg
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Give up on a buffer reclaim after this many milliseconds
    #[arg(long, env = "STEREO_CAPTURE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Start-of-scan marker search
    #[arg(long, value_enum)]
    scan: Option<ScanKind>,

    /// Prime the primary camera before every pair
    #[arg(long)]
    prime_every_pair: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, env = "STEREO_CAPTURE_VERBOSE")]
    verbose: u8,

    /// Suppress all output except warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact", env = "STEREO_CAPTURE_LOG_FORMAT")]
    log_format: LogFormat,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

impl Cli {
    /// Load the configuration file, if any, and apply command-line overrides.
    fn config(&self) -> Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CaptureConfig::default(),
        };

        if let Some(primary) = &self.primary {
            config.devices.primary.clone_from(primary);
        }
        if let Some(secondary) = &self.secondary {
            config.devices.secondary.clone_from(secondary);
        }
        if let Some(frames) = self.frames {
            config.frames = frames;
        }
        if let Some(skip) = self.skip {
            config.skip = skip;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if self.timeout_ms.is_some() {
            config.reclaim_timeout_ms = self.timeout_ms;
        }
        if let Some(scan) = self.scan {
            config.scan = scan;
        }
        config.prime_every_pair |= self.prime_every_pair;

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }

    if let Err(err) = run(&cli) {
        error!(error = %format!("{err:#}"), "Capture failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        primary = %config.devices.primary.display(),
        secondary = %config.devices.secondary.display(),
        frames = config.frames,
        skip = config.skip,
        "Stereo capture starting"
    );

    let setup = config.device_setup()?;
    let mut primary = open_device(&config.devices.primary)?;
    let mut secondary = open_device(&config.devices.secondary)?;
    prepare(&mut primary, &setup).context("preparing primary device")?;
    prepare(&mut secondary, &setup).context("preparing secondary device")?;

    let mut sink = FileSink::new(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;
    let capture = SyncCapture::new(config.settings()).with_scan(config.scan.build());
    let report = capture.run(&mut primary, &mut secondary, &mut sink)?;

    primary.close().context("closing primary device")?;
    secondary.close().context("closing secondary device")?;

    println!(
        "Captured {} pairs, wrote {} to {}",
        report.captured,
        report.delivered,
        sink.dir().display()
    );
    Ok(())
}

fn open_device(path: &std::path::Path) -> Result<V4L2Device> {
    let path = path
        .to_str()
        .with_context(|| format!("device path {} is not UTF-8", path.display()))?;
    Ok(V4L2Device::open(path)?)
}

/// Initialize logging based on CLI options
fn init_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else {
        let default_level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let fmt_layer = match cli.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}
