//! Framegrab: headless frame acquisition CLI.

use anyhow::{bail, Context, Result};
use clap::Parser;
use framegrab::backend::list_devices;
use framegrab::utils::FpsCounter;
use framegrab::{open_source, ColorMode, CropRect, SourceConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Grab frames from a camera, video file or image.
#[derive(Parser, Debug)]
#[command(name = "framegrab")]
#[command(about = "Acquire frames from IIDC/V4L2 cameras, video files and still images")]
struct Args {
    /// Source path or URI (e.g. /dev/video0, iidc:, clip.mp4, synthetic:?fps=30)
    source: Option<String>,

    /// YAML source configuration; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Deliver 8-bit grayscale instead of RGB
    #[arg(short, long)]
    grayscale: bool,

    /// Crop rectangle applied before scaling, as x,y,w,h
    #[arg(long, value_parser = parse_crop)]
    crop: Option<CropRect>,

    /// Output scale factor
    #[arg(long)]
    scale: Option<f64>,

    /// Deliver the latest frame every N milliseconds instead of every frame
    #[arg(short, long)]
    interval_ms: Option<u64>,

    /// Requested capture width
    #[arg(long)]
    width: Option<u32>,

    /// Requested capture height
    #[arg(long)]
    height: Option<u32>,

    /// Requested capture frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Release all IIDC bus bandwidth before opening the camera
    #[arg(long)]
    reset_bus: bool,

    /// Directory to save PNG snapshots into
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Save every Nth delivered frame
    #[arg(long, default_value = "30")]
    save_every: u64,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

fn parse_crop(s: &str) -> std::result::Result<CropRect, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid crop '{}': {}", s, e))?;
    match parts.as_slice() {
        &[x, y, w, h] => Ok(CropRect::new(x, y, w, h)),
        _ => Err(format!("crop needs four values x,y,w,h, got '{}'", s)),
    }
}

impl Args {
    /// Loads the config file if given and applies flag overrides on top.
    fn source_config(&self) -> Result<SourceConfig> {
        let mut config = match &self.config {
            Some(path) => SourceConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => SourceConfig::default(),
        };

        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if self.grayscale {
            config.mode = ColorMode::Grayscale;
        }
        if let Some(crop) = self.crop {
            config.crop = crop;
        }
        if let Some(scale) = self.scale {
            config.scale = scale;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.interval_ms = interval_ms;
        }
        if self.width.is_some() {
            config.width = self.width;
        }
        if self.height.is_some() {
            config.height = self.height;
        }
        if self.fps.is_some() {
            config.fps = self.fps;
        }
        if self.reset_bus {
            config.reset_bus = true;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // List devices mode
    if args.list_devices {
        let devices = list_devices();
        if devices.is_empty() {
            println!("No cameras found");
        } else {
            println!("Available cameras:");
            for device in devices {
                println!("  [{}] {}", device.id, device.name);
            }
        }
        return Ok(());
    }

    if args.save_every == 0 {
        bail!("--save-every must be at least 1");
    }
    if let Some(dir) = &args.save_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let config = args.source_config()?;
    let source = open_source(&config).with_context(|| format!("opening {}", config.source))?;
    println!("{}", source.description());
    let (width, height) = source.output_size();
    info!("Delivering {}x{} {:?} frames", width, height, source.color_mode());

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let delivered = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicBool::new(false));

    let callback = {
        let running = running.clone();
        let delivered = delivered.clone();
        let failed = failed.clone();
        let save_dir = args.save_dir.clone();
        let save_every = args.save_every;
        let limit = args.frames;
        let mut fps_counter = FpsCounter::new();

        move |frame: Option<framegrab::Delivered<'_>>| {
            let Some(frame) = frame else {
                failed.store(true, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
                return;
            };

            let count = delivered.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(fps) = fps_counter.update() {
                info!("FPS: {:.1} (t={} us)", fps, frame.timestamp_us);
            }
            if let Some(dir) = &save_dir {
                if count % save_every == 0 {
                    let path = dir.join(format!("frame_{:06}.png", count));
                    if let Err(e) = frame.buffer.save(&path) {
                        error!("Failed to save {:?}: {}", path, e);
                    }
                }
            }
            if limit.is_some_and(|limit| count >= limit) {
                running.store(false, Ordering::SeqCst);
            }
        }
    };

    source.start_delivery(config.interval(), callback)?;

    while running.load(Ordering::SeqCst) && source.is_delivering() {
        thread::sleep(Duration::from_millis(50));
    }

    source.stop_delivery();
    let stats = source.stats();
    info!(
        "Delivered {} frames ({} purged, {} dequeue failures)",
        delivered.load(Ordering::SeqCst),
        stats.purged,
        stats.dequeue_failures
    );

    if failed.load(Ordering::SeqCst) {
        warn!("Acquisition stopped on an error");
        bail!("acquisition failed");
    }
    Ok(())
}
