//! mosaicd - multi-camera mosaic daemon
//!
//! This daemon:
//! 1. Loads camera, display and label configuration (file + environment)
//! 2. Starts one acquisition worker per enabled camera
//! 3. Composes the tiled canvas on every new frame
//! 4. Writes the latest canvas to a PNG at a bounded rate
//! 5. Stops all streams on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camera_mosaic::{
    Canvas, DisplayPipeline, ErrorEvent, MosaicdConfig, PipelineOptions, RenderSurface,
    RtspConnector,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "MOSAIC_CONFIG")]
    config: Option<PathBuf>,
    /// Where the composited mosaic is written.
    #[arg(long, default_value = "mosaic.png")]
    out: PathBuf,
    /// Minimum time between PNG writes.
    #[arg(long, default_value_t = 1000)]
    snapshot_interval_ms: u64,
    /// Replace every camera address with a synthetic stub:// stream.
    #[arg(long)]
    stub: bool,
}

/// Writes the newest canvas to disk, at most once per interval.
struct PngSnapshotSurface {
    path: PathBuf,
    interval: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl PngSnapshotSurface {
    fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            last_write: Mutex::new(None),
        }
    }

    fn write(&self, canvas: &Canvas) -> Result<()> {
        let tmp = tmp_path(&self.path);
        canvas
            .image()
            .save_with_format(&tmp, image::ImageFormat::Png)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} to {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

impl RenderSurface for PngSnapshotSurface {
    fn present(&self, canvas: &Canvas) {
        let mut last_write = self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last_write.is_some_and(|at| at.elapsed() < self.interval) {
            return;
        }
        *last_write = Some(Instant::now());
        match self.write(canvas) {
            Ok(()) => log::debug!(
                "mosaic pass {} written to {}",
                canvas.pass,
                self.path.display()
            ),
            Err(err) => log::warn!("snapshot failed: {:#}", err),
        }
    }

    fn report(&self, event: &ErrorEvent) {
        log::warn!("{}", event);
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.snapshot_interval_ms == 0 {
        return Err(anyhow!("--snapshot-interval-ms must be at least 1"));
    }

    let mut config = MosaicdConfig::load_from(args.config.as_deref())?;
    if args.stub {
        config.use_stub_sources();
    }
    for stream in &config.streams {
        log::info!(
            "{}: {} ({})",
            stream.camera_id,
            stream.redacted_url(),
            if stream.enabled { "enabled" } else { "disabled" }
        );
    }

    let surface = Arc::new(PngSnapshotSurface::new(
        args.out.clone(),
        Duration::from_millis(args.snapshot_interval_ms),
    ));
    let connector = Arc::new(RtspConnector {
        target_fps: config.target_fps,
        width: config.stub_width,
        height: config.stub_height,
    });
    let mut pipeline = DisplayPipeline::new(
        config.streams.clone(),
        config.display,
        config.labels.clone(),
        surface,
        connector,
        PipelineOptions {
            backoff: config.backoff,
        },
    )?;
    pipeline.start_streams()?;

    let (width, height) = config.display.output_size();
    log::info!(
        "mosaicd running: {}x{} canvas, writing {}",
        width,
        height,
        args.out.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("mosaicd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    pipeline.shutdown()?;

    Ok(())
}
