use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::compositor::{AlignmentPolicy, CompositorConfig, DEFAULT_IDLE_SLEEP};
use crate::controller::PipelineConfig;
use crate::driver::SyntheticConfig;
use crate::frame::{PixelFormat, DEFAULT_CELL_HEIGHT, DEFAULT_CELL_WIDTH};
use crate::queue::{OverflowPolicy, QueueConfig, DEFAULT_QUEUE_CAPACITY};
use crate::worker::{CaptureConfig, DEFAULT_CAPTURE_TIMEOUT};

const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 100;
const DEFAULT_SYNTHETIC_CAMERAS: usize = 2;
const DEFAULT_SYNTHETIC_FPS: u32 = 30;
const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MulticamConfigFile {
    queue: Option<QueueConfigFile>,
    capture: Option<CaptureConfigFile>,
    compositor: Option<CompositorConfigFile>,
    synthetic: Option<SyntheticConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct QueueConfigFile {
    capacity: Option<usize>,
    overflow: Option<String>,
    block_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    timeout_ms: Option<u64>,
    cell_width: Option<u32>,
    cell_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CompositorConfigFile {
    idle_sleep_us: Option<u64>,
    /// Enables window alignment when present.
    sync_tolerance_ns: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SyntheticConfigFile {
    cameras: Option<usize>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<PixelFormat>,
    clock_offsets_ns: Option<Vec<u64>>,
    jitter_ns: Option<u64>,
}

/// Fully resolved configuration for the `multicam` binary.
#[derive(Debug, Clone)]
pub struct MulticamConfig {
    pub pipeline: PipelineConfig,
    pub synthetic: SyntheticConfig,
}

impl MulticamConfig {
    /// Defaults, then the JSON file named by `MULTICAM_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MULTICAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MulticamConfigFile) -> Result<Self> {
        let queue_file = file.queue.unwrap_or_default();
        let overflow = parse_overflow(
            queue_file.overflow.as_deref().unwrap_or("drop-oldest"),
            Duration::from_millis(
                queue_file
                    .block_timeout_ms
                    .unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS),
            ),
        )?;
        let queue = QueueConfig {
            capacity: queue_file.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            overflow,
        };

        let capture_file = file.capture.unwrap_or_default();
        let cell_width = capture_file.cell_width.unwrap_or(DEFAULT_CELL_WIDTH);
        let cell_height = capture_file.cell_height.unwrap_or(DEFAULT_CELL_HEIGHT);
        let capture = CaptureConfig {
            timeout: capture_file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CAPTURE_TIMEOUT),
            cell_width,
            cell_height,
        };

        let compositor_file = file.compositor.unwrap_or_default();
        let compositor = CompositorConfig {
            alignment: alignment_for(compositor_file.sync_tolerance_ns),
            idle_sleep: compositor_file
                .idle_sleep_us
                .map(Duration::from_micros)
                .unwrap_or(DEFAULT_IDLE_SLEEP),
            cell_width,
            cell_height,
        };

        let synthetic_file = file.synthetic.unwrap_or_default();
        let fps = synthetic_file.fps.unwrap_or(DEFAULT_SYNTHETIC_FPS);
        let synthetic = SyntheticConfig {
            cameras: synthetic_file.cameras.unwrap_or(DEFAULT_SYNTHETIC_CAMERAS),
            width: synthetic_file.width.unwrap_or(DEFAULT_SYNTHETIC_WIDTH),
            height: synthetic_file.height.unwrap_or(DEFAULT_SYNTHETIC_HEIGHT),
            format: synthetic_file.format.unwrap_or(PixelFormat::Bgr8),
            frame_interval: frame_interval_for(fps)?,
            clock_offsets_ns: synthetic_file.clock_offsets_ns.unwrap_or_default(),
            jitter_ns: synthetic_file.jitter_ns.unwrap_or(0),
            ..SyntheticConfig::default()
        };

        Ok(Self {
            pipeline: PipelineConfig {
                queue,
                capture,
                compositor,
            },
            synthetic,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(cameras) = std::env::var("MULTICAM_CAMERAS") {
            self.synthetic.cameras = cameras
                .trim()
                .parse()
                .map_err(|_| anyhow!("MULTICAM_CAMERAS must be a non-negative integer"))?;
        }
        if let Ok(capacity) = std::env::var("MULTICAM_QUEUE_CAPACITY") {
            self.pipeline.queue.capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("MULTICAM_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Ok(overflow) = std::env::var("MULTICAM_OVERFLOW") {
            if !overflow.trim().is_empty() {
                let timeout = match self.pipeline.queue.overflow {
                    OverflowPolicy::Block { timeout } => timeout,
                    OverflowPolicy::DropOldest => {
                        Duration::from_millis(DEFAULT_BLOCK_TIMEOUT_MS)
                    }
                };
                self.pipeline.queue.overflow = parse_overflow(&overflow, timeout)?;
            }
        }
        if let Ok(timeout) = std::env::var("MULTICAM_CAPTURE_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("MULTICAM_CAPTURE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.pipeline.capture.timeout = Duration::from_millis(ms);
        }
        if let Ok(tolerance) = std::env::var("MULTICAM_SYNC_TOLERANCE_NS") {
            let ns: u64 = tolerance.trim().parse().map_err(|_| {
                anyhow!("MULTICAM_SYNC_TOLERANCE_NS must be an integer number of nanoseconds")
            })?;
            self.pipeline.compositor.alignment = alignment_for(Some(ns));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.queue.capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if self.pipeline.capture.timeout.is_zero() {
            return Err(anyhow!("capture timeout must be greater than zero"));
        }
        let capture = &self.pipeline.capture;
        if capture.cell_width == 0 || capture.cell_height == 0 {
            return Err(anyhow!(
                "cell size must be non-zero (got {}x{})",
                capture.cell_width,
                capture.cell_height
            ));
        }
        if self.synthetic.width == 0 || self.synthetic.height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        Ok(())
    }
}

/// `drop-oldest` or `block`; `timeout` applies to `block`.
pub fn parse_overflow(value: &str, timeout: Duration) -> Result<OverflowPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
        "block" => Ok(OverflowPolicy::Block { timeout }),
        other => Err(anyhow!(
            "unknown overflow policy '{}' (expected drop-oldest or block)",
            other
        )),
    }
}

/// Synthetic frame interval for a target rate.
pub fn frame_interval_for(fps: u32) -> Result<Duration> {
    if fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    Ok(Duration::from_nanos(1_000_000_000 / fps as u64))
}

fn alignment_for(tolerance_ns: Option<u64>) -> AlignmentPolicy {
    match tolerance_ns {
        Some(tolerance_ns) => AlignmentPolicy::Window { tolerance_ns },
        None => AlignmentPolicy::LockStep,
    }
}

fn read_config_file(path: &Path) -> Result<MulticamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
