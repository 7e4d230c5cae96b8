//! Synthetic camera driver.
//!
//! `SyntheticDriver` produces test-pattern cameras that behave like
//! software-triggered hardware:
//! - Each capture waits one frame interval before returning
//! - Timestamps come from a per-camera monotonic clock (wall or virtual)
//! - Incomplete frames and transport errors can be injected every k-th frame
//! - Every lifecycle call is recorded in a shared `LifecycleLog`
//!
//! Used by the `multicam` binary when no hardware driver is linked in, and by tests.

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{Camera, CameraDriver, CameraInfo, CaptureOutcome};
use crate::frame::{PixelFormat, RawImage};

/// Configuration for a set of synthetic cameras.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Number of cameras discovery reports.
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Time each trigger takes to deliver a frame.
    pub frame_interval: Duration,
    /// When set, timestamps advance by exactly this many nanoseconds per
    /// triggered frame instead of following the wall clock.
    pub timestamp_step_ns: Option<u64>,
    /// Per-camera clock offsets; cameras past the end of the list get zero.
    pub clock_offsets_ns: Vec<u64>,
    /// Upper bound of random jitter added to wall-clock timestamps.
    pub jitter_ns: u64,
    /// Deliver an incomplete frame every k-th trigger.
    pub incomplete_every: Option<u64>,
    /// Fail with a transport error every k-th trigger.
    pub error_every: Option<u64>,
    /// Camera index whose `initialize` fails.
    pub fail_initialize: Option<usize>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            cameras: 2,
            width: 640,
            height: 480,
            format: PixelFormat::Bgr8,
            frame_interval: Duration::from_millis(33),
            timestamp_step_ns: None,
            clock_offsets_ns: Vec::new(),
            jitter_ns: 0,
            incomplete_every: None,
            error_every: None,
            fail_initialize: None,
        }
    }
}

/// Lifecycle calls a synthetic camera records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleStep {
    Initialize,
    ConfigureTrigger,
    BeginAcquisition,
    EndAcquisition,
    Deinitialize,
}

/// Shared record of `(camera index, step)` in call order.
#[derive(Clone, Debug, Default)]
pub struct LifecycleLog {
    events: Arc<Mutex<Vec<(usize, LifecycleStep)>>>,
}

impl LifecycleLog {
    fn record(&self, camera: usize, step: LifecycleStep) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((camera, step));
    }

    pub fn events(&self) -> Vec<(usize, LifecycleStep)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, step: LifecycleStep) -> usize {
        self.events().iter().filter(|(_, s)| *s == step).count()
    }

    pub fn steps_for(&self, camera: usize) -> Vec<LifecycleStep> {
        self.events()
            .into_iter()
            .filter(|(c, _)| *c == camera)
            .map(|(_, s)| s)
            .collect()
    }
}

/// Driver that discovers `config.cameras` synthetic cameras.
pub struct SyntheticDriver {
    config: SyntheticConfig,
    log: LifecycleLog,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            log: LifecycleLog::default(),
        }
    }

    /// Handle to the lifecycle record shared with every camera this driver creates.
    pub fn lifecycle(&self) -> LifecycleLog {
        self.log.clone()
    }
}

impl CameraDriver for SyntheticDriver {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn discover_cameras(&mut self) -> Result<Vec<Box<dyn Camera>>> {
        let cameras = (0..self.config.cameras)
            .map(|index| {
                Box::new(SyntheticCamera::new(index, &self.config, self.log.clone()))
                    as Box<dyn Camera>
            })
            .collect();
        Ok(cameras)
    }
}

struct SyntheticCamera {
    index: usize,
    info: CameraInfo,
    config: SyntheticConfig,
    log: LifecycleLog,
    clock_offset_ns: u64,
    initialized: bool,
    acquiring: bool,
    started_at: Option<Instant>,
    frame_count: u64,
    last_timestamp_ns: u64,
    /// Simulated scene state so consecutive frames differ.
    scene_state: u8,
}

impl SyntheticCamera {
    fn new(index: usize, config: &SyntheticConfig, log: LifecycleLog) -> Self {
        Self {
            index,
            info: CameraInfo {
                serial: format!("SYN-{:04}", index),
                model: "synthetic".to_string(),
            },
            config: config.clone(),
            log,
            clock_offset_ns: config.clock_offsets_ns.get(index).copied().unwrap_or(0),
            initialized: false,
            acquiring: false,
            started_at: None,
            frame_count: 0,
            last_timestamp_ns: 0,
            scene_state: 0,
        }
    }

    fn next_timestamp(&mut self) -> u64 {
        let raw = match self.config.timestamp_step_ns {
            Some(step) => self
                .clock_offset_ns
                .saturating_add(self.frame_count.saturating_mul(step)),
            None => {
                let elapsed = self
                    .started_at
                    .map(|t| t.elapsed().as_nanos() as u64)
                    .unwrap_or(0);
                let jitter = if self.config.jitter_ns > 0 {
                    rand::thread_rng().gen_range(0..=self.config.jitter_ns)
                } else {
                    0
                };
                self.clock_offset_ns
                    .saturating_add(elapsed)
                    .saturating_add(jitter)
            }
        };
        // Jitter must never make the clock run backwards.
        let ts = raw.max(self.last_timestamp_ns);
        self.last_timestamp_ns = ts;
        ts
    }

    /// Moving gradient; the scene shifts every 50 frames.
    fn generate_pixels(&mut self) -> Vec<u8> {
        let len = (self.config.width as usize)
            * (self.config.height as usize)
            * self.config.format.channels();

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let seed = self.frame_count + self.scene_state as u64 + (self.index as u64) * 37;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + seed) % 256) as u8;
        }
        pixels
    }
}

impl Camera for SyntheticCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn initialize(&mut self) -> Result<()> {
        self.log.record(self.index, LifecycleStep::Initialize);
        if self.config.fail_initialize == Some(self.index) {
            bail!("synthetic camera {} refused to initialize", self.index);
        }
        self.initialized = true;
        log::debug!("synthetic camera {} initialized", self.index);
        Ok(())
    }

    fn configure_trigger(&mut self) -> Result<()> {
        self.log.record(self.index, LifecycleStep::ConfigureTrigger);
        if !self.initialized {
            bail!("synthetic camera {} is not initialized", self.index);
        }
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        self.log.record(self.index, LifecycleStep::BeginAcquisition);
        if !self.initialized {
            bail!("synthetic camera {} is not initialized", self.index);
        }
        self.acquiring = true;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        self.log.record(self.index, LifecycleStep::EndAcquisition);
        if !self.acquiring {
            bail!("synthetic camera {} is not acquiring", self.index);
        }
        self.acquiring = false;
        Ok(())
    }

    fn deinitialize(&mut self) -> Result<()> {
        self.log.record(self.index, LifecycleStep::Deinitialize);
        self.acquiring = false;
        self.initialized = false;
        Ok(())
    }

    fn trigger_and_capture(&mut self, timeout: Duration) -> Result<CaptureOutcome> {
        if !self.acquiring {
            bail!("synthetic camera {} is not acquiring", self.index);
        }
        if self.config.frame_interval > timeout {
            std::thread::sleep(timeout);
            return Err(anyhow!(
                "synthetic camera {} timed out after {:?}",
                self.index,
                timeout
            ));
        }
        if !self.config.frame_interval.is_zero() {
            std::thread::sleep(self.config.frame_interval);
        }

        self.frame_count += 1;
        if matches!(self.config.error_every, Some(k) if k > 0 && self.frame_count % k == 0) {
            bail!(
                "synthetic camera {}: simulated transport error on frame {}",
                self.index,
                self.frame_count
            );
        }
        if matches!(self.config.incomplete_every, Some(k) if k > 0 && self.frame_count % k == 0) {
            return Ok(CaptureOutcome::Incomplete);
        }

        let timestamp_ns = self.next_timestamp();
        let pixels = self.generate_pixels();
        Ok(CaptureOutcome::Frame {
            raw: RawImage::new(
                pixels,
                self.config.width,
                self.config.height,
                self.config.format,
            ),
            timestamp_ns,
        })
    }
}
