//! Run lifecycle.
//!
//! `RunController` brings every camera up, `PreparedRun` runs the threaded phase:
//! - one `capture-<i>` thread per camera running a `CaptureWorker`
//! - one `compositor` thread running the `SynchronizedCompositor`
//!
//! Shutdown order: join the compositor, stop the run flag (already stopped if
//! the compositor quit normally), join the workers, then end acquisition and
//! de-initialize every camera. Cameras are released on every path out of a
//! run, including startup failures, thread panics and dropping an unused
//! `PreparedRun`.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::cancel::RunFlag;
use crate::compositor::{CompositorConfig, CompositorStats, SynchronizedCompositor};
use crate::display::Display;
use crate::driver::{Camera, CameraDriver, CameraInfo};
use crate::queue::{QueueConfig, QueueStats, TransferQueue};
use crate::worker::{CaptureConfig, CaptureWorker, WorkerExit, WorkerStats};

/// Settings for every stage of the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub capture: CaptureConfig,
    pub compositor: CompositorConfig,
}

/// Discovery found nothing; no camera was touched and no thread started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoCamerasDetected;

impl fmt::Display for NoCamerasDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no cameras detected")
    }
}

impl std::error::Error for NoCamerasDetected {}

/// Outcome of a completed run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub cameras: usize,
    pub compositor: CompositorStats,
    /// One entry per camera whose worker thread joined cleanly, in camera order.
    pub workers: Vec<WorkerStats>,
    pub queues: Vec<QueueStats>,
    /// Errors from ending acquisition or de-initializing cameras.
    pub teardown_errors: Vec<String>,
}

impl RunSummary {
    pub fn frames_captured(&self) -> u64 {
        self.workers.iter().map(|w| w.frames).sum()
    }
}

pub struct RunController<D: CameraDriver> {
    driver: D,
    config: PipelineConfig,
}

impl<D: CameraDriver> RunController<D> {
    pub fn new(driver: D, config: PipelineConfig) -> Self {
        Self { driver, config }
    }

    /// Discover, initialize and start acquisition on every camera.
    ///
    /// Fails with `NoCamerasDetected` when discovery is empty. If any camera
    /// fails to come up, the ones already started are released again.
    pub fn prepare(mut self) -> Result<PreparedRun> {
        let discovered = self
            .driver
            .discover_cameras()
            .with_context(|| format!("discover cameras via {} driver", self.driver.name()))?;
        log::info!(
            "{} camera(s) detected via {} driver",
            discovered.len(),
            self.driver.name()
        );
        if discovered.is_empty() {
            return Err(NoCamerasDetected.into());
        }

        let mut ready: Vec<Box<dyn Camera>> = Vec::with_capacity(discovered.len());
        for (index, mut camera) in discovered.into_iter().enumerate() {
            if let Err(err) = bring_up(camera.as_mut()) {
                let serial = camera.info().serial.clone();
                if let Err(e) = camera.deinitialize() {
                    log::debug!("camera {} de-initialize after failed start: {:#}", index, e);
                }
                let errors = release_cameras(ready);
                if !errors.is_empty() {
                    log::warn!("{} error(s) releasing started cameras", errors.len());
                }
                return Err(err.context(format!("camera {} ({}) failed to start", index, serial)));
            }
            let info = camera.info();
            log::info!(
                "camera {} ({} {}) acquiring",
                index,
                info.model,
                info.serial
            );
            ready.push(camera);
        }

        Ok(PreparedRun {
            cameras: ready,
            config: self.config,
        })
    }

    /// `prepare` and `run` in one step, with no pause in between.
    pub fn run(self, display: Box<dyn Display>) -> Result<RunSummary> {
        self.prepare()?.run(display)
    }
}

/// Cameras that are acquiring and ready for the threaded phase.
pub struct PreparedRun {
    cameras: Vec<Box<dyn Camera>>,
    config: PipelineConfig,
}

impl PreparedRun {
    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn camera_info(&self) -> Vec<CameraInfo> {
        self.cameras.iter().map(|c| c.info().clone()).collect()
    }

    pub fn run(self, display: Box<dyn Display>) -> Result<RunSummary> {
        self.run_with_flag(display, RunFlag::new())
    }

    /// Run until the display asks to quit or `run` is stopped from outside.
    pub fn run_with_flag(mut self, display: Box<dyn Display>, run: RunFlag) -> Result<RunSummary> {
        let cameras = std::mem::take(&mut self.cameras);
        let config = self.config;
        let count = cameras.len();
        let queues: Vec<Arc<TransferQueue>> = (0..count)
            .map(|_| Arc::new(TransferQueue::new(config.queue)))
            .collect();

        let mut startup_error = None;
        let mut workers: Vec<JoinHandle<Option<WorkerExit>>> = Vec::with_capacity(count);
        let mut unstarted: Vec<Box<dyn Camera>> = Vec::new();
        let mut pending = cameras.into_iter().enumerate();
        for (index, camera) in pending.by_ref() {
            let worker = CaptureWorker::new(
                index,
                camera,
                queues[index].clone(),
                run.clone(),
                config.capture,
            );
            match spawn_worker(index, worker) {
                Ok(handle) => workers.push(handle),
                Err((e, camera)) => {
                    unstarted.extend(camera);
                    startup_error = Some(
                        anyhow::Error::new(e)
                            .context(format!("spawn capture thread for camera {}", index)),
                    );
                    break;
                }
            }
        }
        unstarted.extend(pending.map(|(_, camera)| camera));

        let compositor = if startup_error.is_none() {
            let compositor =
                SynchronizedCompositor::new(queues.clone(), display, run.clone(), config.compositor);
            match thread::Builder::new()
                .name("compositor".to_string())
                .spawn(move || compositor.run())
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    startup_error =
                        Some(anyhow::Error::new(e).context("spawn compositor thread"));
                    None
                }
            }
        } else {
            None
        };
        log::info!("started {} capture thread(s)", workers.len());

        let mut failures = Vec::new();
        let compositor_stats = match compositor {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                failures.push("compositor thread panicked".to_string());
                CompositorStats::default()
            }),
            None => CompositorStats::default(),
        };

        // Workers only stop on the flag, so it must be down whatever happened above.
        run.stop();

        let mut released = Vec::with_capacity(count);
        let mut worker_stats = Vec::with_capacity(count);
        for (index, handle) in workers.into_iter().enumerate() {
            match handle.join() {
                Ok(Some(exit)) => {
                    if let Some(message) = exit.panic {
                        failures.push(format!(
                            "capture thread for camera {} panicked: {}",
                            index, message
                        ));
                    }
                    released.push(exit.camera);
                    worker_stats.push(exit.stats);
                }
                Ok(None) => {
                    log::error!("capture thread for camera {} never received its worker", index);
                    failures.push(format!("capture thread for camera {} had no worker", index));
                }
                Err(_) => {
                    log::error!("capture thread for camera {} panicked", index);
                    failures.push(format!("capture thread for camera {} panicked", index));
                }
            }
        }
        released.extend(unstarted);
        let teardown_errors = release_cameras(released);
        let queue_stats = queues.iter().map(|q| q.stats()).collect();

        if let Some(err) = startup_error {
            return Err(err);
        }
        if !failures.is_empty() {
            bail!(failures.join("; "));
        }

        log::info!(
            "run finished: {} rounds from {} cameras",
            compositor_stats.rounds,
            count
        );
        Ok(RunSummary {
            cameras: count,
            compositor: compositor_stats,
            workers: worker_stats,
            queues: queue_stats,
            teardown_errors,
        })
    }
}

impl Drop for PreparedRun {
    fn drop(&mut self) {
        if self.cameras.is_empty() {
            return;
        }
        log::warn!(
            "prepared run dropped before starting, releasing {} camera(s)",
            self.cameras.len()
        );
        release_cameras(std::mem::take(&mut self.cameras));
    }
}

/// Spawn error plus the camera of the worker that never started.
type SpawnFailure = (std::io::Error, Option<Box<dyn Camera>>);

/// Spawn `capture-<index>`. On failure the worker's camera comes back with the error.
fn spawn_worker(
    index: usize,
    worker: CaptureWorker,
) -> std::result::Result<JoinHandle<Option<WorkerExit>>, SpawnFailure> {
    let slot = Arc::new(Mutex::new(Some(worker)));
    let handed = slot.clone();
    thread::Builder::new()
        .name(format!("capture-{}", index))
        .spawn(move || {
            let worker = handed.lock().unwrap_or_else(PoisonError::into_inner).take();
            worker.map(CaptureWorker::run)
        })
        .map_err(|e| {
            let worker = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            (e, worker.map(CaptureWorker::into_camera))
        })
}

fn bring_up(camera: &mut dyn Camera) -> Result<()> {
    camera.initialize().context("initialize")?;
    camera
        .configure_trigger()
        .context("configure software trigger and timestamps")?;
    camera.begin_acquisition().context("begin acquisition")?;
    Ok(())
}

/// End acquisition and de-initialize each camera, collecting (not stopping on) errors.
fn release_cameras(cameras: Vec<Box<dyn Camera>>) -> Vec<String> {
    let mut errors = Vec::new();
    for mut camera in cameras {
        let serial = camera.info().serial.clone();
        if let Err(e) = camera.end_acquisition() {
            log::error!("camera {}: end acquisition failed: {:#}", serial, e);
            errors.push(format!("camera {}: end acquisition: {:#}", serial, e));
        }
        if let Err(e) = camera.deinitialize() {
            log::error!("camera {}: de-initialize failed: {:#}", serial, e);
            errors.push(format!("camera {}: de-initialize: {:#}", serial, e));
        }
    }
    errors
}
