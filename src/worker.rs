//! Per-camera capture worker.
//!
//! One `CaptureWorker` runs on its own thread per camera. Each cycle walks
//! `Triggering -> Capturing -> Decoding -> Enqueuing` and pushes at most one
//! envelope to the camera's `TransferQueue`, then returns to `Triggering`.
//!
//! Faults inside a cycle are local: an incomplete frame is retried at once, a
//! driver error or undecodable buffer is logged and the loop carries on. Only
//! the run flag ends the loop. A panic inside the loop is caught so the camera
//! still goes back to the controller for release; it also stops the run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::RunFlag;
use crate::driver::{Camera, CaptureOutcome};
use crate::frame::{decode, FrameEnvelope, DEFAULT_CELL_HEIGHT, DEFAULT_CELL_WIDTH};
use crate::queue::{PushOutcome, TransferQueue};

/// Default bounded wait for a triggered frame.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Capture settings shared by all workers of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Bounded wait passed to the driver for each trigger.
    pub timeout: Duration,
    /// Frames are fitted to this size right after decode.
    pub cell_width: u32,
    pub cell_height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CAPTURE_TIMEOUT,
            cell_width: DEFAULT_CELL_WIDTH,
            cell_height: DEFAULT_CELL_HEIGHT,
        }
    }
}

/// Where a worker is in its capture cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    /// Between cycles, about to fire the next trigger. The driver fires the
    /// trigger and waits for the frame in one call, reported as `Capturing`.
    Triggering,
    Capturing,
    Decoding,
    Enqueuing,
    Stopped,
}

/// What one cycle produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Enqueued,
    Incomplete,
    DriverError,
    DecodeError,
    /// Timestamp went backwards; envelope dropped to keep the queue ordered.
    OutOfOrder,
    /// The queue refused the envelope (blocking overflow policy timed out).
    Rejected,
}

/// Counters for one worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub camera_index: usize,
    /// Envelopes handed to the queue.
    pub frames: u64,
    pub incomplete: u64,
    pub driver_errors: u64,
    pub decode_errors: u64,
    pub out_of_order: u64,
    /// Envelopes lost to queue overflow (evicted or rejected).
    pub overflow: u64,
}

/// What a worker hands back when its loop ends.
pub struct WorkerExit {
    pub camera: Box<dyn Camera>,
    pub stats: WorkerStats,
    /// Panic message when the capture loop unwound.
    pub panic: Option<String>,
}

pub struct CaptureWorker {
    camera_index: usize,
    camera: Box<dyn Camera>,
    queue: Arc<TransferQueue>,
    run: RunFlag,
    config: CaptureConfig,
    state: WorkerState,
    stats: WorkerStats,
    last_timestamp_ns: Option<u64>,
}

impl CaptureWorker {
    pub fn new(
        camera_index: usize,
        camera: Box<dyn Camera>,
        queue: Arc<TransferQueue>,
        run: RunFlag,
        config: CaptureConfig,
    ) -> Self {
        Self {
            camera_index,
            camera,
            queue,
            run,
            config,
            state: WorkerState::Idle,
            stats: WorkerStats {
                camera_index,
                ..WorkerStats::default()
            },
            last_timestamp_ns: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Run one trigger/capture/decode/enqueue cycle. Leaves the worker in
    /// `Triggering`, ready for the next one.
    pub fn cycle(&mut self) -> CycleOutcome {
        self.state = WorkerState::Triggering;
        let outcome = self.capture_once();
        self.state = WorkerState::Triggering;
        outcome
    }

    fn capture_once(&mut self) -> CycleOutcome {
        let timeout = self.config.timeout;
        self.state = WorkerState::Capturing;
        let (raw, timestamp_ns) = match self.camera.trigger_and_capture(timeout) {
            Ok(CaptureOutcome::Frame { raw, timestamp_ns }) => (raw, timestamp_ns),
            Ok(CaptureOutcome::Incomplete) => {
                self.stats.incomplete += 1;
                log::debug!("camera {}: incomplete frame discarded", self.camera_index);
                return CycleOutcome::Incomplete;
            }
            Err(e) => {
                self.stats.driver_errors += 1;
                log::warn!("camera {}: capture failed: {:#}", self.camera_index, e);
                return CycleOutcome::DriverError;
            }
        };

        self.state = WorkerState::Decoding;
        let image = match decode(raw) {
            Ok(image) => image.fit_to(self.config.cell_width, self.config.cell_height),
            Err(e) => {
                self.stats.decode_errors += 1;
                log::warn!("camera {}: decode failed: {:#}", self.camera_index, e);
                return CycleOutcome::DecodeError;
            }
        };

        if let Some(last) = self.last_timestamp_ns {
            if timestamp_ns < last {
                self.stats.out_of_order += 1;
                log::warn!(
                    "camera {}: timestamp {} ns precedes previous {} ns, frame dropped",
                    self.camera_index,
                    timestamp_ns,
                    last
                );
                return CycleOutcome::OutOfOrder;
            }
        }

        self.state = WorkerState::Enqueuing;
        let envelope = FrameEnvelope::new(image, timestamp_ns, self.camera_index);
        match self.queue.push(envelope) {
            PushOutcome::Queued => {}
            PushOutcome::EvictedOldest => {
                self.stats.overflow += 1;
                log::debug!(
                    "camera {}: queue full, oldest frame evicted",
                    self.camera_index
                );
            }
            PushOutcome::Rejected => {
                self.stats.overflow += 1;
                log::warn!(
                    "camera {}: queue full for {:?}, frame dropped",
                    self.camera_index,
                    self.queue.overflow_policy()
                );
                return CycleOutcome::Rejected;
            }
        }
        self.last_timestamp_ns = Some(timestamp_ns);
        self.stats.frames += 1;
        CycleOutcome::Enqueued
    }

    /// Give up the camera without running, e.g. when the worker thread could not start.
    pub fn into_camera(self) -> Box<dyn Camera> {
        self.camera
    }

    /// Loop until the run flag stops, then hand the camera back to the caller.
    pub fn run(mut self) -> WorkerExit {
        log::info!(
            "camera {} ({}) capture started",
            self.camera_index,
            self.camera.info().serial
        );
        let looped = panic::catch_unwind(AssertUnwindSafe(|| {
            while self.run.is_running() {
                self.cycle();
            }
        }));
        let panic = looped.err().map(|payload| panic_message(payload.as_ref()));
        if let Some(message) = &panic {
            log::error!(
                "camera {} capture loop panicked: {}",
                self.camera_index,
                message
            );
            self.run.stop();
        }
        self.state = WorkerState::Stopped;
        log::info!(
            "camera {} capture stopped: frames={} incomplete={} errors={} overflow={}",
            self.camera_index,
            self.stats.frames,
            self.stats.incomplete,
            self.stats.driver_errors + self.stats.decode_errors,
            self.stats.overflow
        );
        WorkerExit {
            camera: self.camera,
            stats: self.stats,
            panic,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
