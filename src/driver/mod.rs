//! Camera driver boundary.
//!
//! This module defines what the capture pipeline needs from camera hardware:
//! - Discovery of attached cameras
//! - Per-camera lifecycle (initialize, trigger setup, acquisition start/stop)
//! - One software-triggered capture with a bounded wait
//!
//! Vendor SDK bindings live outside this crate and implement these traits.
//! `synthetic` provides test-pattern cameras for tests and demo runs.
//!
//! A `Camera` is moved into its capture worker's thread for the duration of a
//! run and handed back when the worker stops, so it only has to be `Send`.

use anyhow::Result;
use std::time::Duration;

use crate::frame::RawImage;

pub mod synthetic;

pub use synthetic::{LifecycleLog, LifecycleStep, SyntheticConfig, SyntheticDriver};

/// Identity of a discovered camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    pub serial: String,
    pub model: String,
}

/// Result of one trigger-and-wait.
pub enum CaptureOutcome {
    /// A complete frame and its hardware timestamp.
    Frame { raw: RawImage, timestamp_ns: u64 },
    /// The driver delivered a partial frame. Discard and trigger again.
    Incomplete,
}

/// One camera.
///
/// Errors returned from `trigger_and_capture` are hardware or transport faults;
/// the caller logs them and keeps going. Errors from the lifecycle methods are
/// fatal to the run.
pub trait Camera: Send {
    fn info(&self) -> &CameraInfo;

    fn initialize(&mut self) -> Result<()>;

    /// Put the camera in software-trigger mode with hardware timestamps enabled.
    fn configure_trigger(&mut self) -> Result<()>;

    fn begin_acquisition(&mut self) -> Result<()>;

    fn end_acquisition(&mut self) -> Result<()>;

    fn deinitialize(&mut self) -> Result<()>;

    /// Fire one software trigger and wait up to `timeout` for the frame.
    fn trigger_and_capture(&mut self, timeout: Duration) -> Result<CaptureOutcome>;
}

/// Source of cameras.
pub trait CameraDriver {
    /// Driver identifier for logs.
    fn name(&self) -> &'static str;

    /// Enumerate attached cameras. An empty list is not an error here.
    fn discover_cameras(&mut self) -> Result<Vec<Box<dyn Camera>>>;
}
