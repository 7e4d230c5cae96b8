//! Multi-camera synchronized capture.
//!
//! This crate captures frames from N independently triggered cameras, aligns
//! them by hardware timestamp, and presents them as one composite grid.
//!
//! # Architecture
//!
//! ```text
//! CaptureWorker[i] --push--> TransferQueue[i] --try_pop--> SynchronizedCompositor --> Display
//! ```
//!
//! - One capture thread per camera, one compositor thread, started and joined by `RunController`.
//! - Each queue has exactly one producer and one consumer.
//! - A round completes only when every camera has contributed one fresh frame.
//! - The compositor owns the quit decision and broadcasts it through the `RunFlag`.
//!
//! # Module Structure
//!
//! - `frame`: Image containers and decode (RawImage, Image, FrameEnvelope)
//! - `queue`: Bounded per-camera transfer queue
//! - `cancel`: Cooperative run flag
//! - `driver`: Camera boundary traits and the synthetic driver
//! - `worker`: Per-camera capture loop
//! - `compositor`: Round collection, skew computation, grid composition
//! - `display`: Display boundary and the headless display
//! - `controller`: Run lifecycle
//! - `config`: File + environment configuration

pub mod cancel;
pub mod compositor;
pub mod config;
pub mod controller;
pub mod display;
pub mod driver;
pub mod frame;
pub mod queue;
pub mod worker;

pub use cancel::RunFlag;
pub use compositor::{
    compose, compute_skews, AlignmentPolicy, CellAnnotation, CompositeFrame, CompositorConfig,
    CompositorStats, GridLayout, RoundCollector, SynchronizedCompositor,
};
pub use config::MulticamConfig;
pub use controller::{NoCamerasDetected, PipelineConfig, PreparedRun, RunController, RunSummary};
pub use display::{cell_captions, Display, HeadlessDisplay};
pub use driver::{
    Camera, CameraDriver, CameraInfo, CaptureOutcome, LifecycleLog, LifecycleStep,
    SyntheticConfig, SyntheticDriver,
};
pub use frame::{decode, FrameEnvelope, Image, PixelFormat, RawImage};
pub use queue::{OverflowPolicy, PushOutcome, QueueConfig, QueueStats, TransferQueue};
pub use worker::{CaptureConfig, CaptureWorker, WorkerExit, WorkerState, WorkerStats};
