//! End-to-end runs of the capture pipeline against synthetic cameras.
//!
//! Covers startup faults, lock-step rounds, skew reporting, grid layout,
//! cancellation and camera teardown.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use multicam_sync::{
    AlignmentPolicy, Camera, CameraDriver, CameraInfo, CaptureConfig, CaptureOutcome,
    CompositeFrame, CompositorConfig, Display, LifecycleStep, NoCamerasDetected, OverflowPolicy,
    PipelineConfig, PixelFormat, QueueConfig, RunController, RunFlag, SyntheticConfig,
    SyntheticDriver,
};

const CELL: u32 = 8;

#[derive(Clone, Debug)]
struct Presented {
    round: u64,
    cols: usize,
    rows: usize,
    width: u32,
    height: u32,
    skews: Vec<i64>,
    timestamps: Vec<u64>,
    padding_black: bool,
}

/// Display that records every composite and quits after `limit` of them.
struct RecordingDisplay {
    frames: Arc<Mutex<Vec<Presented>>>,
    limit: Option<usize>,
}

impl RecordingDisplay {
    fn new(limit: Option<usize>) -> (Self, Arc<Mutex<Vec<Presented>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                frames: frames.clone(),
                limit,
            },
            frames,
        )
    }
}

impl Display for RecordingDisplay {
    fn present(&mut self, frame: &CompositeFrame) -> Result<()> {
        let layout = frame.layout;
        let image = frame.image();
        let padding_black = layout.padding_positions().iter().all(|&(row, col)| {
            let x0 = col as u32 * layout.cell_width;
            let y0 = row as u32 * layout.cell_height;
            (y0..y0 + layout.cell_height)
                .all(|y| (x0..x0 + layout.cell_width).all(|x| image.pixel(x, y) == Some([0, 0, 0])))
        });
        self.frames.lock().unwrap().push(Presented {
            round: frame.round,
            cols: layout.cols,
            rows: layout.rows,
            width: image.width(),
            height: image.height(),
            skews: frame.skews_ns(),
            timestamps: frame.annotations.iter().map(|a| a.timestamp_ns).collect(),
            padding_black,
        });
        Ok(())
    }

    fn poll_quit(&mut self) -> bool {
        match self.limit {
            Some(limit) => self.frames.lock().unwrap().len() >= limit,
            None => false,
        }
    }
}

fn synthetic(cameras: usize) -> SyntheticConfig {
    SyntheticConfig {
        cameras,
        width: 16,
        height: 12,
        format: PixelFormat::Mono8,
        frame_interval: Duration::from_millis(2),
        ..SyntheticConfig::default()
    }
}

/// Blocking queues so no frame is lost and round k pairs frame k of every camera.
fn pipeline() -> PipelineConfig {
    PipelineConfig {
        queue: QueueConfig {
            capacity: 4,
            overflow: OverflowPolicy::Block {
                timeout: Duration::from_millis(200),
            },
        },
        capture: CaptureConfig {
            timeout: Duration::from_millis(200),
            cell_width: CELL,
            cell_height: CELL,
        },
        compositor: CompositorConfig {
            alignment: AlignmentPolicy::LockStep,
            idle_sleep: Duration::from_micros(200),
            cell_width: CELL,
            cell_height: CELL,
        },
    }
}

#[test]
fn zero_cameras_is_fatal_and_touches_nothing() {
    let driver = SyntheticDriver::new(synthetic(0));
    let lifecycle = driver.lifecycle();

    let err = match RunController::new(driver, pipeline()).prepare() {
        Ok(_) => panic!("prepare must fail without cameras"),
        Err(err) => err,
    };
    assert!(err.downcast_ref::<NoCamerasDetected>().is_some());
    assert!(lifecycle.events().is_empty());
}

#[test]
fn camera_init_failure_releases_started_cameras() {
    let config = SyntheticConfig {
        fail_initialize: Some(2),
        ..synthetic(3)
    };
    let driver = SyntheticDriver::new(config);
    let lifecycle = driver.lifecycle();

    assert!(RunController::new(driver, pipeline()).prepare().is_err());
    for camera in 0..2 {
        let steps = lifecycle.steps_for(camera);
        assert_eq!(steps.last(), Some(&LifecycleStep::Deinitialize));
        assert!(steps.contains(&LifecycleStep::EndAcquisition));
    }
    assert_eq!(lifecycle.count(LifecycleStep::BeginAcquisition), 2);
}

#[test]
fn lock_step_run_reports_skews_and_releases_cameras() {
    let config = SyntheticConfig {
        timestamp_step_ns: Some(1_000_000),
        clock_offsets_ns: vec![1_000, 1_500, 2_200],
        ..synthetic(3)
    };
    let driver = SyntheticDriver::new(config);
    let lifecycle = driver.lifecycle();
    let (display, frames) = RecordingDisplay::new(Some(5));

    let summary = RunController::new(driver, pipeline())
        .run(Box::new(display))
        .expect("run");

    assert_eq!(summary.cameras, 3);
    assert_eq!(summary.compositor.rounds, 5);
    assert!(summary.teardown_errors.is_empty());

    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 5);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.round, i as u64 + 1);
        assert_eq!(frame.skews, vec![0, 500, 1_200]);
        // every camera contributed its own k-th frame
        let k = frame.timestamps[0] - 1_000;
        assert_eq!(frame.timestamps, vec![1_000 + k, 1_500 + k, 2_200 + k]);
    }

    for camera in 0..3 {
        let steps = lifecycle.steps_for(camera);
        assert_eq!(
            &steps[steps.len() - 2..],
            &[LifecycleStep::EndAcquisition, LifecycleStep::Deinitialize]
        );
    }
}

#[test]
fn five_cameras_tile_into_three_by_two_with_blank_padding() {
    let driver = SyntheticDriver::new(synthetic(5));
    let (display, frames) = RecordingDisplay::new(Some(2));

    RunController::new(driver, pipeline())
        .run(Box::new(display))
        .expect("run");

    let frames = frames.lock().unwrap();
    let first = &frames[0];
    assert_eq!((first.cols, first.rows), (3, 2));
    assert_eq!((first.width, first.height), (3 * CELL, 2 * CELL));
    assert!(first.padding_black);
    assert_eq!(first.skews.len(), 5);
}

#[test]
fn no_composite_while_a_camera_is_silent() {
    // no camera ever completes a frame
    let config = SyntheticConfig {
        incomplete_every: Some(1),
        ..synthetic(2)
    };
    let driver = SyntheticDriver::new(config);
    let (display, frames) = RecordingDisplay::new(None);
    let run = RunFlag::new();

    let prepared = RunController::new(driver, pipeline())
        .prepare()
        .expect("prepare");
    let stopper = {
        let run = run.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            run.stop();
        })
    };
    let summary = prepared
        .run_with_flag(Box::new(display), run)
        .expect("run");
    stopper.join().unwrap();

    assert_eq!(summary.compositor.rounds, 0);
    assert!(frames.lock().unwrap().is_empty());
    assert!(summary.workers.iter().all(|w| w.frames == 0));
    assert!(summary.workers.iter().all(|w| w.incomplete > 0));
}

#[test]
fn external_stop_terminates_every_thread() {
    let driver = SyntheticDriver::new(synthetic(4));
    let lifecycle = driver.lifecycle();
    let (display, _frames) = RecordingDisplay::new(None);
    let run = RunFlag::new();

    let prepared = RunController::new(driver, pipeline())
        .prepare()
        .expect("prepare");
    let stopper = {
        let run = run.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            run.stop();
        })
    };
    let start = Instant::now();
    let summary = prepared
        .run_with_flag(Box::new(display), run)
        .expect("run");
    stopper.join().unwrap();

    // one driver wait plus one blocked push at most
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.workers.len(), 4);
    assert_eq!(summary.queues.len(), 4);
    assert_eq!(lifecycle.count(LifecycleStep::EndAcquisition), 4);
    assert_eq!(lifecycle.count(LifecycleStep::Deinitialize), 4);

    // every envelope a worker produced reached its queue, and nothing moves afterwards
    for (worker, queue) in summary.workers.iter().zip(&summary.queues) {
        assert_eq!(queue.pushed, worker.frames);
        assert_eq!(queue.pushed, queue.popped + queue.len as u64);
    }
    let events = lifecycle.events().len();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(lifecycle.events().len(), events);
}

#[test]
fn transient_faults_do_not_interrupt_the_view() {
    let config = SyntheticConfig {
        incomplete_every: Some(3),
        error_every: Some(5),
        ..synthetic(2)
    };
    let driver = SyntheticDriver::new(config);
    let (display, frames) = RecordingDisplay::new(Some(6));

    let summary = RunController::new(driver, pipeline())
        .run(Box::new(display))
        .expect("run");

    assert_eq!(frames.lock().unwrap().len(), 6);
    assert!(summary.workers.iter().any(|w| w.driver_errors > 0));
    assert!(summary.workers.iter().any(|w| w.incomplete > 0));
}

#[test]
fn window_alignment_only_presents_close_rounds() {
    let config = SyntheticConfig {
        timestamp_step_ns: Some(1_000),
        clock_offsets_ns: vec![0, 3_000],
        ..synthetic(2)
    };
    let mut pipeline = pipeline();
    pipeline.compositor.alignment = AlignmentPolicy::Window { tolerance_ns: 100 };
    let driver = SyntheticDriver::new(config);
    let (display, frames) = RecordingDisplay::new(Some(3));

    let summary = RunController::new(driver, pipeline)
        .run(Box::new(display))
        .expect("run");

    assert!(summary.compositor.discarded >= 3);
    for frame in frames.lock().unwrap().iter() {
        assert!(frame.skews[1].unsigned_abs() <= 100);
    }
}

#[test]
fn window_alignment_keeps_presenting_when_phases_never_meet() {
    let config = SyntheticConfig {
        timestamp_step_ns: Some(1_000),
        clock_offsets_ns: vec![0, 500],
        ..synthetic(2)
    };
    let mut pipeline = pipeline();
    pipeline.compositor.alignment = AlignmentPolicy::Window { tolerance_ns: 100 };
    let driver = SyntheticDriver::new(config);
    let (display, frames) = RecordingDisplay::new(Some(2));

    let summary = RunController::new(driver, pipeline)
        .run(Box::new(display))
        .expect("run");

    assert_eq!(frames.lock().unwrap().len(), 2);
    assert_eq!(summary.compositor.unaligned, 2);
    assert!(summary.compositor.discarded > 0);
}

/// Camera that delivers one frame, then panics inside the driver call.
struct PanickingCamera {
    info: CameraInfo,
    events: Arc<Mutex<Vec<&'static str>>>,
    captured: bool,
}

impl Camera for PanickingCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }
    fn configure_trigger(&mut self) -> Result<()> {
        Ok(())
    }
    fn begin_acquisition(&mut self) -> Result<()> {
        Ok(())
    }
    fn end_acquisition(&mut self) -> Result<()> {
        self.events.lock().unwrap().push("end");
        Ok(())
    }
    fn deinitialize(&mut self) -> Result<()> {
        self.events.lock().unwrap().push("deinit");
        Ok(())
    }
    fn trigger_and_capture(&mut self, _timeout: Duration) -> Result<CaptureOutcome> {
        if self.captured {
            panic!("driver fault");
        }
        self.captured = true;
        Ok(CaptureOutcome::Incomplete)
    }
}

struct PanickingDriver {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl CameraDriver for PanickingDriver {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn discover_cameras(&mut self) -> Result<Vec<Box<dyn Camera>>> {
        Ok(vec![Box::new(PanickingCamera {
            info: CameraInfo {
                serial: "PANIC-0".to_string(),
                model: "test".to_string(),
            },
            events: self.events.clone(),
            captured: false,
        })])
    }
}

#[test]
fn panicking_worker_still_releases_its_camera() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let driver = PanickingDriver {
        events: events.clone(),
    };
    let (display, _frames) = RecordingDisplay::new(None);
    let run = RunFlag::new();

    let prepared = RunController::new(driver, pipeline())
        .prepare()
        .expect("prepare");
    let stopper = {
        let run = run.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            run.stop();
        })
    };
    let result = prepared.run_with_flag(Box::new(display), run.clone());
    stopper.join().unwrap();

    let err = result.expect_err("a panicked worker fails the run");
    assert!(err.to_string().contains("camera 0 panicked: driver fault"));
    assert_eq!(*events.lock().unwrap(), vec!["end", "deinit"]);
    assert!(!run.is_running());
}

#[test]
fn dropping_a_prepared_run_releases_cameras() {
    let driver = SyntheticDriver::new(synthetic(2));
    let lifecycle = driver.lifecycle();

    let prepared = RunController::new(driver, pipeline())
        .prepare()
        .expect("prepare");
    assert_eq!(prepared.camera_count(), 2);
    drop(prepared);

    assert_eq!(lifecycle.count(LifecycleStep::EndAcquisition), 2);
    assert_eq!(lifecycle.count(LifecycleStep::Deinitialize), 2);
}
