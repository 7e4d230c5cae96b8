//! Synchronized compositor.
//!
//! The single consumer of every camera's `TransferQueue`. Each cycle it:
//! 1. Polls the queue of every camera that has no envelope for the current round yet
//! 2. Completes the round only when every camera has contributed one envelope
//! 3. Computes each camera's timestamp skew relative to camera 0
//! 4. Tiles the frames into a `ceil(sqrt(N))`-column grid, padding with black cells
//! 5. Presents the composite and polls the display for a quit request
//!
//! The compositor never blocks on a queue. When a round is incomplete it sleeps
//! for a short fixed interval and polls again.

use image::imageops;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::RunFlag;
use crate::display::Display;
use crate::frame::{FrameEnvelope, Image, DEFAULT_CELL_HEIGHT, DEFAULT_CELL_WIDTH};
use crate::queue::TransferQueue;

/// Pause between polls while a round is incomplete.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Default tolerance for `AlignmentPolicy::Window` (1 ms).
pub const DEFAULT_SYNC_TOLERANCE_NS: u64 = 1_000_000;

/// Consecutive out-of-window polls after which the window policy presents the
/// round it holds anyway.
pub const WINDOW_MAX_DISCARD_POLLS: u32 = 8;

/// How envelopes from different cameras are matched into a round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlignmentPolicy {
    /// A round completes as soon as every camera has one fresh envelope.
    #[default]
    LockStep,
    /// Like `LockStep`, but the round's timestamps must also lie within
    /// `tolerance_ns` of each other. Stale envelopes are discarded and refilled.
    /// Cameras whose phase never comes within the window still get a composite
    /// every `WINDOW_MAX_DISCARD_POLLS + 1` full sets.
    Window { tolerance_ns: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompositorConfig {
    pub alignment: AlignmentPolicy,
    pub idle_sleep: Duration,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            alignment: AlignmentPolicy::LockStep,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            cell_width: DEFAULT_CELL_WIDTH,
            cell_height: DEFAULT_CELL_HEIGHT,
        }
    }
}

// ----------------------------------------------------------------------------
// Grid layout
// ----------------------------------------------------------------------------

/// Row-major grid of equally sized cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridLayout {
    pub cameras: usize,
    pub cols: usize,
    pub rows: usize,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl GridLayout {
    /// `cols = ceil(sqrt(n))`, `rows = ceil(n / cols)`.
    pub fn for_cameras(cameras: usize, cell_width: u32, cell_height: u32) -> Self {
        let mut cols = 0;
        while cols * cols < cameras {
            cols += 1;
        }
        let rows = if cols == 0 {
            0
        } else {
            cameras.div_ceil(cols)
        };
        Self {
            cameras,
            cols,
            rows,
            cell_width,
            cell_height,
        }
    }

    pub fn cells(&self) -> usize {
        self.cols * self.rows
    }

    /// `(row, col)` of the cell at row-major position `index`.
    pub fn position(&self, index: usize) -> (usize, usize) {
        (index / self.cols.max(1), index % self.cols.max(1))
    }

    /// Pixel offset of the top-left corner of cell `index`.
    pub fn cell_origin(&self, index: usize) -> (u32, u32) {
        let (row, col) = self.position(index);
        (col as u32 * self.cell_width, row as u32 * self.cell_height)
    }

    /// `(row, col)` of every cell no camera fills.
    pub fn padding_positions(&self) -> Vec<(usize, usize)> {
        (self.cameras..self.cells())
            .map(|index| self.position(index))
            .collect()
    }

    pub fn width(&self) -> u32 {
        self.cols as u32 * self.cell_width
    }

    pub fn height(&self) -> u32 {
        self.rows as u32 * self.cell_height
    }
}

// ----------------------------------------------------------------------------
// Composite frame
// ----------------------------------------------------------------------------

/// Per-cell metadata drawn from the envelope that filled it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellAnnotation {
    pub camera_index: usize,
    pub timestamp_ns: u64,
    /// `timestamp_ns - timestamp_ns[camera 0]`; zero for camera 0.
    pub skew_ns: i64,
}

/// One presented grid.
pub struct CompositeFrame {
    pub round: u64,
    pub layout: GridLayout,
    pub annotations: Vec<CellAnnotation>,
    image: Image,
}

impl CompositeFrame {
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Skews in camera order.
    pub fn skews_ns(&self) -> Vec<i64> {
        self.annotations.iter().map(|a| a.skew_ns).collect()
    }

    /// Largest absolute skew in the round.
    pub fn max_abs_skew_ns(&self) -> u64 {
        self.annotations
            .iter()
            .map(|a| a.skew_ns.unsigned_abs())
            .max()
            .unwrap_or(0)
    }
}

/// Skew of every timestamp relative to the first one.
///
/// Differences wrap like the hardware counters they come from, so a camera
/// whose clock is behind camera 0 gets a negative skew.
pub fn compute_skews(timestamps: &[u64]) -> Vec<i64> {
    let Some(&reference) = timestamps.first() else {
        return Vec::new();
    };
    timestamps
        .iter()
        .map(|&ts| ts.wrapping_sub(reference) as i64)
        .collect()
}

/// Tile one round of envelopes (in camera order) into a composite.
///
/// Cells past the last camera stay black.
pub fn compose(round: u64, envelopes: Vec<FrameEnvelope>, layout: &GridLayout) -> CompositeFrame {
    let timestamps: Vec<u64> = envelopes.iter().map(|e| e.timestamp_ns).collect();
    let skews = compute_skews(&timestamps);

    let mut canvas = RgbImage::new(layout.width(), layout.height());
    let mut annotations = Vec::with_capacity(envelopes.len());
    for (slot, (envelope, skew_ns)) in envelopes.into_iter().zip(skews).enumerate() {
        let (image, timestamp_ns, camera_index) = envelope.into_parts();
        let image = image.fit_to(layout.cell_width, layout.cell_height);
        let (x, y) = layout.cell_origin(slot);
        imageops::replace(&mut canvas, image.as_rgb(), x as i64, y as i64);
        annotations.push(CellAnnotation {
            camera_index,
            timestamp_ns,
            skew_ns,
        });
    }

    CompositeFrame {
        round,
        layout: *layout,
        annotations,
        image: Image::from_rgb(canvas),
    }
}

// ----------------------------------------------------------------------------
// Round collection
// ----------------------------------------------------------------------------

/// Gathers one envelope per camera across polls.
///
/// An envelope collected for the current round is held in its camera's slot
/// until the round completes; it is never overwritten by a newer one.
pub struct RoundCollector {
    queues: Vec<Arc<TransferQueue>>,
    slots: Vec<Option<FrameEnvelope>>,
    alignment: AlignmentPolicy,
    discarded: u64,
    /// Out-of-window polls since the last completed round.
    misaligned_polls: u32,
    unaligned_rounds: u64,
}

impl RoundCollector {
    pub fn new(queues: Vec<Arc<TransferQueue>>, alignment: AlignmentPolicy) -> Self {
        let slots = queues.iter().map(|_| None).collect();
        Self {
            queues,
            slots,
            alignment,
            discarded: 0,
            misaligned_polls: 0,
            unaligned_rounds: 0,
        }
    }

    /// Cameras that already have an envelope for the current round.
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Envelopes thrown away by the window policy.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Rounds the window policy presented outside its tolerance.
    pub fn unaligned_rounds(&self) -> u64 {
        self.unaligned_rounds
    }

    /// Poll every empty slot once. Returns the round, in camera order, when complete.
    pub fn poll(&mut self) -> Option<Vec<FrameEnvelope>> {
        if self.queues.is_empty() {
            return None;
        }
        for (slot, queue) in self.slots.iter_mut().zip(&self.queues) {
            if slot.is_none() {
                *slot = queue.try_pop();
            }
        }
        if self.slots.iter().any(Option::is_none) {
            return None;
        }

        if let AlignmentPolicy::Window { tolerance_ns } = self.alignment {
            let stamps = self.slots.iter().flatten().map(|e| e.timestamp_ns);
            let newest = stamps.clone().max().unwrap_or(0);
            let oldest = stamps.min().unwrap_or(0);
            if newest - oldest > tolerance_ns {
                if self.misaligned_polls < WINDOW_MAX_DISCARD_POLLS {
                    self.misaligned_polls += 1;
                    let cutoff = newest - tolerance_ns;
                    for slot in self.slots.iter_mut() {
                        if slot.as_ref().is_some_and(|e| e.timestamp_ns < cutoff) {
                            *slot = None;
                            self.discarded += 1;
                        }
                    }
                    return None;
                }
                self.unaligned_rounds += 1;
                log::warn!(
                    "no round within {} ns after {} attempts, presenting spread of {} ns",
                    tolerance_ns,
                    self.misaligned_polls,
                    newest - oldest
                );
            }
        }

        self.misaligned_polls = 0;
        Some(self.slots.iter_mut().filter_map(Option::take).collect())
    }
}

// ----------------------------------------------------------------------------
// Compositor
// ----------------------------------------------------------------------------

/// What one compositor cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositorCycle {
    Presented,
    Waiting,
    Quit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompositorStats {
    pub rounds: u64,
    pub idle_cycles: u64,
    pub discarded: u64,
    /// Rounds presented outside the window tolerance.
    pub unaligned: u64,
    pub present_errors: u64,
}

pub struct SynchronizedCompositor {
    collector: RoundCollector,
    layout: GridLayout,
    display: Box<dyn Display>,
    run: RunFlag,
    idle_sleep: Duration,
    stats: CompositorStats,
}

impl SynchronizedCompositor {
    pub fn new(
        queues: Vec<Arc<TransferQueue>>,
        display: Box<dyn Display>,
        run: RunFlag,
        config: CompositorConfig,
    ) -> Self {
        let layout = GridLayout::for_cameras(queues.len(), config.cell_width, config.cell_height);
        Self {
            collector: RoundCollector::new(queues, config.alignment),
            layout,
            display,
            run,
            idle_sleep: config.idle_sleep,
            stats: CompositorStats::default(),
        }
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn stats(&self) -> CompositorStats {
        CompositorStats {
            discarded: self.collector.discarded(),
            unaligned: self.collector.unaligned_rounds(),
            ..self.stats
        }
    }

    /// Try to complete and present one round, then poll for quit.
    ///
    /// A quit request stops the run flag for every worker.
    pub fn cycle(&mut self) -> CompositorCycle {
        let mut outcome = CompositorCycle::Waiting;

        if let Some(envelopes) = self.collector.poll() {
            let oldest = envelopes.iter().map(|e| e.age()).max().unwrap_or_default();
            self.stats.rounds += 1;
            let frame = compose(self.stats.rounds, envelopes, &self.layout);
            log::debug!(
                "round {}: skews={:?} ns, oldest frame {:?}",
                frame.round,
                frame.skews_ns(),
                oldest
            );
            if let Err(e) = self.display.present(&frame) {
                self.stats.present_errors += 1;
                log::warn!("round {}: present failed: {:#}", frame.round, e);
            }
            outcome = CompositorCycle::Presented;
        }

        if self.display.poll_quit() {
            log::info!("quit requested after {} rounds", self.stats.rounds);
            self.run.stop();
            return CompositorCycle::Quit;
        }
        outcome
    }

    /// Cycle until quit or until the run flag is stopped elsewhere.
    pub fn run(mut self) -> CompositorStats {
        log::info!(
            "compositor started: {} cameras, {}x{} grid",
            self.layout.cameras,
            self.layout.cols,
            self.layout.rows
        );
        while self.run.is_running() {
            match self.cycle() {
                CompositorCycle::Presented => {}
                CompositorCycle::Waiting => {
                    self.stats.idle_cycles += 1;
                    std::thread::sleep(self.idle_sleep);
                }
                CompositorCycle::Quit => break,
            }
        }
        let stats = self.stats();
        log::info!(
            "compositor stopped: rounds={} idle_cycles={} discarded={}",
            stats.rounds,
            stats.idle_cycles,
            stats.discarded
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use anyhow::Result;
    use std::sync::Mutex;

    fn envelope(camera: usize, ts: u64, shade: u8) -> FrameEnvelope {
        let pixels = RgbImage::from_pixel(2, 2, image::Rgb([shade, shade, shade]));
        FrameEnvelope::new(Image::from_rgb(pixels), ts, camera)
    }

    fn queues(n: usize) -> Vec<Arc<TransferQueue>> {
        (0..n)
            .map(|_| Arc::new(TransferQueue::new(QueueConfig::default())))
            .collect()
    }

    /// Records rounds and asks to quit after `quit_after` presentations.
    struct CountingDisplay {
        presented: Arc<Mutex<Vec<Vec<i64>>>>,
        quit_after: usize,
    }

    impl Display for CountingDisplay {
        fn present(&mut self, frame: &CompositeFrame) -> Result<()> {
            self.presented.lock().unwrap().push(frame.skews_ns());
            Ok(())
        }

        fn poll_quit(&mut self) -> bool {
            self.presented.lock().unwrap().len() >= self.quit_after
        }
    }

    fn compositor(
        queues: Vec<Arc<TransferQueue>>,
        quit_after: usize,
        run: &RunFlag,
    ) -> (SynchronizedCompositor, Arc<Mutex<Vec<Vec<i64>>>>) {
        let presented = Arc::new(Mutex::new(Vec::new()));
        let display = CountingDisplay {
            presented: presented.clone(),
            quit_after,
        };
        let config = CompositorConfig {
            cell_width: 2,
            cell_height: 2,
            ..CompositorConfig::default()
        };
        (
            SynchronizedCompositor::new(queues, Box::new(display), run.clone(), config),
            presented,
        )
    }

    #[test]
    fn grid_for_five_cameras_is_three_by_two() {
        let layout = GridLayout::for_cameras(5, 640, 480);
        assert_eq!((layout.cols, layout.rows), (3, 2));
        assert_eq!(layout.padding_positions(), vec![(1, 2)]);
        assert_eq!((layout.width(), layout.height()), (1920, 960));
    }

    #[test]
    fn grid_shapes_for_common_counts() {
        let shape = |n| {
            let l = GridLayout::for_cameras(n, 1, 1);
            (l.cols, l.rows)
        };
        assert_eq!(shape(1), (1, 1));
        assert_eq!(shape(2), (2, 1));
        assert_eq!(shape(3), (2, 2));
        assert_eq!(shape(4), (2, 2));
        assert_eq!(shape(9), (3, 3));
        assert_eq!(shape(10), (4, 3));
        assert_eq!(shape(0), (0, 0));
    }

    #[test]
    fn skews_are_relative_to_camera_zero() {
        assert_eq!(compute_skews(&[1000, 1500, 2200]), vec![0, 500, 1200]);
        assert_eq!(compute_skews(&[2000, 1500]), vec![0, -500]);
        assert!(compute_skews(&[]).is_empty());
    }

    #[test]
    fn compose_places_cells_row_major_and_pads_blank() {
        let layout = GridLayout::for_cameras(5, 2, 2);
        let envelopes = (0..5)
            .map(|i| envelope(i, 1000 + i as u64 * 10, 50 + i as u8))
            .collect();
        let frame = compose(7, envelopes, &layout);

        assert_eq!(frame.round, 7);
        assert_eq!(frame.skews_ns(), vec![0, 10, 20, 30, 40]);
        let image = frame.image();
        assert_eq!((image.width(), image.height()), (6, 4));
        // camera 4 lands at row 1, col 1
        assert_eq!(image.pixel(3, 3), Some([54, 54, 54]));
        assert_eq!(image.pixel(4, 0), Some([52, 52, 52]));
        // padding cell at row 1, col 2
        for y in 2..4 {
            for x in 4..6 {
                assert_eq!(image.pixel(x, y), Some([0, 0, 0]));
            }
        }
    }

    #[test]
    fn compose_fits_mismatched_frames() {
        let layout = GridLayout::for_cameras(1, 4, 4);
        let frame = compose(1, vec![envelope(0, 1, 9)], &layout);
        assert_eq!(frame.image().pixel(3, 3), Some([9, 9, 9]));
    }

    #[test]
    fn lock_step_waits_for_every_camera() {
        let qs = queues(3);
        let mut collector = RoundCollector::new(qs.clone(), AlignmentPolicy::LockStep);

        qs[0].push(envelope(0, 10, 0));
        qs[1].push(envelope(1, 11, 0));
        assert!(collector.poll().is_none());
        assert_eq!(collector.filled(), 2);

        // a second frame from camera 0 stays queued, the held one is kept
        qs[0].push(envelope(0, 20, 0));
        assert!(collector.poll().is_none());
        assert_eq!(qs[0].len(), 1);

        qs[2].push(envelope(2, 12, 0));
        let round = collector.poll().unwrap();
        let stamps: Vec<u64> = round.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(stamps, vec![10, 11, 12]);
        assert_eq!(collector.filled(), 0);
        assert!(collector.poll().is_none());
    }

    #[test]
    fn window_policy_discards_stale_envelopes() {
        let qs = queues(2);
        let mut collector =
            RoundCollector::new(qs.clone(), AlignmentPolicy::Window { tolerance_ns: 100 });

        qs[0].push(envelope(0, 1_000, 0));
        qs[0].push(envelope(0, 1_500, 0));
        qs[1].push(envelope(1, 1_520, 0));

        assert!(collector.poll().is_none());
        assert_eq!(collector.discarded(), 1);

        let round = collector.poll().unwrap();
        let stamps: Vec<u64> = round.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(stamps, vec![1_500, 1_520]);
        assert_eq!(collector.unaligned_rounds(), 0);
    }

    #[test]
    fn window_policy_presents_when_phases_never_meet() {
        let qs = queues(2);
        let mut collector =
            RoundCollector::new(qs.clone(), AlignmentPolicy::Window { tolerance_ns: 100 });
        let feed = |k: u64| {
            qs[0].push(envelope(0, k * 1_000, 0));
            qs[1].push(envelope(1, k * 1_000 + 500, 0));
        };

        let mut presented = Vec::new();
        for k in 0..40 {
            feed(k);
            if let Some(round) = collector.poll() {
                presented.push(compute_skews(
                    &round.iter().map(|e| e.timestamp_ns).collect::<Vec<_>>(),
                ));
            }
        }

        assert!(!presented.is_empty());
        assert_eq!(collector.unaligned_rounds(), presented.len() as u64);
        assert!(presented.iter().all(|skews| skews[1].unsigned_abs() > 100));
        assert!(collector.discarded() >= WINDOW_MAX_DISCARD_POLLS as u64);
    }

    #[test]
    fn cycle_presents_one_composite_per_round() {
        let run = RunFlag::new();
        let qs = queues(2);
        let (mut comp, presented) = compositor(qs.clone(), usize::MAX, &run);

        assert_eq!(comp.cycle(), CompositorCycle::Waiting);
        qs[0].push(envelope(0, 100, 1));
        assert_eq!(comp.cycle(), CompositorCycle::Waiting);
        qs[1].push(envelope(1, 130, 1));
        assert_eq!(comp.cycle(), CompositorCycle::Presented);
        assert_eq!(comp.cycle(), CompositorCycle::Waiting);

        assert_eq!(*presented.lock().unwrap(), vec![vec![0, 30]]);
        assert_eq!(comp.stats().rounds, 1);
    }

    #[test]
    fn quit_stops_the_run_flag() {
        let run = RunFlag::new();
        let qs = queues(1);
        let (comp, presented) = compositor(qs.clone(), 2, &run);
        for ts in 0..5 {
            qs[0].push(envelope(0, ts, 0));
        }

        let stats = comp.run();
        assert_eq!(stats.rounds, 2);
        assert_eq!(presented.lock().unwrap().len(), 2);
        assert!(!run.is_running());
    }

    #[test]
    fn quit_is_polled_while_waiting() {
        let run = RunFlag::new();
        let (mut comp, _) = compositor(queues(2), 0, &run);
        assert_eq!(comp.cycle(), CompositorCycle::Quit);
        assert!(!run.is_running());
    }

    #[test]
    fn external_stop_ends_run() {
        let run = RunFlag::new();
        let (comp, presented) = compositor(queues(2), usize::MAX, &run);
        run.stop();
        let stats = comp.run();
        assert_eq!(stats.rounds, 0);
        assert!(presented.lock().unwrap().is_empty());
    }
}
