//! Display boundary.
//!
//! The compositor calls `present` once per completed round and `poll_quit` once
//! per cycle. Windowing toolkits implement `Display` outside this crate.
//! `HeadlessDisplay` is the built-in implementation: it logs what it is shown
//! and quits on a frame limit or an external quit request (Ctrl-C).

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compositor::CompositeFrame;

pub trait Display: Send {
    fn present(&mut self, frame: &CompositeFrame) -> Result<()>;

    /// Non-blocking. `true` once the user asked to stop.
    fn poll_quit(&mut self) -> bool;
}

/// Display that renders nowhere and logs a periodic summary.
pub struct HeadlessDisplay {
    frame_limit: Option<u64>,
    presented: u64,
    quit: Arc<AtomicBool>,
    summary_interval: Duration,
    last_summary: Instant,
    rounds_since_summary: u64,
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self {
            frame_limit: None,
            presented: 0,
            quit: Arc::new(AtomicBool::new(false)),
            summary_interval: Duration::from_secs(5),
            last_summary: Instant::now(),
            rounds_since_summary: 0,
        }
    }

    /// Request quit after `limit` composites have been presented.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn with_summary_interval(mut self, interval: Duration) -> Self {
        self.summary_interval = interval;
        self
    }

    /// Flag that makes the next `poll_quit` return `true` once set.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl Default for HeadlessDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HeadlessDisplay {
    fn present(&mut self, frame: &CompositeFrame) -> Result<()> {
        self.presented += 1;
        self.rounds_since_summary += 1;

        if self.last_summary.elapsed() >= self.summary_interval {
            let secs = self.last_summary.elapsed().as_secs_f64();
            let image = frame.image();
            log::info!(
                "round {}: {}x{} grid ({}x{} px), {:.1} composites/s, max skew {} ns",
                frame.round,
                frame.layout.cols,
                frame.layout.rows,
                image.width(),
                image.height(),
                self.rounds_since_summary as f64 / secs.max(f64::EPSILON),
                frame.max_abs_skew_ns()
            );
            for line in cell_captions(frame) {
                log::info!("  {}", line);
            }
            self.last_summary = Instant::now();
            self.rounds_since_summary = 0;
        }
        Ok(())
    }

    fn poll_quit(&mut self) -> bool {
        if self.quit.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.frame_limit, Some(limit) if self.presented >= limit)
    }
}

/// One caption per camera cell: its hardware timestamp and skew against camera 0.
pub fn cell_captions(frame: &CompositeFrame) -> Vec<String> {
    frame
        .annotations
        .iter()
        .map(|a| {
            format!(
                "cam {}: timestamp {} ns, diff with cam 0 {:+} ns",
                a.camera_index, a.timestamp_ns, a.skew_ns
            )
        })
        .collect()
}
