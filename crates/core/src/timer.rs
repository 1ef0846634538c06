//! Frame timing for periodic frame-rate reports.

use std::time::{Duration, Instant};

/// Summary of the frames counted during one report interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    /// Frames counted in the interval.
    pub frames: u32,
    /// Frames per second over the interval.
    pub fps: f32,
    /// Mean frame time in milliseconds.
    pub mean_frame_ms: f32,
}

/// Counts frames and produces a [`FrameReport`] once per interval.
#[derive(Debug)]
pub struct FrameTimer {
    interval: Duration,
    window_start: Instant,
    last_frame: Instant,
    frames: u32,
}

impl FrameTimer {
    /// Create a timer that reports every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            window_start: now,
            last_frame: now,
            frames: 0,
        }
    }

    /// Record a frame. Returns a report when the interval has elapsed.
    pub fn frame(&mut self) -> Option<FrameReport> {
        self.frame_at(Instant::now())
    }

    fn frame_at(&mut self, now: Instant) -> Option<FrameReport> {
        self.frames += 1;
        self.last_frame = now;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f32();
        let report = FrameReport {
            frames: self.frames,
            fps: self.frames as f32 / secs,
            mean_frame_ms: secs * 1000.0 / self.frames as f32,
        };
        self.window_start = now;
        self.frames = 0;
        Some(report)
    }

    /// Time since the last recorded frame.
    pub fn since_last_frame(&self) -> Duration {
        self.last_frame.elapsed()
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
