//! Step timing for performance reporting.
//!
//! A [`StepTimer`] keeps a rolling average of step wall-clock duration over a
//! fixed window of steps. When a window completes, the average is published
//! (and logged) and the accumulator starts over. Timing never feeds back into
//! the simulation.
//!
//! # Example
//!
//! ```ignore
//! use flockgrid::time::StepTimer;
//!
//! let mut timer = StepTimer::new(500);
//!
//! // Around each step:
//! let started = timer.begin();
//! flock.step(0.1, Strategy::Coherent)?;
//! timer.end(started);
//!
//! if let Some(avg) = timer.last_average() {
//!     println!("{:.3} ms/step", avg.as_secs_f64() * 1e3);
//! }
//! ```

use std::time::{Duration, Instant};

use tracing::info;

/// Windowed average of step durations.
#[derive(Debug)]
pub struct StepTimer {
    /// Steps per averaging window.
    window: u32,
    /// Duration accumulated in the current window.
    accumulated: Duration,
    /// Steps recorded in the current window.
    window_steps: u32,
    /// Total steps recorded since creation.
    total_steps: u64,
    /// Average of the most recently completed window.
    last_average: Option<Duration>,
}

impl StepTimer {
    /// Create a timer averaging over `window` steps (at least one).
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            accumulated: Duration::ZERO,
            window_steps: 0,
            total_steps: 0,
            last_average: None,
        }
    }

    /// Mark the start of a step.
    #[inline]
    pub fn begin(&self) -> Instant {
        Instant::now()
    }

    /// Record the step started at `started`.
    pub fn end(&mut self, started: Instant) {
        self.record(started.elapsed());
    }

    /// Record one step of the given duration.
    ///
    /// Returns the window average when this step completed a window.
    pub fn record(&mut self, duration: Duration) -> Option<Duration> {
        self.accumulated += duration;
        self.window_steps += 1;
        self.total_steps += 1;

        if self.window_steps < self.window {
            return None;
        }

        let average = self.accumulated / self.window;
        self.last_average = Some(average);
        self.accumulated = Duration::ZERO;
        self.window_steps = 0;
        info!(
            steps = self.total_steps,
            window = self.window,
            avg_ms = average.as_secs_f64() * 1e3,
            "step timing window complete"
        );
        Some(average)
    }

    /// Average step duration of the last completed window.
    #[inline]
    pub fn last_average(&self) -> Option<Duration> {
        self.last_average
    }

    /// Steps recorded since creation.
    #[inline]
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Steps per averaging window.
    #[inline]
    pub fn window(&self) -> u32 {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timer_new() {
        let timer = StepTimer::new(500);
        assert_eq!(timer.window(), 500);
        assert_eq!(timer.total_steps(), 0);
        assert_eq!(timer.last_average(), None);
    }

    #[test]
    fn test_average_published_at_window_end() {
        let mut timer = StepTimer::new(4);
        for ms in [1, 2, 3] {
            assert_eq!(timer.record(Duration::from_millis(ms)), None);
        }
        assert_eq!(timer.record(Duration::from_millis(6)), Some(Duration::from_millis(3)));
        assert_eq!(timer.last_average(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_window_resets_accumulator() {
        let mut timer = StepTimer::new(2);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(2));
        let avg = timer.record(Duration::from_millis(4));
        assert_eq!(avg, Some(Duration::from_millis(3)));
        assert_eq!(timer.total_steps(), 4);
    }

    #[test]
    fn test_zero_window_clamps_to_one() {
        let mut timer = StepTimer::new(0);
        assert!(timer.record(Duration::from_millis(1)).is_some());
    }

    #[test]
    fn test_begin_end_measures_wall_clock() {
        let mut timer = StepTimer::new(1);
        let started = timer.begin();
        thread::sleep(Duration::from_millis(5));
        timer.end(started);
        assert!(timer.last_average().unwrap() >= Duration::from_millis(5));
    }
}
