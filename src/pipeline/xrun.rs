//! Xrun bookkeeping for one pipeline.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks source starvation and repeated xruns inside a sliding window.
#[derive(Debug, Default)]
pub(crate) struct XrunTracker {
    /// Consecutive ticks the source endpoint produced nothing.
    starved_ticks: u32,
    /// Timestamps of recent xruns.
    events: VecDeque<Instant>,
    /// Set once recovery has been abandoned.
    pub storm: bool,
}

impl XrunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one starved tick and returns the consecutive count.
    pub fn starved_tick(&mut self) -> u32 {
        self.starved_ticks += 1;
        self.starved_ticks
    }

    /// Clears the consecutive starvation counter.
    pub fn fed(&mut self) {
        self.starved_ticks = 0;
    }

    /// Records an xrun at `now` and returns how many fall inside `window`.
    pub fn record(&mut self, now: Instant, window: Duration) -> u32 {
        self.events.push_back(now);
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.starved_ticks = 0;
        self.events.len() as u32
    }

    /// Forgets everything (pipeline reset).
    pub fn reset(&mut self) {
        self.starved_ticks = 0;
        self.events.clear();
        self.storm = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starvation_counts_consecutive_ticks() {
        let mut tracker = XrunTracker::new();
        assert_eq!(tracker.starved_tick(), 1);
        assert_eq!(tracker.starved_tick(), 2);
        tracker.fed();
        assert_eq!(tracker.starved_tick(), 1);
    }

    #[test]
    fn test_window_expires_old_events() {
        let mut tracker = XrunTracker::new();
        let t0 = Instant::now();
        assert_eq!(tracker.record(t0, Duration::from_secs(1)), 1);
        assert_eq!(
            tracker.record(t0 + Duration::from_millis(100), Duration::from_secs(1)),
            2
        );
        // Two seconds later both earlier events have aged out.
        assert_eq!(
            tracker.record(t0 + Duration::from_secs(2), Duration::from_secs(1)),
            1
        );
    }

    #[test]
    fn test_reset_clears_all() {
        let mut tracker = XrunTracker::new();
        tracker.starved_tick();
        tracker.record(Instant::now(), Duration::from_secs(1));
        tracker.storm = true;
        tracker.reset();
        assert!(!tracker.storm);
        // A fresh record after reset counts from one again.
        assert_eq!(tracker.record(Instant::now(), Duration::from_secs(1)), 1);
    }
}
