//! Rolling time-window counter shared by the host auto-recovery windows,
//! the client controller's escalation windows, and its metrics tracker.
//!
//! Grounded on `GuiState::tick_frame`'s `VecDeque<Instant>` eviction loop
//! (teacher's `duallink-gui/src/state.rs`): push a timestamp, evict anything
//! older than the window, read the remaining length.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A `VecDeque<Instant>` that only ever remembers events within `window`.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    events: VecDeque<Instant>,
}

impl RollingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    /// Record one event at `now` and evict anything older than the window.
    pub fn record(&mut self, now: Instant) {
        self.events.push_back(now);
        self.evict(now);
    }

    /// Drop stale entries without recording a new event.
    pub fn evict(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count of events currently inside the window.
    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_events_older_than_window() {
        let mut w = RollingWindow::new(Duration::from_secs(8));
        let t0 = Instant::now();
        w.record(t0);
        w.record(t0 + Duration::from_secs(2));
        assert_eq!(w.count(), 2);
        w.evict(t0 + Duration::from_secs(9));
        assert_eq!(w.count(), 1);
        w.evict(t0 + Duration::from_secs(11));
        assert_eq!(w.count(), 0);
    }
}
