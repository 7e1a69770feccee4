//! miragekit-present — render presentation policy (spec §4.9): decides
//! which decoded frame a per-stream ring buffer hands to the renderer, and
//! how deep that ring is allowed to grow before it's trimmed.
//!
//! Rendering itself (Metal, the actual present call) is out of scope (spec
//! §1); this crate only owns the selection policy, the same way
//! `miragekit-quality` only owns the bitrate/quality curve. Grounded on the
//! teacher's bounded `VecDeque<Instant>` bookkeeping in
//! `duallink-gui::state::GuiState` for the ring-buffer shape, generalized
//! from a metrics log into a depth-bounded frame queue with the
//! latest-vs-buffered selection spec §4.9 requires.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use miragekit_core::types::LatencyMode;

/// Depth the ring is trimmed to under `buffered` selection (spec §4.9).
pub const BUFFERED_MAX_DEPTH: usize = 3;

/// Depth/age thresholds that trigger the emergency trim.
const EMERGENCY_DEPTH: usize = 8;
const EMERGENCY_AGE: Duration = Duration::from_millis(150);
const EMERGENCY_SAFE_DEPTH: usize = 4;

/// Decode-health ratio thresholds (spec §4.9).
const HEALTHY_RATIO: f64 = 0.95;
const STRESSED_RATIO: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeHealth {
    Healthy,
    Nominal,
    Stressed,
}

impl DecodeHealth {
    /// `decodedFPS / targetFPS` classified per spec §4.9.
    pub fn classify(decoded_fps: f64, target_fps: f64) -> Self {
        if target_fps <= 0.0 {
            return DecodeHealth::Healthy;
        }
        let ratio = decoded_fps / target_fps;
        if ratio >= HEALTHY_RATIO {
            DecodeHealth::Healthy
        } else if ratio < STRESSED_RATIO {
            DecodeHealth::Stressed
        } else {
            DecodeHealth::Nominal
        }
    }
}

/// Which end of the ring the presentation loop should read from, and what
/// depth the ring should be trimmed to first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Trim to depth 1, return the newest frame.
    Latest,
    /// Trim to `max_depth`, return the oldest frame.
    Buffered { max_depth: usize },
}

/// Chooses the selection policy for one presentation tick (spec §4.9).
///
/// `lowestLatency` or an active typing burst always selects `latest`;
/// `auto` (steady, no typing burst) and `smoothest` select `buffered`.
/// Decode health does not change *which* policy applies — it only bounds
/// the ring via [`PresentationRing::trim_for_emergency`] so presentation
/// never starves on a healthy decoder and stays bounded under a stressed
/// one.
pub fn selection_policy(latency_mode: LatencyMode, typing_burst_active: bool) -> SelectionPolicy {
    if typing_burst_active || latency_mode == LatencyMode::LowestLatency {
        SelectionPolicy::Latest
    } else {
        SelectionPolicy::Buffered { max_depth: BUFFERED_MAX_DEPTH }
    }
}

/// One decoded frame slot in the ring. Presentation policy only ever needs
/// the frame's arrival time to decide trims; the payload itself is
/// opaque to this crate (decode/render are both external collaborators).
pub struct RingEntry<T> {
    pub frame: T,
    pub arrived_at: Instant,
}

/// Per-stream lock-free ring buffer of decoded frames awaiting
/// presentation. Callers hold this behind whatever mutex matches their
/// stream-state boundary (spec §5); this type itself does no locking.
pub struct PresentationRing<T> {
    entries: VecDeque<RingEntry<T>>,
}

impl<T> Default for PresentationRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PresentationRing<T> {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Pushes a newly decoded frame onto the back of the ring.
    pub fn push(&mut self, frame: T, arrived_at: Instant) {
        self.entries.push_back(RingEntry { frame, arrived_at });
    }

    /// Applies the emergency trim (spec §4.9): when depth ≥ 8 and the
    /// oldest entry is ≥ 150 ms old, force the ring down to a safe depth
    /// of 4, dropping the *oldest* excess entries so presentation recovers
    /// with the freshest material available.
    pub fn trim_for_emergency(&mut self, now: Instant) {
        if self.entries.len() < EMERGENCY_DEPTH {
            return;
        }
        let oldest_age = self
            .entries
            .front()
            .map(|e| now.saturating_duration_since(e.arrived_at))
            .unwrap_or_default();
        if oldest_age < EMERGENCY_AGE {
            return;
        }
        while self.entries.len() > EMERGENCY_SAFE_DEPTH {
            self.entries.pop_front();
        }
    }

    /// Trims to `max_depth` from the front (oldest first), then returns the
    /// new oldest entry without removing it — `buffered` selection
    /// consumes in presentation order.
    pub fn select_buffered(&mut self, max_depth: usize) -> Option<&T> {
        while self.entries.len() > max_depth {
            self.entries.pop_front();
        }
        self.entries.front().map(|e| &e.frame)
    }

    /// Trims to depth 1 and returns the remaining (newest) entry —
    /// `latest` selection discards everything older unconditionally.
    pub fn select_latest(&mut self) -> Option<&T> {
        while self.entries.len() > 1 {
            self.entries.pop_front();
        }
        self.entries.front().map(|e| &e.frame)
    }

    /// Applies `policy`, after the emergency trim, and returns the
    /// selected entry without removing it from the ring.
    pub fn select(&mut self, policy: SelectionPolicy, now: Instant) -> Option<&T> {
        self.trim_for_emergency(now);
        match policy {
            SelectionPolicy::Latest => self.select_latest(),
            SelectionPolicy::Buffered { max_depth } => self.select_buffered(max_depth),
        }
    }

    /// Removes and returns the frame `select` would have returned —
    /// presentation consumes the entry once it has been handed to the
    /// renderer.
    pub fn pop_selected(&mut self, policy: SelectionPolicy, now: Instant) -> Option<T> {
        self.trim_for_emergency(now);
        match policy {
            SelectionPolicy::Latest => {
                while self.entries.len() > 1 {
                    self.entries.pop_front();
                }
                self.entries.pop_front().map(|e| e.frame)
            }
            SelectionPolicy::Buffered { max_depth } => {
                while self.entries.len() > max_depth {
                    self.entries.pop_front();
                }
                self.entries.pop_front().map(|e| e.frame)
            }
        }
    }
}
