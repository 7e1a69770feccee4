//! miragekit-client — client stream controller (spec §4.7): the ordered
//! decode queue, decode-error and freeze-driven recovery escalation,
//! decode-submission-limit adaptation, and the adaptive-fallback signal.
//!
//! Grounded on the teacher's `PartialFrame`/channel-based dispatch in
//! `duallink-transport` for the single-consumer queue shape, and on
//! `miragekit-core::rolling::RollingWindow` (itself grounded on the
//! teacher's `GuiState::tick_frame`) for every rolling-window escalation
//! counter below.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use miragekit_core::collaborators::{AdaptiveFallbackObserver, KeyframeRequester};
use miragekit_core::ids::StreamID;
use miragekit_core::rolling::RollingWindow;
use miragekit_reassembler::{FrameCompleteEvent, FrameReassembler, FrameSink};

// MARK: - Ordered decode queue (spec §4.7.1)

const DECODE_QUEUE_CAPACITY: usize = 48;
const QUEUE_DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The queue was full of stale P-frames; they were drained to make
    /// room for a fresh keyframe.
    DrainedForKeyframe,
    /// A non-keyframe arrived at capacity; its buffer was released.
    Dropped,
}

struct DecodeQueueState {
    frames: VecDeque<FrameCompleteEvent>,
    stopped: bool,
}

/// Single-producer, single-consumer bounded queue of complete compressed
/// frames awaiting decode, with keyframe-preserving backpressure.
pub struct DecodeQueue {
    capacity: usize,
    state: Mutex<DecodeQueueState>,
    notify: Notify,
    queue_drops: AtomicU64,
    last_drop_log: Mutex<Option<Instant>>,
}

impl Default for DecodeQueue {
    fn default() -> Self {
        Self::new(DECODE_QUEUE_CAPACITY)
    }
}

impl DecodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(DecodeQueueState { frames: VecDeque::with_capacity(capacity), stopped: false }),
            notify: Notify::new(),
            queue_drops: AtomicU64::new(0),
            last_drop_log: Mutex::new(None),
        }
    }

    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    pub fn queue_drop_count(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    pub fn enqueue(&self, event: FrameCompleteEvent) -> EnqueueOutcome {
        let outcome;
        {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                drop(state);
                drop(event);
                return EnqueueOutcome::Dropped;
            }
            if state.frames.len() >= self.capacity {
                if event.is_keyframe {
                    let drained: Vec<_> = state.frames.drain(..).collect();
                    state.frames.push_back(event);
                    drop(state);
                    drop(drained);
                    outcome = EnqueueOutcome::DrainedForKeyframe;
                } else {
                    drop(state);
                    drop(event);
                    self.queue_drops.fetch_add(1, Ordering::Relaxed);
                    self.log_drop_rate_limited();
                    return EnqueueOutcome::Dropped;
                }
            } else {
                state.frames.push_back(event);
                outcome = EnqueueOutcome::Accepted;
            }
        }
        self.notify.notify_one();
        outcome
    }

    fn log_drop_rate_limited(&self) {
        let mut last = self.last_drop_log.lock().unwrap();
        let now = Instant::now();
        let should_log = last.map(|t| now.saturating_duration_since(t) >= QUEUE_DROP_LOG_INTERVAL).unwrap_or(true);
        if should_log {
            *last = Some(now);
            tracing::trace!(total_drops = self.queue_drop_count(), "decode queue dropped frame at capacity");
        }
    }

    /// Waits for the next frame, or returns `None` once [`DecodeQueue::stop`]
    /// has been called and the queue has drained.
    pub async fn dequeue(&self) -> Option<FrameCompleteEvent> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.stopped {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drains the queue, releasing every buffered frame's storage, without
    /// closing it to future enqueues.
    pub fn drain(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.frames.drain(..).collect()
        };
        drop(drained);
    }

    /// Shuts the queue down: subsequent `dequeue` calls return `None`
    /// after draining what remains.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

// MARK: - Decode-error handling (spec §4.7.2)

const DECODE_ERROR_WINDOW: Duration = Duration::from_secs(8);
const DECODE_RECOVERY_ESCALATION_THRESHOLD: usize = 3;
const RECOVERY_DISPATCH_COOLDOWN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Soft,
    Hard,
}

struct DecodeErrorEscalationState {
    window: RollingWindow,
    last_dispatch: Option<Instant>,
}

/// Tracks decoder `onErrorThreshold` callbacks in an 8 s rolling window and
/// decides whether the controller escalates soft or hard recovery.
pub struct DecodeErrorEscalation {
    state: Mutex<DecodeErrorEscalationState>,
}

impl Default for DecodeErrorEscalation {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeErrorEscalation {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DecodeErrorEscalationState {
                window: RollingWindow::new(DECODE_ERROR_WINDOW),
                last_dispatch: None,
            }),
        }
    }

    /// Dispatch is cooldown-gated (≥ 500 ms between recovery requests);
    /// returns `None` when the cooldown swallows this event.
    pub fn on_error_threshold(&self, now: Instant) -> Option<RecoveryAction> {
        let mut state = self.state.lock().unwrap();
        state.window.record(now);

        if let Some(last) = state.last_dispatch {
            if now.saturating_duration_since(last) < RECOVERY_DISPATCH_COOLDOWN {
                return None;
            }
        }
        state.last_dispatch = Some(now);

        if state.window.count() >= DECODE_RECOVERY_ESCALATION_THRESHOLD {
            state.window.clear();
            Some(RecoveryAction::Hard)
        } else {
            Some(RecoveryAction::Soft)
        }
    }
}

// MARK: - Freeze monitor (spec §4.7.3)

const FREEZE_TIMEOUT: Duration = Duration::from_secs(5);
const FREEZE_RECOVERY_COOLDOWN: Duration = Duration::from_secs(3);
const FREEZE_RECOVERY_ESCALATION_THRESHOLD: u32 = 2;

struct FreezeMonitorState {
    last_sequence: u64,
    last_progress_time: Option<Instant>,
    frozen_streak: u32,
    last_recovery_time: Option<Instant>,
}

/// Periodic (every 500 ms) presentation-progress check. `sample` is meant
/// to be called on that cadence while the application is active.
pub struct FreezeMonitor {
    state: Mutex<FreezeMonitorState>,
}

impl Default for FreezeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FreezeMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FreezeMonitorState {
                last_sequence: 0,
                last_progress_time: None,
                frozen_streak: 0,
                last_recovery_time: None,
            }),
        }
    }

    /// `presentation_sequence` is the presentation snapshot's monotonic
    /// sequence counter; `recent_packet` is whether a video packet arrived
    /// within the last 5 s.
    pub fn sample(
        &self,
        now: Instant,
        presentation_sequence: u64,
        queue_depth: usize,
        recent_packet: bool,
        awaiting_keyframe: bool,
    ) -> Option<RecoveryAction> {
        let mut state = self.state.lock().unwrap();

        if presentation_sequence != state.last_sequence || state.last_progress_time.is_none() {
            state.last_sequence = presentation_sequence;
            state.last_progress_time = Some(now);
            state.frozen_streak = 0;
            return None;
        }

        let stalled_for = now.saturating_duration_since(state.last_progress_time.unwrap());
        if !(stalled_for > FREEZE_TIMEOUT && (queue_depth > 0 || recent_packet)) {
            return None;
        }

        if let Some(last) = state.last_recovery_time {
            if now.saturating_duration_since(last) < FREEZE_RECOVERY_COOLDOWN {
                return None;
            }
        }

        state.frozen_streak += 1;
        state.last_recovery_time = Some(now);

        if state.frozen_streak >= FREEZE_RECOVERY_ESCALATION_THRESHOLD && awaiting_keyframe {
            state.frozen_streak = 0;
            Some(RecoveryAction::Hard)
        } else {
            Some(RecoveryAction::Soft)
        }
    }
}

// MARK: - Decode-submission limit adaptation (spec §4.7.4)

const SUBMISSION_LIMIT_BASELINE: u32 = 2;
const SUBMISSION_LIMIT_MAX: u32 = 3;
const SUBMISSION_STRESS_RATIO: f64 = 0.80;
const SUBMISSION_HEALTHY_RATIO: f64 = 0.95;
const SUBMISSION_STRESS_STREAK_TO_RAISE: u32 = 2;
const SUBMISSION_HEALTHY_STREAK_TO_RESTORE: u32 = 3;

struct SubmissionLimitState {
    limit: u32,
    stress_streak: u32,
    healthy_streak: u32,
}

/// Adapts how many frames the decoder is allowed to have in flight,
/// relaxing the limit under sustained decode stress and restoring it once
/// decode keeps up again.
pub struct SubmissionLimit {
    state: Mutex<SubmissionLimitState>,
}

impl Default for SubmissionLimit {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionLimit {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SubmissionLimitState {
                limit: SUBMISSION_LIMIT_BASELINE,
                stress_streak: 0,
                healthy_streak: 0,
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.state.lock().unwrap().limit
    }

    pub fn evaluate(&self, decoded_fps: f64, target_fps: f64) {
        let ratio = if target_fps > 0.0 { decoded_fps / target_fps } else { 1.0 };
        let mut state = self.state.lock().unwrap();

        if ratio < SUBMISSION_STRESS_RATIO {
            state.healthy_streak = 0;
            state.stress_streak += 1;
            if state.stress_streak >= SUBMISSION_STRESS_STREAK_TO_RAISE {
                state.limit = SUBMISSION_LIMIT_MAX;
            }
        } else if ratio >= SUBMISSION_HEALTHY_RATIO {
            state.stress_streak = 0;
            state.healthy_streak += 1;
            if state.healthy_streak >= SUBMISSION_HEALTHY_STREAK_TO_RESTORE {
                state.limit = SUBMISSION_LIMIT_BASELINE;
            }
        } else {
            state.stress_streak = 0;
            state.healthy_streak = 0;
        }
    }
}

// MARK: - Adaptive fallback signal (spec §4.7.5)

const ADAPTIVE_FALLBACK_WINDOW: Duration = Duration::from_secs(8);
const ADAPTIVE_FALLBACK_COOLDOWN: Duration = Duration::from_secs(15);
const QUEUE_DROP_THRESHOLD: usize = 12;
const RECOVERY_REQUEST_THRESHOLD: usize = 2;
const DECODE_THRESHOLD_THRESHOLD: usize = 2;

struct AdaptiveFallbackState {
    queue_drops: RollingWindow,
    recovery_requests: RollingWindow,
    decode_thresholds: RollingWindow,
    last_signal: Option<Instant>,
}

/// Rolling-window trigger for "downshift the encoder" — callers own the
/// control-channel message this is a prerequisite for.
pub struct AdaptiveFallback {
    state: Mutex<AdaptiveFallbackState>,
}

impl Default for AdaptiveFallback {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveFallback {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AdaptiveFallbackState {
                queue_drops: RollingWindow::new(ADAPTIVE_FALLBACK_WINDOW),
                recovery_requests: RollingWindow::new(ADAPTIVE_FALLBACK_WINDOW),
                decode_thresholds: RollingWindow::new(ADAPTIVE_FALLBACK_WINDOW),
                last_signal: None,
            }),
        }
    }

    pub fn record_queue_drop(&self, now: Instant) {
        self.state.lock().unwrap().queue_drops.record(now);
    }

    pub fn record_recovery_request(&self, now: Instant) {
        self.state.lock().unwrap().recovery_requests.record(now);
    }

    pub fn record_decode_threshold(&self, now: Instant) {
        self.state.lock().unwrap().decode_thresholds.record(now);
    }

    /// Returns `true` exactly when `onAdaptiveFallbackNeeded` should fire;
    /// internally cooldown-gated to at most once every 15 s.
    pub fn evaluate(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        state.queue_drops.evict(now);
        state.recovery_requests.evict(now);
        state.decode_thresholds.evict(now);

        let queue_pressure = state.queue_drops.count() >= QUEUE_DROP_THRESHOLD
            && state.recovery_requests.count() >= RECOVERY_REQUEST_THRESHOLD;
        let decode_pressure = state.decode_thresholds.count() >= DECODE_THRESHOLD_THRESHOLD;

        if !(queue_pressure || decode_pressure) {
            return false;
        }
        if let Some(last) = state.last_signal {
            if now.saturating_duration_since(last) < ADAPTIVE_FALLBACK_COOLDOWN {
                return false;
            }
        }
        state.last_signal = Some(now);
        true
    }
}

// MARK: - Client stream controller

/// Per-stream client-side aggregate: owns the decode queue and every
/// recovery-escalation policy, and is itself the [`FrameSink`] the
/// reassembler delivers complete frames to.
pub struct ClientStreamController {
    stream_id: StreamID,
    pub decode_queue: DecodeQueue,
    pub decode_errors: DecodeErrorEscalation,
    pub freeze_monitor: FreezeMonitor,
    pub submission_limit: SubmissionLimit,
    pub adaptive_fallback: AdaptiveFallback,
    reassembler: Arc<FrameReassembler>,
    keyframe_requester: Arc<dyn KeyframeRequester>,
    fallback_observer: Arc<dyn AdaptiveFallbackObserver>,
}

impl ClientStreamController {
    pub fn new(
        stream_id: StreamID,
        reassembler: Arc<FrameReassembler>,
        keyframe_requester: Arc<dyn KeyframeRequester>,
        fallback_observer: Arc<dyn AdaptiveFallbackObserver>,
    ) -> Self {
        Self {
            stream_id,
            decode_queue: DecodeQueue::default(),
            decode_errors: DecodeErrorEscalation::new(),
            freeze_monitor: FreezeMonitor::new(),
            submission_limit: SubmissionLimit::new(),
            adaptive_fallback: AdaptiveFallback::new(),
            reassembler,
            keyframe_requester,
            fallback_observer,
        }
    }

    pub async fn dequeue(&self) -> Option<FrameCompleteEvent> {
        self.decode_queue.dequeue().await
    }

    pub fn stop_frame_processing_pipeline(&self) {
        self.decode_queue.stop();
    }

    pub fn on_decode_error_threshold(&self, now: Instant) {
        match self.decode_errors.on_error_threshold(now) {
            Some(RecoveryAction::Hard) => self.escalate(now, RecoveryAction::Hard),
            Some(RecoveryAction::Soft) => self.escalate(now, RecoveryAction::Soft),
            None => {}
        }
    }

    pub fn sample_freeze(&self, now: Instant, presentation_sequence: u64, recent_packet: bool) {
        let queue_depth = self.decode_queue.depth();
        let awaiting_keyframe = self.reassembler.should_request_keyframe();
        if let Some(action) =
            self.freeze_monitor.sample(now, presentation_sequence, queue_depth, recent_packet, awaiting_keyframe)
        {
            self.escalate(now, action);
        }
    }

    pub fn evaluate_adaptive_fallback(&self, now: Instant) {
        if self.adaptive_fallback.evaluate(now) {
            self.fallback_observer.on_adaptive_fallback_needed(self.stream_id);
        }
    }

    fn escalate(&self, now: Instant, action: RecoveryAction) {
        self.decode_queue.drain();
        self.reassembler.enter_keyframe_only_mode();
        let reason = match action {
            RecoveryAction::Soft => "client decode recovery (soft)",
            RecoveryAction::Hard => "client decode recovery (hard)",
        };
        self.keyframe_requester.request_keyframe(self.stream_id, reason);
        self.adaptive_fallback.record_recovery_request(now);
        if action == RecoveryAction::Hard {
            self.adaptive_fallback.record_decode_threshold(now);
        }
    }
}

impl FrameSink for ClientStreamController {
    fn on_frame_complete(&self, event: FrameCompleteEvent) {
        if self.decode_queue.enqueue(event) == EnqueueOutcome::Dropped {
            self.adaptive_fallback.record_queue_drop(Instant::now());
        }
    }
}
