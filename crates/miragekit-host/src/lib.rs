//! miragekit-host — per-stream host state: keyframe recovery, the auto
//! latency-recovery hysteresis, the typing-burst transient, in-flight
//! encoder admission, and encoder-settings change classification
//! (spec §4.6).
//!
//! Grounded on the teacher's `DualLinkReceiver`'s owner-thread-per-stream
//! model (`duallink-transport::DualLinkReceiver::start`): each concern here
//! is a small guarded-mutex state machine rather than a shared global, so a
//! stream's recovery bookkeeping never contends with another stream's.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use miragekit_core::collaborators::KeyframeRequester;
use miragekit_core::ids::StreamID;
use miragekit_core::types::{EncoderSettings, LatencyMode, Resolution};
use miragekit_quality::derived_qualities;

// MARK: - Keyframe recovery (spec §4.6.1)

const KEYFRAME_REQUEST_COALESCE_WINDOW: Duration = Duration::from_secs(1);
const SOFT_RECOVERY_ESCALATION_WINDOW: Duration = Duration::from_secs(8);
const HARD_RECOVERY_LOSS_MODE_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// The request coalesced with one already pending; no new action.
    Coalesced,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastRecoveryKind {
    None,
    Soft,
    Hard,
}

struct KeyframeRecoveryState {
    last_recovery_time: Option<Instant>,
    last_recovery_kind: LastRecoveryKind,
    soft_recovery_attempted_at: Option<Instant>,
    pending: bool,
    pending_requires_reset: bool,
    pending_requires_flush: bool,
    loss_mode_deadline: Option<Instant>,
    soft_recovery_count: u64,
    hard_recovery_count: u64,
}

impl Default for KeyframeRecoveryState {
    fn default() -> Self {
        Self {
            last_recovery_time: None,
            last_recovery_kind: LastRecoveryKind::None,
            soft_recovery_attempted_at: None,
            pending: false,
            pending_requires_reset: false,
            pending_requires_flush: false,
            loss_mode_deadline: None,
            soft_recovery_count: 0,
            hard_recovery_count: 0,
        }
    }
}

/// Soft→hard keyframe recovery escalation, independent of latency mode.
pub struct KeyframeRecovery {
    state: Mutex<KeyframeRecoveryState>,
}

impl Default for KeyframeRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyframeRecovery {
    pub fn new() -> Self {
        Self { state: Mutex::new(KeyframeRecoveryState::default()) }
    }

    /// Evaluates a keyframe-recovery request at `now`, escalating to hard
    /// recovery if a prior soft attempt within the last 8 s never
    /// succeeded (inferred by this call itself arriving again).
    pub fn request_keyframe(&self, now: Instant) -> RecoveryKind {
        let mut state = self.state.lock().unwrap();

        if let Some(last) = state.last_recovery_time {
            if state.pending && now.saturating_duration_since(last) < KEYFRAME_REQUEST_COALESCE_WINDOW {
                return RecoveryKind::Coalesced;
            }
        }

        let escalate = state.last_recovery_kind == LastRecoveryKind::Soft
            && state
                .soft_recovery_attempted_at
                .map(|at| now.saturating_duration_since(at) < SOFT_RECOVERY_ESCALATION_WINDOW)
                .unwrap_or(false);

        let kind = if escalate {
            state.pending_requires_reset = true;
            state.pending_requires_flush = true;
            state.loss_mode_deadline = Some(now + HARD_RECOVERY_LOSS_MODE_DURATION);
            state.hard_recovery_count += 1;
            state.last_recovery_kind = LastRecoveryKind::Hard;
            state.soft_recovery_attempted_at = None;
            tracing::warn!(
                hard_recovery_count = state.hard_recovery_count,
                "keyframe recovery escalated to hard (soft attempt did not land in time)"
            );
            RecoveryKind::Hard
        } else {
            state.soft_recovery_count += 1;
            state.last_recovery_kind = LastRecoveryKind::Soft;
            state.soft_recovery_attempted_at = Some(now);
            tracing::debug!(soft_recovery_count = state.soft_recovery_count, "requesting soft keyframe recovery");
            RecoveryKind::Soft
        };

        state.last_recovery_time = Some(now);
        state.pending = true;
        kind
    }

    /// Clears `pending` once the requested keyframe has actually reached
    /// the encoder output; re-enables scheduled (periodic) keyframes.
    pub fn acknowledge_keyframe_emitted(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = false;
    }

    /// Scheduled keyframes are disabled while a recovery keyframe is
    /// outstanding (spec §4.6.1).
    pub fn scheduled_keyframes_suppressed(&self) -> bool {
        self.state.lock().unwrap().pending
    }

    /// Consumes the pending reset/flush flags a hard recovery set, so the
    /// encoder driver applies them exactly once.
    pub fn take_reset_and_flush(&self) -> (bool, bool) {
        let mut state = self.state.lock().unwrap();
        let reset = std::mem::take(&mut state.pending_requires_reset);
        let flush = std::mem::take(&mut state.pending_requires_flush);
        (reset, flush)
    }

    pub fn is_loss_mode_active(&self, now: Instant) -> bool {
        self.state
            .lock()
            .unwrap()
            .loss_mode_deadline
            .map(|deadline| now < deadline)
            .unwrap_or(false)
    }

    pub fn soft_recovery_count(&self) -> u64 {
        self.state.lock().unwrap().soft_recovery_count
    }

    pub fn hard_recovery_count(&self) -> u64 {
        self.state.lock().unwrap().hard_recovery_count
    }
}

// MARK: - Auto recovery (spec §4.6.2)

const AUTO_RECOVERY_UNHEALTHY_STREAK: u32 = 2;
const AUTO_RECOVERY_HEALTHY_STREAK: u32 = 2;
const AUTO_RECOVERY_HOLD: Duration = Duration::from_secs(2);
const AUTO_RECOVERY_COOLDOWN: Duration = Duration::from_secs(2);
const AUTO_RECOVERY_MAX_IN_FLIGHT: u32 = 1;
const AUTO_RECOVERY_QUALITY_CEILING: f64 = 0.58;
const BASELINE_MAX_IN_FLIGHT: u32 = 2;

const UNHEALTHY_ENCODE_MS_FACTOR: f64 = 1.30;
const UNHEALTHY_FPS_FACTOR: f64 = 0.85;
const HEALTHY_FPS_FACTOR: f64 = 0.95;
/// Spec §8 Scenario F feeds `avgEncodeMs=16.67` against a 60fps budget of
/// `16.6666…7ms` as its "healthy" sample — a two-decimal rounding of the
/// budget itself, not a value strictly under it. Comparing with this much
/// tolerance absorbs that rounding without loosening the threshold in any
/// way that would accept a genuinely slower encode.
const HEALTHY_ENCODE_MS_EPSILON: f64 = 0.01;

/// One ~1 s encode-health sample (spec §4.6.2 inputs).
#[derive(Debug, Clone, Copy)]
pub struct EncodeWindowSample {
    pub capture_fps: f64,
    pub encode_fps: f64,
    pub avg_encode_ms: f64,
    pub pending_count: u32,
}

struct AutoRecoveryState {
    active: bool,
    unhealthy_streak: u32,
    healthy_streak: u32,
    hold_until: Option<Instant>,
    cooldown_until: Option<Instant>,
    quality_ceiling: f64,
    max_in_flight_frames: u32,
}

/// Hysteretic in-flight/quality clamp for `latencyMode = auto` when encode
/// is sustainably unhealthy.
pub struct AutoRecovery {
    baseline_quality_ceiling: f64,
    state: Mutex<AutoRecoveryState>,
}

impl AutoRecovery {
    pub fn new(configured_quality_ceiling: f64) -> Self {
        Self {
            baseline_quality_ceiling: configured_quality_ceiling,
            state: Mutex::new(AutoRecoveryState {
                active: false,
                unhealthy_streak: 0,
                healthy_streak: 0,
                hold_until: None,
                cooldown_until: None,
                quality_ceiling: configured_quality_ceiling,
                max_in_flight_frames: BASELINE_MAX_IN_FLIGHT,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub fn max_in_flight_frames(&self) -> u32 {
        self.state.lock().unwrap().max_in_flight_frames
    }

    pub fn quality_ceiling(&self) -> f64 {
        self.state.lock().unwrap().quality_ceiling
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.state.lock().unwrap().cooldown_until
    }

    /// Feeds one window's health sample at `now`; mutates recovery state
    /// per the spec §4.6.2 hysteresis. Same `(now, sample)` applied twice
    /// in a row leaves the second call a no-op (spec §8 property 10):
    /// the streak that crossed a threshold was already reset by the
    /// transition the first call made.
    pub fn evaluate(&self, now: Instant, target_frame_rate: u32, sample: EncodeWindowSample) {
        let budget_ms = 1000.0 / target_frame_rate.max(1) as f64;
        let unhealthy = sample.avg_encode_ms > budget_ms * UNHEALTHY_ENCODE_MS_FACTOR
            || sample.encode_fps < target_frame_rate as f64 * UNHEALTHY_FPS_FACTOR;
        // Spec's own Scenario F worked example feeds avgEncodeMs == budget
        // (not 85% of it) as a healthy sample, so the encode-time side of
        // this check compares against the full per-frame budget.
        let healthy = sample.avg_encode_ms <= budget_ms + HEALTHY_ENCODE_MS_EPSILON
            && sample.encode_fps >= target_frame_rate as f64 * HEALTHY_FPS_FACTOR;

        let mut state = self.state.lock().unwrap();

        if !state.active {
            if let Some(cooldown) = state.cooldown_until {
                if now < cooldown {
                    if !unhealthy {
                        state.unhealthy_streak = 0;
                    }
                    return;
                }
            }
            if unhealthy {
                state.unhealthy_streak += 1;
                if state.unhealthy_streak >= AUTO_RECOVERY_UNHEALTHY_STREAK {
                    state.active = true;
                    state.max_in_flight_frames = AUTO_RECOVERY_MAX_IN_FLIGHT;
                    state.quality_ceiling = state.quality_ceiling.min(AUTO_RECOVERY_QUALITY_CEILING);
                    state.hold_until = Some(now + AUTO_RECOVERY_HOLD);
                    state.healthy_streak = 0;
                    state.unhealthy_streak = 0;
                    tracing::info!(
                        quality_ceiling = state.quality_ceiling,
                        "auto-recovery entered: encode sustainably unhealthy"
                    );
                }
            } else {
                state.unhealthy_streak = 0;
            }
            return;
        }

        if let Some(hold) = state.hold_until {
            if now < hold {
                return;
            }
        }

        if healthy {
            state.healthy_streak += 1;
            if state.healthy_streak >= AUTO_RECOVERY_HEALTHY_STREAK {
                state.active = false;
                state.max_in_flight_frames = BASELINE_MAX_IN_FLIGHT;
                state.quality_ceiling = self.baseline_quality_ceiling;
                state.cooldown_until = Some(now + AUTO_RECOVERY_COOLDOWN);
                state.healthy_streak = 0;
                state.hold_until = None;
                tracing::info!("auto-recovery exited: encode healthy for two consecutive windows");
            }
        } else {
            state.healthy_streak = 0;
        }
    }

    /// `activeQuality` clamp for the current recovery state — never
    /// exceeds the pre-recovery value (spec §8 property 9).
    pub fn clamp_quality(&self, desired: f64) -> f64 {
        desired.min(self.quality_ceiling())
    }
}

// MARK: - Typing-burst transient (spec §4.6.3)

const TYPING_BURST_DURATION: Duration = Duration::from_millis(350);
const TYPING_BURST_MAX_IN_FLIGHT: u32 = 1;
const TYPING_BURST_QUALITY_CEILING: f64 = 0.62;

struct TypingBurstState {
    active: bool,
    deadline: Option<Instant>,
    saved_max_in_flight: u32,
    saved_quality_ceiling: f64,
}

impl Default for TypingBurstState {
    fn default() -> Self {
        Self {
            active: false,
            deadline: None,
            saved_max_in_flight: BASELINE_MAX_IN_FLIGHT,
            saved_quality_ceiling: AUTO_RECOVERY_QUALITY_CEILING,
        }
    }
}

/// A short (350 ms) clamp triggered by user input, active only under
/// `latencyMode = auto`; callers are expected to gate calls on latency
/// mode themselves (non-auto modes ignore these calls per spec §4.6.3).
pub struct TypingBurst {
    state: Mutex<TypingBurstState>,
}

impl Default for TypingBurst {
    fn default() -> Self {
        Self::new()
    }
}

impl TypingBurst {
    pub fn new() -> Self {
        Self { state: Mutex::new(TypingBurstState::default()) }
    }

    /// Records input activity at `now`, saving the pre-burst baselines on
    /// first activation. Repeated calls just extend the deadline.
    pub fn note_activity(&self, now: Instant, baseline_max_in_flight: u32, baseline_quality_ceiling: f64) {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            state.saved_max_in_flight = baseline_max_in_flight;
            state.saved_quality_ceiling = baseline_quality_ceiling;
            state.active = true;
        }
        state.deadline = Some(now + TYPING_BURST_DURATION);
    }

    /// Restores the saved baselines once `now` passes the deadline.
    /// Returns `Some((maxInFlight, qualityCeiling))` exactly on the call
    /// that expires the burst.
    pub fn expire_if_needed(&self, now: Instant) -> Option<(u32, f64)> {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            return None;
        }
        let deadline = state.deadline?;
        if now < deadline {
            return None;
        }
        state.active = false;
        state.deadline = None;
        Some((state.saved_max_in_flight, state.saved_quality_ceiling))
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub fn max_in_flight_frames(&self) -> Option<u32> {
        self.is_active().then_some(TYPING_BURST_MAX_IN_FLIGHT)
    }

    pub fn quality_ceiling(&self) -> Option<f64> {
        self.is_active().then_some(TYPING_BURST_QUALITY_CEILING)
    }
}

// MARK: - In-flight encoder admission (spec §4.6.4)

/// Thread-safe saturating counter bounding concurrently in-flight encodes.
pub struct EncoderAdmission {
    limit: AtomicU32,
    in_flight: AtomicU32,
}

impl EncoderAdmission {
    pub fn new(limit: u32) -> Self {
        Self { limit: AtomicU32::new(limit), in_flight: AtomicU32::new(0) }
    }

    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Reserves one admission slot. Returns `false` without mutating state
    /// when the limit is already saturated.
    pub fn reserve_slot(&self) -> bool {
        let limit = self.limit.load(Ordering::SeqCst);
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current >= limit {
                    None
                } else {
                    Some(current + 1)
                }
            })
            .is_ok()
    }

    /// Releases one slot; never underflows below zero.
    pub fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| Some(current.saturating_sub(1)));
    }

    pub fn reset(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
    }
}

// MARK: - Encoder-settings update classification (spec §4.6.5)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderSettingsUpdateMode {
    NoChange,
    BitrateOnly,
    FullReconfiguration,
}

/// Pure classification of an encoder-settings change (spec §8 property 8).
pub fn encoder_settings_update_mode(
    current: &EncoderSettings,
    updated: &EncoderSettings,
) -> EncoderSettingsUpdateMode {
    if current == updated {
        return EncoderSettingsUpdateMode::NoChange;
    }
    let non_bitrate_fields_equal = current.codec == updated.codec
        && current.target_frame_rate == updated.target_frame_rate
        && current.key_frame_interval == updated.key_frame_interval
        && current.bit_depth == updated.bit_depth
        && current.color_space == updated.color_space
        && current.pixel_format == updated.pixel_format;

    if non_bitrate_fields_equal {
        EncoderSettingsUpdateMode::BitrateOnly
    } else {
        EncoderSettingsUpdateMode::FullReconfiguration
    }
}

// MARK: - Desktop resize request decision (spec §8 property 8)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDecision {
    /// Requested resolution matches the current one; nothing to do.
    Ignore,
    /// A new dimension token and keyframe are needed, but the encoder's
    /// other settings (bitrate, frame rate, ...) are untouched.
    ApplyDimensionOnly,
    /// The change is large enough (or an aspect-ratio change) that the
    /// caller should also reconsider bitrate/quality for the new pixel
    /// count, in addition to bumping the dimension token.
    ApplyWithQualityReconsideration,
}

/// Fraction of total pixels a resize must change by before the caller is
/// told to reconsider quality/bitrate alongside the dimension bump.
const RESIZE_QUALITY_RECONSIDERATION_THRESHOLD: f64 = 0.20;

/// Pure classification of a `displayResolutionChange`/`streamScaleChange`
/// control message (spec §6.4) against the stream's current resolution.
/// Mirrors `encoder_settings_update_mode`'s shape: a three-way
/// classification over structural equality plus one magnitude threshold,
/// rather than a bitrate-vs-everything-else split.
pub fn desktop_resize_request_decision(current: Resolution, requested: Resolution) -> ResizeDecision {
    if current == requested {
        return ResizeDecision::Ignore;
    }
    let current_pixels = current.total_pixels().max(1) as f64;
    let requested_pixels = requested.total_pixels() as f64;
    let relative_change = (requested_pixels - current_pixels).abs() / current_pixels;

    if relative_change >= RESIZE_QUALITY_RECONSIDERATION_THRESHOLD {
        ResizeDecision::ApplyWithQualityReconsideration
    } else {
        ResizeDecision::ApplyDimensionOnly
    }
}

// MARK: - Stream context (spec §3.6)

/// Per-stream aggregate of every piece of host latency/recovery state,
/// matching the "Host stream context state" list in spec §3.6.
pub struct StreamContext {
    pub stream_id: StreamID,
    latency_mode: Mutex<LatencyMode>,
    pub keyframe_recovery: KeyframeRecovery,
    pub auto_recovery: AutoRecovery,
    pub typing_burst: TypingBurst,
    pub admission: EncoderAdmission,
    keyframe_requester: Arc<dyn KeyframeRequester>,
}

impl StreamContext {
    pub fn new(
        stream_id: StreamID,
        latency_mode: LatencyMode,
        configured_quality_ceiling: f64,
        encoder_admission_limit: u32,
        keyframe_requester: Arc<dyn KeyframeRequester>,
    ) -> Self {
        Self {
            stream_id,
            latency_mode: Mutex::new(latency_mode),
            keyframe_recovery: KeyframeRecovery::new(),
            auto_recovery: AutoRecovery::new(configured_quality_ceiling),
            typing_burst: TypingBurst::new(),
            admission: EncoderAdmission::new(encoder_admission_limit),
            keyframe_requester,
        }
    }

    pub fn latency_mode(&self) -> LatencyMode {
        *self.latency_mode.lock().unwrap()
    }

    pub fn set_latency_mode(&self, mode: LatencyMode) {
        *self.latency_mode.lock().unwrap() = mode;
    }

    /// Drives both the internal keyframe-recovery escalation and the
    /// external notification in one call.
    pub fn request_keyframe(&self, now: Instant, reason: &'static str) -> RecoveryKind {
        let kind = self.keyframe_recovery.request_keyframe(now);
        if kind != RecoveryKind::Coalesced {
            self.keyframe_requester.request_keyframe(self.stream_id, reason);
        }
        kind
    }

    /// `noteTypingBurstActivity`; a no-op outside `latencyMode = auto`.
    pub fn note_typing_burst_activity(&self, now: Instant) {
        if self.latency_mode() != LatencyMode::Auto {
            return;
        }
        self.typing_burst.note_activity(now, self.auto_recovery.max_in_flight_frames(), self.auto_recovery.quality_ceiling());
    }

    pub fn expire_typing_burst_if_needed(&self, now: Instant) {
        if self.latency_mode() != LatencyMode::Auto {
            return;
        }
        self.typing_burst.expire_if_needed(now);
    }

    /// Effective `maxInFlightFrames`: the tightest of baseline, auto
    /// recovery, and an active typing burst.
    pub fn effective_max_in_flight_frames(&self) -> u32 {
        let mut value = self.auto_recovery.max_in_flight_frames();
        if let Some(burst) = self.typing_burst.max_in_flight_frames() {
            value = value.min(burst);
        }
        value
    }

    /// Effective quality ceiling: the tightest of auto recovery and an
    /// active typing burst.
    pub fn effective_quality_ceiling(&self) -> f64 {
        let mut ceiling = self.auto_recovery.quality_ceiling();
        if let Some(burst) = self.typing_burst.quality_ceiling() {
            ceiling = ceiling.min(burst);
        }
        ceiling
    }

    /// Clamps a desired `activeQuality` to the current effective ceiling.
    pub fn clamp_active_quality(&self, desired: f64) -> f64 {
        desired.min(self.effective_quality_ceiling())
    }

    /// Derives the baseline `qualityCeiling` a newly configured stream
    /// should start at, from the encoder settings it was just given
    /// (spec §4.5's `derivedQualities`, applied to the current encoder
    /// target rather than a fixed constant).
    pub fn configured_quality_ceiling(settings: &EncoderSettings, resolution: Resolution) -> f64 {
        let (frame_quality, _keyframe_quality) =
            derived_qualities(settings.bitrate_bps, resolution.width, resolution.height, settings.target_frame_rate);
        frame_quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miragekit_core::types::{ColorSpace, PixelFormat, VideoCodec};
    use std::sync::atomic::AtomicU64;

    struct RecordingKeyframeRequester {
        count: AtomicU64,
    }

    impl KeyframeRequester for RecordingKeyframeRequester {
        fn request_keyframe(&self, _stream_id: StreamID, _reason: &'static str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample(encode_fps: f64, avg_encode_ms: f64) -> EncodeWindowSample {
        EncodeWindowSample { capture_fps: encode_fps, encode_fps, avg_encode_ms, pending_count: 0 }
    }

    fn settings(bitrate_bps: u64, target_frame_rate: u32) -> EncoderSettings {
        EncoderSettings {
            codec: VideoCodec::Hevc,
            target_frame_rate,
            key_frame_interval: 120,
            bit_depth: 8,
            color_space: ColorSpace::Srgb,
            pixel_format: PixelFormat::Nv12,
            bitrate_bps,
        }
    }

    #[test]
    fn keyframe_recovery_coalesces_requests_within_one_second() {
        let recovery = KeyframeRecovery::new();
        let t0 = Instant::now();
        assert_eq!(recovery.request_keyframe(t0), RecoveryKind::Soft);
        assert_eq!(recovery.request_keyframe(t0 + Duration::from_millis(200)), RecoveryKind::Coalesced);
        assert_eq!(recovery.soft_recovery_count(), 1);
    }

    #[test]
    fn keyframe_recovery_escalates_to_hard_when_soft_keeps_failing() {
        let recovery = KeyframeRecovery::new();
        let t0 = Instant::now();
        assert_eq!(recovery.request_keyframe(t0), RecoveryKind::Soft);
        // Acknowledge so the coalesce window doesn't swallow the next call.
        recovery.acknowledge_keyframe_emitted();
        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(recovery.request_keyframe(t1), RecoveryKind::Hard);
        assert_eq!(recovery.hard_recovery_count(), 1);
        let (reset, flush) = recovery.take_reset_and_flush();
        assert!(reset && flush);
        assert!(recovery.is_loss_mode_active(t1 + Duration::from_secs(1)));
        assert!(!recovery.is_loss_mode_active(t1 + Duration::from_secs(4)));
    }

    #[test]
    fn scheduled_keyframes_suppressed_while_pending() {
        let recovery = KeyframeRecovery::new();
        let t0 = Instant::now();
        assert!(!recovery.scheduled_keyframes_suppressed());
        recovery.request_keyframe(t0);
        assert!(recovery.scheduled_keyframes_suppressed());
        recovery.acknowledge_keyframe_emitted();
        assert!(!recovery.scheduled_keyframes_suppressed());
    }

    /// Scenario F (spec §8): frame budget 16.67 ms, latencyMode=auto.
    #[test]
    fn scenario_f_auto_recovery_entry_and_exit() {
        let auto = AutoRecovery::new(0.80);
        let t0 = Instant::now();

        auto.evaluate(t0, 60, sample(40.0, 25.0));
        auto.evaluate(t0 + Duration::from_secs(1), 60, sample(40.0, 25.0));
        assert!(auto.is_active());
        assert_eq!(auto.max_in_flight_frames(), 1);
        assert!(auto.quality_ceiling() <= 0.58);

        let t_23_0 = t0 + Duration::from_millis(23_000);
        auto.evaluate(t_23_0, 60, sample(60.0, 16.67));
        assert!(auto.is_active(), "still within hold at 23.0s");

        let t_24_2 = t0 + Duration::from_millis(24_200);
        auto.evaluate(t_24_2, 60, sample(60.0, 16.67));
        assert!(auto.is_active(), "one healthy window isn't enough to exit");

        let t_26_3 = t0 + Duration::from_millis(26_300);
        auto.evaluate(t_26_3, 60, sample(60.0, 16.67));
        assert!(!auto.is_active(), "two healthy windows exit recovery");
        assert_eq!(auto.max_in_flight_frames(), BASELINE_MAX_IN_FLIGHT);
        let cooldown = auto.cooldown_until().expect("cooldown armed on exit");
        assert!(cooldown > t_26_3);
    }

    #[test]
    fn auto_recovery_state_machine_is_idempotent_for_repeated_identical_windows() {
        let auto = AutoRecovery::new(0.80);
        let t0 = Instant::now();
        auto.evaluate(t0, 60, sample(40.0, 25.0));
        auto.evaluate(t0 + Duration::from_secs(1), 60, sample(40.0, 25.0));
        assert!(auto.is_active());

        let snapshot_active = auto.is_active();
        let snapshot_in_flight = auto.max_in_flight_frames();
        let snapshot_ceiling = auto.quality_ceiling();

        // Re-applying the exact same (now, sample) must not change state
        // further (spec §8 property 10) — this call is still inside the
        // hold window, so it is a pure no-op.
        auto.evaluate(t0 + Duration::from_secs(1), 60, sample(40.0, 25.0));
        assert_eq!(auto.is_active(), snapshot_active);
        assert_eq!(auto.max_in_flight_frames(), snapshot_in_flight);
        assert_eq!(auto.quality_ceiling(), snapshot_ceiling);
    }

    #[test]
    fn typing_burst_clamps_and_restores_baseline() {
        let burst = TypingBurst::new();
        let t0 = Instant::now();
        assert!(!burst.is_active());

        burst.note_activity(t0, 2, 0.80);
        assert!(burst.is_active());
        assert_eq!(burst.max_in_flight_frames(), Some(1));
        assert_eq!(burst.quality_ceiling(), Some(0.62));

        // Extends the deadline rather than reactivating with new baselines.
        burst.note_activity(t0 + Duration::from_millis(100), 1, 0.10);
        assert_eq!(burst.quality_ceiling(), Some(0.62));

        assert_eq!(burst.expire_if_needed(t0 + Duration::from_millis(300)), None);
        let restored = burst.expire_if_needed(t0 + Duration::from_millis(460));
        assert_eq!(restored, Some((2, 0.80)));
        assert!(!burst.is_active());
    }

    #[test]
    fn stream_context_active_quality_never_exceeds_typing_burst_ceiling() {
        let requester = Arc::new(RecordingKeyframeRequester { count: AtomicU64::new(0) });
        let ctx = StreamContext::new(1, LatencyMode::Auto, 0.80, 2, requester);
        let t0 = Instant::now();

        assert_eq!(ctx.clamp_active_quality(0.95), 0.80);

        ctx.note_typing_burst_activity(t0);
        assert!(ctx.clamp_active_quality(0.95) <= 0.62);

        ctx.expire_typing_burst_if_needed(t0 + Duration::from_millis(400));
        assert_eq!(ctx.clamp_active_quality(0.95), 0.80);
    }

    #[test]
    fn typing_burst_is_ignored_outside_auto_latency_mode() {
        let requester = Arc::new(RecordingKeyframeRequester { count: AtomicU64::new(0) });
        let ctx = StreamContext::new(1, LatencyMode::Smoothest, 0.80, 2, requester);
        ctx.note_typing_burst_activity(Instant::now());
        assert!(!ctx.typing_burst.is_active());
    }

    #[test]
    fn encoder_admission_saturates_and_releases() {
        let admission = EncoderAdmission::new(2);
        assert!(admission.reserve_slot());
        assert!(admission.reserve_slot());
        assert!(!admission.reserve_slot());
        admission.release_slot();
        assert!(admission.reserve_slot());
        admission.reset();
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn encoder_admission_release_never_underflows() {
        let admission = EncoderAdmission::new(2);
        admission.release_slot();
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn encoder_settings_update_mode_classifies_correctly() {
        let base = settings(8_000_000, 60);
        assert_eq!(encoder_settings_update_mode(&base, &base), EncoderSettingsUpdateMode::NoChange);

        let bitrate_changed = settings(10_000_000, 60);
        assert_eq!(
            encoder_settings_update_mode(&base, &bitrate_changed),
            EncoderSettingsUpdateMode::BitrateOnly
        );

        let frame_rate_changed = settings(8_000_000, 120);
        assert_eq!(
            encoder_settings_update_mode(&base, &frame_rate_changed),
            EncoderSettingsUpdateMode::FullReconfiguration
        );
    }

    #[test]
    fn configured_quality_ceiling_derives_from_encoder_settings() {
        let s = settings(8_000_000, 60);
        let ceiling = StreamContext::configured_quality_ceiling(&s, Resolution::FHD);
        assert!(ceiling > 0.0 && ceiling <= 0.80);
    }

    #[test]
    fn encoder_settings_update_mode_is_pure() {
        let a = settings(8_000_000, 60);
        let b = settings(10_000_000, 60);
        assert_eq!(encoder_settings_update_mode(&a, &b), encoder_settings_update_mode(&a, &b));
    }

    #[test]
    fn desktop_resize_ignores_unchanged_resolution() {
        assert_eq!(
            desktop_resize_request_decision(Resolution::FHD, Resolution::FHD),
            ResizeDecision::Ignore
        );
    }

    #[test]
    fn desktop_resize_small_change_skips_quality_reconsideration() {
        let current = Resolution::new(1920, 1080);
        let requested = Resolution::new(1920, 1088); // < 20% pixel delta
        assert_eq!(
            desktop_resize_request_decision(current, requested),
            ResizeDecision::ApplyDimensionOnly
        );
    }

    #[test]
    fn desktop_resize_large_change_requests_quality_reconsideration() {
        assert_eq!(
            desktop_resize_request_decision(Resolution::FHD, Resolution::UHD),
            ResizeDecision::ApplyWithQualityReconsideration
        );
    }

    #[test]
    fn desktop_resize_request_decision_is_pure() {
        let a = Resolution::new(1280, 720);
        let b = Resolution::new(1920, 1080);
        assert_eq!(
            desktop_resize_request_decision(a, b),
            desktop_resize_request_decision(a, b)
        );
    }
}
