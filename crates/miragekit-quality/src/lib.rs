//! miragekit-quality — pure encoder-quality and data-rate-limit policy
//! (spec §4.5).
//!
//! The teacher has no precedent for this: DualLink never adapts encoder
//! quality to bitrate pressure (its GStreamer sender pins a single fixed
//! `quality-level` property). This crate is built from scratch as a
//! continuous function of compression pressure over `(bitrate, resolution,
//! frame rate)`, kept dependency-free like the rest of the workspace's pure
//! policy crates.
//!
//! Every function here is pure: no I/O, no shared state, no clock reads.
//! `miragekit-host` is the only caller that threads live stream state
//! through them.

/// Lower bound for both `frameQuality` and `keyframeQuality`.
pub const QUALITY_FLOOR: f64 = 0.12;

/// Absolute ceiling for `frameQuality`, independent of bitrate.
pub const QUALITY_CEILING: f64 = 0.80;

/// Floor `keyframeQuality(for:)` compresses toward as queued bytes grow.
pub const KEYFRAME_QUALITY_FLOOR: f64 = 0.10;

/// Fraction of `frameQuality` a freshly-derived `keyframeQuality` starts at.
const KEYFRAME_QUALITY_RATIO: f64 = 0.85;

/// Reference pressure (pixels × frameRate / bitrateBps) at which the
/// quality curve crosses the midpoint of its range. Chosen so that the
/// severely-constrained example in spec §4.5 (20 Mbps at 3840×2160@60)
/// lands at ~0.24, comfortably under the 0.30 hard ceiling for that case.
const PRESSURE_REFERENCE: f64 = 8.0;

/// Derives `(frameQuality, keyframeQuality)` from the target bitrate and
/// output geometry (spec §4.5).
///
/// `pressure = pixels * frameRate / targetBitrateBps` is the compression
/// load per encoded second; quality falls monotonically as pressure rises.
/// Frame rate enters multiplicatively, so two streams with identical
/// bitrate-per-pixel but different frame rates are never equal: the
/// higher-frame-rate stream always sees higher pressure and therefore
/// strictly lower quality.
pub fn derived_qualities(
    target_bitrate_bps: u64,
    width: u32,
    height: u32,
    frame_rate: u32,
) -> (f64, f64) {
    let pixels = width as f64 * height as f64;
    let bitrate = target_bitrate_bps.max(1) as f64;
    let pressure = pixels * frame_rate.max(1) as f64 / bitrate;

    let raw = PRESSURE_REFERENCE / (PRESSURE_REFERENCE + pressure);
    let frame_quality = raw.clamp(QUALITY_FLOOR, QUALITY_CEILING);

    let keyframe_quality =
        (frame_quality * KEYFRAME_QUALITY_RATIO).clamp(QUALITY_FLOOR, frame_quality);

    (frame_quality, keyframe_quality)
}

/// Derives the per-window byte budget used to throttle outbound frame
/// admission (spec §4.5).
///
/// Returns `(bytes, windowSeconds)`. High frame rates get a shorter window
/// so the budget tracks burstiness at 120 Hz without averaging it away.
pub fn data_rate_limit(target_bitrate_bps: u64, target_frame_rate: u32) -> (u64, f64) {
    let window_seconds = if target_frame_rate >= 120 { 0.25 } else { 0.5 };
    let bytes = ((target_bitrate_bps as f64 / 8.0) * window_seconds).round() as u64;
    (bytes.max(1), window_seconds)
}

/// Runtime keyframe-quality compression (spec §4.5): as `queued_bytes`
/// approaches `max_queued_bytes`, the returned quality slides from
/// `base_keyframe_quality` down to [`KEYFRAME_QUALITY_FLOOR`].
///
/// Monotone non-increasing in `queued_bytes` for fixed `base_keyframe_quality`
/// and `max_queued_bytes`; never exceeds `base_keyframe_quality`.
pub fn keyframe_quality_under_pressure(
    queued_bytes: u64,
    max_queued_bytes: u64,
    base_keyframe_quality: f64,
) -> f64 {
    let base = base_keyframe_quality.clamp(KEYFRAME_QUALITY_FLOOR, QUALITY_CEILING);
    if max_queued_bytes == 0 {
        return KEYFRAME_QUALITY_FLOOR.min(base);
    }
    let ratio = (queued_bytes as f64 / max_queued_bytes as f64).clamp(0.0, 1.0);
    let quality = base - ratio * (base - KEYFRAME_QUALITY_FLOOR);
    quality.clamp(KEYFRAME_QUALITY_FLOOR, base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualities_stay_within_floor_and_ceiling() {
        let (fq, kq) = derived_qualities(8_000_000, 1920, 1080, 60);
        assert!((QUALITY_FLOOR..=QUALITY_CEILING).contains(&fq));
        assert!((QUALITY_FLOOR..=fq).contains(&kq));
    }

    #[test]
    fn severely_constrained_bitrate_hits_low_ceiling() {
        // 20 Mbps at 3840x2160@60, the example named in spec §4.5.
        let (fq, _kq) = derived_qualities(20_000_000, 3840, 2160, 60);
        assert!(fq <= 0.30, "expected frameQuality <= 0.30, got {fq}");
    }

    #[test]
    fn frame_quality_never_exceeds_hard_ceiling() {
        // Implausibly generous bitrate for a tiny frame: pressure -> ~0.
        let (fq, _) = derived_qualities(1_000_000_000, 64, 64, 1);
        assert!(fq <= QUALITY_CEILING);
    }

    #[test]
    fn higher_frame_rate_is_strictly_lower_quality_at_equal_bitrate_per_pixel() {
        let pixels = (1920u32, 1080u32);
        // bitrate/pixel held constant across both calls (not scaled by
        // frame rate) — frame rate is the only thing that differs.
        let bitrate_per_pixel = 4.0;
        let bitrate = (bitrate_per_pixel * pixels.0 as f64 * pixels.1 as f64) as u64;

        let (fq_60, _) = derived_qualities(bitrate, pixels.0, pixels.1, 60);
        let (fq_120, _) = derived_qualities(bitrate, pixels.0, pixels.1, 120);
        assert!(fq_120 < fq_60);
    }

    #[test]
    fn quality_is_monotone_in_compression_pressure() {
        let (low_pressure, _) = derived_qualities(40_000_000, 1920, 1080, 60);
        let (mid_pressure, _) = derived_qualities(8_000_000, 1920, 1080, 60);
        let (high_pressure, _) = derived_qualities(1_000_000, 1920, 1080, 60);
        assert!(low_pressure >= mid_pressure);
        assert!(mid_pressure >= high_pressure);
    }

    #[test]
    fn derived_qualities_is_pure() {
        let a = derived_qualities(8_000_000, 1920, 1080, 60);
        let b = derived_qualities(8_000_000, 1920, 1080, 60);
        assert_eq!(a, b);
    }

    #[test]
    fn data_rate_limit_uses_short_window_at_120hz() {
        let (bytes, window) = data_rate_limit(8_000_000, 120);
        assert_eq!(window, 0.25);
        assert_eq!(bytes, (8_000_000.0_f64 / 8.0 * 0.25).round() as u64);
    }

    #[test]
    fn data_rate_limit_uses_half_second_window_below_120hz() {
        let (bytes, window) = data_rate_limit(8_000_000, 60);
        assert_eq!(window, 0.5);
        assert_eq!(bytes, (8_000_000.0_f64 / 8.0 * 0.5).round() as u64);
    }

    #[test]
    fn data_rate_limit_never_returns_zero_bytes() {
        let (bytes, _) = data_rate_limit(1, 60);
        assert_eq!(bytes, 1);
    }

    #[test]
    fn keyframe_quality_under_pressure_is_monotone_non_increasing() {
        let base = 0.7;
        let max = 1_000_000u64;
        let q_empty = keyframe_quality_under_pressure(0, max, base);
        let q_half = keyframe_quality_under_pressure(500_000, max, base);
        let q_full = keyframe_quality_under_pressure(1_000_000, max, base);
        let q_over = keyframe_quality_under_pressure(2_000_000, max, base);

        assert_eq!(q_empty, base);
        assert!(q_half <= q_empty);
        assert!(q_full <= q_half);
        assert_eq!(q_over, q_full, "overshoot clamps at the floor, doesn't go lower");
        assert!(q_full >= KEYFRAME_QUALITY_FLOOR);
    }

    #[test]
    fn keyframe_quality_under_pressure_never_exceeds_base() {
        let q = keyframe_quality_under_pressure(0, 1000, 0.5);
        assert_eq!(q, 0.5);
    }
}
