//! Identifiers and primitives shared by every MirageKit crate (spec §3.1).

use serde::{Deserialize, Serialize};

/// Host-assigned handle for one video or audio stream.
pub type StreamID = u32;

/// Monotonically increasing frame counter within an [`Epoch`]; wraps modulo 2^32.
pub type FrameNumber = u32;

/// Generation counter the host bumps on any discontinuity (encoder reset,
/// dimension change, hard recovery). Buffered state tied to an older epoch
/// is invalidated wholesale when this changes.
pub type Epoch = u16;

/// Discriminator for the encoder's current output dimensions / parameter
/// sets. Keyframes carry the new token; P-frames with a stale token are
/// discarded (the encoder may still have them in flight across a resize).
pub type DimensionToken = u16;

/// Per-stream packet counter used for FEC block selection and loss estimation.
pub type SequenceNumber = u32;

/// Host presentation time of an encoded frame, in nanoseconds.
pub type Timestamp = u64;

/// Pixel rectangle describing the captured region within the encoder's
/// output dimensions. Carried on every video fragment (spec §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl ContentRect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

/// Distance between two [`FrameNumber`]s under u32 wraparound, always
/// returned as a non-negative forward distance from `earlier` to `later`.
pub fn wrapping_forward_distance(later: FrameNumber, earlier: FrameNumber) -> u32 {
    later.wrapping_sub(earlier)
}
