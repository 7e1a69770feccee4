//! Capability traits at the boundary with things this crate never
//! implements (spec §9): platform capture/codec/render on one side, and the
//! cross-component observer callbacks ("closures as observer callbacks ⇒
//! capability traits") on the other.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::ids::{FrameNumber, StreamID, Timestamp};

/// Declared but never implemented here — screen capture is a platform API
/// (ScreenCaptureKit on macOS) and explicitly out of scope (spec §1).
#[async_trait]
pub trait Capturer: Send + Sync {
    async fn start(&mut self) -> Result<(), CollaboratorError>;
    async fn stop(&mut self);
}

/// Declared but never implemented here — hardware video encode is a
/// platform API (VideoToolbox) and out of scope. `miragekit-quality` derives
/// the quality/bitrate parameters this trait would be driven with.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode_next(&mut self, quality: f64) -> Result<Bytes, CollaboratorError>;
    fn request_keyframe(&mut self);
    fn reset(&mut self);
}

/// Declared but never implemented here — hardware video decode is a
/// platform API (VideoToolbox) and out of scope. The client controller in
/// `miragekit-client` drives this trait's cadence but not its internals.
#[async_trait]
pub trait VideoDecoder: Send + Sync {
    async fn decode(&mut self, access_unit: Bytes, timestamp: Timestamp) -> Result<(), CollaboratorError>;
}

/// Declared but never implemented here — Metal-based presentation is a
/// platform API and out of scope. `miragekit-present` decides *which*
/// decoded frame to hand this trait, not how it draws.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn present(&mut self, frame: Bytes, timestamp: Timestamp) -> Result<(), CollaboratorError>;
}

#[derive(Debug)]
pub struct CollaboratorError(pub String);

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CollaboratorError {}

/// Implemented by the client stream controller's owner, invoked by
/// `miragekit-host`'s keyframe-recovery state machine and by
/// `miragekit-client`'s decode-error/freeze escalation — the control-plane
/// `keyframeRequest` message itself is out of scope (spec §6.4).
pub trait KeyframeRequester: Send + Sync {
    fn request_keyframe(&self, stream_id: StreamID, reason: &'static str);
}

/// Implemented by whoever owns the encoder-settings control channel;
/// invoked by `miragekit-client`'s adaptive-fallback signal (spec §4.7.5).
pub trait AdaptiveFallbackObserver: Send + Sync {
    fn on_adaptive_fallback_needed(&self, stream_id: StreamID);
}

/// Invoked by `miragekit-reassembler` whenever a pending frame is dropped
/// instead of delivered (timeout, superseded by a newer keyframe, etc).
pub trait FrameLossObserver: Send + Sync {
    fn on_frame_loss(&self, stream_id: StreamID, frame_number: FrameNumber);
}
