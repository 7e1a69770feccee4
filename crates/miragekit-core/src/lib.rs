//! miragekit-core — shared identifiers, tunables, errors, and the
//! external-collaborator/observer traits the rest of the MirageKit
//! streaming-core workspace is written against.

pub mod collaborators;
pub mod errors;
pub mod ids;
pub mod rolling;
pub mod transport_trait;
pub mod tunables;
pub mod types;

pub use collaborators::{
    AdaptiveFallbackObserver, Capturer, CollaboratorError, FrameLossObserver, KeyframeRequester,
    Renderer, VideoDecoder, VideoEncoder,
};
pub use errors::{ConfigError, CryptoError, TransportSendError};
pub use ids::{ContentRect, DimensionToken, Epoch, FrameNumber, SequenceNumber, StreamID, Timestamp};
pub use rolling::RollingWindow;
pub use transport_trait::UdpTransport;
pub use tunables::Tunables;
pub use types::{ColorSpace, EncoderSettings, LatencyMode, PixelFormat, Resolution, VideoCodec};
