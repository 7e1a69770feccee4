use thiserror::Error;

/// Fail-fast configuration errors (spec §7): the control plane reports these
/// and refuses to enter the streaming state.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {reason}")]
    Invalid { reason: String },
}

/// AEAD failures from the packetizer/reassembler's optional encrypted-payload
/// path (spec §4.4).
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("AEAD seal failed")]
    SealFailed,
    #[error("AEAD open failed (auth tag mismatch or corrupt ciphertext)")]
    OpenFailed,
}

/// Transport-level send errors (spec §7 "send failure on transport" /
/// "missing transport registration").
#[derive(Error, Debug)]
pub enum TransportSendError {
    #[error("no endpoint registered for stream {stream_id}")]
    NoEndpointRegistered { stream_id: crate::ids::StreamID },
    #[error("socket send failed: {reason}")]
    SendFailed { reason: String },
}
