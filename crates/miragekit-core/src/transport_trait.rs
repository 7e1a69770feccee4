//! The `UdpTransport` seam (spec §9: "Apple-frameworks-only pieces ⇒
//! declared as external collaborators behind traits"). `miragekit-transport`
//! provides the concrete `tokio::net::UdpSocket`-backed implementation;
//! `miragekit-packetizer` is written only against this trait so it never
//! has to know whether it's talking to a real socket or a test double.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportSendError;
use crate::ids::StreamID;

#[async_trait]
pub trait UdpTransport: Send + Sync {
    /// Send one already-framed UDP datagram to the endpoint registered for
    /// `stream_id`. Implementations MUST NOT block on registration lookup —
    /// a missing endpoint is `Err(NoEndpointRegistered)`, not a panic or a
    /// silent drop, so callers can still run their buffer-release callback
    /// (spec §7 "the buffer-release callback MUST still fire synchronously").
    async fn send_datagram(&self, stream_id: StreamID, datagram: Bytes) -> Result<(), TransportSendError>;
}
