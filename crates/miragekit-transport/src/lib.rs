//! miragekit-transport — the concrete `tokio::net::UdpSocket`-backed
//! transport the rest of the workspace is written against (spec §5, §6.3).
//!
//! Three responsibilities, matching the teacher's `duallink-transport`
//! shape (a registry guarding shared state, a send-side trait impl, a
//! `tokio::spawn`-per-socket receive loop) generalized from the teacher's
//! single hardcoded video port to MirageKit's registration-driven,
//! multi-stream model:
//!
//! - [`UdpEndpointRegistry`]: the mutex-protected per-stream send-endpoint
//!   table spec §5 calls the "transport registry", plus the stream-kind
//!   map the receive loop needs to know how to parse a given `streamID`.
//! - [`UdpSender`]: the concrete [`miragekit_core::UdpTransport`] impl.
//!   Tracks send failures in a rolling window and notifies a
//!   [`SendFailureObserver`] once the threshold trips (spec §7).
//! - [`UdpReceiver`]: the receive loop. Demuxes registration datagrams
//!   from video/audio ones and hands parsed headers to a [`DatagramSink`].
//!
//! The TCP control plane that actually decides stream<->device mapping is
//! out of scope (spec §6.4) — this crate only owns the UDP datagram
//! plumbing underneath it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use uuid::Uuid;

use miragekit_core::rolling::RollingWindow;
use miragekit_core::{StreamID, TransportSendError, UdpTransport};
use miragekit_wire::audio::AudioHeader;
use miragekit_wire::video::VideoHeader;
use miragekit_wire::{AUDIO_HEADER_SIZE, MAGIC};

/// Which wire format a registered `streamID` carries. The receive loop
/// can't tell video and audio datagrams apart from bytes alone once a
/// stream is known (both share the `streamID` field at the same offset);
/// the control plane tells the registry which is which at stream setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Send-endpoint + stream-kind table (spec §5 "Transport registry").
/// Registration/unregistration is mutex-protected; a missing endpoint is a
/// normal, synchronous outcome, never a panic or a block.
#[derive(Default)]
pub struct UdpEndpointRegistry {
    endpoints: Mutex<HashMap<StreamID, SocketAddr>>,
    kinds: Mutex<HashMap<StreamID, StreamKind>>,
}

impl UdpEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: StreamID, addr: SocketAddr) {
        self.endpoints.lock().unwrap().insert(stream_id, addr);
    }

    pub fn unregister(&self, stream_id: StreamID) {
        self.endpoints.lock().unwrap().remove(&stream_id);
        self.kinds.lock().unwrap().remove(&stream_id);
    }

    pub fn endpoint_for(&self, stream_id: StreamID) -> Option<SocketAddr> {
        self.endpoints.lock().unwrap().get(&stream_id).copied()
    }

    pub fn register_stream_kind(&self, stream_id: StreamID, kind: StreamKind) {
        self.kinds.lock().unwrap().insert(stream_id, kind);
    }

    pub fn stream_kind(&self, stream_id: StreamID) -> Option<StreamKind> {
        self.kinds.lock().unwrap().get(&stream_id).copied()
    }
}

/// First datagram on a new UDP flow (spec §6.3): shared `"MIRA"` magic,
/// then a 16-byte device UUID, then an optional control-plane-issued
/// token carried in whatever bytes remain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub device_id: Uuid,
    pub token: Option<Bytes>,
}

const REGISTRATION_MIN_SIZE: usize = 4 + 16;

/// Parses a registration datagram. Returns `None` on bad magic or a
/// buffer too short to hold a device UUID — silently dropped by the
/// caller like any other malformed packet (spec §7).
pub fn parse_registration(bytes: &[u8]) -> Option<DeviceRegistration> {
    if bytes.len() < REGISTRATION_MIN_SIZE {
        return None;
    }
    if bytes[0..4] != MAGIC {
        return None;
    }
    let uuid_bytes: [u8; 16] = bytes[4..20].try_into().ok()?;
    let device_id = Uuid::from_bytes(uuid_bytes);
    let token = if bytes.len() > REGISTRATION_MIN_SIZE {
        Some(Bytes::copy_from_slice(&bytes[REGISTRATION_MIN_SIZE..]))
    } else {
        None
    };
    Some(DeviceRegistration { device_id, token })
}

fn peek_stream_id(bytes: &[u8]) -> Option<StreamID> {
    if bytes.len() < 10 {
        return None;
    }
    Some(u32::from_be_bytes(bytes[6..10].try_into().ok()?))
}

/// Notified once send failures on a stream cross the rolling-window
/// threshold (spec §7: "6 errors / 1 s, cooldown 2 s ... signals the
/// stream context to trigger a recovery keyframe and arm loss mode").
pub trait SendFailureObserver: Send + Sync {
    fn on_send_failure_threshold(&self, stream_id: StreamID);
}

const SEND_FAILURE_THRESHOLD: usize = 6;
const SEND_FAILURE_WINDOW: Duration = Duration::from_secs(1);
const SEND_FAILURE_COOLDOWN: Duration = Duration::from_secs(2);
const SEND_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(1);

struct FailureTracker {
    window: RollingWindow,
    cooldown_until: Option<Instant>,
    last_logged: Option<Instant>,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self {
            window: RollingWindow::new(SEND_FAILURE_WINDOW),
            cooldown_until: None,
            last_logged: None,
        }
    }
}

/// The concrete [`UdpTransport`] every other crate in this workspace is
/// written against. Wraps one bound `UdpSocket` plus the endpoint
/// registry; failed sends are tracked per stream and escalated to an
/// optional [`SendFailureObserver`] once they cross the threshold.
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    registry: Arc<UdpEndpointRegistry>,
    failures: Mutex<HashMap<StreamID, FailureTracker>>,
    observer: Option<Arc<dyn SendFailureObserver>>,
}

impl UdpSender {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<UdpEndpointRegistry>,
        observer: Option<Arc<dyn SendFailureObserver>>,
    ) -> Self {
        Self { socket, registry, failures: Mutex::new(HashMap::new()), observer }
    }

    fn clear_failures(&self, stream_id: StreamID) {
        if let Some(tracker) = self.failures.lock().unwrap().get_mut(&stream_id) {
            tracker.window.clear();
        }
    }

    fn record_failure(&self, stream_id: StreamID, now: Instant) {
        let mut failures = self.failures.lock().unwrap();
        let tracker = failures.entry(stream_id).or_default();
        tracker.window.record(now);

        let should_log = tracker.last_logged.map(|at| now.saturating_duration_since(at) >= SEND_FAILURE_LOG_INTERVAL).unwrap_or(true);
        if should_log {
            tracker.last_logged = Some(now);
            tracing::warn!(stream_id, "udp send failed");
        }

        let in_cooldown = tracker.cooldown_until.map(|until| now < until).unwrap_or(false);
        let escalate = !in_cooldown && tracker.window.count() >= SEND_FAILURE_THRESHOLD;
        if escalate {
            tracker.cooldown_until = Some(now + SEND_FAILURE_COOLDOWN);
            tracker.window.clear();
        }
        drop(failures);

        if escalate {
            if let Some(observer) = &self.observer {
                observer.on_send_failure_threshold(stream_id);
            }
        }
    }
}

#[async_trait]
impl UdpTransport for UdpSender {
    async fn send_datagram(&self, stream_id: StreamID, datagram: Bytes) -> Result<(), TransportSendError> {
        let Some(addr) = self.registry.endpoint_for(stream_id) else {
            return Err(TransportSendError::NoEndpointRegistered { stream_id });
        };
        match self.socket.send_to(&datagram, addr).await {
            Ok(_) => {
                self.clear_failures(stream_id);
                Ok(())
            }
            Err(err) => {
                self.record_failure(stream_id, Instant::now());
                Err(TransportSendError::SendFailed { reason: err.to_string() })
            }
        }
    }
}

/// Receive-side callback surface. Methods are called synchronously from
/// the receive loop's task; implementations that need to cross into
/// reassembler/audio-consumer state should do so the same way the rest of
/// the workspace does — a short-held mutex, never an await, inside the
/// callback (spec §5).
pub trait DatagramSink: Send + Sync {
    fn on_video_datagram(&self, header: VideoHeader, payload: &[u8]);
    fn on_audio_datagram(&self, header: AudioHeader, payload: &[u8]);
    fn on_registration(&self, source: SocketAddr, registration: DeviceRegistration);
}

const RECV_BUFFER_SIZE: usize = 65_536;

/// The UDP receive loop: one per bound socket, grounded on the teacher's
/// `run_udp_receiver` task shape (`tokio::spawn` around a `recv_from`
/// loop), demuxing the MirageKit wire formats instead of the teacher's
/// single hardcoded layout.
pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    registry: Arc<UdpEndpointRegistry>,
}

impl UdpReceiver {
    pub fn new(socket: Arc<UdpSocket>, registry: Arc<UdpEndpointRegistry>) -> Self {
        Self { socket, registry }
    }

    /// Runs until the socket errors out or the task is cancelled. Spawn
    /// this with `tokio::spawn` per spec §5's "parallel tasks... for UDP
    /// receive" scheduling model.
    pub async fn run(self, sink: Arc<dyn DatagramSink>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => self.dispatch(&buf[..len], addr, sink.as_ref()),
                Err(err) => {
                    tracing::warn!(error = %err, "udp recv_from failed");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, bytes: &[u8], addr: SocketAddr, sink: &dyn DatagramSink) {
        if bytes.len() < 4 || bytes[0..4] != MAGIC {
            return;
        }

        // Registration datagrams are shorter than the smallest media
        // header (audio, 44 bytes); media datagrams are always at least
        // that long including payload.
        if bytes.len() < AUDIO_HEADER_SIZE {
            if let Some(registration) = parse_registration(bytes) {
                sink.on_registration(addr, registration);
            }
            return;
        }

        let Some(stream_id) = peek_stream_id(bytes) else {
            return;
        };

        match self.registry.stream_kind(stream_id) {
            Some(StreamKind::Video) => {
                self.dispatch_video(bytes, sink);
            }
            Some(StreamKind::Audio) => {
                self.dispatch_audio(bytes, sink);
            }
            None => {
                // Stream kind not (yet) registered: fall back to trying
                // both codecs. Each deserializer validates its own fixed
                // layout and length, so a mismatched guess just fails to
                // parse rather than misreading a payload.
                if !self.dispatch_video(bytes, sink) {
                    self.dispatch_audio(bytes, sink);
                }
            }
        }
    }

    fn dispatch_video(&self, bytes: &[u8], sink: &dyn DatagramSink) -> bool {
        match miragekit_wire::video::deserialize(bytes) {
            Some((header, offset)) => {
                sink.on_video_datagram(header, &bytes[offset..]);
                true
            }
            None => false,
        }
    }

    fn dispatch_audio(&self, bytes: &[u8], sink: &dyn DatagramSink) -> bool {
        match miragekit_wire::audio::deserialize(bytes) {
            Some((header, offset)) => {
                sink.on_audio_datagram(header, &bytes[offset..]);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miragekit_wire::video::{VideoFlags, HEADER_SIZE as VIDEO_HEADER_SIZE};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_video_header(stream_id: StreamID) -> VideoHeader {
        VideoHeader {
            flags: VideoFlags { keyframe: true, discontinuity: false, parameter_set: false, encrypted_payload: false },
            stream_id,
            epoch: 1,
            dimension_token: 1,
            frame_number: 1,
            fragment_index: 0,
            fragment_count: 1,
            sequence_number: 1,
            timestamp: 1,
            content_rect: miragekit_core::ContentRect::new(0, 0, 100, 100),
            payload_length: 4,
            checksum: miragekit_wire::crc32(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn registry_round_trips_endpoint_and_kind() {
        let registry = UdpEndpointRegistry::new();
        let addr: SocketAddr = (Ipv4Addr::LOCALHOST, 9000).into();
        assert_eq!(registry.endpoint_for(1), None);

        registry.register(1, addr);
        registry.register_stream_kind(1, StreamKind::Video);
        assert_eq!(registry.endpoint_for(1), Some(addr));
        assert_eq!(registry.stream_kind(1), Some(StreamKind::Video));

        registry.unregister(1);
        assert_eq!(registry.endpoint_for(1), None);
        assert_eq!(registry.stream_kind(1), None);
    }

    #[test]
    fn parse_registration_extracts_uuid_and_token() {
        let device_id = Uuid::from_bytes([7u8; 16]);
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&MAGIC);
        datagram.extend_from_slice(device_id.as_bytes());
        datagram.extend_from_slice(b"token-bytes");

        let parsed = parse_registration(&datagram).expect("valid registration");
        assert_eq!(parsed.device_id, device_id);
        assert_eq!(parsed.token.as_deref(), Some(&b"token-bytes"[..]));
    }

    #[test]
    fn parse_registration_without_token_is_none() {
        let device_id = Uuid::from_bytes([3u8; 16]);
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&MAGIC);
        datagram.extend_from_slice(device_id.as_bytes());

        let parsed = parse_registration(&datagram).expect("valid registration");
        assert_eq!(parsed.token, None);
    }

    #[test]
    fn parse_registration_rejects_short_buffer_and_bad_magic() {
        assert!(parse_registration(&[0u8; 10]).is_none());
        let mut datagram = vec![b'X'; 20];
        datagram[0..4].copy_from_slice(b"NOPE");
        assert!(parse_registration(&datagram).is_none());
    }

    struct RecordingSink {
        videos: AtomicUsize,
        audios: AtomicUsize,
        registrations: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { videos: AtomicUsize::new(0), audios: AtomicUsize::new(0), registrations: AtomicUsize::new(0) }
        }
    }

    impl DatagramSink for RecordingSink {
        fn on_video_datagram(&self, _header: VideoHeader, _payload: &[u8]) {
            self.videos.fetch_add(1, Ordering::SeqCst);
        }

        fn on_audio_datagram(&self, _header: AudioHeader, _payload: &[u8]) {
            self.audios.fetch_add(1, Ordering::SeqCst);
        }

        fn on_registration(&self, _source: SocketAddr, _registration: DeviceRegistration) {
            self.registrations.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn receiver_for_test() -> UdpReceiver {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        UdpReceiver { socket: Arc::new(socket), registry: Arc::new(UdpEndpointRegistry::new()) }
    }

    #[tokio::test]
    async fn dispatch_routes_registration_below_audio_header_size() {
        let receiver = receiver_for_test().await;
        let sink = Arc::new(RecordingSink::new());
        let device_id = Uuid::from_bytes([1u8; 16]);
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&MAGIC);
        datagram.extend_from_slice(device_id.as_bytes());

        receiver.dispatch(&datagram, (Ipv4Addr::LOCALHOST, 1).into(), sink.as_ref());
        assert_eq!(sink.registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_routes_registered_video_stream() {
        let receiver = receiver_for_test().await;
        receiver.registry.register_stream_kind(42, StreamKind::Video);
        let sink = Arc::new(RecordingSink::new());

        let header = sample_video_header(42);
        let mut datagram = miragekit_wire::video::serialize(&header).to_vec();
        datagram.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(datagram.len(), VIDEO_HEADER_SIZE + 4);

        receiver.dispatch(&datagram, (Ipv4Addr::LOCALHOST, 1).into(), sink.as_ref());
        assert_eq!(sink.videos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_audio_when_stream_kind_unknown() {
        let receiver = receiver_for_test().await;
        let sink = Arc::new(RecordingSink::new());

        let header = AudioHeader {
            flags: miragekit_wire::AudioFlags { keyframe: true, discontinuity: false, encrypted_payload: false },
            stream_id: 5,
            sequence_number: 1,
            timestamp: 1,
            codec: miragekit_wire::AudioCodec::Aac,
            sample_rate: 48_000,
            channel_count: 2,
            channel_layout_tag: 0,
            fragment_index: 0,
            fragment_count: 1,
            payload_length: 4,
            checksum: miragekit_wire::crc32(&[9, 9, 9, 9]),
        };
        let mut datagram = miragekit_wire::audio::serialize(&header).to_vec();
        datagram.extend_from_slice(&[9, 9, 9, 9]);

        receiver.dispatch(&datagram, (Ipv4Addr::LOCALHOST, 1).into(), sink.as_ref());
        assert_eq!(sink.audios.load(Ordering::SeqCst), 1);
        assert_eq!(sink.videos.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_drops_malformed_magic_silently() {
        let receiver = receiver_for_test().await;
        let sink = Arc::new(RecordingSink::new());
        receiver.dispatch(b"not-a-mirage-datagram-at-all-", (Ipv4Addr::LOCALHOST, 1).into(), sink.as_ref());
        assert_eq!(sink.videos.load(Ordering::SeqCst), 0);
        assert_eq!(sink.audios.load(Ordering::SeqCst), 0);
        assert_eq!(sink.registrations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_datagram_without_registration_returns_error_synchronously() {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let registry = Arc::new(UdpEndpointRegistry::new());
        let sender = UdpSender::new(socket, registry, None);
        let result = sender.send_datagram(1, Bytes::from_static(b"hi")).await;
        assert!(matches!(result, Err(TransportSendError::NoEndpointRegistered { stream_id: 1 })));
    }

    #[tokio::test]
    async fn send_datagram_delivers_to_registered_endpoint() {
        let sender_socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let receiver_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let receiver_addr = receiver_socket.local_addr().unwrap();

        let registry = Arc::new(UdpEndpointRegistry::new());
        registry.register(1, receiver_addr);
        let sender = UdpSender::new(sender_socket, registry, None);

        sender.send_datagram(1, Bytes::from_static(b"payload")).await.expect("send succeeds");

        let mut buf = [0u8; 16];
        let (len, _) = receiver_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"payload");
    }

    struct CountingFailureObserver {
        count: AtomicUsize,
    }

    impl SendFailureObserver for CountingFailureObserver {
        fn on_send_failure_threshold(&self, _stream_id: StreamID) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn repeated_send_failures_escalate_to_observer() {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let registry = Arc::new(UdpEndpointRegistry::new());
        let observer = Arc::new(CountingFailureObserver { count: AtomicUsize::new(0) });
        let sender = UdpSender::new(socket, registry, Some(observer.clone()));

        // Drive the rolling-window accounting directly rather than
        // through a real failing send — a refused UDP datagram's ICMP
        // error isn't guaranteed to round-trip before the `await`
        // resolves in every sandbox, which would make this flaky.
        for _ in 0..SEND_FAILURE_THRESHOLD {
            sender.record_failure(7, Instant::now());
        }
        assert_eq!(observer.count.load(Ordering::SeqCst), 1);
    }
}
