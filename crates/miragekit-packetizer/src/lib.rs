//! miragekit-packetizer — host-side fragmentation, sequencing, and optional
//! AEAD for outbound video (spec §4.4).
//!
//! Fragmentation follows the same manual big-endian framing style as
//! `miragekit-wire`; this crate is the sender-side counterpart to
//! `miragekit-reassembler`, one instance per outbound stream.

use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

type NonceBytes = [u8; 12];
use bytes::{Bytes, BytesMut};
use miragekit_core::{
    ContentRect, CryptoError, DimensionToken, Epoch, FrameNumber, SequenceNumber, StreamID,
    Timestamp, Tunables,
};
use miragekit_wire::video::{self, VideoFlags, VideoHeader};
use miragekit_wire::{crc32, VIDEO_HEADER_SIZE};

const AEAD_TAG_LEN: usize = 16;
const AEAD_KEY_LEN: usize = 32;

/// Per-stream encrypt-then-authenticate context. The nonce binds to
/// `(streamID, epoch, sequenceNumber, fragmentIndex)` — spec §9 leaves the
/// exact IV construction an open question; this one is 12 bytes, exactly
/// the fields named, and is unique as long as `resetEpoch` is called on
/// every encoder reset/restart (the epoch never repeats across the
/// lifetime of a given key).
pub struct MediaSecurityContext {
    cipher: Aes256Gcm,
}

impl MediaSecurityContext {
    pub fn new(key: &[u8; AEAD_KEY_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    fn nonce_bytes(stream_id: StreamID, epoch: Epoch, sequence_number: SequenceNumber, fragment_index: u16) -> NonceBytes {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&stream_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&epoch.to_be_bytes());
        bytes[6..10].copy_from_slice(&sequence_number.to_be_bytes());
        bytes[10..12].copy_from_slice(&fragment_index.to_be_bytes());
        bytes
    }

    fn seal(&self, stream_id: StreamID, epoch: Epoch, sequence_number: SequenceNumber, fragment_index: u16, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = Self::nonce_bytes(stream_id, epoch, sequence_number, fragment_index);
        let nonce = Nonce::from_slice(&bytes);
        self.cipher.encrypt(nonce, plaintext).map_err(|_| CryptoError::SealFailed)
    }
}

/// Caller-supplied metadata for one encoded access unit (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct VideoFrameMeta {
    pub frame_number: FrameNumber,
    pub keyframe: bool,
    pub discontinuity: bool,
    pub parameter_set: bool,
    pub dimension_token: DimensionToken,
    pub content_rect: ContentRect,
    pub timestamp: Timestamp,
}

struct PacketizerState {
    epoch: Epoch,
    sequence_number: SequenceNumber,
}

pub struct Packetizer {
    stream_id: StreamID,
    tunables: Tunables,
    security: Option<MediaSecurityContext>,
    duplicate_parameter_set_first_fragment: AtomicBool,
    fec_block_size: AtomicU32,
    state: Mutex<PacketizerState>,
}

impl Packetizer {
    pub fn new(stream_id: StreamID, tunables: Tunables, security: Option<MediaSecurityContext>) -> Self {
        Self {
            stream_id,
            tunables,
            security,
            duplicate_parameter_set_first_fragment: AtomicBool::new(false),
            fec_block_size: AtomicU32::new(1),
            state: Mutex::new(PacketizerState { epoch: 0, sequence_number: 0 }),
        }
    }

    /// Enable or disable the parameter-set duplication experiment gate
    /// (spec §4.4: duplicate only the first fragment of a keyframe that
    /// also carries `parameterSet`).
    pub fn set_parameter_set_duplication(&self, enabled: bool) {
        self.duplicate_parameter_set_first_fragment.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// FEC block size is tracked here as the host stream context's recovery
    /// state machine toggles it (spec §4.6.1), but parity generation itself
    /// is outside this crate's scope — the spec names the knob without
    /// specifying a parity algorithm.
    pub fn set_fec_block_size(&self, size: u32) {
        self.fec_block_size.store(size.max(1), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn fec_block_size(&self) -> u32 {
        self.fec_block_size.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn current_epoch(&self) -> Epoch {
        self.state.lock().unwrap().epoch
    }

    /// Increment epoch and zero the sequence counter — called on encoder
    /// reset or dimension change (spec §4.4).
    pub fn reset_epoch(&self) -> Epoch {
        let mut state = self.state.lock().unwrap();
        state.epoch = state.epoch.wrapping_add(1);
        state.sequence_number = 0;
        tracing::info!(stream_id = self.stream_id, epoch = state.epoch, "packetizer epoch reset");
        state.epoch
    }

    fn max_payload_size(&self) -> usize {
        let mut max_payload = self.tunables.max_packet_size.saturating_sub(VIDEO_HEADER_SIZE);
        if self.security.is_some() {
            max_payload = max_payload.saturating_sub(AEAD_TAG_LEN);
        }
        max_payload.max(1)
    }

    /// Fragment one encoded access unit into wire-ready UDP datagrams.
    pub fn packetize(&self, encoded: &[u8], meta: VideoFrameMeta) -> Result<Vec<Bytes>, CryptoError> {
        let max_payload = self.max_payload_size();
        let total_fragments = encoded.len().div_ceil(max_payload).max(1).min(u16::MAX as usize) as u16;

        let mut out = Vec::with_capacity(total_fragments as usize);
        let mut state = self.state.lock().unwrap();
        let epoch = state.epoch;

        for fragment_index in 0..total_fragments {
            let offset = fragment_index as usize * max_payload;
            let end = (offset + max_payload).min(encoded.len());
            let slice = &encoded[offset..end];
            let sequence_number = state.sequence_number;
            state.sequence_number = state.sequence_number.wrapping_add(1);

            let is_first_fragment = fragment_index == 0;
            let (wire_payload, checksum) = match &self.security {
                Some(ctx) => {
                    let sealed = ctx.seal(self.stream_id, epoch, sequence_number, fragment_index, slice)?;
                    (sealed, 0)
                }
                None => (slice.to_vec(), crc32(slice)),
            };

            let header = VideoHeader {
                flags: VideoFlags {
                    keyframe: meta.keyframe,
                    discontinuity: meta.discontinuity,
                    parameter_set: meta.parameter_set,
                    encrypted_payload: self.security.is_some(),
                },
                stream_id: self.stream_id,
                epoch,
                dimension_token: meta.dimension_token,
                frame_number: meta.frame_number,
                fragment_index,
                fragment_count: total_fragments,
                sequence_number,
                timestamp: meta.timestamp,
                content_rect: meta.content_rect,
                payload_length: slice.len() as u32,
                checksum,
            };

            let datagram = build_datagram(&header, &wire_payload);

            let gate_enabled = self.duplicate_parameter_set_first_fragment.load(std::sync::atomic::Ordering::Relaxed);
            if should_duplicate_parameter_set_packet(gate_enabled, fragment_index, meta.keyframe, meta.parameter_set) {
                debug_assert!(is_first_fragment);
                out.push(datagram.clone());
            }
            out.push(datagram);
        }

        Ok(out)
    }
}

/// Pure decision for the parameter-set duplication gate (spec §4.4, §8
/// property 8): duplicate a fragment iff the gate is enabled, it is the
/// first fragment of a frame, and that frame is a keyframe carrying a
/// parameter set. Split out from [`Packetizer::packetize`] so the rule
/// itself is independently testable for purity.
pub fn should_duplicate_parameter_set_packet(
    gate_enabled: bool,
    fragment_index: u16,
    is_keyframe: bool,
    is_parameter_set: bool,
) -> bool {
    gate_enabled && fragment_index == 0 && is_keyframe && is_parameter_set
}

fn build_datagram(header: &VideoHeader, payload: &[u8]) -> Bytes {
    let header_bytes = video::serialize(header);
    let mut out = BytesMut::with_capacity(header_bytes.len() + payload.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    out.freeze()
}
