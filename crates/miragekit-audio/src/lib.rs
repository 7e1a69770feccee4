//! miragekit-audio — host-side audio packetization sharing video's
//! epoch-free sequence/CRC/encrypted-payload model (spec §4.8).
//!
//! Grounded on `miragekit-packetizer`: same fragmentation shape, same
//! optional `aes-gcm` payload seal, same manual big-endian framing via
//! `miragekit-wire`. Audio differs in two ways the spec calls out: there is
//! no reassembler (AAC is one datagram or dropped; PCM fragments are
//! decoded in arrival order with no reference-chain to rebuild), and the
//! wire header carries no epoch field, so the AEAD nonce below drops that
//! term rather than fixing it to zero as filler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{Bytes, BytesMut};

use miragekit_core::{CryptoError, SequenceNumber, StreamID, Timestamp, Tunables};
use miragekit_wire::audio::{self, AudioCodec, AudioFlags, AudioHeader};
use miragekit_wire::{crc32, AUDIO_HEADER_SIZE};

const AEAD_TAG_LEN: usize = 16;
const AEAD_KEY_LEN: usize = 32;
type NonceBytes = [u8; 10];

/// Per-stream AEAD context for audio payloads. The nonce binds to
/// `(streamID, sequenceNumber, fragmentIndex)` — one term short of the
/// video nonce, since the audio wire header has no epoch to bind against.
/// Uniqueness across restarts is the caller's responsibility (e.g. a fresh
/// key per session), same open question as spec §9 raises for video.
pub struct AudioSecurityContext {
    cipher: Aes256Gcm,
}

impl AudioSecurityContext {
    pub fn new(key: &[u8; AEAD_KEY_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    fn nonce_bytes(stream_id: StreamID, sequence_number: SequenceNumber, fragment_index: u16) -> NonceBytes {
        let mut bytes = [0u8; 10];
        bytes[0..4].copy_from_slice(&stream_id.to_be_bytes());
        bytes[4..8].copy_from_slice(&sequence_number.to_be_bytes());
        bytes[8..10].copy_from_slice(&fragment_index.to_be_bytes());
        bytes
    }

    fn seal(&self, stream_id: StreamID, sequence_number: SequenceNumber, fragment_index: u16, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = Self::nonce_bytes(stream_id, sequence_number, fragment_index);
        // aes-gcm nonces are 12 bytes; pad the 10-byte binding with two
        // zero bytes rather than widen the binding itself.
        let mut full = [0u8; 12];
        full[..10].copy_from_slice(&bytes);
        let nonce = Nonce::from_slice(&full);
        self.cipher.encrypt(nonce, plaintext).map_err(|_| CryptoError::SealFailed)
    }
}

/// Caller-supplied metadata for one audio access unit (spec §4.8).
#[derive(Debug, Clone, Copy)]
pub struct AudioFrameMeta {
    pub discontinuity: bool,
    pub timestamp: Timestamp,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub channel_layout_tag: u32,
}

struct AudioPacketizerState {
    sequence_number: SequenceNumber,
}

/// Per-stream audio fragmenter. One instance per outbound audio stream,
/// configured once with the codec and (for PCM) the sample-frame size.
pub struct AudioPacketizer {
    stream_id: StreamID,
    tunables: Tunables,
    codec: AudioCodec,
    /// Bytes per sample frame (`channelCount * bytesPerSample`); only
    /// meaningful for PCM, ignored for AAC.
    bytes_per_frame: usize,
    security: Option<AudioSecurityContext>,
    state: Mutex<AudioPacketizerState>,
    dropped_oversized: AtomicU64,
}

impl AudioPacketizer {
    pub fn new(
        stream_id: StreamID,
        tunables: Tunables,
        codec: AudioCodec,
        bytes_per_frame: usize,
        security: Option<AudioSecurityContext>,
    ) -> Self {
        Self {
            stream_id,
            tunables,
            codec,
            bytes_per_frame: bytes_per_frame.max(1),
            security,
            state: Mutex::new(AudioPacketizerState { sequence_number: 0 }),
            dropped_oversized: AtomicU64::new(0),
        }
    }

    pub fn dropped_oversized_count(&self) -> u64 {
        self.dropped_oversized.load(Ordering::Relaxed)
    }

    fn max_payload_size(&self) -> usize {
        let mut max_payload = self.tunables.max_packet_size.saturating_sub(AUDIO_HEADER_SIZE);
        if self.security.is_some() {
            max_payload = max_payload.saturating_sub(AEAD_TAG_LEN);
        }
        max_payload.max(1)
    }

    /// Fragments one encoded access unit into wire-ready datagrams. AAC
    /// access units larger than the payload budget are dropped (counted,
    /// logged) rather than fragmented — AAC has no mid-frame split point.
    /// PCM access units are split on `bytesPerFrame` boundaries so every
    /// fragment but possibly the last holds a whole number of sample
    /// frames (spec §8 property 6).
    pub fn packetize(&self, encoded: &[u8], meta: AudioFrameMeta) -> Result<Vec<Bytes>, CryptoError> {
        let max_payload = self.max_payload_size();

        match self.codec {
            AudioCodec::Aac => {
                if encoded.len() > max_payload {
                    self.dropped_oversized.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        stream_id = self.stream_id,
                        len = encoded.len(),
                        max_payload,
                        "AAC access unit exceeds payload budget, dropping"
                    );
                    return Ok(Vec::new());
                }
                self.build_fragments(&[encoded], meta)
            }
            AudioCodec::Pcm => {
                let chunks = self.pcm_chunks(encoded, max_payload);
                self.build_fragments(&chunks, meta)
            }
        }
    }

    fn pcm_chunks<'a>(&self, encoded: &'a [u8], max_payload: usize) -> Vec<&'a [u8]> {
        let frames_per_fragment = (max_payload / self.bytes_per_frame).max(1);
        let aligned_max = frames_per_fragment * self.bytes_per_frame;
        if encoded.is_empty() {
            return vec![encoded];
        }
        encoded.chunks(aligned_max).collect()
    }

    fn build_fragments(&self, chunks: &[&[u8]], meta: AudioFrameMeta) -> Result<Vec<Bytes>, CryptoError> {
        let mut state = self.state.lock().unwrap();
        let fragment_count = chunks.len() as u16;

        let mut datagrams = Vec::with_capacity(chunks.len());
        for (fragment_index, chunk) in chunks.iter().enumerate() {
            let sequence_number = state.sequence_number;
            state.sequence_number = state.sequence_number.wrapping_add(1);

            let (payload, checksum, encrypted) = match &self.security {
                Some(security) => {
                    let sealed = security.seal(self.stream_id, sequence_number, fragment_index as u16, chunk)?;
                    (sealed, 0u32, true)
                }
                None => (chunk.to_vec(), crc32(chunk), false),
            };

            let header = AudioHeader {
                flags: AudioFlags {
                    keyframe: fragment_index == 0,
                    discontinuity: meta.discontinuity,
                    encrypted_payload: encrypted,
                },
                stream_id: self.stream_id,
                sequence_number,
                timestamp: meta.timestamp,
                codec: self.codec,
                sample_rate: meta.sample_rate,
                channel_count: meta.channel_count,
                channel_layout_tag: meta.channel_layout_tag,
                fragment_index: fragment_index as u16,
                fragment_count,
                payload_length: chunk.len() as u32,
                checksum,
            };

            datagrams.push(build_datagram(&header, &payload));
        }

        Ok(datagrams)
    }
}

fn build_datagram(header: &AudioHeader, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(AUDIO_HEADER_SIZE + payload.len());
    out.extend_from_slice(&audio::serialize(header));
    out.extend_from_slice(payload);
    out.freeze()
}

/// Thin receive-side helper: parses one audio datagram into its header and
/// payload slice. There is no reassembler on the audio path (spec §4.8) —
/// the caller decodes AAC payloads directly and concatenates or
/// sequentially feeds PCM fragments in `sequenceNumber` order.
pub fn parse_audio_datagram(bytes: &[u8]) -> Option<(AudioHeader, &[u8])> {
    let (header, payload_offset) = audio::deserialize(bytes)?;
    let payload_len = header.payload_length as usize;
    let tag_len = if header.flags.encrypted_payload { 16 } else { 0 };
    let end = payload_offset + payload_len + tag_len;
    if end > bytes.len() {
        return None;
    }
    Some((header, &bytes[payload_offset..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> AudioFrameMeta {
        AudioFrameMeta { discontinuity: false, timestamp: 1000, sample_rate: 48_000, channel_count: 2, channel_layout_tag: 0x65_0002 }
    }

    #[test]
    fn aac_single_access_unit_fits_one_datagram() {
        let tunables = Tunables { max_packet_size: 1232, ..Default::default() };
        let packetizer = AudioPacketizer::new(1, tunables, AudioCodec::Aac, 4, None);
        let encoded = vec![7u8; 512];
        let datagrams = packetizer.packetize(&encoded, meta()).unwrap();
        assert_eq!(datagrams.len(), 1);

        let (header, payload) = parse_audio_datagram(&datagrams[0]).unwrap();
        assert_eq!(header.fragment_count, 1);
        assert_eq!(payload, &encoded[..]);
    }

    #[test]
    fn aac_access_unit_too_large_is_dropped_and_counted() {
        let tunables = Tunables { max_packet_size: 576, ..Default::default() };
        let packetizer = AudioPacketizer::new(1, tunables, AudioCodec::Aac, 4, None);
        let encoded = vec![9u8; 10_000];
        let datagrams = packetizer.packetize(&encoded, meta()).unwrap();
        assert!(datagrams.is_empty());
        assert_eq!(packetizer.dropped_oversized_count(), 1);
    }

    #[test]
    fn pcm_fragments_align_to_sample_frame_boundaries() {
        let bytes_per_frame = 4; // stereo, 16-bit
        let tunables = Tunables { max_packet_size: 576, ..Default::default() };
        let packetizer = AudioPacketizer::new(1, tunables, AudioCodec::Pcm, bytes_per_frame, None);

        let frame_count = 200;
        let encoded: Vec<u8> = (0..frame_count * bytes_per_frame).map(|i| (i % 251) as u8).collect();
        let datagrams = packetizer.packetize(&encoded, meta()).unwrap();
        assert!(datagrams.len() > 1);

        let mut reconstructed = Vec::new();
        for (i, datagram) in datagrams.iter().enumerate() {
            let (header, payload) = parse_audio_datagram(datagram).unwrap();
            assert_eq!(header.fragment_index as usize, i);
            if i + 1 < datagrams.len() {
                assert_eq!(payload.len() % bytes_per_frame, 0, "non-final fragment must hold whole sample frames");
            }
            reconstructed.extend_from_slice(payload);
        }
        assert_eq!(reconstructed, encoded);
    }

    #[test]
    fn encrypted_payload_sets_flag_and_zero_checksum() {
        let key = [7u8; AEAD_KEY_LEN];
        let security = AudioSecurityContext::new(&key);
        let tunables = Tunables { max_packet_size: 1232, ..Default::default() };
        let packetizer = AudioPacketizer::new(2, tunables, AudioCodec::Aac, 4, Some(security));

        let encoded = vec![3u8; 256];
        let datagrams = packetizer.packetize(&encoded, meta()).unwrap();
        let (header, payload) = parse_audio_datagram(&datagrams[0]).unwrap();
        assert!(header.flags.encrypted_payload);
        assert_eq!(header.checksum, 0);
        assert_ne!(payload, &encoded[..]);
    }

    #[test]
    fn sequence_number_increments_per_fragment() {
        let bytes_per_frame = 4;
        let tunables = Tunables { max_packet_size: 576, ..Default::default() };
        let packetizer = AudioPacketizer::new(1, tunables, AudioCodec::Pcm, bytes_per_frame, None);
        let encoded: Vec<u8> = vec![1u8; 400 * bytes_per_frame];
        let datagrams = packetizer.packetize(&encoded, meta()).unwrap();

        let mut sequence_numbers = Vec::new();
        for datagram in &datagrams {
            let (header, _) = parse_audio_datagram(datagram).unwrap();
            sequence_numbers.push(header.sequence_number);
        }
        let mut sorted = sequence_numbers.clone();
        sorted.sort_unstable();
        assert_eq!(sequence_numbers, sorted);
        assert_eq!(sorted.len(), sorted.iter().collect::<std::collections::HashSet<_>>().len());
    }
}
