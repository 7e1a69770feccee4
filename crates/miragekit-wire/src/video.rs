//! Video UDP datagram header codec (spec §3.2, §6.1).
//!
//! Fixed 58-byte big-endian header, written with explicit
//! `to_be_bytes`/`from_be_bytes` slicing — the same idiom as the teacher's
//! `duallink-transport::parse_packet`, just with the fuller field set the
//! spec's wire table calls for (epoch, dimension token, content rect, CRC).
//!
//! ```text
//! [0..4]   magic           b"MIRA"
//! [4]      version
//! [5]      flags           bit0 keyframe, 1 discontinuity, 2 parameterSet, 3 encryptedPayload
//! [6..10]  streamID
//! [10..12] epoch
//! [12..14] dimensionToken
//! [14..18] frameNumber
//! [18..20] fragmentIndex
//! [20..22] fragmentCount
//! [22..26] sequenceNumber
//! [26..34] timestamp (ns)
//! [34..38] contentRect.x
//! [38..42] contentRect.y
//! [42..46] contentRect.w
//! [46..50] contentRect.h
//! [50..54] payloadLength
//! [54..58] checksum (CRC32, zero when encrypted)
//! ```

use miragekit_core::{ContentRect, DimensionToken, Epoch, FrameNumber, SequenceNumber, StreamID, Timestamp};

pub const MAGIC: [u8; 4] = *b"MIRA";
pub const WIRE_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 58;

/// Decoded flag bits for one video fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoFlags {
    pub keyframe: bool,
    pub discontinuity: bool,
    pub parameter_set: bool,
    pub encrypted_payload: bool,
}

impl VideoFlags {
    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.keyframe {
            b |= 0x01;
        }
        if self.discontinuity {
            b |= 0x02;
        }
        if self.parameter_set {
            b |= 0x04;
        }
        if self.encrypted_payload {
            b |= 0x08;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            keyframe: b & 0x01 != 0,
            discontinuity: b & 0x02 != 0,
            parameter_set: b & 0x04 != 0,
            encrypted_payload: b & 0x08 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub flags: VideoFlags,
    pub stream_id: StreamID,
    pub epoch: Epoch,
    pub dimension_token: DimensionToken,
    pub frame_number: FrameNumber,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub sequence_number: SequenceNumber,
    pub timestamp: Timestamp,
    pub content_rect: ContentRect,
    /// Payload length excluding the AEAD tag when `encrypted_payload` is set.
    pub payload_length: u32,
    /// CRC32 of the payload; MUST be zero when `encrypted_payload` is set.
    pub checksum: u32,
}

/// Serialize the fixed header (not the payload) into exactly `HEADER_SIZE`
/// bytes.
pub fn serialize(header: &VideoHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&MAGIC);
    out[4] = WIRE_VERSION;
    out[5] = header.flags.to_byte();
    out[6..10].copy_from_slice(&header.stream_id.to_be_bytes());
    out[10..12].copy_from_slice(&header.epoch.to_be_bytes());
    out[12..14].copy_from_slice(&header.dimension_token.to_be_bytes());
    out[14..18].copy_from_slice(&header.frame_number.to_be_bytes());
    out[18..20].copy_from_slice(&header.fragment_index.to_be_bytes());
    out[20..22].copy_from_slice(&header.fragment_count.to_be_bytes());
    out[22..26].copy_from_slice(&header.sequence_number.to_be_bytes());
    out[26..34].copy_from_slice(&header.timestamp.to_be_bytes());
    out[34..38].copy_from_slice(&header.content_rect.x.to_be_bytes());
    out[38..42].copy_from_slice(&header.content_rect.y.to_be_bytes());
    out[42..46].copy_from_slice(&header.content_rect.w.to_be_bytes());
    out[46..50].copy_from_slice(&header.content_rect.h.to_be_bytes());
    out[50..54].copy_from_slice(&header.payload_length.to_be_bytes());
    out[54..58].copy_from_slice(&header.checksum.to_be_bytes());
    out
}

/// Parse a header from the front of `bytes`, returning the header and the
/// offset where the payload begins. Returns `None` on a short buffer, bad
/// magic, or a declared `payloadLength` that doesn't fit in what's left —
/// callers silently drop in every such case (spec §4.1, §7: "never panics").
pub fn deserialize(bytes: &[u8]) -> Option<(VideoHeader, usize)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    if bytes[0..4] != MAGIC {
        return None;
    }
    let flags = VideoFlags::from_byte(bytes[5]);
    let stream_id = u32::from_be_bytes(bytes[6..10].try_into().ok()?);
    let epoch = u16::from_be_bytes(bytes[10..12].try_into().ok()?);
    let dimension_token = u16::from_be_bytes(bytes[12..14].try_into().ok()?);
    let frame_number = u32::from_be_bytes(bytes[14..18].try_into().ok()?);
    let fragment_index = u16::from_be_bytes(bytes[18..20].try_into().ok()?);
    let fragment_count = u16::from_be_bytes(bytes[20..22].try_into().ok()?);
    let sequence_number = u32::from_be_bytes(bytes[22..26].try_into().ok()?);
    let timestamp = u64::from_be_bytes(bytes[26..34].try_into().ok()?);
    let x = i32::from_be_bytes(bytes[34..38].try_into().ok()?);
    let y = i32::from_be_bytes(bytes[38..42].try_into().ok()?);
    let w = i32::from_be_bytes(bytes[42..46].try_into().ok()?);
    let h = i32::from_be_bytes(bytes[46..50].try_into().ok()?);
    let payload_length = u32::from_be_bytes(bytes[50..54].try_into().ok()?);
    let checksum = u32::from_be_bytes(bytes[54..58].try_into().ok()?);

    if fragment_count == 0 {
        return None;
    }

    let payload_offset = HEADER_SIZE;
    let available = bytes.len() - payload_offset;
    let declared_without_tag = payload_length as usize;
    // `encrypted_payload` appends a 16-byte AEAD tag the declared
    // `payload_length` doesn't count (spec §6.1); tolerate that here.
    let max_declared = if flags.encrypted_payload {
        declared_without_tag + 16
    } else {
        declared_without_tag
    };
    if max_declared > available {
        return None;
    }

    Some((
        VideoHeader {
            flags,
            stream_id,
            epoch,
            dimension_token,
            frame_number,
            fragment_index,
            fragment_count,
            sequence_number,
            timestamp,
            content_rect: ContentRect::new(x, y, w, h),
            payload_length,
            checksum,
        },
        payload_offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> VideoHeader {
        VideoHeader {
            flags: VideoFlags {
                keyframe: true,
                discontinuity: false,
                parameter_set: true,
                encrypted_payload: false,
            },
            stream_id: 7,
            epoch: 3,
            dimension_token: 42,
            frame_number: 1001,
            fragment_index: 2,
            fragment_count: 10,
            sequence_number: 55555,
            timestamp: 123_456_789_000,
            content_rect: ContentRect::new(0, 0, 1920, 1080),
            payload_length: 16,
            checksum: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn round_trips_every_flag_combination() {
        for bits in 0u8..16 {
            let mut header = sample_header();
            header.flags = VideoFlags::from_byte(bits);
            header.checksum = if header.flags.encrypted_payload { 0 } else { 0xABCD };

            let mut datagram = serialize(&header).to_vec();
            datagram.extend_from_slice(&[0u8; 16]);

            let (parsed, offset) = deserialize(&datagram).expect("valid header");
            assert_eq!(offset, HEADER_SIZE);
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn rejects_short_buffer() {
        let header = sample_header();
        let datagram = serialize(&header);
        assert!(deserialize(&datagram[..HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let header = sample_header();
        let mut datagram = serialize(&header).to_vec();
        datagram[0] = b'X';
        assert!(deserialize(&datagram).is_none());
    }

    #[test]
    fn rejects_payload_length_exceeding_remaining_bytes() {
        let mut header = sample_header();
        header.payload_length = 1_000_000;
        let datagram = serialize(&header).to_vec();
        assert!(deserialize(&datagram).is_none());
    }

    #[test]
    fn rejects_zero_fragment_count() {
        let mut header = sample_header();
        header.fragment_count = 0;
        let mut datagram = serialize(&header).to_vec();
        datagram.extend_from_slice(&[0u8; 16]);
        assert!(deserialize(&datagram).is_none());
    }
}
