//! Audio UDP datagram header codec (spec §3.3, §6.2).
//!
//! Fixed 44-byte big-endian header, structurally identical in spirit to the
//! video header (§`video.rs`) but carrying codec/sample-rate/channel fields
//! instead of dimension/content-rect ones.
//!
//! ```text
//! [0..4]   magic            b"MIRA"
//! [4]      version
//! [5]      flags            bit0 keyframe, 1 discontinuity, 2 encryptedPayload
//! [6..10]  streamID
//! [10..14] sequenceNumber
//! [14..22] timestamp (ns)
//! [22]     codecTag         0 = AAC, 1 = PCM
//! [23..27] sampleRate
//! [27]     channelCount
//! [28..32] channelLayoutTag
//! [32..34] fragmentIndex
//! [34..36] fragmentCount
//! [36..40] payloadLength
//! [40..44] checksum
//! ```

use miragekit_core::{SequenceNumber, StreamID, Timestamp};

pub const HEADER_SIZE: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Pcm,
}

impl AudioCodec {
    fn to_tag(self) -> u8 {
        match self {
            Self::Aac => 0,
            Self::Pcm => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Aac),
            1 => Some(Self::Pcm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioFlags {
    pub keyframe: bool,
    pub discontinuity: bool,
    pub encrypted_payload: bool,
}

impl AudioFlags {
    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.keyframe {
            b |= 0x01;
        }
        if self.discontinuity {
            b |= 0x02;
        }
        if self.encrypted_payload {
            b |= 0x04;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            keyframe: b & 0x01 != 0,
            discontinuity: b & 0x02 != 0,
            encrypted_payload: b & 0x04 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub flags: AudioFlags,
    pub stream_id: StreamID,
    pub sequence_number: SequenceNumber,
    pub timestamp: Timestamp,
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub channel_layout_tag: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_length: u32,
    pub checksum: u32,
}

pub fn serialize(header: &AudioHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&super::video::MAGIC);
    out[4] = super::video::WIRE_VERSION;
    out[5] = header.flags.to_byte();
    out[6..10].copy_from_slice(&header.stream_id.to_be_bytes());
    out[10..14].copy_from_slice(&header.sequence_number.to_be_bytes());
    out[14..22].copy_from_slice(&header.timestamp.to_be_bytes());
    out[22] = header.codec.to_tag();
    out[23..27].copy_from_slice(&header.sample_rate.to_be_bytes());
    out[27] = header.channel_count;
    out[28..32].copy_from_slice(&header.channel_layout_tag.to_be_bytes());
    out[32..34].copy_from_slice(&header.fragment_index.to_be_bytes());
    out[34..36].copy_from_slice(&header.fragment_count.to_be_bytes());
    out[36..40].copy_from_slice(&header.payload_length.to_be_bytes());
    out[40..44].copy_from_slice(&header.checksum.to_be_bytes());
    out
}

pub fn deserialize(bytes: &[u8]) -> Option<(AudioHeader, usize)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    if bytes[0..4] != super::video::MAGIC {
        return None;
    }
    let flags = AudioFlags::from_byte(bytes[5]);
    let stream_id = u32::from_be_bytes(bytes[6..10].try_into().ok()?);
    let sequence_number = u32::from_be_bytes(bytes[10..14].try_into().ok()?);
    let timestamp = u64::from_be_bytes(bytes[14..22].try_into().ok()?);
    let codec = AudioCodec::from_tag(bytes[22])?;
    let sample_rate = u32::from_be_bytes(bytes[23..27].try_into().ok()?);
    let channel_count = bytes[27];
    let channel_layout_tag = u32::from_be_bytes(bytes[28..32].try_into().ok()?);
    let fragment_index = u16::from_be_bytes(bytes[32..34].try_into().ok()?);
    let fragment_count = u16::from_be_bytes(bytes[34..36].try_into().ok()?);
    let payload_length = u32::from_be_bytes(bytes[36..40].try_into().ok()?);
    let checksum = u32::from_be_bytes(bytes[40..44].try_into().ok()?);

    if fragment_count == 0 {
        return None;
    }

    let payload_offset = HEADER_SIZE;
    let available = bytes.len() - payload_offset;
    let max_declared = if flags.encrypted_payload {
        payload_length as usize + 16
    } else {
        payload_length as usize
    };
    if max_declared > available {
        return None;
    }

    Some((
        AudioHeader {
            flags,
            stream_id,
            sequence_number,
            timestamp,
            codec,
            sample_rate,
            channel_count,
            channel_layout_tag,
            fragment_index,
            fragment_count,
            payload_length,
            checksum,
        },
        payload_offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AudioHeader {
        AudioHeader {
            flags: AudioFlags { keyframe: true, discontinuity: false, encrypted_payload: false },
            stream_id: 9,
            sequence_number: 77,
            timestamp: 999,
            codec: AudioCodec::Aac,
            sample_rate: 48_000,
            channel_count: 2,
            channel_layout_tag: 0x00650002,
            fragment_index: 0,
            fragment_count: 1,
            payload_length: 64,
            checksum: 0x1234_5678,
        }
    }

    #[test]
    fn round_trips() {
        let header = sample();
        let mut datagram = serialize(&header).to_vec();
        datagram.extend(std::iter::repeat(0u8).take(64));
        let (parsed, offset) = deserialize(&datagram).expect("valid header");
        assert_eq!(offset, HEADER_SIZE);
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_unknown_codec_tag() {
        let header = sample();
        let mut datagram = serialize(&header).to_vec();
        datagram[22] = 0xFF;
        datagram.extend(std::iter::repeat(0u8).take(64));
        assert!(deserialize(&datagram).is_none());
    }
}
