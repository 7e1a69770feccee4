//! miragekit-wire — fixed-header codecs for the UDP video and audio
//! datagram formats (spec §3.2, §3.3, §4.1, §6.1, §6.2).
//!
//! Each sub-module is self-contained: `serialize`/`deserialize` pairs that
//! never panic on malformed input, matching the teacher's
//! `duallink-transport::parse_packet` contract.

pub mod audio;
pub mod crc;
pub mod video;

pub use audio::{AudioCodec, AudioFlags, AudioHeader};
pub use crc::crc32;
pub use video::{VideoFlags, VideoHeader, HEADER_SIZE as VIDEO_HEADER_SIZE, MAGIC, WIRE_VERSION};

pub use audio::HEADER_SIZE as AUDIO_HEADER_SIZE;
