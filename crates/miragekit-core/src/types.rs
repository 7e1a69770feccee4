use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Encoder output resolution. Used by `miragekit-quality`'s pixel-count
/// pressure calculation and by the reassembler's content-rect bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const QHD: Self = Self { width: 2560, height: 1440 };
    pub const UHD: Self = Self { width: 3840, height: 2160 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
}

// MARK: - Encoder configuration (spec §3.6)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Srgb,
    DisplayP3,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv12,
    P010,
    Bgra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    Smoothest,
    Auto,
    LowestLatency,
}

/// Encoder configuration fields named in spec §3.6, independent of the
/// runtime quality/bitrate state that `miragekit-quality` and
/// `miragekit-host` derive from them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub codec: VideoCodec,
    pub target_frame_rate: u32,
    pub key_frame_interval: u32,
    pub bit_depth: u8,
    pub color_space: ColorSpace,
    pub pixel_format: PixelFormat,
    pub bitrate_bps: u64,
}
