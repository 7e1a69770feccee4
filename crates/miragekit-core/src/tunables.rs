//! Centralised configuration knobs (spec §6.5).
//!
//! Mirrors `duallink_core::StreamConfig`'s camelCase-alias pattern so a
//! control-plane JSON payload using either casing deserializes cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

/// Every tunable named in spec §6.5, centralized so host and client crates
/// share one source of truth instead of each hardcoding the same constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// UDP datagram size ceiling, IPv6-MTU-safe by default. MUST be honored
    /// in `[576, 9000]`.
    #[serde(alias = "maxPacketSize")]
    pub max_packet_size: usize,
    /// Pending-keyframe timeout, seconds.
    #[serde(alias = "keyframeTimeout")]
    pub keyframe_timeout_secs: f64,
    /// Pending-P-frame timeout, seconds.
    #[serde(alias = "pFrameTimeout")]
    pub p_frame_timeout_secs: f64,
    /// Client decode-queue capacity, in frames.
    #[serde(alias = "queueCapacity")]
    pub queue_capacity: usize,
    /// Reassembler pending-frame map cap; oldest pending frame is dropped
    /// once the map grows beyond this.
    #[serde(alias = "maxQueuedFrames")]
    pub pending_frame_cap: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_packet_size: 1232,
            keyframe_timeout_secs: 2.0,
            p_frame_timeout_secs: 0.5,
            queue_capacity: 48,
            pending_frame_cap: 16,
        }
    }
}

impl Tunables {
    pub fn keyframe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.keyframe_timeout_secs)
    }

    pub fn p_frame_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.p_frame_timeout_secs)
    }

    /// Fail-fast validation run at stream setup (spec §7 "Configuration errors").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(576..=9000).contains(&self.max_packet_size) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "maxPacketSize {} out of bounds [576, 9000]",
                    self.max_packet_size
                ),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "queueCapacity must be > 0".into(),
            });
        }
        if self.pending_frame_cap == 0 {
            return Err(ConfigError::Invalid {
                reason: "maxQueuedFrames must be > 0".into(),
            });
        }
        Ok(())
    }
}
