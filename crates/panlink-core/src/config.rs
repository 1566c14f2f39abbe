//! Mesh layer configuration

use crate::frame::MAX_MAC_PAYLOAD;
use serde::{Deserialize, Serialize};

/// Tunables for the LowPan layer and its transport.
///
/// `Default` gives a working small-network setup; `with_*` builders adjust
/// individual knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowpanConfig {
    /// PAN id stamped on outbound frames.
    pub pan_id: u16,
    /// MAC payload bytes available to one frame (header + data).
    pub frame_capacity: usize,
    /// Initial TTL for mesh unicasts.
    pub default_ttl: u8,
    /// Initial TTL (hop cap) for mesh broadcasts.
    pub broadcast_hops: u8,
    /// Idle milliseconds before a partial reassembly is abandoned.
    pub reassembly_timeout_ms: u64,
    /// Maximum fragments one datagram may be split into.
    pub max_fragments: usize,
    /// Bounded depth of each connection's inbound datagram queue.
    pub connection_queue_depth: usize,
    /// Bounded depth of the link-quality listener fan-out queue.
    pub quality_queue_depth: usize,
    /// Transmit attempts for unacknowledged bridge-protocol frames.
    pub bridge_retries: u32,
}

impl Default for LowpanConfig {
    fn default() -> Self {
        Self {
            pan_id: 3,
            frame_capacity: 112,
            default_ttl: 8,
            broadcast_hops: 2,
            reassembly_timeout_ms: 10_000,
            max_fragments: 32,
            connection_queue_depth: 64,
            quality_queue_depth: 200,
            bridge_retries: 3,
        }
    }
}

impl LowpanConfig {
    pub fn with_pan_id(mut self, pan_id: u16) -> Self {
        self.pan_id = pan_id;
        self
    }

    /// Clamped to the 802.15.4 MAC payload ceiling.
    pub fn with_frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity.min(MAX_MAC_PAYLOAD);
        self
    }

    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl.max(1);
        self
    }

    pub fn with_broadcast_hops(mut self, hops: u8) -> Self {
        self.broadcast_hops = hops.max(1);
        self
    }

    pub fn with_reassembly_timeout_ms(mut self, ms: u64) -> Self {
        self.reassembly_timeout_ms = ms;
        self
    }

    pub fn with_max_fragments(mut self, max: usize) -> Self {
        self.max_fragments = max.max(1);
        self
    }

    pub fn with_connection_queue_depth(mut self, depth: usize) -> Self {
        self.connection_queue_depth = depth.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LowpanConfig::default();
        assert_eq!(cfg.frame_capacity, 112);
        assert_eq!(cfg.default_ttl, 8);
        assert_eq!(cfg.reassembly_timeout_ms, 10_000);
    }

    #[test]
    fn test_builder_clamps() {
        let cfg = LowpanConfig::default()
            .with_frame_capacity(4096)
            .with_default_ttl(0);
        assert_eq!(cfg.frame_capacity, MAX_MAC_PAYLOAD);
        assert_eq!(cfg.default_ttl, 1);
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = LowpanConfig::default().with_pan_id(7);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: LowpanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pan_id, 7);
        assert_eq!(back.max_fragments, cfg.max_fragments);
    }
}
