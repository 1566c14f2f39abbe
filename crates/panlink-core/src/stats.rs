//! LowPan traffic statistics
//!
//! A flat block of counters maintained by the mesh layer and exported as a
//! fixed 104-byte little-endian snapshot: a `u64` capture timestamp
//! followed by 24 `u32` counters in a fixed order. The wire layout is part
//! of the management-protocol contract and must not change.

use crate::error::WireError;
use crate::frame::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the encoded statistics block.
pub const STATS_WIRE_SIZE: usize = 104;

/// Counter snapshot of the mesh layer.
///
/// Counters only ever increase (per layer lifetime); the timestamp is
/// stamped when a snapshot is taken, not continuously.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowpanStats {
    /// Snapshot capture time, ms since the Unix epoch.
    pub timestamp: u64,
    /// Registered protocol handlers.
    pub protocol_count: u32,
    /// Registered protocol-family handlers.
    pub protocol_family_count: u32,
    /// Inbound frames with no handler for their protocol or family.
    pub protocol_handler_missing: u32,
    /// Unicast datagrams sent (whole datagrams, not frames).
    pub unicasts_sent: u32,
    /// Unicast datagrams that needed fragmentation.
    pub unicasts_fragmented: u32,
    /// Local-dispatch frames transmitted.
    pub non_mesh_packets_sent: u32,
    /// Mesh frames transmitted.
    pub mesh_packets_sent: u32,
    /// All frames transmitted.
    pub packets_sent: u32,
    /// Broadcast datagrams sent.
    pub broadcasts_sent: u32,
    /// Local broadcast frames received.
    pub broadcasts_received: u32,
    /// Mesh broadcast datagrams sent.
    pub mesh_broadcasts_sent: u32,
    /// Mesh broadcast frames received.
    pub mesh_broadcasts_received: u32,
    /// Broadcast datagrams that needed fragmentation.
    pub broadcasts_fragmented: u32,
    /// Mesh unicasts forwarded on behalf of other nodes.
    pub packets_forwarded: u32,
    /// Mesh broadcasts rebroadcast on behalf of other nodes.
    pub mesh_broadcasts_forwarded: u32,
    /// Frames dropped because their TTL ran out here.
    pub ttl_expired: u32,
    /// Duplicate broadcasts suppressed by sequence tracking.
    pub dropped_broadcasts: u32,
    /// Datagrams dropped because a connection queue was full.
    pub broadcasts_queue_full: u32,
    /// Mesh frames received.
    pub mesh_packets_received: u32,
    /// Local-dispatch frames received.
    pub non_mesh_packets_received: u32,
    /// Datagrams completed by reassembly.
    pub datagrams_reassembled: u32,
    /// Partial reassemblies abandoned on timeout.
    pub reassembly_expired: u32,
    /// Fragment frames received.
    pub fragments_received: u32,
    /// Unicast datagrams delivered locally.
    pub unicasts_received: u32,
}

impl LowpanStats {
    /// Clone the counters and stamp the capture time.
    pub fn snapshot(&self) -> LowpanStats {
        let mut snap = self.clone();
        snap.timestamp = now_millis();
        snap
    }

    fn counters(&self) -> [u32; 24] {
        [
            self.protocol_count,
            self.protocol_family_count,
            self.protocol_handler_missing,
            self.unicasts_sent,
            self.unicasts_fragmented,
            self.non_mesh_packets_sent,
            self.mesh_packets_sent,
            self.packets_sent,
            self.broadcasts_sent,
            self.broadcasts_received,
            self.mesh_broadcasts_sent,
            self.mesh_broadcasts_received,
            self.broadcasts_fragmented,
            self.packets_forwarded,
            self.mesh_broadcasts_forwarded,
            self.ttl_expired,
            self.dropped_broadcasts,
            self.broadcasts_queue_full,
            self.mesh_packets_received,
            self.non_mesh_packets_received,
            self.datagrams_reassembled,
            self.reassembly_expired,
            self.fragments_received,
            self.unicasts_received,
        ]
    }

    /// Encode as the fixed 104-byte little-endian block.
    pub fn to_bytes(&self) -> [u8; STATS_WIRE_SIZE] {
        let mut buf = [0u8; STATS_WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        for (i, counter) in self.counters().iter().enumerate() {
            let at = 8 + i * 4;
            buf[at..at + 4].copy_from_slice(&counter.to_le_bytes());
        }
        buf
    }

    /// Decode a block previously produced by `to_bytes`.
    pub fn from_bytes(data: &[u8]) -> Result<LowpanStats, WireError> {
        if data.len() < STATS_WIRE_SIZE {
            return Err(WireError::Truncated {
                need: STATS_WIRE_SIZE,
                have: data.len(),
            });
        }
        let mut words = [0u32; 24];
        for (i, word) in words.iter_mut().enumerate() {
            let at = 8 + i * 4;
            *word = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[0..8]);
        Ok(LowpanStats {
            timestamp: u64::from_le_bytes(ts),
            protocol_count: words[0],
            protocol_family_count: words[1],
            protocol_handler_missing: words[2],
            unicasts_sent: words[3],
            unicasts_fragmented: words[4],
            non_mesh_packets_sent: words[5],
            mesh_packets_sent: words[6],
            packets_sent: words[7],
            broadcasts_sent: words[8],
            broadcasts_received: words[9],
            mesh_broadcasts_sent: words[10],
            mesh_broadcasts_received: words[11],
            broadcasts_fragmented: words[12],
            packets_forwarded: words[13],
            mesh_broadcasts_forwarded: words[14],
            ttl_expired: words[15],
            dropped_broadcasts: words[16],
            broadcasts_queue_full: words[17],
            mesh_packets_received: words[18],
            non_mesh_packets_received: words[19],
            datagrams_reassembled: words[20],
            reassembly_expired: words[21],
            fragments_received: words[22],
            unicasts_received: words[23],
        })
    }
}

impl fmt::Display for LowpanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 24] = [
            "protocol_count",
            "protocol_family_count",
            "protocol_handler_missing",
            "unicasts_sent",
            "unicasts_fragmented",
            "non_mesh_packets_sent",
            "mesh_packets_sent",
            "packets_sent",
            "broadcasts_sent",
            "broadcasts_received",
            "mesh_broadcasts_sent",
            "mesh_broadcasts_received",
            "broadcasts_fragmented",
            "packets_forwarded",
            "mesh_broadcasts_forwarded",
            "ttl_expired",
            "dropped_broadcasts",
            "broadcasts_queue_full",
            "mesh_packets_received",
            "non_mesh_packets_received",
            "datagrams_reassembled",
            "reassembly_expired",
            "fragments_received",
            "unicasts_received",
        ];
        writeln!(f, "timestamp: {}", self.timestamp)?;
        for (name, value) in NAMES.iter().zip(self.counters()) {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}
