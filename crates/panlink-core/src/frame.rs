//! Radio addresses and MAC-layer frames
//!
//! This module defines the two types everything else is built on:
//! `IeeeAddress`, the 64-bit extended address of an 802.15.4 radio, and
//! `RadioFrame`, one MAC payload together with the addressing and
//! signal-quality metadata captured when it was sent or received.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 64-bit IEEE extended address of a radio interface.
///
/// The all-nodes broadcast address is the 16-bit short form `0xFFFF`
/// widened to 64 bits. Address zero is reserved and never valid as a
/// destination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IeeeAddress(u64);

impl IeeeAddress {
    /// The all-nodes broadcast address.
    pub const BROADCAST: IeeeAddress = IeeeAddress(0xFFFF);

    /// The unassigned/reserved address.
    pub const NONE: IeeeAddress = IeeeAddress(0);

    pub const fn new(raw: u64) -> Self {
        IeeeAddress(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for IeeeAddress {
    fn from(raw: u64) -> Self {
        IeeeAddress(raw)
    }
}

impl From<IeeeAddress> for u64 {
    fn from(addr: IeeeAddress) -> u64 {
        addr.0
    }
}

impl fmt::Display for IeeeAddress {
    /// Dotted-hex rendering, four groups of 16 bits: `0014.4F01.0000.7D2C`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}.{:04X}.{:04X}.{:04X}",
            (self.0 >> 48) & 0xFFFF,
            (self.0 >> 32) & 0xFFFF,
            (self.0 >> 16) & 0xFFFF,
            self.0 & 0xFFFF
        )
    }
}

impl fmt::Debug for IeeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IeeeAddress({self})")
    }
}

/// Upper bound on the MAC payload a single 802.15.4 frame can carry.
///
/// 127-byte PHY frames minus worst-case MAC overhead. The configured
/// per-frame capacity (`LowpanConfig::frame_capacity`) must not exceed it.
pub const MAX_MAC_PAYLOAD: usize = 118;

/// One MAC frame: payload plus addressing and capture metadata.
///
/// Outbound frames are built by the mesh layer and stamped with the
/// transmitting interface's source address by the transport. Inbound
/// frames carry the RSSI/correlation/link-quality triple and a capture
/// timestamp recorded by the receiving driver.
#[derive(Debug, Clone)]
pub struct RadioFrame {
    /// MAC source address (the transmitting interface).
    pub source: IeeeAddress,
    /// MAC destination address; `IeeeAddress::BROADCAST` for link broadcast.
    pub destination: IeeeAddress,
    /// PAN id the frame was sent on.
    pub pan_id: u16,
    /// Received signal strength, dBm.
    pub rssi: i8,
    /// Correlation value reported by the radio (0-255).
    pub correlation: u8,
    /// Link quality indicator (0-255).
    pub link_quality: u8,
    /// Milliseconds since the Unix epoch at capture time; 0 until stamped.
    pub timestamp: u64,
    payload: Vec<u8>,
}

impl RadioFrame {
    /// Build an outbound frame addressed to `destination`.
    pub fn outbound(destination: IeeeAddress, payload: Vec<u8>) -> Self {
        RadioFrame {
            source: IeeeAddress::NONE,
            destination,
            pan_id: 0,
            rssi: 0,
            correlation: 0,
            link_quality: 0,
            timestamp: 0,
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Record the signal-quality triple and capture time, as a receiving
    /// driver does just before handing the frame up.
    pub fn stamp_capture(&mut self, rssi: i8, correlation: u8, link_quality: u8) {
        self.rssi = rssi;
        self.correlation = correlation;
        self.link_quality = link_quality;
        self.timestamp = now_millis();
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        assert!(IeeeAddress::BROADCAST.is_broadcast());
        assert!(!IeeeAddress::new(0x1234).is_broadcast());
        assert!(IeeeAddress::NONE.is_none());
    }

    #[test]
    fn test_dotted_hex_display() {
        let addr = IeeeAddress::new(0x0014_4F01_0000_7D2C);
        assert_eq!(addr.to_string(), "0014.4F01.0000.7D2C");
        assert_eq!(IeeeAddress::BROADCAST.to_string(), "0000.0000.0000.FFFF");
    }

    #[test]
    fn test_address_roundtrip() {
        let addr = IeeeAddress::from(0xDEAD_BEEFu64);
        assert_eq!(u64::from(addr), 0xDEAD_BEEF);
    }

    #[test]
    fn test_frame_capture_stamp() {
        let mut frame = RadioFrame::outbound(IeeeAddress::new(2), vec![1, 2, 3]);
        assert_eq!(frame.timestamp, 0);
        frame.stamp_capture(-60, 200, 180);
        assert_eq!(frame.rssi, -60);
        assert_eq!(frame.link_quality, 180);
        assert!(frame.timestamp > 0);
        assert_eq!(frame.payload_len(), 3);
    }
}
