//! Mesh broadcast duplicate suppression
//!
//! Every mesh broadcast carries a per-originator sequence number. A node
//! accepts a broadcast only if its sequence is strictly greater than the
//! highest it has recorded for that originator; rebroadcast copies arriving
//! over different paths therefore collapse to one delivery. Sequence
//! numbers are seeded randomly at startup so a rebooted node does not
//! collide with its pre-reboot history on peers.

use crate::frame::IeeeAddress;
use std::collections::HashMap;

/// Highest-seen broadcast sequence per originator.
#[derive(Debug, Default)]
pub struct BroadcastTracker {
    seen: HashMap<IeeeAddress, u16>,
}

impl BroadcastTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence` for `originator` if it is new.
    ///
    /// Returns `true` when the broadcast should be delivered and forwarded,
    /// `false` when it is a duplicate (or stale) and must be dropped.
    pub fn accept(&mut self, originator: IeeeAddress, sequence: u16) -> bool {
        match self.seen.get_mut(&originator) {
            Some(highest) => {
                if sequence > *highest {
                    *highest = sequence;
                    true
                } else {
                    false
                }
            }
            None => {
                self.seen.insert(originator, sequence);
                true
            }
        }
    }

    /// Forget an originator, e.g. when it is known to have restarted.
    pub fn forget(&mut self, originator: IeeeAddress) {
        self.seen.remove(&originator);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_broadcast_accepted() {
        let mut tracker = BroadcastTracker::new();
        assert!(tracker.accept(IeeeAddress::new(1), 100));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut tracker = BroadcastTracker::new();
        assert!(tracker.accept(IeeeAddress::new(1), 100));
        assert!(!tracker.accept(IeeeAddress::new(1), 100));
        assert!(!tracker.accept(IeeeAddress::new(1), 99));
    }

    #[test]
    fn test_higher_sequence_accepted() {
        let mut tracker = BroadcastTracker::new();
        assert!(tracker.accept(IeeeAddress::new(1), 100));
        assert!(tracker.accept(IeeeAddress::new(1), 101));
        assert!(!tracker.accept(IeeeAddress::new(1), 101));
    }

    #[test]
    fn test_originators_independent() {
        let mut tracker = BroadcastTracker::new();
        assert!(tracker.accept(IeeeAddress::new(1), 50));
        assert!(tracker.accept(IeeeAddress::new(2), 50));
        assert!(!tracker.accept(IeeeAddress::new(1), 50));
    }

    #[test]
    fn test_forget() {
        let mut tracker = BroadcastTracker::new();
        assert!(tracker.accept(IeeeAddress::new(1), 10));
        tracker.forget(IeeeAddress::new(1));
        assert!(tracker.accept(IeeeAddress::new(1), 5));
    }
}
