//! Datagram reassembly from LowPan fragments
//!
//! Partial datagrams are keyed by (originator, datagram id). Fragments may
//! arrive out of order and duplicated; each fragment places its payload at
//! its byte offset, duplicates are ignored by offset, and the datagram
//! completes when every byte of the advertised total has been filled.
//! Entries idle longer than the timeout are purged opportunistically on
//! every table access, so no sweeper thread is needed.

use crate::frame::IeeeAddress;
use crate::header::FragmentInfo;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of feeding one fragment into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Stored; more fragments are needed.
    Incomplete,
    /// The fragment completed its datagram.
    Complete(Vec<u8>),
    /// Malformed or out-of-policy fragment; dropped.
    Rejected,
}

#[derive(Debug)]
struct PartialDatagram {
    buf: Vec<u8>,
    /// Per-byte coverage, so overlapping fragments never inflate the
    /// received count past what was actually written.
    filled: Vec<bool>,
    fragments: usize,
    received: usize,
    last_update: Instant,
}

impl PartialDatagram {
    fn new(total_len: usize, now: Instant) -> Self {
        Self {
            buf: vec![0; total_len],
            filled: vec![false; total_len],
            fragments: 0,
            received: 0,
            last_update: now,
        }
    }
}

/// Table of in-progress reassemblies.
#[derive(Debug)]
pub struct ReassemblyTable {
    partials: HashMap<(IeeeAddress, u16), PartialDatagram>,
    timeout: Duration,
    max_fragments: usize,
}

impl ReassemblyTable {
    pub fn new(timeout: Duration, max_fragments: usize) -> Self {
        Self {
            partials: HashMap::new(),
            timeout,
            max_fragments,
        }
    }

    /// Feed one fragment. Purges expired entries first; the number purged
    /// is reported through `expired`.
    pub fn feed(
        &mut self,
        originator: IeeeAddress,
        frag: &FragmentInfo,
        payload: &[u8],
        now: Instant,
        expired: &mut usize,
    ) -> FeedOutcome {
        *expired += self.purge_expired(now);

        let total = frag.total_len as usize;
        let offset = frag.offset as usize;
        if total == 0 || payload.is_empty() || offset + payload.len() > total {
            return FeedOutcome::Rejected;
        }

        let key = (originator, frag.datagram_id);
        let entry = self
            .partials
            .entry(key)
            .or_insert_with(|| PartialDatagram::new(total, now));

        // A reused datagram id with a different total supersedes the
        // stale partial.
        if entry.buf.len() != total {
            *entry = PartialDatagram::new(total, now);
        }

        entry.last_update = now;
        let range = offset..offset + payload.len();
        let newly = entry.filled[range.clone()].iter().filter(|f| !**f).count();
        if newly == 0 {
            // Duplicate fragment, every byte already placed.
            return FeedOutcome::Incomplete;
        }
        entry.fragments += 1;
        if entry.fragments > self.max_fragments {
            self.partials.remove(&key);
            return FeedOutcome::Rejected;
        }

        entry.buf[range.clone()].copy_from_slice(payload);
        for flag in &mut entry.filled[range] {
            *flag = true;
        }
        entry.received += newly;

        if entry.received >= total {
            let done = self.partials.remove(&key);
            match done {
                Some(partial) => FeedOutcome::Complete(partial.buf),
                None => FeedOutcome::Rejected,
            }
        } else {
            FeedOutcome::Incomplete
        }
    }

    /// Drop partials idle longer than the timeout; returns how many.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.partials.len();
        self.partials
            .retain(|_, p| now.duration_since(p.last_update) < timeout);
        before - self.partials.len()
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(id: u16, total: u16, offset: u16) -> FragmentInfo {
        FragmentInfo {
            datagram_id: id,
            total_len: total,
            offset,
        }
    }

    fn table() -> ReassemblyTable {
        ReassemblyTable::new(Duration::from_secs(10), 32)
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut t = table();
        let mut expired = 0;
        let a = IeeeAddress::new(1);
        assert_eq!(
            t.feed(a, &frag(1, 6, 0), &[1, 2, 3], Instant::now(), &mut expired),
            FeedOutcome::Incomplete
        );
        match t.feed(a, &frag(1, 6, 3), &[4, 5, 6], Instant::now(), &mut expired) {
            FeedOutcome::Complete(data) => assert_eq!(data, vec![1, 2, 3, 4, 5, 6]),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(t.is_empty());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut t = table();
        let mut expired = 0;
        let a = IeeeAddress::new(1);
        assert_eq!(
            t.feed(a, &frag(2, 4, 2), &[3, 4], Instant::now(), &mut expired),
            FeedOutcome::Incomplete
        );
        match t.feed(a, &frag(2, 4, 0), &[1, 2], Instant::now(), &mut expired) {
            FeedOutcome::Complete(data) => assert_eq!(data, vec![1, 2, 3, 4]),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut t = table();
        let mut expired = 0;
        let a = IeeeAddress::new(1);
        t.feed(a, &frag(3, 4, 0), &[1, 2], Instant::now(), &mut expired);
        assert_eq!(
            t.feed(a, &frag(3, 4, 0), &[9, 9], Instant::now(), &mut expired),
            FeedOutcome::Incomplete
        );
        match t.feed(a, &frag(3, 4, 2), &[3, 4], Instant::now(), &mut expired) {
            FeedOutcome::Complete(data) => assert_eq!(data, vec![1, 2, 3, 4]),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_same_id_different_originators() {
        let mut t = table();
        let mut expired = 0;
        t.feed(IeeeAddress::new(1), &frag(5, 4, 0), &[1, 1], Instant::now(), &mut expired);
        t.feed(IeeeAddress::new(2), &frag(5, 4, 0), &[2, 2], Instant::now(), &mut expired);
        assert_eq!(t.len(), 2);
        match t.feed(
            IeeeAddress::new(2),
            &frag(5, 4, 2),
            &[2, 2],
            Instant::now(),
            &mut expired,
        ) {
            FeedOutcome::Complete(data) => assert_eq!(data, vec![2, 2, 2, 2]),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_overlapping_fragments_do_not_fake_completion() {
        let mut t = table();
        let mut expired = 0;
        let a = IeeeAddress::new(1);
        // Offsets 0 and 1 overlap in three bytes; together they cover only
        // 5 of 8 bytes, so the datagram must stay incomplete.
        t.feed(a, &frag(6, 8, 0), &[1, 2, 3, 4], Instant::now(), &mut expired);
        assert_eq!(
            t.feed(a, &frag(6, 8, 1), &[2, 3, 4, 5], Instant::now(), &mut expired),
            FeedOutcome::Incomplete
        );
        match t.feed(a, &frag(6, 8, 5), &[6, 7, 8], Instant::now(), &mut expired) {
            FeedOutcome::Complete(data) => assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_expiry() {
        let mut t = ReassemblyTable::new(Duration::from_millis(100), 32);
        let mut expired = 0;
        let start = Instant::now();
        t.feed(IeeeAddress::new(1), &frag(7, 10, 0), &[0; 5], start, &mut expired);
        assert_eq!(t.len(), 1);

        let later = start + Duration::from_millis(200);
        t.feed(IeeeAddress::new(2), &frag(8, 10, 0), &[0; 5], later, &mut expired);
        assert_eq!(expired, 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_overflowing_fragment_rejected() {
        let mut t = table();
        let mut expired = 0;
        assert_eq!(
            t.feed(
                IeeeAddress::new(1),
                &frag(9, 4, 3),
                &[1, 2, 3],
                Instant::now(),
                &mut expired
            ),
            FeedOutcome::Rejected
        );
    }

    #[test]
    fn test_fragment_count_cap() {
        let mut t = ReassemblyTable::new(Duration::from_secs(10), 2);
        let mut expired = 0;
        let a = IeeeAddress::new(1);
        t.feed(a, &frag(1, 10, 0), &[0; 2], Instant::now(), &mut expired);
        t.feed(a, &frag(1, 10, 2), &[0; 2], Instant::now(), &mut expired);
        assert_eq!(
            t.feed(a, &frag(1, 10, 4), &[0; 2], Instant::now(), &mut expired),
            FeedOutcome::Rejected
        );
        assert!(t.is_empty());
    }
}
