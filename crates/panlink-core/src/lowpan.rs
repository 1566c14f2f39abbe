//! LowPan mesh core
//!
//! The state machine between the frame transport and the protocol
//! managers:
//!
//! ```text
//!   protocol managers        (register_protocol / register_protocol_family)
//!        ^          |
//!        | dispatch | send / send_broadcast
//!   +----+----------v----+
//!   |      LowPan        |  fragmentation, reassembly, TTL forwarding,
//!   +----+----------^----+  broadcast dedup, statistics
//!        |          |
//!   send_to      receive    FrameTransport
//! ```
//!
//! Outbound datagrams that fit one frame go out as-is; larger ones are
//! split into fragments sharing a datagram id. A destination the transport
//! has heard from gets a local single-hop frame; anything else becomes a
//! mesh frame flooded with a TTL budget. Inbound frames are decoded,
//! checked against the node's own addresses (loop echo), deduplicated if
//! mesh broadcasts, reassembled if fragments, delivered to the registered
//! handler, and forwarded when they are someone else's mesh traffic with
//! TTL to spare.

use crate::config::LowpanConfig;
use crate::dedup::BroadcastTracker;
use crate::error::SendError;
use crate::frame::{IeeeAddress, RadioFrame};
use crate::header::{FragmentInfo, FrameKind, HeaderInfo, LowpanHeader};
use crate::reassembly::{FeedOutcome, ReassemblyTable};
use crate::stats::LowpanStats;
use crate::transport::{FrameTransport, InboundSink};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Receiver of datagrams for one protocol id (or family id).
///
/// Called on a transport receive thread; implementations hand the payload
/// off quickly (the managers enqueue to a connection queue).
pub trait ProtocolHandler: Send + Sync {
    fn process_incoming(&self, payload: &[u8], info: &HeaderInfo);
}

/// The mesh layer of one node.
pub struct LowPan {
    config: LowpanConfig,
    transport: Arc<FrameTransport>,
    protocols: RwLock<HashMap<u8, Arc<dyn ProtocolHandler>>>,
    families: RwLock<HashMap<u8, Arc<dyn ProtocolHandler>>>,
    reassembly: Mutex<ReassemblyTable>,
    dedup: Mutex<BroadcastTracker>,
    stats: Mutex<LowpanStats>,
    // Both counters are seeded randomly so a restarted node does not
    // replay sequence numbers its peers have already recorded.
    broadcast_seq: AtomicU16,
    datagram_id: AtomicU16,
}

impl LowPan {
    pub fn new(config: LowpanConfig, transport: Arc<FrameTransport>) -> Arc<Self> {
        let reassembly = ReassemblyTable::new(
            Duration::from_millis(config.reassembly_timeout_ms),
            config.max_fragments,
        );
        Arc::new(Self {
            config,
            transport,
            protocols: RwLock::new(HashMap::new()),
            families: RwLock::new(HashMap::new()),
            reassembly: Mutex::new(reassembly),
            dedup: Mutex::new(BroadcastTracker::new()),
            stats: Mutex::new(LowpanStats::default()),
            broadcast_seq: AtomicU16::new(rand::random()),
            datagram_id: AtomicU16::new(rand::random()),
        })
    }

    pub fn transport(&self) -> &Arc<FrameTransport> {
        &self.transport
    }

    pub fn config(&self) -> &LowpanConfig {
        &self.config
    }

    /// Register a handler for a native protocol id, replacing any previous
    /// registration.
    pub fn register_protocol(&self, protocol: u8, handler: Arc<dyn ProtocolHandler>) {
        let mut protocols = self.protocols.write();
        protocols.insert(protocol, handler);
        self.stats.lock().protocol_count = protocols.len() as u32;
    }

    pub fn deregister_protocol(&self, protocol: u8) -> bool {
        let mut protocols = self.protocols.write();
        let removed = protocols.remove(&protocol).is_some();
        self.stats.lock().protocol_count = protocols.len() as u32;
        removed
    }

    /// Register a handler for a protocol-family id.
    pub fn register_protocol_family(&self, family: u8, handler: Arc<dyn ProtocolHandler>) {
        let mut families = self.families.write();
        families.insert(family, handler);
        self.stats.lock().protocol_family_count = families.len() as u32;
    }

    pub fn deregister_protocol_family(&self, family: u8) -> bool {
        let mut families = self.families.write();
        let removed = families.remove(&family).is_some();
        self.stats.lock().protocol_family_count = families.len() as u32;
        removed
    }

    /// Send a unicast datagram, fragmenting as needed.
    ///
    /// A destination the transport has heard from directly gets local
    /// single-hop frames; otherwise mesh frames with the default TTL are
    /// flooded toward it. Any fragment failing fails the whole datagram.
    pub fn send(&self, protocol: u8, to: IeeeAddress, payload: &[u8]) -> Result<usize, SendError> {
        if to.is_none() || to.is_broadcast() {
            return Err(SendError::InvalidDestination(to));
        }
        let originator = self.transport.primary_address();
        let (header, mac_dest) = if self.transport.knows(to) {
            (LowpanHeader::local(protocol, originator), to)
        } else {
            (
                LowpanHeader::mesh(protocol, originator, to, self.config.default_ttl),
                IeeeAddress::BROADCAST,
            )
        };
        let fragmented = self.send_datagram(&header, mac_dest, payload)?;
        let mut stats = self.stats.lock();
        stats.unicasts_sent += 1;
        if fragmented {
            stats.unicasts_fragmented += 1;
        }
        Ok(payload.len())
    }

    /// Send a broadcast datagram with a hop budget.
    ///
    /// `hops` of 1 is a plain link-local broadcast, which is never
    /// fragmented. More hops make it a mesh broadcast carrying this node's
    /// next sequence number, rebroadcast by receivers until the TTL runs
    /// out.
    pub fn send_broadcast(&self, protocol: u8, payload: &[u8], hops: u8) -> Result<usize, SendError> {
        let originator = self.transport.primary_address();
        if hops <= 1 {
            let header = LowpanHeader::local(protocol, originator);
            let room = self.config.frame_capacity.saturating_sub(header.encoded_len());
            if payload.len() > room {
                return Err(SendError::TooLarge {
                    len: payload.len(),
                    max: room,
                });
            }
            let mut frame = RadioFrame::outbound(IeeeAddress::BROADCAST, header.encode(payload));
            self.transport.broadcast(&mut frame)?;
            let mut stats = self.stats.lock();
            stats.broadcasts_sent += 1;
            stats.packets_sent += 1;
            stats.non_mesh_packets_sent += 1;
            return Ok(payload.len());
        }

        let header =
            LowpanHeader::mesh_broadcast(protocol, originator, hops, self.next_broadcast_seq());
        let fragmented = self.send_datagram(&header, IeeeAddress::BROADCAST, payload)?;
        let mut stats = self.stats.lock();
        stats.broadcasts_sent += 1;
        stats.mesh_broadcasts_sent += 1;
        if fragmented {
            stats.broadcasts_fragmented += 1;
        }
        Ok(payload.len())
    }

    /// Send one single-hop frame under a protocol-*family* id.
    ///
    /// Family traffic bridges foreign radio stacks frame-for-frame, so it
    /// is never fragmented; oversized payloads are an error. `to` may be
    /// the broadcast address.
    pub fn send_family(&self, family: u8, to: IeeeAddress, payload: &[u8]) -> Result<usize, SendError> {
        if to.is_none() {
            return Err(SendError::InvalidDestination(to));
        }
        let header =
            LowpanHeader::local(family, self.transport.primary_address()).with_family();
        let room = self.config.frame_capacity.saturating_sub(header.encoded_len());
        if payload.len() > room {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max: room,
            });
        }
        let mut frame = RadioFrame::outbound(to, header.encode(payload));
        self.transport.send_to(&mut frame, to)?;
        let mut stats = self.stats.lock();
        stats.packets_sent += 1;
        stats.non_mesh_packets_sent += 1;
        Ok(payload.len())
    }

    /// Counter snapshot stamped with the capture time.
    pub fn stats(&self) -> LowpanStats {
        self.stats.lock().snapshot()
    }

    pub(crate) fn count_queue_full(&self) {
        self.stats.lock().broadcasts_queue_full += 1;
    }

    fn next_datagram_id(&self) -> u16 {
        self.datagram_id.fetch_add(1, Ordering::Relaxed)
    }

    fn next_broadcast_seq(&self) -> u16 {
        self.broadcast_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Encode and transmit, fragmenting when header plus payload exceeds
    /// the frame capacity. Returns whether fragmentation happened.
    fn send_datagram(
        &self,
        header: &LowpanHeader,
        mac_dest: IeeeAddress,
        payload: &[u8],
    ) -> Result<bool, SendError> {
        if header.encoded_len() + payload.len() <= self.config.frame_capacity {
            let mut frame = RadioFrame::outbound(mac_dest, header.encode(payload));
            self.transport.send_to(&mut frame, mac_dest)?;
            self.count_frame_sent(header.kind);
            return Ok(false);
        }

        let probe = header.clone().with_fragment(FragmentInfo {
            datagram_id: 0,
            total_len: 0,
            offset: 0,
        });
        let chunk = self.config.frame_capacity.saturating_sub(probe.encoded_len());
        let max = (chunk * self.config.max_fragments).min(u16::MAX as usize);
        if chunk == 0 || payload.len() > max {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max,
            });
        }

        let datagram_id = self.next_datagram_id();
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk).min(payload.len());
            let mut piece = header.clone().with_fragment(FragmentInfo {
                datagram_id,
                total_len: payload.len() as u16,
                offset: offset as u16,
            });
            // Dedup accepts only strictly increasing sequences per
            // originator, so every mesh broadcast frame spends its own.
            if piece.kind == FrameKind::MeshBroadcast && offset > 0 {
                piece.sequence = Some(self.next_broadcast_seq());
            }
            let mut frame = RadioFrame::outbound(mac_dest, piece.encode(&payload[offset..end]));
            self.transport.send_to(&mut frame, mac_dest)?;
            self.count_frame_sent(header.kind);
            offset = end;
        }
        Ok(true)
    }

    fn count_frame_sent(&self, kind: FrameKind) {
        let mut stats = self.stats.lock();
        stats.packets_sent += 1;
        match kind {
            FrameKind::Local => stats.non_mesh_packets_sent += 1,
            FrameKind::Mesh | FrameKind::MeshBroadcast => stats.mesh_packets_sent += 1,
        }
    }

    fn handle_frame(&self, frame: RadioFrame) {
        let (header, payload_at) = match LowpanHeader::decode(frame.payload()) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(%err, source = %frame.source, "undecodable frame dropped");
                return;
            }
        };

        // A frame we originated, echoed back over some loop.
        if self.transport.is_local(header.originator) {
            trace!(originator = %header.originator, "own frame echoed back, dropped");
            return;
        }

        {
            let mut stats = self.stats.lock();
            match header.kind {
                FrameKind::Local => {
                    stats.non_mesh_packets_received += 1;
                    if frame.destination.is_broadcast() {
                        stats.broadcasts_received += 1;
                    }
                }
                FrameKind::Mesh => stats.mesh_packets_received += 1,
                FrameKind::MeshBroadcast => {
                    stats.mesh_packets_received += 1;
                    stats.mesh_broadcasts_received += 1;
                }
            }
        }

        if header.kind == FrameKind::MeshBroadcast {
            let sequence = header.sequence.unwrap_or(0);
            if !self.dedup.lock().accept(header.originator, sequence) {
                self.stats.lock().dropped_broadcasts += 1;
                trace!(originator = %header.originator, sequence, "duplicate broadcast dropped");
                return;
            }
        }

        let for_us = match header.kind {
            // The MAC already filtered local frames to us-or-broadcast.
            FrameKind::Local | FrameKind::MeshBroadcast => true,
            FrameKind::Mesh => {
                header.destination.is_broadcast() || self.transport.is_local(header.destination)
            }
        };
        if for_us {
            self.deliver(&header, &frame, &frame.payload()[payload_at..]);
        }

        let forward = match header.kind {
            FrameKind::Local => false,
            FrameKind::Mesh => !for_us,
            FrameKind::MeshBroadcast => true,
        };
        if forward {
            self.forward(header, &frame, payload_at);
        }
    }

    fn deliver(&self, header: &LowpanHeader, frame: &RadioFrame, payload: &[u8]) {
        match &header.fragment {
            None => self.dispatch(header, frame, payload),
            Some(frag) => {
                self.stats.lock().fragments_received += 1;
                let mut expired = 0;
                let outcome = self.reassembly.lock().feed(
                    header.originator,
                    frag,
                    payload,
                    Instant::now(),
                    &mut expired,
                );
                if expired > 0 {
                    self.stats.lock().reassembly_expired += expired as u32;
                }
                match outcome {
                    FeedOutcome::Incomplete => {}
                    FeedOutcome::Complete(datagram) => {
                        self.stats.lock().datagrams_reassembled += 1;
                        self.dispatch(header, frame, &datagram);
                    }
                    FeedOutcome::Rejected => {
                        debug!(
                            originator = %header.originator,
                            datagram_id = frag.datagram_id,
                            "bad fragment rejected"
                        );
                    }
                }
            }
        }
    }

    fn dispatch(&self, header: &LowpanHeader, frame: &RadioFrame, payload: &[u8]) {
        let info = HeaderInfo::from_frame(header, frame);
        if !info.broadcast {
            self.stats.lock().unicasts_received += 1;
        }
        let handler = if header.family {
            self.families.read().get(&header.protocol).cloned()
        } else {
            // Native protocols may fall back to a family handler claiming
            // the same id space.
            self.protocols
                .read()
                .get(&header.protocol)
                .cloned()
                .or_else(|| self.families.read().get(&header.protocol).cloned())
        };
        match handler {
            Some(handler) => handler.process_incoming(payload, &info),
            None => {
                self.stats.lock().protocol_handler_missing += 1;
                debug!(
                    protocol = header.protocol,
                    family = header.family,
                    "no handler registered, dropped"
                );
            }
        }
    }

    /// Forward someone else's mesh frame, spending one TTL hop. Forwarding
    /// is best effort; transmit failures are logged, not surfaced.
    fn forward(&self, mut header: LowpanHeader, frame: &RadioFrame, payload_at: usize) {
        if header.ttl <= 1 {
            self.stats.lock().ttl_expired += 1;
            trace!(
                originator = %header.originator,
                destination = %header.destination,
                "ttl expired, not forwarded"
            );
            return;
        }
        header.ttl -= 1;

        let rebroadcast = header.kind == FrameKind::MeshBroadcast;
        let mac_dest = if !rebroadcast && self.transport.knows(header.destination) {
            header.destination
        } else {
            IeeeAddress::BROADCAST
        };
        let mut out = RadioFrame::outbound(mac_dest, header.encode(&frame.payload()[payload_at..]));
        match self.transport.send_to(&mut out, mac_dest) {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.packets_forwarded += 1;
                stats.packets_sent += 1;
                stats.mesh_packets_sent += 1;
                if rebroadcast {
                    stats.mesh_broadcasts_forwarded += 1;
                }
            }
            Err(err) => {
                debug!(%err, destination = %header.destination, "forward failed");
            }
        }
    }
}

impl InboundSink for LowPan {
    fn receive(&self, frame: RadioFrame) {
        self.handle_frame(frame);
    }
}

impl std::fmt::Debug for LowPan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowPan")
            .field("transport", &self.transport)
            .field("protocols", &self.protocols.read().len())
            .field("families", &self.families.read().len())
            .finish()
    }
}
