//! In-memory radio network for hardware-free testing
//!
//! `SimNetwork` is a hub connecting any number of `SimRadio` devices over
//! channels. Reachability is either everyone-hears-everyone (`new`) or an
//! explicit link map (`with_explicit_links`), which is how multi-hop
//! topologies are modeled. `SimNode` wires a radio, a transport, the mesh
//! core, and both protocol managers together the way an embedding
//! application would.

use crate::config::LowpanConfig;
use crate::error::RadioError;
use crate::frame::{IeeeAddress, RadioFrame};
use crate::lowpan::LowPan;
use crate::manager::{BridgeManager, DatagramManager};
use crate::transport::{FrameTransport, RadioDevice, TxStatus};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SIM_RSSI: i8 = -60;
const SIM_CORRELATION: u8 = 110;
const SIM_LINK_QUALITY: u8 = 220;

struct NetInner {
    stations: Mutex<HashMap<IeeeAddress, Sender<RadioFrame>>>,
    links: Mutex<HashSet<(u64, u64)>>,
    all_reachable: bool,
    tx_counts: Mutex<HashMap<IeeeAddress, usize>>,
    forced_status: Mutex<HashMap<IeeeAddress, TxStatus>>,
}

impl NetInner {
    fn reachable(&self, from: IeeeAddress, to: IeeeAddress) -> bool {
        self.all_reachable || self.links.lock().contains(&(from.raw(), to.raw()))
    }

    fn deliver(&self, from: IeeeAddress, frame: &RadioFrame) {
        let stations = self.stations.lock();
        for (&addr, tx) in stations.iter() {
            if addr == from || !self.reachable(from, addr) {
                continue;
            }
            // The MAC filter: only frames for us or for everyone.
            if !frame.destination.is_broadcast() && frame.destination != addr {
                continue;
            }
            let mut copy = frame.clone();
            copy.stamp_capture(SIM_RSSI, SIM_CORRELATION, SIM_LINK_QUALITY);
            let _ = tx.send(copy);
        }
    }
}

/// Hub for a simulated radio network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetInner>,
}

impl SimNetwork {
    /// A network where every station hears every other.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A network where only declared links carry frames.
    pub fn with_explicit_links() -> Self {
        Self::build(false)
    }

    fn build(all_reachable: bool) -> Self {
        Self {
            inner: Arc::new(NetInner {
                stations: Mutex::new(HashMap::new()),
                links: Mutex::new(HashSet::new()),
                all_reachable,
                tx_counts: Mutex::new(HashMap::new()),
                forced_status: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Declare a symmetric link between two addresses.
    pub fn link(&self, a: u64, b: u64) {
        let mut links = self.inner.links.lock();
        links.insert((a, b));
        links.insert((b, a));
    }

    pub fn unlink(&self, a: u64, b: u64) {
        let mut links = self.inner.links.lock();
        links.remove(&(a, b));
        links.remove(&(b, a));
    }

    /// Attach a new radio with the given address.
    pub fn attach(&self, address: u64) -> Arc<SimRadio> {
        let addr = IeeeAddress::new(address);
        let (tx, rx) = unbounded();
        self.inner.stations.lock().insert(addr, tx);
        Arc::new(SimRadio {
            addr,
            net: Arc::clone(&self.inner),
            rx,
        })
    }

    /// Frames transmitted by a station so far.
    pub fn tx_count(&self, address: u64) -> usize {
        self.inner
            .tx_counts
            .lock()
            .get(&IeeeAddress::new(address))
            .copied()
            .unwrap_or(0)
    }

    /// Force every transmit from `address` to report `status`.
    pub fn set_tx_status(&self, address: u64, status: TxStatus) {
        self.inner
            .forced_status
            .lock()
            .insert(IeeeAddress::new(address), status);
    }

    pub fn clear_tx_status(&self, address: u64) {
        self.inner
            .forced_status
            .lock()
            .remove(&IeeeAddress::new(address));
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One simulated radio interface.
pub struct SimRadio {
    addr: IeeeAddress,
    net: Arc<NetInner>,
    rx: Receiver<RadioFrame>,
}

impl RadioDevice for SimRadio {
    fn own_address(&self) -> IeeeAddress {
        self.addr
    }

    fn transmit(&self, frame: &RadioFrame) -> TxStatus {
        *self.net.tx_counts.lock().entry(self.addr).or_insert(0) += 1;
        if let Some(&status) = self.net.forced_status.lock().get(&self.addr) {
            if status != TxStatus::Success {
                return status;
            }
        }
        self.net.deliver(self.addr, frame);
        TxStatus::Success
    }

    fn receive_blocking(&self) -> Result<RadioFrame, RadioError> {
        self.rx.recv().map_err(|_| RadioError::Shutdown)
    }

    fn shutdown(&self) {
        // Removing the station drops its sender, which unblocks the
        // receive loop with a disconnect.
        self.net.stations.lock().remove(&self.addr);
    }
}

/// One fully wired node on a simulated network.
pub struct SimNode {
    pub address: IeeeAddress,
    pub transport: Arc<FrameTransport>,
    pub lowpan: Arc<LowPan>,
    pub datagrams: Arc<DatagramManager>,
    pub bridge: Arc<BridgeManager>,
}

impl SimNode {
    /// Attach a radio at `address`, wire the whole stack on top of it, and
    /// start receiving.
    pub fn join(net: &SimNetwork, address: u64, config: LowpanConfig) -> SimNode {
        let radio = net.attach(address);
        let transport = FrameTransport::new(vec![radio], config.pan_id, config.quality_queue_depth);
        let lowpan = LowPan::new(config, Arc::clone(&transport));
        let datagrams = DatagramManager::new(Arc::clone(&lowpan));
        let bridge = BridgeManager::new(Arc::clone(&lowpan));
        transport.start(lowpan.clone());
        SimNode {
            address: IeeeAddress::new(address),
            transport,
            lowpan,
            datagrams,
            bridge,
        }
    }

    pub fn shutdown(&self) {
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn settle() {
        thread::sleep(Duration::from_millis(200));
    }

    #[test]
    fn test_unicast_and_reply() {
        let net = SimNetwork::new();
        let a = SimNode::join(&net, 1, LowpanConfig::default());
        let b = SimNode::join(&net, 2, LowpanConfig::default());

        let server = b.datagrams.open_server(5).unwrap();
        let client = a.datagrams.open_input(IeeeAddress::new(2), 5);

        a.datagrams.send(client, IeeeAddress::new(2), b"hello").unwrap();
        let got = b.datagrams.receive_timeout(server, WAIT).unwrap().unwrap();
        assert_eq!(got.payload, b"hello");
        assert_eq!(got.info.originator, IeeeAddress::new(1));

        // B heard A, so the reply goes out as a direct single-hop frame.
        assert!(b.transport.knows(IeeeAddress::new(1)));
        let reply_to = b.datagrams.open_input(IeeeAddress::new(1), 5);
        b.datagrams.send(reply_to, IeeeAddress::new(1), b"hi back").unwrap();
        let got = a.datagrams.receive_timeout(client, WAIT).unwrap().unwrap();
        assert_eq!(got.payload, b"hi back");

        assert_eq!(a.lowpan.stats().unicasts_sent, 1);
        assert_eq!(b.lowpan.stats().unicasts_received, 1);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_large_datagram_fragments_and_reassembles() {
        let net = SimNetwork::new();
        let a = SimNode::join(&net, 1, LowpanConfig::default());
        let b = SimNode::join(&net, 2, LowpanConfig::default());

        let server = b.datagrams.open_server(5).unwrap();
        let client = a.datagrams.open_input(IeeeAddress::new(2), 5);

        let payload: Vec<u8> = (0..600u16).map(|i| (i % 251) as u8).collect();
        let sent = a.datagrams.send(client, IeeeAddress::new(2), &payload).unwrap();
        assert_eq!(sent, 600);

        let got = b.datagrams.receive_timeout(server, WAIT).unwrap().unwrap();
        assert_eq!(got.payload, payload);

        // 600 bytes cannot fit one 112-byte frame.
        assert!(net.tx_count(1) >= 6, "tx_count = {}", net.tx_count(1));
        let a_stats = a.lowpan.stats();
        assert_eq!(a_stats.unicasts_sent, 1);
        assert_eq!(a_stats.unicasts_fragmented, 1);
        let b_stats = b.lowpan.stats();
        assert_eq!(b_stats.datagrams_reassembled, 1);
        assert!(b_stats.fragments_received >= 6);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_multi_hop_forwarding() {
        let net = SimNetwork::with_explicit_links();
        net.link(1, 2);
        net.link(2, 3);

        let config = LowpanConfig::default().with_default_ttl(4);
        let a = SimNode::join(&net, 1, config.clone());
        let b = SimNode::join(&net, 2, config.clone());
        let c = SimNode::join(&net, 3, config);

        let server = c.datagrams.open_server(7).unwrap();
        let client = a.datagrams.open_input(IeeeAddress::new(3), 7);

        a.datagrams.send(client, IeeeAddress::new(3), b"across").unwrap();
        let got = c.datagrams.receive_timeout(server, WAIT).unwrap().unwrap();
        assert_eq!(got.payload, b"across");
        // Originator is A even though the frame arrived via B.
        assert_eq!(got.info.originator, IeeeAddress::new(1));

        settle();
        assert!(b.lowpan.stats().packets_forwarded >= 1);
        assert_eq!(c.lowpan.stats().unicasts_received, 1);

        a.shutdown();
        b.shutdown();
        c.shutdown();
    }

    #[test]
    fn test_broadcast_delivered_once_despite_rebroadcast() {
        let net = SimNetwork::new();
        let a = SimNode::join(&net, 1, LowpanConfig::default());
        let b = SimNode::join(&net, 2, LowpanConfig::default());
        let c = SimNode::join(&net, 3, LowpanConfig::default());

        let b_conn = b.datagrams.open_broadcast(9);
        let c_conn = c.datagrams.open_broadcast(9);
        let a_conn = a.datagrams.open_broadcast(9);

        a.datagrams.send(a_conn, IeeeAddress::BROADCAST, b"news").unwrap();
        settle();

        // Exactly one delivery each, no matter how many copies flew.
        assert_eq!(
            b.datagrams.receive_timeout(b_conn, WAIT).unwrap().unwrap().payload,
            b"news"
        );
        assert!(b
            .datagrams
            .receive_timeout(b_conn, Duration::from_millis(100))
            .unwrap()
            .is_none());
        assert_eq!(
            c.datagrams.receive_timeout(c_conn, WAIT).unwrap().unwrap().payload,
            b"news"
        );
        assert!(c
            .datagrams
            .receive_timeout(c_conn, Duration::from_millis(100))
            .unwrap()
            .is_none());

        // B and C rebroadcast A's message to each other; the copies were
        // suppressed by sequence tracking.
        let dropped = b.lowpan.stats().dropped_broadcasts + c.lowpan.stats().dropped_broadcasts;
        assert!(dropped >= 1, "dropped = {dropped}");
        assert!(b.lowpan.stats().mesh_broadcasts_forwarded >= 1);
        // A's own broadcast echoed back is ignored outright.
        assert_eq!(a.lowpan.stats().broadcasts_sent, 1);

        a.shutdown();
        b.shutdown();
        c.shutdown();
    }

    #[test]
    fn test_fragmented_broadcast_delivered_once_per_receiver() {
        let net = SimNetwork::new();
        let a = SimNode::join(&net, 1, LowpanConfig::default());
        let b = SimNode::join(&net, 2, LowpanConfig::default());
        let c = SimNode::join(&net, 3, LowpanConfig::default());

        let a_conn = a.datagrams.open_broadcast(9);
        let b_conn = b.datagrams.open_broadcast(9);
        let c_conn = c.datagrams.open_broadcast(9);

        // Far too big for one frame; hops 2 makes B and C rebroadcast the
        // fragments to each other as well.
        let payload: Vec<u8> = (0..600u16).map(|i| (i % 249) as u8).collect();
        a.datagrams.send(a_conn, IeeeAddress::BROADCAST, &payload).unwrap();
        settle();

        for (node, conn) in [(&b, b_conn), (&c, c_conn)] {
            let got = node.datagrams.receive_timeout(conn, WAIT).unwrap().unwrap();
            assert_eq!(got.payload, payload);
            assert_eq!(got.info.originator, IeeeAddress::new(1));
            assert!(node
                .datagrams
                .receive_timeout(conn, Duration::from_millis(100))
                .unwrap()
                .is_none());
            assert_eq!(node.lowpan.stats().datagrams_reassembled, 1);
        }

        assert_eq!(a.lowpan.stats().broadcasts_fragmented, 1);
        // The cross-rebroadcast copies were suppressed, not fed to
        // reassembly twice.
        let dropped = b.lowpan.stats().dropped_broadcasts + c.lowpan.stats().dropped_broadcasts;
        assert!(dropped >= 1, "dropped = {dropped}");

        a.shutdown();
        b.shutdown();
        c.shutdown();
    }

    #[test]
    fn test_bridge_retries_then_fails() {
        let net = SimNetwork::new();
        let a = SimNode::join(&net, 1, LowpanConfig::default());
        let b = SimNode::join(&net, 2, LowpanConfig::default());

        // Let A learn B's address first.
        b.lowpan.send_broadcast(200, b"here", 1).unwrap();
        settle();
        assert!(a.transport.knows(IeeeAddress::new(2)));

        net.set_tx_status(1, TxStatus::NoAck);
        let before = net.tx_count(1);
        let conn = a.bridge.open_input(IeeeAddress::new(2), 4);
        let err = a.bridge.send(conn, IeeeAddress::new(2), b"x").unwrap_err();
        assert_eq!(err, crate::error::SendError::NoAck(IeeeAddress::new(2)));
        assert_eq!(net.tx_count(1) - before, 3);

        // Acks restored, the same send goes through.
        net.clear_tx_status(1);
        let server = b.bridge.open_server(4).unwrap();
        a.bridge.send(conn, IeeeAddress::new(2), b"again").unwrap();
        let got = b.bridge.receive_timeout(server, WAIT).unwrap().unwrap();
        assert_eq!(got.payload, b"again");

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_shutdown_stops_receive_loop() {
        let net = SimNetwork::new();
        let a = SimNode::join(&net, 1, LowpanConfig::default());
        let b = SimNode::join(&net, 2, LowpanConfig::default());
        b.shutdown();

        // Sends toward the departed node still return; the frame just goes
        // nowhere.
        let conn = a.datagrams.open_input(IeeeAddress::new(2), 5);
        a.datagrams.send(conn, IeeeAddress::new(2), b"anyone?").unwrap();

        a.shutdown();
    }
}
