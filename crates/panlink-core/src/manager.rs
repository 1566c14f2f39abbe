//! Port-based protocol managers
//!
//! Two managers sit on top of `LowPan` and multiplex datagram connections
//! by a port carried as the first payload byte on the wire:
//!
//! - `DatagramManager` speaks the native datagram protocol (id 105) with
//!   full mesh routing and fragmentation. It never retries; reliability is
//!   the application's business.
//! - `BridgeManager` speaks a foreign protocol-*family* (id 63) used to
//!   bridge nodes whose radio stack shares only single-hop frames. Frames
//!   are never fragmented and an unacknowledged unicast is retried a few
//!   times before the error surfaces.
//!
//! Inbound datagrams resolve to a connection with server precedence: a
//! server connection on the port wins, then the input connection bound to
//! the originator, then (for broadcasts) a broadcast connection.

use crate::connection::{ConnectionId, ConnectionState, Datagram, EnqueueOutcome, Role};
use crate::error::{ConnectError, RecvError, SendError};
use crate::frame::IeeeAddress;
use crate::header::HeaderInfo;
use crate::lowpan::{LowPan, ProtocolHandler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Native datagram protocol id.
pub const DATAGRAM_PROTOCOL_ID: u8 = 105;
/// Foreign bridge protocol-family id.
pub const BRIDGE_FAMILY_ID: u8 = 63;

/// Shared connection table plus the port-stripping inbound path.
struct PortMux {
    lowpan: Arc<LowPan>,
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionState>>>,
    queue_depth: usize,
}

impl PortMux {
    fn new(lowpan: Arc<LowPan>) -> Self {
        let queue_depth = lowpan.config().connection_queue_depth;
        Self {
            lowpan,
            connections: Mutex::new(HashMap::new()),
            queue_depth,
        }
    }

    fn open_server(&self, port: u8) -> Result<ConnectionId, ConnectError> {
        let cid = ConnectionId::server(port);
        let mut connections = self.connections.lock();
        if connections.contains_key(&cid) {
            return Err(ConnectError::PortInUse(port));
        }
        connections.insert(cid, ConnectionState::new(self.queue_depth));
        Ok(cid)
    }

    /// Idempotent; reopening an existing input connection returns the same
    /// identity.
    fn open_input(&self, remote: IeeeAddress, port: u8) -> ConnectionId {
        let cid = ConnectionId::input(remote, port);
        self.connections
            .lock()
            .entry(cid)
            .or_insert_with(|| ConnectionState::new(self.queue_depth));
        cid
    }

    /// Reference counted; every open must be matched by a close.
    fn open_broadcast(&self, port: u8) -> ConnectionId {
        let cid = ConnectionId::broadcast(port);
        let mut connections = self.connections.lock();
        match connections.get(&cid) {
            Some(state) => state.add_ref(),
            None => {
                connections.insert(cid, ConnectionState::new(self.queue_depth));
            }
        }
        cid
    }

    fn close(&self, cid: ConnectionId) {
        let mut connections = self.connections.lock();
        if cid.role == Role::Broadcast {
            if let Some(state) = connections.get(&cid) {
                if state.release_ref() > 0 {
                    return;
                }
            }
        }
        if let Some(state) = connections.remove(&cid) {
            state.close();
        }
    }

    fn state(&self, cid: &ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.lock().get(cid).cloned()
    }

    fn receive(&self, cid: ConnectionId) -> Result<Datagram, RecvError> {
        self.state(&cid).ok_or(RecvError::Closed)?.receive()
    }

    fn receive_timeout(
        &self,
        cid: ConnectionId,
        timeout: Duration,
    ) -> Result<Option<Datagram>, RecvError> {
        self.state(&cid)
            .ok_or(RecvError::Closed)?
            .receive_timeout(timeout)
    }

    /// Strip the port byte and enqueue to the owning connection.
    fn deliver(&self, payload: &[u8], info: &HeaderInfo) {
        let Some((&port, user)) = payload.split_first() else {
            trace!(originator = %info.originator, "empty datagram dropped");
            return;
        };
        let state = {
            let connections = self.connections.lock();
            connections
                .get(&ConnectionId::server(port))
                .or_else(|| connections.get(&ConnectionId::input(info.originator, port)))
                .or_else(|| {
                    if info.broadcast {
                        connections.get(&ConnectionId::broadcast(port))
                    } else {
                        None
                    }
                })
                .cloned()
        };
        match state {
            Some(state) => {
                let datagram = Datagram {
                    payload: user.to_vec(),
                    info: info.clone(),
                };
                match state.enqueue(datagram) {
                    EnqueueOutcome::Queued => {}
                    EnqueueOutcome::Full => {
                        self.lowpan.count_queue_full();
                        debug!(port, originator = %info.originator, "connection queue full, datagram dropped");
                    }
                    // Racing a close; not an overflow, not counted.
                    EnqueueOutcome::Closed => {
                        trace!(port, originator = %info.originator, "datagram arrived after close");
                    }
                }
            }
            None => {
                trace!(port, originator = %info.originator, "no connection for port");
            }
        }
    }

    fn check_sendable(&self, cid: ConnectionId) -> Result<(), SendError> {
        if self.state(&cid).is_none() {
            return Err(SendError::Closed);
        }
        if !cid.can_send() {
            return Err(SendError::NotSendable(cid.to_string()));
        }
        Ok(())
    }
}

/// Manager for the native datagram protocol.
pub struct DatagramManager {
    mux: PortMux,
    default_hops: u8,
}

impl DatagramManager {
    /// Create the manager and register it with `lowpan` under the native
    /// protocol id.
    pub fn new(lowpan: Arc<LowPan>) -> Arc<Self> {
        let default_hops = lowpan.config().broadcast_hops;
        let manager = Arc::new(Self {
            mux: PortMux::new(lowpan),
            default_hops,
        });
        manager
            .mux
            .lowpan
            .register_protocol(DATAGRAM_PROTOCOL_ID, manager.clone());
        manager
    }

    /// Open a receive-only connection taking every datagram on `port`.
    pub fn open_server(&self, port: u8) -> Result<ConnectionId, ConnectError> {
        self.mux.open_server(port)
    }

    /// Open a two-way connection bound to `remote` on `port`.
    pub fn open_input(&self, remote: IeeeAddress, port: u8) -> ConnectionId {
        self.mux.open_input(remote, port)
    }

    /// Open (or share) the broadcast connection for `port`.
    pub fn open_broadcast(&self, port: u8) -> ConnectionId {
        self.mux.open_broadcast(port)
    }

    pub fn close(&self, cid: ConnectionId) {
        self.mux.close(cid)
    }

    /// Send `payload` over the connection. Broadcast connections broadcast
    /// with the configured hop budget and ignore `to`; others require a
    /// concrete destination.
    pub fn send(&self, cid: ConnectionId, to: IeeeAddress, payload: &[u8]) -> Result<usize, SendError> {
        self.mux.check_sendable(cid)?;
        let mut wire = Vec::with_capacity(payload.len() + 1);
        wire.push(cid.port);
        wire.extend_from_slice(payload);
        if cid.role == Role::Broadcast {
            self.mux
                .lowpan
                .send_broadcast(DATAGRAM_PROTOCOL_ID, &wire, self.default_hops)?;
        } else {
            self.mux.lowpan.send(DATAGRAM_PROTOCOL_ID, to, &wire)?;
        }
        Ok(payload.len())
    }

    /// Broadcast with an explicit hop budget.
    pub fn send_broadcast(
        &self,
        cid: ConnectionId,
        payload: &[u8],
        hops: u8,
    ) -> Result<usize, SendError> {
        self.mux.check_sendable(cid)?;
        let mut wire = Vec::with_capacity(payload.len() + 1);
        wire.push(cid.port);
        wire.extend_from_slice(payload);
        self.mux
            .lowpan
            .send_broadcast(DATAGRAM_PROTOCOL_ID, &wire, hops)?;
        Ok(payload.len())
    }

    /// Block until a datagram arrives on the connection.
    pub fn receive(&self, cid: ConnectionId) -> Result<Datagram, RecvError> {
        self.mux.receive(cid)
    }

    pub fn receive_timeout(
        &self,
        cid: ConnectionId,
        timeout: Duration,
    ) -> Result<Option<Datagram>, RecvError> {
        self.mux.receive_timeout(cid, timeout)
    }
}

impl ProtocolHandler for DatagramManager {
    fn process_incoming(&self, payload: &[u8], info: &HeaderInfo) {
        self.mux.deliver(payload, info);
    }
}

/// Manager for the foreign bridge protocol family.
pub struct BridgeManager {
    mux: PortMux,
    retries: u32,
}

impl BridgeManager {
    /// Create the manager and register it with `lowpan` under the bridge
    /// family id.
    pub fn new(lowpan: Arc<LowPan>) -> Arc<Self> {
        let retries = lowpan.config().bridge_retries.max(1);
        let manager = Arc::new(Self {
            mux: PortMux::new(lowpan),
            retries,
        });
        manager
            .mux
            .lowpan
            .register_protocol_family(BRIDGE_FAMILY_ID, manager.clone());
        manager
    }

    pub fn open_server(&self, port: u8) -> Result<ConnectionId, ConnectError> {
        self.mux.open_server(port)
    }

    pub fn open_input(&self, remote: IeeeAddress, port: u8) -> ConnectionId {
        self.mux.open_input(remote, port)
    }

    pub fn open_broadcast(&self, port: u8) -> ConnectionId {
        self.mux.open_broadcast(port)
    }

    pub fn close(&self, cid: ConnectionId) {
        self.mux.close(cid)
    }

    /// Send one single-hop frame, retrying unacknowledged unicasts.
    pub fn send(&self, cid: ConnectionId, to: IeeeAddress, payload: &[u8]) -> Result<usize, SendError> {
        self.mux.check_sendable(cid)?;
        let dest = if cid.role == Role::Broadcast {
            IeeeAddress::BROADCAST
        } else {
            to
        };
        let mut wire = Vec::with_capacity(payload.len() + 1);
        wire.push(cid.port);
        wire.extend_from_slice(payload);

        let mut attempt = 0;
        loop {
            match self.mux.lowpan.send_family(BRIDGE_FAMILY_ID, dest, &wire) {
                Ok(_) => return Ok(payload.len()),
                Err(SendError::NoAck(addr)) => {
                    attempt += 1;
                    if attempt >= self.retries {
                        return Err(SendError::NoAck(addr));
                    }
                    trace!(attempt, to = %addr, "no ack, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn receive(&self, cid: ConnectionId) -> Result<Datagram, RecvError> {
        self.mux.receive(cid)
    }

    pub fn receive_timeout(
        &self,
        cid: ConnectionId,
        timeout: Duration,
    ) -> Result<Option<Datagram>, RecvError> {
        self.mux.receive_timeout(cid, timeout)
    }
}

impl ProtocolHandler for BridgeManager {
    fn process_incoming(&self, payload: &[u8], info: &HeaderInfo) {
        self.mux.deliver(payload, info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LowpanConfig;
    use crate::transport::FrameTransport;

    fn manager() -> Arc<DatagramManager> {
        let transport = FrameTransport::new(Vec::new(), 3, 8);
        DatagramManager::new(LowPan::new(LowpanConfig::default(), transport))
    }

    fn info(from: u64, broadcast: bool) -> HeaderInfo {
        HeaderInfo {
            originator: IeeeAddress::new(from),
            destination: IeeeAddress::new(1),
            protocol: DATAGRAM_PROTOCOL_ID,
            family: false,
            broadcast,
            ttl: 0,
            rssi: -60,
            correlation: 0,
            link_quality: 200,
            timestamp: 1,
        }
    }

    #[test]
    fn test_registration() {
        let mgr = manager();
        assert_eq!(mgr.mux.lowpan.stats().protocol_count, 1);
    }

    #[test]
    fn test_port_stripped_before_queueing() {
        let mgr = manager();
        let cid = mgr.open_server(32).unwrap();
        mgr.process_incoming(&[32, 1, 2, 3], &info(5, false));
        let got = mgr.receive(cid).unwrap();
        assert_eq!(got.payload, vec![1, 2, 3]);
        assert_eq!(got.info.originator, IeeeAddress::new(5));
    }

    #[test]
    fn test_server_precedence_over_input() {
        let mgr = manager();
        let server = mgr.open_server(32).unwrap();
        let input = mgr.open_input(IeeeAddress::new(5), 32);

        mgr.process_incoming(&[32, 9], &info(5, false));
        assert_eq!(mgr.receive(server).unwrap().payload, vec![9]);
        assert!(mgr
            .receive_timeout(input, Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_input_bound_to_remote() {
        let mgr = manager();
        let cid = mgr.open_input(IeeeAddress::new(5), 40);

        mgr.process_incoming(&[40, 1], &info(5, false));
        mgr.process_incoming(&[40, 2], &info(6, false)); // wrong remote, no connection
        assert_eq!(mgr.receive(cid).unwrap().payload, vec![1]);
        assert!(mgr
            .receive_timeout(cid, Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_second_server_rejected() {
        let mgr = manager();
        mgr.open_server(32).unwrap();
        assert_eq!(mgr.open_server(32), Err(ConnectError::PortInUse(32)));
    }

    #[test]
    fn test_server_cannot_send() {
        let mgr = manager();
        let cid = mgr.open_server(32).unwrap();
        assert!(matches!(
            mgr.send(cid, IeeeAddress::new(5), b"x"),
            Err(SendError::NotSendable(_))
        ));
    }

    #[test]
    fn test_send_on_closed_connection() {
        let mgr = manager();
        let cid = mgr.open_input(IeeeAddress::new(5), 32);
        mgr.close(cid);
        assert_eq!(mgr.send(cid, IeeeAddress::new(5), b"x"), Err(SendError::Closed));
        assert!(matches!(mgr.receive(cid), Err(RecvError::Closed)));
    }

    #[test]
    fn test_broadcast_connection_refcount() {
        let mgr = manager();
        let first = mgr.open_broadcast(60);
        let second = mgr.open_broadcast(60);
        assert_eq!(first, second);

        mgr.close(first);
        // Still open for the second holder.
        mgr.process_incoming(&[60, 7], &info(5, true));
        assert_eq!(mgr.receive(second).unwrap().payload, vec![7]);

        mgr.close(second);
        assert!(matches!(mgr.receive(second), Err(RecvError::Closed)));
    }

    #[test]
    fn test_queue_full_counted() {
        let transport = FrameTransport::new(Vec::new(), 3, 8);
        let config = LowpanConfig::default().with_connection_queue_depth(1);
        let lowpan = LowPan::new(config, transport);
        let mgr = DatagramManager::new(lowpan.clone());
        mgr.open_server(32).unwrap();

        mgr.process_incoming(&[32, 1], &info(5, false));
        mgr.process_incoming(&[32, 2], &info(5, false));
        assert_eq!(lowpan.stats().broadcasts_queue_full, 1);
    }

    #[test]
    fn test_empty_payload_ignored() {
        let mgr = manager();
        mgr.open_server(32).unwrap();
        mgr.process_incoming(&[], &info(5, false));
        // Nothing queued, nothing counted.
        assert_eq!(mgr.mux.lowpan.stats().broadcasts_queue_full, 0);
    }
}
