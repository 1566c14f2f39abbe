//! Frame transport over one or more radio interfaces
//!
//! `FrameTransport` owns the node's radio devices and hides interface
//! choice from the mesh layer above it:
//!
//! ```text
//!   mesh layer (InboundSink)
//!        ^            |
//!        | frames     | send_to / broadcast
//!   +----+------------v----+
//!   |    FrameTransport    |   address -> interface table,
//!   +--+----------------+--+   learned from received frames
//!      |                |
//!   rx thread 0     rx thread 1     one blocking receive thread
//!   RadioDevice     RadioDevice     per interface
//! ```
//!
//! A unicast to an address the table knows goes out that interface and
//! maps NoAck/ChannelBusy to errors. An unknown or broadcast destination
//! goes out every interface, stamping each interface's own source address;
//! per-interface failures are swallowed when more than one interface
//! exists, and a unicast fallback stops after its first success.
//!
//! Link-quality listeners are decoupled from the receive threads by a
//! bounded channel drained by a dedicated fan-out thread; when the channel
//! is full the newest observation is dropped.

use crate::error::{RadioError, SendError};
use crate::frame::{IeeeAddress, RadioFrame};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// Result of one transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Frame sent (and acknowledged, where the MAC acknowledges).
    Success,
    /// Sent but never acknowledged.
    NoAck,
    /// The channel stayed busy; nothing was sent.
    ChannelBusy,
    /// Driver-level failure.
    Failed,
}

/// One physical radio interface. Implemented by drivers (or `sim::SimRadio`
/// for tests); the MAC/PHY internals stay behind this seam.
pub trait RadioDevice: Send + Sync {
    /// The interface's own extended address.
    fn own_address(&self) -> IeeeAddress;

    /// Transmit one frame. Blocks for the duration of the attempt.
    fn transmit(&self, frame: &RadioFrame) -> TxStatus;

    /// Block until a frame addressed to this interface (or broadcast)
    /// arrives. Returns `RadioError::Shutdown` to end the receive loop.
    fn receive_blocking(&self) -> Result<RadioFrame, RadioError>;

    /// Unblock any pending `receive_blocking` and stop the device.
    fn shutdown(&self) {}
}

/// Observer of per-frame signal quality, fed asynchronously.
pub trait PacketQualityListener: Send + Sync {
    fn notify_packet(
        &self,
        source: IeeeAddress,
        destination: IeeeAddress,
        rssi: i8,
        correlation: u8,
        link_quality: u8,
        length: usize,
    );
}

/// Consumer of received frames; the mesh layer implements this.
pub trait InboundSink: Send + Sync {
    fn receive(&self, frame: RadioFrame);
}

/// The node's radio interfaces plus the learned address table.
pub struct FrameTransport {
    devices: Vec<Arc<dyn RadioDevice>>,
    /// Which interface last heard from an address. Last heard wins.
    routes: DashMap<IeeeAddress, usize>,
    pan_id: u16,
    listeners: Mutex<Vec<Arc<dyn PacketQualityListener>>>,
    quality_tx: Mutex<Option<Sender<RadioFrame>>>,
    quality_rx: Mutex<Option<Receiver<RadioFrame>>>,
    running: AtomicBool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FrameTransport {
    pub fn new(devices: Vec<Arc<dyn RadioDevice>>, pan_id: u16, quality_queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = bounded(quality_queue_depth.max(1));
        Arc::new(Self {
            devices,
            routes: DashMap::new(),
            pan_id,
            listeners: Mutex::new(Vec::new()),
            quality_tx: Mutex::new(Some(tx)),
            quality_rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Addresses of all local interfaces.
    pub fn addresses(&self) -> Vec<IeeeAddress> {
        self.devices.iter().map(|d| d.own_address()).collect()
    }

    /// Address of the first interface, the node's identity on the mesh.
    pub fn primary_address(&self) -> IeeeAddress {
        self.devices
            .first()
            .map(|d| d.own_address())
            .unwrap_or(IeeeAddress::NONE)
    }

    pub fn is_local(&self, addr: IeeeAddress) -> bool {
        self.devices.iter().any(|d| d.own_address() == addr)
    }

    /// Whether some interface has heard from `addr`.
    pub fn knows(&self, addr: IeeeAddress) -> bool {
        self.routes.contains_key(&addr)
    }

    /// Send one frame to `dest`. A destination the address table knows goes
    /// out that interface; anything else falls back to `broadcast`.
    pub fn send_to(&self, frame: &mut RadioFrame, dest: IeeeAddress) -> Result<(), SendError> {
        if self.devices.is_empty() {
            return Err(SendError::NoRoute(dest));
        }
        frame.destination = dest;
        frame.pan_id = self.pan_id;

        let known = if dest.is_broadcast() {
            None
        } else {
            self.routes.get(&dest).map(|entry| *entry.value())
        };
        match known {
            Some(idx) => {
                let device = &self.devices[idx];
                frame.source = device.own_address();
                match device.transmit(frame) {
                    TxStatus::Success => {
                        self.offer_quality(frame);
                        Ok(())
                    }
                    TxStatus::NoAck => Err(SendError::NoAck(dest)),
                    TxStatus::ChannelBusy => Err(SendError::ChannelBusy),
                    TxStatus::Failed => Err(SendError::Device(format!(
                        "interface {} to {dest}",
                        device.own_address()
                    ))),
                }
            }
            None => self.broadcast(frame),
        }
    }

    /// Send one frame out every interface. A unicast fallback (non-broadcast
    /// MAC destination) stops after the first interface that succeeds.
    pub fn broadcast(&self, frame: &mut RadioFrame) -> Result<(), SendError> {
        if self.devices.is_empty() {
            return Err(SendError::NoRoute(frame.destination));
        }
        frame.pan_id = self.pan_id;
        let single = self.devices.len() == 1;
        for device in &self.devices {
            frame.source = device.own_address();
            match device.transmit(frame) {
                TxStatus::Success => {
                    self.offer_quality(frame);
                    if !frame.destination.is_broadcast() {
                        return Ok(());
                    }
                }
                TxStatus::ChannelBusy if single => return Err(SendError::ChannelBusy),
                status => {
                    trace!(?status, source = %frame.source, "broadcast transmit failed on one interface");
                }
            }
        }
        Ok(())
    }

    /// Spawn one receive thread per interface, feeding `sink`. Frames also
    /// refresh the address table before delivery, so replies flow back out
    /// the interface that last heard the peer.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn InboundSink>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock();
        for (idx, device) in self.devices.iter().enumerate() {
            let transport = Arc::clone(self);
            let device = Arc::clone(device);
            let sink = Arc::clone(&sink);
            handles.push(thread::spawn(move || loop {
                match device.receive_blocking() {
                    Ok(frame) => {
                        transport.routes.insert(frame.source, idx);
                        transport.offer_quality(&frame);
                        sink.receive(frame);
                    }
                    Err(RadioError::Shutdown) => {
                        debug!(interface = idx, "receive loop stopped");
                        break;
                    }
                    Err(RadioError::Io(msg)) => {
                        warn!(interface = idx, %msg, "receive failed");
                    }
                }
            }));
        }
    }

    /// Stop the receive loops and the quality fan-out, joining the threads.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for device in &self.devices {
            device.shutdown();
        }
        // Dropping the sender ends the fan-out thread.
        self.quality_tx.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Register a signal-quality observer. The fan-out thread starts with
    /// the first listener.
    pub fn add_quality_listener(self: &Arc<Self>, listener: Arc<dyn PacketQualityListener>) {
        self.listeners.lock().push(listener);
        if let Some(rx) = self.quality_rx.lock().take() {
            let transport = Arc::clone(self);
            self.handles.lock().push(thread::spawn(move || {
                for frame in rx.iter() {
                    let listeners = transport.listeners.lock().clone();
                    for listener in listeners {
                        listener.notify_packet(
                            frame.source,
                            frame.destination,
                            frame.rssi,
                            frame.correlation,
                            frame.link_quality,
                            frame.payload_len(),
                        );
                    }
                }
            }));
        }
    }

    pub fn remove_quality_listener(&self, listener: &Arc<dyn PacketQualityListener>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn offer_quality(&self, frame: &RadioFrame) {
        if self.listeners.lock().is_empty() {
            return;
        }
        if let Some(tx) = self.quality_tx.lock().as_ref() {
            // Full queue drops the newest observation.
            let _ = tx.try_send(frame.clone());
        }
    }
}

impl std::fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTransport")
            .field("interfaces", &self.devices.len())
            .field("routes", &self.routes.len())
            .field("pan_id", &self.pan_id)
            .finish()
    }
}
