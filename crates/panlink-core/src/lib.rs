//! # panlink-core
//!
//! An 802.15.4 LowPan mesh sublayer: fragmentation and reassembly,
//! TTL-bounded mesh forwarding, broadcast duplicate suppression, and
//! port-based datagram connections, layered over pluggable radio drivers.
//!
//! ## Overview
//!
//! - **Frame transport**: one blocking receive thread per radio interface,
//!   a learned address-to-interface table, broadcast fallback for unknown
//!   destinations, and asynchronous link-quality listener fan-out
//! - **Mesh core**: LowPan header codec, fragmentation of datagrams that
//!   exceed one frame, reassembly with idle timeout, per-originator
//!   broadcast sequence dedup, and forwarding that spends one TTL per hop
//! - **Protocol managers**: the native datagram protocol and a foreign
//!   bridge family, both multiplexing bounded blocking connections by port
//! - **Statistics**: a fixed 104-byte counter block for remote diagnostics
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     Application                        │
//! │        open_server / open_input / open_broadcast       │
//! └───────────────────────────┬────────────────────────────┘
//!                             ▼
//! ┌────────────────────────────────────────────────────────┐
//! │        DatagramManager          BridgeManager          │
//! │   (protocol 105, routed)   (family 63, single hop)     │
//! └───────────────────────────┬────────────────────────────┘
//!                             ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                        LowPan                          │
//! │   fragment / reassemble / dedup / forward / count      │
//! └───────────────────────────┬────────────────────────────┘
//!                             ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                    FrameTransport                      │
//! │        RadioDevice trait, one rx thread per radio      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use panlink_core::{LowpanConfig, IeeeAddress};
//! use panlink_core::sim::{SimNetwork, SimNode};
//!
//! // Two nodes on an in-memory network; real deployments pass their own
//! // RadioDevice implementations to FrameTransport instead.
//! let net = SimNetwork::new();
//! let alice = SimNode::join(&net, 0x14, LowpanConfig::default());
//! let bob = SimNode::join(&net, 0x15, LowpanConfig::default());
//!
//! let server = bob.datagrams.open_server(5).unwrap();
//! let client = alice.datagrams.open_input(IeeeAddress::new(0x15), 5);
//! alice.datagrams.send(client, IeeeAddress::new(0x15), b"hello").unwrap();
//! let got = bob.datagrams.receive(server).unwrap();
//! assert_eq!(got.payload, b"hello");
//! ```

pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod header;
pub mod lowpan;
pub mod manager;
pub mod reassembly;
pub mod sim;
pub mod stats;
pub mod transport;

pub use config::LowpanConfig;
pub use connection::{ConnectionId, Datagram, Role};
pub use error::{ConnectError, RadioError, RecvError, SendError, WireError};
pub use frame::{IeeeAddress, RadioFrame, MAX_MAC_PAYLOAD};
pub use header::{FragmentInfo, FrameKind, HeaderInfo, LowpanHeader};
pub use lowpan::{LowPan, ProtocolHandler};
pub use manager::{BridgeManager, DatagramManager, BRIDGE_FAMILY_ID, DATAGRAM_PROTOCOL_ID};
pub use stats::{LowpanStats, STATS_WIRE_SIZE};
pub use transport::{
    FrameTransport, InboundSink, PacketQualityListener, RadioDevice, TxStatus,
};
