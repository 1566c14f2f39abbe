//! Error types for the mesh layer
//!
//! Only failures the caller can act on are errors. Expected lossy-network
//! events (duplicate broadcasts, expired TTLs, reassembly timeouts, full
//! queues) are silently counted in `LowpanStats` instead.

use crate::frame::IeeeAddress;
use thiserror::Error;

/// Failure to send a datagram or frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// A directly-addressed frame was transmitted but never acknowledged.
    #[error("no acknowledgement from {0}")]
    NoAck(IeeeAddress),

    /// The channel stayed busy for the duration of the transmit attempt.
    #[error("channel busy")]
    ChannelBusy,

    /// No interface is available to reach the destination.
    #[error("no route to {0}")]
    NoRoute(IeeeAddress),

    /// The destination address is not valid for sending.
    #[error("invalid destination address {0}")]
    InvalidDestination(IeeeAddress),

    /// The connection cannot be used for sending (server-role connections
    /// are receive-only).
    #[error("connection {0} cannot send")]
    NotSendable(String),

    /// The datagram exceeds what fragmentation can carry.
    #[error("datagram of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },

    /// The radio driver reported a transmit failure.
    #[error("transmit failed: {0}")]
    Device(String),

    /// The connection was closed or never opened.
    #[error("connection is closed")]
    Closed,
}

/// Failure to decode a wire header or statistics block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown dispatch byte {0:#04x}")]
    UnknownDispatch(u8),
}

/// Failure of a blocking receive on a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The connection was closed while (or before) waiting.
    #[error("connection closed")]
    Closed,
}

/// Failure to open a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// A server connection already owns this port.
    #[error("port {0} already has a server connection")]
    PortInUse(u8),
}

/// Failure of a radio driver's blocking receive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The device was shut down; the receive loop should exit.
    #[error("radio shut down")]
    Shutdown,

    /// A transient receive failure; the receive loop logs and continues.
    #[error("receive failed: {0}")]
    Io(String),
}
