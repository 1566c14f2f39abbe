//! Datagram connections and their inbound queues
//!
//! A connection is identified by (remote address, port, role). Server
//! connections receive from any originator on their port; input
//! connections receive only from their bound remote; broadcast connections
//! send broadcasts and are reference-counted so several opens of the same
//! port share one identity. Each connection owns a bounded FIFO of inbound
//! datagrams with a blocking `receive`; closing the connection wakes every
//! blocked receiver.

use crate::error::RecvError;
use crate::frame::IeeeAddress;
use crate::header::HeaderInfo;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Receives from any originator on the port; cannot send.
    Server,
    /// Bound to one remote; sends and receives.
    Input,
    /// Sends broadcasts; receives broadcasts on the port.
    Broadcast,
}

/// Identity of one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    /// Bound remote; `IeeeAddress::NONE` for servers,
    /// `IeeeAddress::BROADCAST` for broadcast connections.
    pub remote: IeeeAddress,
    pub port: u8,
    pub role: Role,
}

impl ConnectionId {
    pub fn server(port: u8) -> Self {
        Self {
            remote: IeeeAddress::NONE,
            port,
            role: Role::Server,
        }
    }

    pub fn input(remote: IeeeAddress, port: u8) -> Self {
        Self {
            remote,
            port,
            role: Role::Input,
        }
    }

    pub fn broadcast(port: u8) -> Self {
        Self {
            remote: IeeeAddress::BROADCAST,
            port,
            role: Role::Broadcast,
        }
    }

    /// Server connections are receive-only.
    pub fn can_send(&self) -> bool {
        self.role != Role::Server
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::Server => write!(f, "server:{}", self.port),
            Role::Input => write!(f, "{}:{}", self.remote, self.port),
            Role::Broadcast => write!(f, "broadcast:{}", self.port),
        }
    }
}

/// One received datagram, payload plus delivery metadata.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub info: HeaderInfo,
}

#[derive(Debug)]
struct QueueInner {
    queue: VecDeque<Datagram>,
    closed: bool,
    refcount: u32,
}

/// Why an enqueue did or did not take the datagram. Only `Full` is a
/// genuine overflow worth counting; a datagram racing a close is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Queued,
    Full,
    Closed,
}

/// Shared state of one connection: the bounded inbound queue.
#[derive(Debug)]
pub struct ConnectionState {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity: usize,
}

impl ConnectionState {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                closed: false,
                refcount: 1,
            }),
            ready: Condvar::new(),
            capacity,
        })
    }

    /// Enqueue an inbound datagram. The newest datagram is dropped when the
    /// queue is full or the connection is closed.
    pub(crate) fn enqueue(&self, datagram: Datagram) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return EnqueueOutcome::Closed;
        }
        if inner.queue.len() >= self.capacity {
            return EnqueueOutcome::Full;
        }
        inner.queue.push_back(datagram);
        self.ready.notify_one();
        EnqueueOutcome::Queued
    }

    /// Block until a datagram arrives or the connection is closed.
    pub fn receive(&self) -> Result<Datagram, RecvError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(datagram) = inner.queue.pop_front() {
                return Ok(datagram);
            }
            if inner.closed {
                return Err(RecvError::Closed);
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Like `receive` but gives up after `timeout`, returning `Ok(None)`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Datagram>, RecvError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(datagram) = inner.queue.pop_front() {
                return Ok(Some(datagram));
            }
            if inner.closed {
                return Err(RecvError::Closed);
            }
            if self.ready.wait_for(&mut inner, timeout).timed_out() {
                return Ok(inner.queue.pop_front());
            }
        }
    }

    /// Non-blocking poll.
    pub fn try_receive(&self) -> Result<Option<Datagram>, RecvError> {
        let mut inner = self.inner.lock();
        match inner.queue.pop_front() {
            Some(datagram) => Ok(Some(datagram)),
            None if inner.closed => Err(RecvError::Closed),
            None => Ok(None),
        }
    }

    /// Close the connection and wake every blocked receiver.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.queue.clear();
        self.ready.notify_all();
    }

    pub(crate) fn add_ref(&self) {
        self.inner.lock().refcount += 1;
    }

    /// Drop one reference; returns how many remain.
    pub(crate) fn release_ref(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.refcount = inner.refcount.saturating_sub(1);
        inner.refcount
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
