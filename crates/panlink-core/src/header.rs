//! LowPan header wire codec
//!
//! Every frame payload starts with a dispatch byte followed by a variable
//! header. The low nibble selects the frame kind; two flag bits extend it:
//!
//! ```text
//! +----------+----------+------------+- - - - - - - - - - -+- - - - -+
//! | dispatch | protocol | originator | mesh: dest(8) ttl(1)| payload |
//! |   (1)    |   (1)    |    (8)     | bcast: + seq(2)     |         |
//! +----------+----------+------------+ frag: id(2) total(2)+- - - - -+
//!                                    |       offset(2)     |
//!                                    +- - - - - - - - - - -+
//! ```
//!
//! Kinds: `0x1` local (single hop, never forwarded), `0x2` mesh unicast,
//! `0x3` mesh broadcast. Flag `0x10` marks a fragment descriptor, `0x20`
//! marks the protocol byte as a protocol-*family* id. All multi-byte
//! fields are little-endian.

use crate::error::WireError;
use crate::frame::{IeeeAddress, RadioFrame};
use serde::{Deserialize, Serialize};

const KIND_MASK: u8 = 0x0F;
const KIND_LOCAL: u8 = 0x01;
const KIND_MESH: u8 = 0x02;
const KIND_MESH_BROADCAST: u8 = 0x03;

/// Fragment descriptor present.
pub const FLAG_FRAGMENT: u8 = 0x10;
/// Protocol byte is a family id, not a native protocol id.
pub const FLAG_FAMILY: u8 = 0x20;

/// How a frame travels: local single-hop, mesh unicast, or mesh broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Local,
    Mesh,
    MeshBroadcast,
}

/// Position of one fragment within its datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentInfo {
    /// Datagram id, shared by all fragments of one datagram.
    pub datagram_id: u16,
    /// Total length of the reassembled datagram in bytes.
    pub total_len: u16,
    /// Byte offset of this fragment's payload within the datagram.
    pub offset: u16,
}

/// Decoded (or to-be-encoded) LowPan header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowpanHeader {
    pub kind: FrameKind,
    /// The protocol byte names a family rather than a native protocol.
    pub family: bool,
    pub protocol: u8,
    /// The node that originated the datagram, not the last hop.
    pub originator: IeeeAddress,
    /// Final destination; `IeeeAddress::NONE` for local frames, where the
    /// MAC destination is authoritative.
    pub destination: IeeeAddress,
    /// Remaining hop budget; 0 for local frames.
    pub ttl: u8,
    /// Broadcast sequence number, mesh broadcasts only.
    pub sequence: Option<u16>,
    pub fragment: Option<FragmentInfo>,
}

impl LowpanHeader {
    /// Single-hop frame; the MAC destination decides who receives it.
    pub fn local(protocol: u8, originator: IeeeAddress) -> Self {
        Self {
            kind: FrameKind::Local,
            family: false,
            protocol,
            originator,
            destination: IeeeAddress::NONE,
            ttl: 0,
            sequence: None,
            fragment: None,
        }
    }

    /// Mesh unicast toward `destination` with `ttl` hops of budget.
    pub fn mesh(protocol: u8, originator: IeeeAddress, destination: IeeeAddress, ttl: u8) -> Self {
        Self {
            kind: FrameKind::Mesh,
            family: false,
            protocol,
            originator,
            destination,
            ttl,
            sequence: None,
            fragment: None,
        }
    }

    /// Mesh broadcast carrying the originator's `sequence` number.
    pub fn mesh_broadcast(protocol: u8, originator: IeeeAddress, ttl: u8, sequence: u16) -> Self {
        Self {
            kind: FrameKind::MeshBroadcast,
            family: false,
            protocol,
            originator,
            destination: IeeeAddress::BROADCAST,
            ttl,
            sequence: Some(sequence),
            fragment: None,
        }
    }

    pub fn with_family(mut self) -> Self {
        self.family = true;
        self
    }

    pub fn with_fragment(mut self, fragment: FragmentInfo) -> Self {
        self.fragment = Some(fragment);
        self
    }

    /// Encoded header size in bytes for this field combination.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + 1 + 8; // dispatch + protocol + originator
        match self.kind {
            FrameKind::Local => {}
            FrameKind::Mesh => len += 8 + 1,
            FrameKind::MeshBroadcast => len += 8 + 1 + 2,
        }
        if self.fragment.is_some() {
            len += 6;
        }
        len
    }

    /// Serialize the header followed by `payload` into one frame payload.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() + payload.len());
        let mut dispatch = match self.kind {
            FrameKind::Local => KIND_LOCAL,
            FrameKind::Mesh => KIND_MESH,
            FrameKind::MeshBroadcast => KIND_MESH_BROADCAST,
        };
        if self.fragment.is_some() {
            dispatch |= FLAG_FRAGMENT;
        }
        if self.family {
            dispatch |= FLAG_FAMILY;
        }
        buf.push(dispatch);
        buf.push(self.protocol);
        buf.extend_from_slice(&self.originator.raw().to_le_bytes());
        if self.kind != FrameKind::Local {
            buf.extend_from_slice(&self.destination.raw().to_le_bytes());
            buf.push(self.ttl);
        }
        if self.kind == FrameKind::MeshBroadcast {
            buf.extend_from_slice(&self.sequence.unwrap_or(0).to_le_bytes());
        }
        if let Some(frag) = &self.fragment {
            buf.extend_from_slice(&frag.datagram_id.to_le_bytes());
            buf.extend_from_slice(&frag.total_len.to_le_bytes());
            buf.extend_from_slice(&frag.offset.to_le_bytes());
        }
        buf.extend_from_slice(payload);
        buf
    }

    /// Parse a frame payload; returns the header and the offset where the
    /// protocol payload begins.
    pub fn decode(data: &[u8]) -> Result<(LowpanHeader, usize), WireError> {
        let mut cur = Cursor::new(data);
        let dispatch = cur.u8()?;
        let kind = match dispatch & KIND_MASK {
            KIND_LOCAL => FrameKind::Local,
            KIND_MESH => FrameKind::Mesh,
            KIND_MESH_BROADCAST => FrameKind::MeshBroadcast,
            _ => return Err(WireError::UnknownDispatch(dispatch)),
        };
        let protocol = cur.u8()?;
        let originator = IeeeAddress::new(cur.u64()?);
        let (destination, ttl) = if kind == FrameKind::Local {
            (IeeeAddress::NONE, 0)
        } else {
            (IeeeAddress::new(cur.u64()?), cur.u8()?)
        };
        let sequence = if kind == FrameKind::MeshBroadcast {
            Some(cur.u16()?)
        } else {
            None
        };
        let fragment = if dispatch & FLAG_FRAGMENT != 0 {
            Some(FragmentInfo {
                datagram_id: cur.u16()?,
                total_len: cur.u16()?,
                offset: cur.u16()?,
            })
        } else {
            None
        };
        let header = LowpanHeader {
            kind,
            family: dispatch & FLAG_FAMILY != 0,
            protocol,
            originator,
            destination,
            ttl,
            sequence,
            fragment,
        };
        Ok((header, cur.pos))
    }
}

/// Delivery metadata handed to protocol handlers alongside the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderInfo {
    /// The node that originated the datagram.
    pub originator: IeeeAddress,
    /// Final destination (us, or broadcast).
    pub destination: IeeeAddress,
    pub protocol: u8,
    /// The protocol id is a family id.
    pub family: bool,
    /// Frame arrived as some form of broadcast.
    pub broadcast: bool,
    /// Remaining TTL when the frame arrived; 0 for local frames.
    pub ttl: u8,
    pub rssi: i8,
    pub correlation: u8,
    pub link_quality: u8,
    /// Capture timestamp, ms since the Unix epoch.
    pub timestamp: u64,
}

impl HeaderInfo {
    pub(crate) fn from_frame(header: &LowpanHeader, frame: &RadioFrame) -> Self {
        // Mesh unicasts may ride MAC broadcasts while flooding; what counts
        // is the datagram's final destination, not the hop's.
        let broadcast = match header.kind {
            FrameKind::MeshBroadcast => true,
            FrameKind::Mesh => header.destination.is_broadcast(),
            FrameKind::Local => frame.destination.is_broadcast(),
        };
        HeaderInfo {
            originator: header.originator,
            destination: if header.kind == FrameKind::Local {
                frame.destination
            } else {
                header.destination
            },
            protocol: header.protocol,
            family: header.family,
            broadcast,
            ttl: header.ttl,
            rssi: frame.rssi,
            correlation: frame.correlation,
            link_quality: frame.link_quality,
            timestamp: frame.timestamp,
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated {
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}
