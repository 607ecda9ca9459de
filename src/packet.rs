//! Packet buffers moved between protocol layers
//!
//! A [`Packet`] owns its bytes and keeps a cursor (`head`) into them. The
//! bytes in front of the cursor are reserved room that lower layers fill with
//! their headers on the way down; on the way up each layer strips its header
//! by advancing the cursor. All cursor moves are bounds-checked.
//!
//! Packets are never cloned between layers. Handing a packet to the next
//! layer moves it, so a packet sits in at most one queue at a time.

use crate::device::DeviceId;
use crate::relay::ConnId;
use bytes::BytesMut;
use thiserror::Error;

/// Errors raised by header manipulation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Not enough reserved room in front of the payload
    #[error("no headroom: need {needed} bytes, {available} reserved")]
    NoHeadroom {
        /// Bytes the header needs
        needed: usize,
        /// Bytes still reserved
        available: usize,
    },

    /// Payload shorter than the header being stripped
    #[error("truncated packet: need {needed} bytes, {available} present")]
    Truncated {
        /// Bytes the header needs
        needed: usize,
        /// Bytes in the payload
        available: usize,
    },
}

/// Protocol layer tags carried on a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layer {
    /// Application relay
    App = 0,
    /// MAC framing
    Mac = 1,
}

impl Layer {
    /// Map a wire identifier back to a layer
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Layer::App),
            1 => Some(Layer::Mac),
            _ => None,
        }
    }
}

/// Who consumes a packet on its way out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Written to a local TCP connection
    Connection(ConnId),
    /// Written to a modem device
    Device(DeviceId),
}

/// An owned byte buffer with reserved header room
#[derive(Debug)]
pub struct Packet {
    buf: BytesMut,
    head: usize,
    refs: u32,
    up: Layer,
    down: Layer,
    owner: Option<Owner>,
}

impl Packet {
    /// Create an outbound packet with `room` bytes reserved for headers
    pub fn with_headroom(room: usize, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(room + payload.len());
        buf.resize(room, 0);
        buf.extend_from_slice(payload);
        Packet {
            buf,
            head: room,
            refs: 1,
            up: Layer::App,
            down: Layer::App,
            owner: None,
        }
    }

    /// Create an inbound packet from bytes received off a link
    pub fn inbound(payload: &[u8]) -> Self {
        let mut packet = Self::with_headroom(0, payload);
        packet.down = Layer::Mac;
        packet
    }

    /// Bytes from the cursor to the end
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    /// Length of the payload
    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserved bytes left in front of the payload
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Prepend `header` into the reserved room
    pub fn push_header(&mut self, header: &[u8]) -> Result<(), PacketError> {
        if header.len() > self.head {
            return Err(PacketError::NoHeadroom {
                needed: header.len(),
                available: self.head,
            });
        }
        self.head -= header.len();
        self.buf[self.head..self.head + header.len()].copy_from_slice(header);
        Ok(())
    }

    /// Strip `n` header bytes from the front and return them
    pub fn pull_header(&mut self, n: usize) -> Result<&[u8], PacketError> {
        if n > self.len() {
            return Err(PacketError::Truncated {
                needed: n,
                available: self.len(),
            });
        }
        let start = self.head;
        self.head += n;
        Ok(&self.buf[start..start + n])
    }

    /// Consume `n` payload bytes that were already written out
    pub fn advance(&mut self, n: usize) {
        self.head += n.min(self.len());
    }

    /// Reference count; always 1 as packets are never shared
    pub fn ref_count(&self) -> u32 {
        self.refs
    }

    /// Layer that should consume the packet next on the way up
    pub fn up(&self) -> Layer {
        self.up
    }

    /// Layer that produced the packet on the way down
    pub fn down(&self) -> Layer {
        self.down
    }

    /// Retag the packet
    pub fn set_layers(&mut self, up: Layer, down: Layer) {
        self.up = up;
        self.down = down;
    }

    /// Consumer of the packet, if assigned
    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }

    /// Assign the consumer; replaces any previous owner
    pub fn set_owner(&mut self, owner: Owner) {
        self.owner = Some(owner);
    }
}
