//! Tunnel frame header
//!
//! Every frame exchanged with the peer gateway starts with a five byte
//! header serialized with bincode:
//!
//! ```text
//! +------+------------------+
//! | KIND |     SESSION      |
//! +------+------------------+
//! |  1   |  4 (LE u32)      |
//! +------+------------------+
//! ```
//!
//! The top bit of `SESSION` is set when the sender opened the session, so
//! both gateways can allocate ids independently without collisions.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the serialized header
pub const TUNNEL_HEADER_LEN: usize = 5;

/// Bit marking a session opened by the sender
const ORIGIN_BIT: u32 = 1 << 31;

/// Largest session id a gateway allocates
pub const MAX_SESSION_ID: u32 = ORIGIN_BIT - 1;

/// Type of a tunnel frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Relay payload
    Data = 0,
    /// Open a connection to the address in the payload
    New = 1,
    /// SOCKS5 reply for a `New` frame
    ConnectResult = 2,
    /// Tear the session down
    Close = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::New),
            2 => Ok(FrameKind::ConnectResult),
            3 => Ok(FrameKind::Close),
            _ => Err(GatewayError::Protocol(format!("unknown frame kind {}", value))),
        }
    }
}

/// Which gateway opened a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// Opened by a client of this gateway
    Local,
    /// Opened by the peer gateway
    Remote,
}

/// Session key as seen by this gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Opener of the session
    pub origin: Origin,
    /// Id allocated by the opener
    pub id: u32,
}

impl SessionKey {
    /// Session opened here
    pub fn local(id: u32) -> Self {
        SessionKey {
            origin: Origin::Local,
            id,
        }
    }

    /// Session opened by the peer
    pub fn remote(id: u32) -> Self {
        SessionKey {
            origin: Origin::Remote,
            id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Origin::Local => write!(f, "L{}", self.id),
            Origin::Remote => write!(f, "R{}", self.id),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    kind: u8,
    session: u32,
}

/// Decoded tunnel header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHeader {
    /// Frame type
    pub kind: FrameKind,
    /// Session the frame belongs to
    pub session: SessionKey,
}

impl TunnelHeader {
    /// Create a header
    pub fn new(kind: FrameKind, session: SessionKey) -> Self {
        TunnelHeader { kind, session }
    }

    /// Serialize for sending to the peer
    pub fn encode(&self) -> Result<Vec<u8>> {
        let session = match self.session.origin {
            Origin::Local => self.session.id | ORIGIN_BIT,
            Origin::Remote => self.session.id & MAX_SESSION_ID,
        };
        let wire = WireHeader {
            kind: self.kind as u8,
            session,
        };
        bincode::serialize(&wire)
            .map_err(|e| GatewayError::Protocol(format!("Failed to serialize header: {}", e)))
    }

    /// Deserialize a header received from the peer
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TUNNEL_HEADER_LEN {
            return Err(GatewayError::Protocol(format!(
                "tunnel header needs {} bytes, got {}",
                TUNNEL_HEADER_LEN,
                bytes.len()
            )));
        }
        let wire: WireHeader = bincode::deserialize(&bytes[..TUNNEL_HEADER_LEN])
            .map_err(|e| GatewayError::Protocol(format!("Failed to deserialize header: {}", e)))?;
        let id = wire.session & MAX_SESSION_ID;
        // The sender opened it, so from here it is remote.
        let session = if wire.session & ORIGIN_BIT != 0 {
            SessionKey::remote(id)
        } else {
            SessionKey::local(id)
        };
        Ok(TunnelHeader {
            kind: FrameKind::try_from(wire.kind)?,
            session,
        })
    }

    /// Deserialize a header this gateway built itself
    ///
    /// Used for frames the device gave back undelivered.
    pub fn decode_outbound(bytes: &[u8]) -> Result<Self> {
        let mut header = Self::decode(bytes)?;
        header.session.origin = match header.session.origin {
            Origin::Local => Origin::Remote,
            Origin::Remote => Origin::Local,
        };
        Ok(header)
    }
}
