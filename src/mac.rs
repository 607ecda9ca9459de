//! MAC framing between the relay and the modem
//!
//! Every tunnel frame carries a seven byte header on the modem link:
//!
//! ```text
//! +-----+-----+----+-----------+
//! | SRC | DST | UP |    CRC    |
//! +-----+-----+----+-----------+
//! |  1  |  1  | 1  | 4 (BE u32) |
//! +-----+-----+----+-----------+
//! ```
//!
//! The checksum goes through an [`Integrity`] implementation so a real
//! check can replace the default [`NoChecksum`] without touching the layers
//! around it.

use crate::error::{GatewayError, Result};
use crate::packet::{Layer, Packet};
use tracing::debug;

/// Length of the MAC header in bytes
pub const MAC_HEADER_LEN: usize = 7;

/// Broadcast destination address
pub const MAC_BROADCAST: u8 = 0;

/// Checksum over a frame payload
pub trait Integrity: Send {
    /// Compute the checksum of `payload`
    fn checksum(&self, payload: &[u8]) -> u32;

    /// Whether `crc` matches `payload`
    fn verify(&self, payload: &[u8], crc: u32) -> bool {
        self.checksum(payload) == crc
    }
}

/// Integrity check that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChecksum;

impl Integrity for NoChecksum {
    fn checksum(&self, _payload: &[u8]) -> u32 {
        0
    }

    fn verify(&self, _payload: &[u8], _crc: u32) -> bool {
        true
    }
}

/// Decoded MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacHeader {
    /// Sender address
    pub src: u8,
    /// Receiver address
    pub dst: u8,
    /// Layer the payload belongs to
    pub up: u8,
    /// Payload checksum
    pub crc: u32,
}

impl MacHeader {
    fn encode(&self) -> [u8; MAC_HEADER_LEN] {
        let crc = self.crc.to_be_bytes();
        [self.src, self.dst, self.up, crc[0], crc[1], crc[2], crc[3]]
    }

    fn decode(bytes: &[u8]) -> Self {
        MacHeader {
            src: bytes[0],
            dst: bytes[1],
            up: bytes[2],
            crc: u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        }
    }
}

/// MAC layer state
pub struct MacLayer {
    address: u8,
    integrity: Box<dyn Integrity>,
}

impl std::fmt::Debug for MacLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacLayer")
            .field("address", &self.address)
            .finish()
    }
}

impl MacLayer {
    /// Create a MAC layer sending from `address` with the given integrity check
    pub fn new(address: u8, integrity: Box<dyn Integrity>) -> Self {
        MacLayer { address, integrity }
    }

    /// Local address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Frame an outbound packet
    pub fn output(&self, packet: &mut Packet) -> Result<()> {
        let header = MacHeader {
            src: self.address,
            dst: MAC_BROADCAST,
            up: packet.up() as u8,
            crc: self.integrity.checksum(packet.payload()),
        };
        packet.push_header(&header.encode())?;
        packet.set_layers(Layer::Mac, Layer::App);
        Ok(())
    }

    /// Strip and verify the header of an inbound packet
    pub fn input(&self, packet: &mut Packet) -> Result<MacHeader> {
        let header = MacHeader::decode(packet.pull_header(MAC_HEADER_LEN)?);
        if !self.integrity.verify(packet.payload(), header.crc) {
            return Err(GatewayError::Protocol(format!(
                "checksum mismatch from {}",
                header.src
            )));
        }
        let up = Layer::from_id(header.up).ok_or_else(|| {
            GatewayError::Protocol(format!("unknown upper layer {}", header.up))
        })?;
        debug!("MAC frame from {} to {} for {:?}", header.src, header.dst, up);
        packet.set_layers(up, Layer::Mac);
        Ok(header)
    }
}
