//! Write-side handshake of the half-duplex modem
//!
//! One transmission may be outstanding at a time. It moves through
//! `Ready -> AwaitingAck -> AwaitingDelivery -> Ready`, and the packet being
//! sent is held here until the modem confirms delivery.

use super::parser::TAG_RECEIVED;
use crate::packet::Packet;
use std::fmt;

/// Command echoed by the modem when it acknowledges a transmission
pub const TRANSMIT_COMMAND: &str = "HHTXD";

/// Write state of a modem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// No transmission outstanding
    Ready,
    /// Command written, waiting for `$MMOKY`
    AwaitingAck,
    /// Acknowledged, waiting for `$MMTDN`
    AwaitingDelivery,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteState::Ready => write!(f, "ready"),
            WriteState::AwaitingAck => write!(f, "awaiting-ack"),
            WriteState::AwaitingDelivery => write!(f, "awaiting-delivery"),
        }
    }
}

/// Handshake state plus the packet in flight
#[derive(Debug)]
pub struct Handshake {
    state: WriteState,
    in_flight: Option<Packet>,
}

impl Default for Handshake {
    fn default() -> Self {
        Handshake {
            state: WriteState::Ready,
            in_flight: None,
        }
    }
}

impl Handshake {
    /// Current state
    pub fn state(&self) -> WriteState {
        self.state
    }

    /// Whether a new transmission may start
    pub fn is_ready(&self) -> bool {
        self.state == WriteState::Ready
    }

    /// Start a transmission; hands the packet back untouched if busy
    pub fn begin(&mut self, packet: Packet) -> Result<(), Packet> {
        if self.state != WriteState::Ready {
            return Err(packet);
        }
        self.state = WriteState::AwaitingAck;
        self.in_flight = Some(packet);
        Ok(())
    }

    /// Handle `$MMOKY`; returns whether the state advanced
    pub fn on_ack(&mut self, command: &str) -> bool {
        if self.state != WriteState::AwaitingAck || command.as_bytes() == TAG_RECEIVED {
            return false;
        }
        self.state = WriteState::AwaitingDelivery;
        true
    }

    /// Handle `$MMTDN`; returns the delivered packet
    pub fn on_delivered(&mut self) -> Option<Packet> {
        if self.state != WriteState::AwaitingDelivery {
            return None;
        }
        self.state = WriteState::Ready;
        self.in_flight.take()
    }

    /// Handle `$MMERR`; returns the rejected packet when it was ours
    pub fn on_error(&mut self, command: &str) -> Option<Packet> {
        if self.state != WriteState::AwaitingAck || command != TRANSMIT_COMMAND {
            return None;
        }
        self.abort()
    }

    /// Give up on the transmission in flight
    pub fn abort(&mut self) -> Option<Packet> {
        self.state = WriteState::Ready;
        self.in_flight.take()
    }
}
