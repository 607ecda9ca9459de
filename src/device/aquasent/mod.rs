//! AquaSent acoustic modem driver
//!
//! Outbound frames are sent as `$HHTXD,0,0,0,<HEX>\r\n`. The modem answers
//! with `$MMOKY` once it accepted the command and `$MMTDN` once the frame
//! was delivered; only then may the next frame be sent. Inbound frames
//! arrive as `$MMRXD` lines.

pub mod handshake;
pub mod hex;
pub mod parser;

pub use handshake::{Handshake, WriteState, TRANSMIT_COMMAND};
pub use parser::{FrameParser, ModemFrame, ParseError};

use super::serial::SerialPort;
use super::{Device, DeviceDriver, DriverEvent, NetIdentity};
use crate::config::ModemConfig;
use crate::error::{GatewayError, Result};
use crate::helper::{duration_from_millis, modem_line_capacity};
use crate::packet::Packet;
use bytes::BytesMut;
use tracing::{debug, info, warn};

/// Prefix of the transmit command
pub const TRANSMIT_PREFIX: &[u8] = b"$HHTXD,0,0,0,";

/// Terminator of every modem command
pub const LINE_END: &[u8] = b"\r\n";

/// Driver state for one AquaSent modem
#[derive(Debug)]
pub struct Aquasent {
    parser: FrameParser,
    handshake: Handshake,
}

impl Aquasent {
    /// Create a driver for a modem with the given MTU
    pub fn new(mtu: usize) -> Self {
        Aquasent {
            parser: FrameParser::new(modem_line_capacity(mtu)),
            handshake: Handshake::default(),
        }
    }

    /// Current write state
    pub fn write_state(&self) -> WriteState {
        self.handshake.state()
    }

    /// Open the serial port named in `config` and wrap it as a device
    pub fn open(config: &ModemConfig) -> Result<Device> {
        let port = SerialPort::open(&config.aquasent_port, config.aquasent_baud).map_err(|e| {
            GatewayError::Device(format!(
                "Failed to open {} at {} baud: {}",
                config.aquasent_port.display(),
                config.aquasent_baud,
                e
            ))
        })?;
        info!(
            "Opened aquasent modem on {} at {} baud",
            config.aquasent_port.display(),
            config.aquasent_baud
        );

        Ok(Device::new(
            config.aquasent_name,
            Box::new(port),
            Box::new(Aquasent::new(config.aquasent_mtu)),
            NetIdentity {
                ip: config.aquasent_ip_addr,
                netmask: config.aquasent_netmask,
                gateway: config.aquasent_gateway,
                mac: config.aquasent_mac_addr,
            },
            config.aquasent_mtu,
            duration_from_millis(config.aquasent_handshake_timeout_ms),
        ))
    }

    fn handle(&mut self, frame: ModemFrame, events: &mut Vec<DriverEvent>) {
        match frame {
            ModemFrame::Received { src, dst, payload } => {
                debug!("Received {} bytes from modem {} to {}", payload.len(), src, dst);
                events.push(DriverEvent::Frame(Packet::inbound(&payload)));
            }
            ModemFrame::Ack { command, .. } => {
                if self.handshake.on_ack(&command) {
                    debug!("Modem acknowledged {}", command);
                }
            }
            ModemFrame::Delivered { result, packet } => match self.handshake.on_delivered() {
                Some(delivered) => {
                    debug!("Modem delivered packet {} (result {})", packet, result);
                    events.push(DriverEvent::Delivered(delivered));
                }
                None => debug!(
                    "Ignoring delivery notification in state {}",
                    self.handshake.state()
                ),
            },
            ModemFrame::Error { command, code } => {
                warn!("Modem reported error {} for {}", code, command);
                if let Some(rejected) = self.handshake.on_error(&command) {
                    events.push(DriverEvent::Lost(rejected));
                }
            }
        }
    }
}

impl DeviceDriver for Aquasent {
    fn kind(&self) -> &'static str {
        "aquasent"
    }

    fn input(&mut self, bytes: &[u8], events: &mut Vec<DriverEvent>) {
        let mut discarded = 0usize;
        let mut last_error = None;
        for &byte in bytes {
            match self.parser.push(byte) {
                Ok(Some(frame)) => self.handle(frame, events),
                Ok(None) => {}
                Err(e) => {
                    discarded += 1;
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            warn!("Discarded {} malformed modem byte(s): {}", discarded, e);
        }
    }

    fn output(&mut self, packet: Packet, out: &mut BytesMut) -> std::result::Result<(), Packet> {
        if !self.handshake.is_ready() {
            return Err(packet);
        }
        out.reserve(TRANSMIT_PREFIX.len() + packet.len() * 2 + LINE_END.len());
        out.extend_from_slice(TRANSMIT_PREFIX);
        hex::encode_into(out, packet.payload());
        out.extend_from_slice(LINE_END);
        self.handshake.begin(packet)
    }

    fn is_ready(&self) -> bool {
        self.handshake.is_ready()
    }

    fn abort(&mut self) -> Option<Packet> {
        self.handshake.abort()
    }
}
