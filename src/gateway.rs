//! Gateway wiring
//!
//! The [`Gateway`] owns the SOCKS5 listener, the device table, the MAC
//! layer and the relay, and is the reactor's [`Handler`]. After every
//! callback it pumps packets between the layers until nothing moves:
//! relay frames go down through the MAC layer onto the routed device,
//! device frames come up through the MAC layer into the relay, and frames
//! a device gave up on are reported back to the relay.

use crate::config::Config;
use crate::device::aquasent::Aquasent;
use crate::device::{Device, DeviceEvent, DeviceId, DeviceName, DeviceTable};
use crate::error::Result;
use crate::helper::{duration_from_millis, MAX_DEVICE_BACKLOG};
use crate::mac::{MacLayer, NoChecksum};
use crate::net::{self, Listener, SocketOpts};
use crate::packet::{Owner, Packet};
use crate::reactor::{EventSource, Handler, Interest, Reactor, TimerId, Token};
use crate::relay::{ConnId, Relay};
use anyhow::Context;
use std::io;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Tag of a gateway timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Modem handshake of a device
    Handshake(DeviceId),
    /// Pending tunnel connect of a relay connection
    Connect(ConnId),
}

/// Listener, devices, MAC layer and relay of one gateway
#[derive(Debug)]
pub struct Gateway {
    listener: Listener,
    listener_token: Token,
    socket_opts: SocketOpts,
    devices: DeviceTable,
    relay: Relay,
    mac: MacLayer,
    route: DeviceName,
}

impl Gateway {
    /// Bind the SOCKS5 listener and set up the layers above the device
    pub fn bind(reactor: &mut Reactor<TimerKind>, config: &Config) -> Result<Self> {
        let addr = config.relay.listen_addr();
        let listener = net::bind_listener(addr)?;
        let listener_token = reactor.register(Interest::READABLE);
        debug!("SOCKS5 listener bound to {} as {}", addr, listener_token);

        Ok(Gateway {
            listener,
            listener_token,
            socket_opts: SocketOpts::default(),
            devices: DeviceTable::new(),
            relay: Relay::new(
                config.modem.aquasent_mtu,
                duration_from_millis(config.relay.connect_timeout_ms),
            ),
            mac: MacLayer::new(config.modem.aquasent_mac_addr, Box::new(NoChecksum)),
            route: config.modem.aquasent_name,
        })
    }

    /// Add a device to the table
    pub fn attach_device(&mut self, reactor: &mut Reactor<TimerKind>, device: Device) -> DeviceId {
        self.devices.add(reactor, device)
    }

    /// Address the SOCKS5 listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.get_ref().local_addr()
    }

    /// The relay
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// The device table
    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    fn accept_all(&mut self, reactor: &mut Reactor<TimerKind>) {
        loop {
            match net::accept_nonblocking(&self.listener, &self.socket_opts) {
                Ok((stream, peer)) => {
                    self.relay.accept(reactor, stream, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Failed to accept SOCKS5 client: {}", e);
                    break;
                }
            }
        }
    }

    /// Move packets between the layers until both directions are idle
    fn pump(&mut self, reactor: &mut Reactor<TimerKind>, mut events: Vec<DeviceEvent>) {
        loop {
            for event in events.drain(..) {
                match event {
                    DeviceEvent::Frame(mut packet) => match self.mac.input(&mut packet) {
                        Ok(_) => self.relay.on_tunnel_frame(reactor, packet),
                        Err(e) => warn!("Dropping modem frame: {}", e),
                    },
                    DeviceEvent::Lost(packet) => self.frame_lost(reactor, packet),
                    DeviceEvent::Down(name) => error!("Device {} is down", name),
                }
            }

            let Some(packet) = self.relay.pop_frame() else {
                break;
            };
            self.transmit(reactor, packet);
        }

        let backlog = self
            .devices
            .find_by_name(self.route)
            .map(|id| self.devices.backlog(id))
            .unwrap_or(0);
        self.relay.set_paused(reactor, backlog >= MAX_DEVICE_BACKLOG);
    }

    /// Frame a relay packet and queue it on the routed device
    fn transmit(&mut self, reactor: &mut Reactor<TimerKind>, mut packet: Packet) {
        if let Err(e) = self.mac.output(&mut packet) {
            error!("Failed to frame packet for the modem: {}", e);
            // No MAC header was pushed, the relay can read it as is.
            self.relay.on_frame_lost(reactor, packet);
            return;
        }
        match self.devices.find_by_name(self.route) {
            Some(id) => {
                packet.set_owner(Owner::Device(id));
                if let Err(packet) = self.devices.send(reactor, packet) {
                    self.frame_lost(reactor, packet);
                }
            }
            None => {
                warn!("No device {} to carry {} byte frame", self.route, packet.len());
                self.frame_lost(reactor, packet);
            }
        }
    }

    /// Hand a MAC framed packet that will never be delivered back to the relay
    fn frame_lost(&mut self, reactor: &mut Reactor<TimerKind>, mut packet: Packet) {
        match self.mac.input(&mut packet) {
            Ok(_) => self.relay.on_frame_lost(reactor, packet),
            Err(e) => warn!("Lost frame without a readable MAC header: {}", e),
        }
    }

    /// Close every connection and device
    pub fn shutdown(&mut self, reactor: &mut Reactor<TimerKind>) {
        info!("Shutting down gateway");
        self.relay.shutdown(reactor);
        self.devices.shutdown(reactor);
        reactor.unregister(self.listener_token);
    }
}

impl Handler for Gateway {
    type Timer = TimerKind;

    fn source(&self, token: Token) -> Option<&dyn EventSource> {
        if token == self.listener_token {
            return Some(&self.listener as &dyn EventSource);
        }
        self.devices
            .source(token)
            .or_else(|| self.relay.source(token))
    }

    fn on_readable(&mut self, reactor: &mut Reactor<TimerKind>, token: Token) {
        if token == self.listener_token {
            self.accept_all(reactor);
            return;
        }
        let events = if self.devices.owns(token) {
            self.devices.on_readable(reactor, token)
        } else {
            self.relay.on_readable(reactor, token);
            Vec::new()
        };
        self.pump(reactor, events);
    }

    fn on_writable(&mut self, reactor: &mut Reactor<TimerKind>, token: Token) {
        let events = if self.devices.owns(token) {
            self.devices.on_writable(reactor, token)
        } else {
            self.relay.on_writable(reactor, token);
            Vec::new()
        };
        self.pump(reactor, events);
    }

    fn on_timeout(&mut self, reactor: &mut Reactor<TimerKind>, id: TimerId, tag: TimerKind) {
        debug!("{} fired for {:?}", id, tag);
        let events = match tag {
            TimerKind::Handshake(device) => self.devices.on_handshake_timeout(reactor, device),
            TimerKind::Connect(conn) => {
                self.relay.on_connect_timeout(reactor, conn);
                Vec::new()
            }
        };
        self.pump(reactor, events);
    }
}

/// Run a gateway until `shutdown_rx` fires
///
/// Failing to bind the listener or open the modem is fatal.
pub async fn run_gateway(config: Config, mut shutdown_rx: broadcast::Receiver<bool>) -> anyhow::Result<()> {
    let mut reactor = Reactor::new();
    let mut gateway = Gateway::bind(&mut reactor, &config).with_context(|| {
        format!(
            "Failed to bind SOCKS5 listener on {}",
            config.relay.listen_addr()
        )
    })?;

    let device = Aquasent::open(&config.modem).with_context(|| {
        format!("Failed to open modem {:?}", config.modem.aquasent_port)
    })?;
    gateway.attach_device(&mut reactor, device);

    info!("SOCKS5 gateway listening on {}", gateway.local_addr()?);
    reactor.run_forever(&mut gateway, &mut shutdown_rx).await;

    gateway.shutdown(&mut reactor);
    info!("Gateway stopped");
    Ok(())
}
