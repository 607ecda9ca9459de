//! Modem devices and the device table
//!
//! A [`Device`] pairs a byte [`Link`] with a [`DeviceDriver`] that speaks
//! the modem's command protocol. The [`DeviceTable`] owns every device,
//! queues outbound packets while a device is busy, flushes command bytes as
//! the link accepts them, and turns driver notifications into
//! [`DeviceEvent`]s for the layers above.
//!
//! Write availability is owned here: a device becomes unavailable as soon as
//! a transmission is handed to its driver and available again when the
//! driver reports delivery, rejection or a handshake timeout.

pub mod aquasent;
pub mod serial;

use crate::gateway::TimerKind;
use crate::packet::{Layer, Owner, Packet};
use crate::reactor::{EventSource, Interest, Link, Reactor, TimerId, Token};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Identifier of a device in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Two-character logical device name, e.g. `AM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceName([u8; 2]);

impl DeviceName {
    /// Build a name from two ASCII bytes
    pub const fn new(name: [u8; 2]) -> Self {
        DeviceName(name)
    }
}

impl FromStr for DeviceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [a, b] if a.is_ascii_graphic() && b.is_ascii_graphic() => Ok(DeviceName([*a, *b])),
            _ => Err(format!("device name must be two ASCII characters, got {:?}", s)),
        }
    }
}

impl TryFrom<String> for DeviceName {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceName> for String {
    fn from(name: DeviceName) -> Self {
        name.to_string()
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
    }
}

/// Network identity of a device
///
/// Carried for the protocol layers; the tunnel itself only uses `mac`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetIdentity {
    /// Link-local address
    pub ip: u8,
    /// Network mask
    pub netmask: u8,
    /// Gateway address
    pub gateway: u8,
    /// MAC address
    pub mac: u8,
}

/// Notification raised by a driver while processing input
#[derive(Debug)]
pub enum DriverEvent {
    /// A frame arrived from the remote side
    Frame(Packet),
    /// The in-flight packet was delivered
    Delivered(Packet),
    /// The in-flight packet was rejected by the modem
    Lost(Packet),
}

/// Command protocol of one kind of modem
pub trait DeviceDriver: Send {
    /// Short driver name used in logs
    fn kind(&self) -> &'static str;

    /// Consume bytes read from the link
    fn input(&mut self, bytes: &[u8], events: &mut Vec<DriverEvent>);

    /// Encode `packet` as a command into `out` and start its handshake
    ///
    /// Fails without side effects, handing the packet back, while a
    /// previous transmission is outstanding.
    fn output(&mut self, packet: Packet, out: &mut BytesMut) -> Result<(), Packet>;

    /// Whether a new transmission may start
    fn is_ready(&self) -> bool;

    /// Abandon the transmission in flight
    fn abort(&mut self) -> Option<Packet>;
}

/// Event surfaced by the device table
#[derive(Debug)]
pub enum DeviceEvent {
    /// A frame for the layers above
    Frame(Packet),
    /// A frame that will never be delivered
    Lost(Packet),
    /// The device link closed and the device was removed
    Down(DeviceName),
}

/// One modem endpoint
pub struct Device {
    name: DeviceName,
    link: Box<dyn Link>,
    driver: Box<dyn DeviceDriver>,
    identity: NetIdentity,
    mtu: usize,
    handshake_timeout: Duration,
    read_available: bool,
    write_available: bool,
    pending: VecDeque<Packet>,
    outbox: BytesMut,
    token: Option<Token>,
    timer: Option<TimerId>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("driver", &self.driver.kind())
            .field("mtu", &self.mtu)
            .field("write_available", &self.write_available)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl EventSource for Device {
    fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.link.poll_readable(cx)
    }

    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.link.poll_writable(cx)
    }
}

impl Device {
    /// Create a device around an open link
    pub fn new(
        name: DeviceName,
        link: Box<dyn Link>,
        driver: Box<dyn DeviceDriver>,
        identity: NetIdentity,
        mtu: usize,
        handshake_timeout: Duration,
    ) -> Self {
        Device {
            name,
            link,
            driver,
            identity,
            mtu,
            handshake_timeout,
            read_available: true,
            write_available: true,
            pending: VecDeque::new(),
            outbox: BytesMut::new(),
            token: None,
            timer: None,
        }
    }

    /// Logical name
    pub fn name(&self) -> DeviceName {
        self.name
    }

    /// Maximum frame size in bytes
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether a new transmission may be handed to the driver
    pub fn is_write_available(&self) -> bool {
        self.write_available
    }

    /// Frames queued behind the one in flight
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    fn wants_write(&self) -> bool {
        !self.outbox.is_empty() || (self.write_available && !self.pending.is_empty())
    }

    fn update_interest(&self, reactor: &mut Reactor<TimerKind>) {
        if let Some(token) = self.token {
            let interest = Interest::NONE
                .with_read(self.read_available)
                .with_write(self.wants_write());
            reactor.set_interest(token, interest);
        }
    }

    /// Write buffered command bytes until the link would block
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.link.write_nonblocking(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbox.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Abandon the transmission in flight and free the device for the next one
    fn release(&mut self, reactor: &mut Reactor<TimerKind>) -> Option<Packet> {
        if let Some(timer) = self.timer.take() {
            reactor.cancel_timer(timer);
        }
        self.write_available = true;
        self.driver.abort()
    }

    fn flush_or_fail(&mut self, reactor: &mut Reactor<TimerKind>, events: &mut Vec<DeviceEvent>) {
        if let Err(e) = self.flush() {
            error!("Failed to write to device {}: {}", self.name, e);
            self.outbox.clear();
            if let Some(packet) = self.release(reactor) {
                events.push(DeviceEvent::Lost(packet));
            }
        }
    }
}

/// All devices known to the gateway
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: BTreeMap<DeviceId, Device>,
    by_token: HashMap<Token, DeviceId>,
    next_id: usize,
}

impl DeviceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with the reactor and take ownership of it
    pub fn add(&mut self, reactor: &mut Reactor<TimerKind>, mut device: Device) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        let token = reactor.register(Interest::READABLE);
        device.token = Some(token);
        info!(
            "Added {} device {} as {} (mtu {}, mac {}, ip {}/{})",
            device.driver.kind(),
            device.name,
            id,
            device.mtu,
            device.identity.mac,
            device.identity.ip,
            device.identity.netmask
        );
        self.by_token.insert(token, id);
        self.devices.insert(id, device);
        id
    }

    /// Find a device by its logical name
    pub fn find_by_name(&self, name: DeviceName) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, device)| device.name == name)
            .map(|(id, _)| *id)
    }

    /// Borrow a device
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// Whether `token` belongs to a device
    pub fn owns(&self, token: Token) -> bool {
        self.by_token.contains_key(&token)
    }

    /// Readiness source registered under `token`
    pub fn source(&self, token: Token) -> Option<&dyn EventSource> {
        let id = self.by_token.get(&token)?;
        self.devices.get(id).map(|d| d as &dyn EventSource)
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Frames queued on a device
    pub fn backlog(&self, id: DeviceId) -> usize {
        self.devices.get(&id).map(Device::backlog).unwrap_or(0)
    }

    /// Queue a packet on the device named by its owner
    ///
    /// Hands the packet back when it has no device owner or the device is
    /// gone.
    pub fn send(&mut self, reactor: &mut Reactor<TimerKind>, packet: Packet) -> Result<(), Packet> {
        let Some(Owner::Device(id)) = packet.owner() else {
            return Err(packet);
        };
        let Some(device) = self.devices.get_mut(&id) else {
            return Err(packet);
        };
        if packet.len() > device.mtu {
            warn!(
                "Frame of {} bytes exceeds mtu {} of device {}",
                packet.len(),
                device.mtu,
                device.name
            );
        }
        device.pending.push_back(packet);
        device.update_interest(reactor);
        Ok(())
    }

    /// Read from a device and run its driver over the bytes
    pub fn on_readable(&mut self, reactor: &mut Reactor<TimerKind>, token: Token) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let Some(&id) = self.by_token.get(&token) else {
            return events;
        };
        let Some(device) = self.devices.get_mut(&id) else {
            return events;
        };

        let mut buf = vec![0u8; crate::helper::modem_line_capacity(device.mtu)];
        let mut driver_events = Vec::new();
        let mut closed = false;
        loop {
            match device.link.read_nonblocking(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    debug!("Read {} bytes from device {}", n, device.name);
                    device.driver.input(&buf[..n], &mut driver_events);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Failed to read from device {}: {}", device.name, e);
                    closed = true;
                    break;
                }
            }
        }

        for event in driver_events {
            match event {
                DriverEvent::Frame(mut packet) => {
                    packet.set_owner(Owner::Device(id));
                    packet.set_layers(Layer::Mac, Layer::Mac);
                    events.push(DeviceEvent::Frame(packet));
                }
                DriverEvent::Delivered(packet) => {
                    debug!("Device {} delivered {} bytes", device.name, packet.len());
                    if let Some(timer) = device.timer.take() {
                        reactor.cancel_timer(timer);
                    }
                    device.write_available = true;
                }
                DriverEvent::Lost(packet) => {
                    if let Some(timer) = device.timer.take() {
                        reactor.cancel_timer(timer);
                    }
                    device.write_available = true;
                    events.push(DeviceEvent::Lost(packet));
                }
            }
        }
        device.update_interest(reactor);

        if closed {
            error!("Device {} link is gone, removing it", device.name);
            events.extend(self.remove(reactor, id));
        }
        events
    }

    /// Flush command bytes and start the next transmission if allowed
    pub fn on_writable(&mut self, reactor: &mut Reactor<TimerKind>, token: Token) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let Some(&id) = self.by_token.get(&token) else {
            return events;
        };
        let Some(device) = self.devices.get_mut(&id) else {
            return events;
        };

        device.flush_or_fail(reactor, &mut events);

        if device.outbox.is_empty() && device.write_available && device.driver.is_ready() {
            if let Some(packet) = device.pending.pop_front() {
                let len = packet.len();
                match device.driver.output(packet, &mut device.outbox) {
                    Ok(()) => {
                        debug!("Device {} transmitting {} bytes", device.name, len);
                        device.write_available = false;
                        device.timer =
                            Some(reactor.add_timer(device.handshake_timeout, TimerKind::Handshake(id)));
                        device.flush_or_fail(reactor, &mut events);
                    }
                    Err(packet) => {
                        warn!("Device {} driver busy, requeueing frame", device.name);
                        device.pending.push_front(packet);
                        device.write_available = false;
                    }
                }
            }
        }

        device.update_interest(reactor);
        events
    }

    /// The handshake timer of device `id` fired
    pub fn on_handshake_timeout(
        &mut self,
        reactor: &mut Reactor<TimerKind>,
        id: DeviceId,
    ) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let Some(device) = self.devices.get_mut(&id) else {
            return events;
        };
        device.timer = None;
        if let Some(packet) = device.release(reactor) {
            warn!(
                "Device {} handshake timed out after {:?}, dropping {} byte frame",
                device.name,
                device.handshake_timeout,
                packet.len()
            );
            events.push(DeviceEvent::Lost(packet));
        }
        device.update_interest(reactor);
        events
    }

    /// Remove a device, surfacing every frame it still held as lost
    pub fn remove(&mut self, reactor: &mut Reactor<TimerKind>, id: DeviceId) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let Some(mut device) = self.devices.remove(&id) else {
            return events;
        };
        if let Some(token) = device.token.take() {
            reactor.unregister(token);
            self.by_token.remove(&token);
        }
        if let Some(packet) = device.release(reactor) {
            events.push(DeviceEvent::Lost(packet));
        }
        events.extend(device.pending.drain(..).map(DeviceEvent::Lost));
        events.push(DeviceEvent::Down(device.name));
        events
    }

    /// Close every device
    pub fn shutdown(&mut self, reactor: &mut Reactor<TimerKind>) {
        let ids: Vec<DeviceId> = self.devices.keys().copied().collect();
        for id in ids {
            if let Some(device) = self.devices.get(&id) {
                info!("Closing device {}", device.name);
            }
            self.remove(reactor, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::aquasent::Aquasent;
    use super::*;
    use tokio::net::UnixStream;

    const NAME: DeviceName = DeviceName::new(*b"AM");

    fn device(link: UnixStream, timeout: Duration) -> Device {
        Device::new(
            NAME,
            Box::new(link),
            Box::new(Aquasent::new(64)),
            NetIdentity::default(),
            64,
            timeout,
        )
    }

    fn outbound(id: DeviceId, payload: &[u8]) -> Packet {
        let mut packet = Packet::with_headroom(0, payload);
        packet.set_owner(Owner::Device(id));
        packet
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn read_line(modem: &mut UnixStream) -> String {
        let mut buf = vec![0u8; 256];
        modem.readable().await.unwrap();
        let n = modem.try_read(&mut buf).unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn test_device_name_parse() {
        assert_eq!("AM".parse::<DeviceName>().unwrap(), NAME);
        assert_eq!(NAME.to_string(), "AM");
        assert!("A".parse::<DeviceName>().is_err());
        assert!("AMX".parse::<DeviceName>().is_err());
    }

    #[tokio::test]
    async fn test_find_by_name_and_source() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let (link, _modem) = UnixStream::pair().unwrap();
        let id = table.add(&mut reactor, device(link, Duration::from_secs(1)));
        assert_eq!(table.find_by_name(NAME), Some(id));
        assert_eq!(table.find_by_name(DeviceName::new(*b"XX")), None);
        assert_eq!(table.len(), 1);
        assert_eq!(reactor.registrations(), 1);
    }

    #[tokio::test]
    async fn test_send_without_device_owner_is_returned() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let packet = Packet::with_headroom(0, b"x");
        assert!(table.send(&mut reactor, packet).is_err());
        let packet = outbound(DeviceId(9), b"x");
        assert!(table.send(&mut reactor, packet).is_err());
    }

    #[tokio::test]
    async fn test_transmit_and_deliver_cycle() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let (link, mut modem) = UnixStream::pair().unwrap();
        let id = table.add(&mut reactor, device(link, Duration::from_secs(30)));
        let token = Token(0);
        settle().await;

        table.send(&mut reactor, outbound(id, b"\x01\xAB")).unwrap();
        table.send(&mut reactor, outbound(id, b"\x02")).unwrap();
        assert_eq!(reactor.interest(token), Some(Interest::BOTH));

        let events = table.on_writable(&mut reactor, token);
        assert!(events.is_empty());
        assert_eq!(read_line(&mut modem).await, "$HHTXD,0,0,0,01AB\r\n");
        assert!(!table.get(id).unwrap().is_write_available());
        assert_eq!(table.backlog(id), 1);
        assert_eq!(reactor.interest(token), Some(Interest::READABLE));
        assert_eq!(reactor.pending_timers(), 1);

        modem.try_write(b"$MMOKY,HHTXD\r\n$MMTDN,0,1\r\n").unwrap();
        settle().await;
        let events = table.on_readable(&mut reactor, token);
        assert!(events.is_empty());
        assert!(table.get(id).unwrap().is_write_available());
        assert_eq!(reactor.pending_timers(), 0);
        assert_eq!(reactor.interest(token), Some(Interest::BOTH));

        table.on_writable(&mut reactor, token);
        assert_eq!(read_line(&mut modem).await, "$HHTXD,0,0,0,02\r\n");
    }

    #[tokio::test]
    async fn test_received_frame_surfaces_with_owner() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let (link, modem) = UnixStream::pair().unwrap();
        let id = table.add(&mut reactor, device(link, Duration::from_secs(30)));
        settle().await;

        modem.try_write(b"$MMRXD,2,1,CAFE\r\n").unwrap();
        settle().await;
        let events = table.on_readable(&mut reactor, Token(0));
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::Frame(packet) => {
                assert_eq!(packet.payload(), &[0xCA, 0xFE]);
                assert_eq!(packet.owner(), Some(Owner::Device(id)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout_reports_lost_frame() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let (link, _modem) = UnixStream::pair().unwrap();
        let id = table.add(&mut reactor, device(link, Duration::from_millis(5)));
        settle().await;

        table.send(&mut reactor, outbound(id, b"lost")).unwrap();
        table.on_writable(&mut reactor, Token(0));
        let events = table.on_handshake_timeout(&mut reactor, id);
        assert!(matches!(&events[..], [DeviceEvent::Lost(p)] if p.payload() == b"lost"));
        assert!(table.get(id).unwrap().is_write_available());
    }

    #[tokio::test]
    async fn test_modem_error_rejects_frame() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let (link, modem) = UnixStream::pair().unwrap();
        let id = table.add(&mut reactor, device(link, Duration::from_secs(30)));
        settle().await;

        table.send(&mut reactor, outbound(id, b"x")).unwrap();
        table.on_writable(&mut reactor, Token(0));
        modem.try_write(b"$MMERR,HHTXD,3\r\n").unwrap();
        settle().await;
        let events = table.on_readable(&mut reactor, Token(0));
        assert!(matches!(&events[..], [DeviceEvent::Lost(_)]));
        assert!(table.get(id).unwrap().is_write_available());
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_closed_link_removes_device() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let (link, modem) = UnixStream::pair().unwrap();
        let id = table.add(&mut reactor, device(link, Duration::from_secs(30)));
        table.send(&mut reactor, outbound(id, b"queued")).unwrap();

        drop(modem);
        settle().await;
        let events = table.on_readable(&mut reactor, Token(0));
        assert!(matches!(&events[..], [DeviceEvent::Lost(_), DeviceEvent::Down(n)] if *n == NAME));
        assert!(table.is_empty());
        assert_eq!(reactor.registrations(), 0);
    }

    /// Link whose reads fail the way an unplugged serial adapter does
    struct BrokenLink;

    impl EventSource for BrokenLink {
        fn poll_readable(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_writable(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Link for BrokenLink {
        fn read_nonblocking(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }

        fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn test_read_error_removes_device_and_loses_frames() {
        let mut reactor = Reactor::new();
        let mut table = DeviceTable::new();
        let broken = Device::new(
            NAME,
            Box::new(BrokenLink),
            Box::new(Aquasent::new(64)),
            NetIdentity::default(),
            64,
            Duration::from_secs(30),
        );
        let id = table.add(&mut reactor, broken);
        table.send(&mut reactor, outbound(id, b"in flight")).unwrap();
        table.send(&mut reactor, outbound(id, b"queued")).unwrap();
        table.on_writable(&mut reactor, Token(0));
        assert_eq!(reactor.pending_timers(), 1);

        let events = table.on_readable(&mut reactor, Token(0));
        assert!(matches!(
            &events[..],
            [DeviceEvent::Lost(a), DeviceEvent::Lost(b), DeviceEvent::Down(n)]
                if a.payload() == b"in flight" && b.payload() == b"queued" && *n == NAME
        ));
        assert!(table.is_empty());
        assert_eq!(reactor.registrations(), 0);
        assert_eq!(reactor.pending_timers(), 0);

        // A later readiness for the stale token is ignored
        assert!(table.on_readable(&mut reactor, Token(0)).is_empty());
    }
}
