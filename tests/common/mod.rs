//! Test utilities and fakes for uns-gateway
//!
//! This module provides common test utilities used across integration tests:
//! a gateway wired to a scripted modem over a Unix socket pair, a loop that
//! drives gateways while a test future runs, and a modem link joining two
//! gateways.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::task::JoinHandle;
use uns_gateway::device::aquasent::{hex, Aquasent};
use uns_gateway::device::{Device, NetIdentity};
use uns_gateway::reactor::Reactor;
use uns_gateway::{Config, Gateway, TimerKind};

/// Deadline for a single driven step
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 greeting offering "no authentication"
pub const GREETING: [u8; 3] = [0x05, 0x01, 0x00];

/// Test configuration builder
pub struct TestConfigBuilder {
    mtu: usize,
    mac_addr: u8,
    connect_timeout_ms: u64,
    handshake_timeout_ms: u64,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            mtu: 256,
            mac_addr: 1,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set modem MTU
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set MAC address
    pub fn mac_addr(mut self, addr: u8) -> Self {
        self.mac_addr = addr;
        self
    }

    /// Set tunnel connect timeout
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set modem handshake timeout
    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    /// Build a config listening on an ephemeral loopback port
    pub fn build(self) -> Config {
        let mut config = Config::default();
        config.relay.socks_addr = "127.0.0.1".parse().unwrap();
        config.relay.socks_port = 0;
        config.relay.connect_timeout_ms = self.connect_timeout_ms;
        config.modem.aquasent_mtu = self.mtu;
        config.modem.aquasent_mac_addr = self.mac_addr;
        config.modem.aquasent_handshake_timeout_ms = self.handshake_timeout_ms;
        config
    }
}

/// A gateway plus the reactor driving it
pub struct Node {
    /// Reactor of the gateway
    pub reactor: Reactor<TimerKind>,
    /// The gateway
    pub gateway: Gateway,
}

impl Node {
    /// Bind a gateway and attach a modem whose far end is returned
    pub fn with_modem(config: &Config) -> (Node, UnixStream) {
        let mut reactor = Reactor::new();
        let mut gateway = Gateway::bind(&mut reactor, config).unwrap();
        let (link, modem) = UnixStream::pair().unwrap();
        let device = Device::new(
            config.modem.aquasent_name,
            Box::new(link),
            Box::new(Aquasent::new(config.modem.aquasent_mtu)),
            NetIdentity {
                mac: config.modem.aquasent_mac_addr,
                ..NetIdentity::default()
            },
            config.modem.aquasent_mtu,
            Duration::from_millis(config.modem.aquasent_handshake_timeout_ms),
        );
        gateway.attach_device(&mut reactor, device);
        (Node { reactor, gateway }, modem)
    }

    /// Address SOCKS5 clients connect to
    pub fn socks_addr(&self) -> SocketAddr {
        self.gateway.local_addr().unwrap()
    }

    /// Run one reactor cycle
    pub async fn turn(&mut self) -> usize {
        self.reactor.turn(&mut self.gateway).await
    }
}

/// Drive `nodes` until `fut` completes
///
/// Panics if `fut` is not done within [`STEP_TIMEOUT`].
pub async fn drive<F: Future>(nodes: &mut [Node], fut: F) -> F::Output {
    tokio::pin!(fut);
    let deadline = tokio::time::sleep(STEP_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        let turns: Vec<_> = nodes.iter_mut().map(|node| Box::pin(node.turn())).collect();
        tokio::select! {
            out = &mut fut => return out,
            _ = &mut deadline => panic!("timed out driving gateways"),
            _ = futures::future::select_all(turns) => {}
        }
    }
}

/// Drive `nodes` for a fixed time
pub async fn settle(nodes: &mut [Node], time: Duration) {
    drive(nodes, tokio::time::sleep(time)).await
}

/// SOCKS5 CONNECT request for an IPv4 destination
pub fn connect_request(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(addr) = addr else {
        panic!("IPv4 address expected");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&addr.ip().octets());
    request.extend_from_slice(&addr.port().to_be_bytes());
    request
}

/// Connect a SOCKS5 client and send the greeting and `request` in one write
pub async fn socks_client(gateway: SocketAddr, request: &[u8]) -> TcpStream {
    let mut client = TcpStream::connect(gateway).await.unwrap();
    let mut hello = GREETING.to_vec();
    hello.extend_from_slice(request);
    client.write_all(&hello).await.unwrap();
    client
}

/// Read exactly `N` bytes
pub async fn read_n<const N: usize>(stream: &mut TcpStream) -> [u8; N] {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Scripted modem end of a device link
pub struct FakeModem {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    delivered: u32,
}

impl FakeModem {
    /// Wrap the modem end of a link
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        FakeModem {
            lines: BufReader::new(reader).lines(),
            writer,
            delivered: 0,
        }
    }

    /// Next `$HHTXD` payload, decoded from hex
    pub async fn next_transmission(&mut self) -> Vec<u8> {
        let line = self.lines.next_line().await.unwrap().expect("link closed");
        let payload = line
            .strip_prefix("$HHTXD,0,0,0,")
            .unwrap_or_else(|| panic!("unexpected command {:?}", line));
        hex::decode(payload.as_bytes()).unwrap()
    }

    /// Acknowledge and confirm delivery of the transmission in flight
    pub async fn deliver(&mut self) {
        self.delivered += 1;
        let reply = format!("$MMOKY,HHTXD\r\n$MMTDN,0,{}\r\n", self.delivered);
        self.writer.write_all(reply.as_bytes()).await.unwrap();
    }

    /// Deliver `frame` from a remote modem
    pub async fn receive(&mut self, frame: &[u8]) {
        let line = format!("$MMRXD,2,1,{}\r\n", hex::encode(frame));
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Write raw bytes to the gateway
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }
}

/// Join two modem ends as if both modems shared the water
///
/// Every `$HHTXD` from one side is acknowledged to its sender, received by
/// the other side, then confirmed as delivered.
pub fn spawn_modem_link(a: UnixStream, b: UnixStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (a_reader, mut a_writer) = a.into_split();
        let (b_reader, mut b_writer) = b.into_split();
        let mut a_lines = BufReader::new(a_reader).lines();
        let mut b_lines = BufReader::new(b_reader).lines();
        let mut delivered = 0u32;

        loop {
            tokio::select! {
                line = a_lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    delivered += 1;
                    transmit(&line, &mut a_writer, &mut b_writer, delivered).await;
                }
                line = b_lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    delivered += 1;
                    transmit(&line, &mut b_writer, &mut a_writer, delivered).await;
                }
            }
        }
    })
}

async fn transmit(line: &str, sender: &mut OwnedWriteHalf, receiver: &mut OwnedWriteHalf, seq: u32) {
    let Some(payload) = line.strip_prefix("$HHTXD,0,0,0,") else {
        return;
    };
    let _ = sender.write_all(b"$MMOKY,HHTXD\r\n").await;
    let _ = receiver
        .write_all(format!("$MMRXD,1,2,{}\r\n", payload).as_bytes())
        .await;
    let _ = sender
        .write_all(format!("$MMTDN,0,{}\r\n", seq).as_bytes())
        .await;
}

/// Spawn a TCP echo server on an ephemeral loopback port
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}
