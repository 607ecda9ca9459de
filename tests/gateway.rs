//! Gateway tests against a scripted modem

mod common;

use common::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uns_gateway::mac::MAC_HEADER_LEN;
use uns_gateway::relay::{FrameKind, SessionKey, TunnelHeader, TUNNEL_HEADER_LEN};
use uns_gateway::socks::{ConnectRequest, Reply, PLACEHOLDER_ADDR};

const PLACEHOLDER_REPLY: [u8; 6] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

fn destination() -> SocketAddr {
    "10.0.0.2:80".parse().unwrap()
}

/// Frame as the peer gateway would send it
fn peer_frame(kind: FrameKind, session: SessionKey, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![2, 1, 0, 0, 0, 0, 0];
    frame.extend(TunnelHeader::new(kind, session).encode().unwrap());
    frame.extend_from_slice(payload);
    frame
}

/// Split a transmitted frame into its tunnel header and payload
fn split_frame(frame: &[u8]) -> (TunnelHeader, Vec<u8>) {
    let start = MAC_HEADER_LEN + TUNNEL_HEADER_LEN;
    let header = TunnelHeader::decode(&frame[MAC_HEADER_LEN..start]).unwrap();
    (header, frame[start..].to_vec())
}

#[tokio::test]
async fn test_method_selection_rejects_bad_version() {
    let config = TestConfigBuilder::new().build();
    let (node, _modem) = Node::with_modem(&config);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    let reply = drive(&mut nodes, read_n::<2>(&mut client)).await;
    assert_eq!(reply, [0x05, 0xFF]);
}

#[tokio::test]
async fn test_bind_request_gets_general_failure() {
    let config = TestConfigBuilder::new().build();
    let (node, _modem) = Node::with_modem(&config);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &[0x05, 0x02, 0x00, 0x01, 10, 0, 0, 2, 0, 80]).await;
    let reply = drive(&mut nodes, read_n::<12>(&mut client)).await;
    assert_eq!(&reply[..2], &[0x05, 0x00]);
    assert_eq!(&reply[2..6], &[0x05, 0x01, 0x00, 0x01]);
    assert_eq!(&reply[6..], &PLACEHOLDER_REPLY);
    assert_eq!(nodes[0].gateway.relay().len(), 1);
}

#[tokio::test]
async fn test_connect_sends_new_frame_and_relays_result() {
    let config = TestConfigBuilder::new().mac_addr(1).build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    assert_eq!(drive(&mut nodes, read_n::<2>(&mut client)).await, [0x05, 0x00]);

    let frame = drive(&mut nodes, modem.next_transmission()).await;
    assert_eq!(frame.len(), MAC_HEADER_LEN + TUNNEL_HEADER_LEN + 10);
    assert_eq!(frame[0], 1, "MAC source is the configured address");
    assert_eq!(frame[2], 0, "payload belongs to the relay");
    let (header, payload) = split_frame(&frame);
    assert_eq!(header.kind, FrameKind::New);
    let (request, _) = ConnectRequest::parse(&payload).unwrap();
    assert_eq!(SocketAddr::V4(request.target), destination());

    drive(&mut nodes, modem.deliver()).await;
    let bound = "10.0.0.9:40000".parse().unwrap();
    let result = peer_frame(
        FrameKind::ConnectResult,
        header.session,
        &Reply::success(bound).encode(),
    );
    drive(&mut nodes, modem.receive(&result)).await;

    let reply = drive(&mut nodes, read_n::<10>(&mut client)).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..], &[10, 0, 0, 9, 0x9C, 0x40]);

    // Data flows both ways once connected
    client.write_all(b"ping").await.unwrap();
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    let (data_header, data) = split_frame(&frame);
    assert_eq!(data_header.kind, FrameKind::Data);
    assert_eq!(data_header.session, header.session);
    assert_eq!(data, b"ping");
    drive(&mut nodes, modem.deliver()).await;

    let pong = peer_frame(FrameKind::Data, header.session, b"pong");
    drive(&mut nodes, modem.receive(&pong)).await;
    assert_eq!(&drive(&mut nodes, read_n::<4>(&mut client)).await, b"pong");
}

#[tokio::test]
async fn test_failed_result_keeps_placeholder_address() {
    let config = TestConfigBuilder::new().build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    let (header, _) = split_frame(&frame);
    drive(&mut nodes, modem.deliver()).await;

    let refused = [0x05, 0x05, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
    let result = peer_frame(FrameKind::ConnectResult, header.session, &refused);
    drive(&mut nodes, modem.receive(&result)).await;

    let reply = drive(&mut nodes, read_n::<12>(&mut client)).await;
    assert_eq!(&reply[2..4], &[0x05, 0x05]);
    assert_eq!(&reply[6..], &PLACEHOLDER_REPLY);
    assert_eq!(PLACEHOLDER_ADDR.octets(), [0xFF; 4]);
}

#[tokio::test]
async fn test_transmissions_wait_for_delivery() {
    let config = TestConfigBuilder::new().build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let _first = socks_client(addr, &connect_request(destination())).await;
    let _second = socks_client(addr, &connect_request("10.0.0.3:22".parse().unwrap())).await;

    let first = drive(&mut nodes, modem.next_transmission()).await;
    let early = drive(
        &mut nodes,
        tokio::time::timeout(Duration::from_millis(300), modem.next_transmission()),
    )
    .await;
    assert!(early.is_err(), "second frame sent before the first was delivered");

    drive(&mut nodes, modem.deliver()).await;
    let second = drive(&mut nodes, modem.next_transmission()).await;
    let (first, _) = split_frame(&first);
    let (second, _) = split_frame(&second);
    assert_eq!(first.kind, FrameKind::New);
    assert_eq!(second.kind, FrameKind::New);
    assert_ne!(first.session, second.session);
}

#[tokio::test]
async fn test_connect_timeout_replies_host_unreachable() {
    let config = TestConfigBuilder::new().connect_timeout_ms(200).build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    drive(&mut nodes, modem.next_transmission()).await;
    drive(&mut nodes, modem.deliver()).await;

    let reply = drive(&mut nodes, read_n::<12>(&mut client)).await;
    assert_eq!(&reply[2..4], &[0x05, 0x04]);
    assert_eq!(&reply[6..], &PLACEHOLDER_REPLY);

    // The peer is told to forget the session
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    assert_eq!(split_frame(&frame).0.kind, FrameKind::Close);
}

#[tokio::test]
async fn test_handshake_timeout_fails_request() {
    let config = TestConfigBuilder::new().handshake_timeout_ms(200).build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    drive(&mut nodes, modem.next_transmission()).await;

    // Never acknowledged, so the New frame is lost
    let reply = drive(&mut nodes, read_n::<12>(&mut client)).await;
    assert_eq!(&reply[2..4], &[0x05, 0x04]);
}

#[tokio::test]
async fn test_modem_error_fails_request() {
    let config = TestConfigBuilder::new().build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    drive(&mut nodes, modem.next_transmission()).await;
    drive(&mut nodes, modem.write_raw(b"$MMERR,HHTXD,1\r\n")).await;

    let reply = drive(&mut nodes, read_n::<12>(&mut client)).await;
    assert_eq!(&reply[2..4], &[0x05, 0x04]);
}

#[tokio::test]
async fn test_garbage_from_modem_is_skipped() {
    let config = TestConfigBuilder::new().build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    let (header, _) = split_frame(&frame);

    drive(&mut nodes, modem.write_raw(b"noise$MMXX\r\n$MMRXD,2,1,ZZ\r\n")).await;
    drive(&mut nodes, modem.deliver()).await;
    let bound = "10.0.0.9:1".parse().unwrap();
    let result = peer_frame(
        FrameKind::ConnectResult,
        header.session,
        &Reply::success(bound).encode(),
    );
    drive(&mut nodes, modem.receive(&result)).await;

    let reply = drive(&mut nodes, read_n::<12>(&mut client)).await;
    assert_eq!(&reply[2..4], &[0x05, 0x00]);
}

#[tokio::test]
async fn test_client_close_sends_close_frame() {
    let config = TestConfigBuilder::new().build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    let (header, _) = split_frame(&frame);
    drive(&mut nodes, modem.deliver()).await;
    let bound = "10.0.0.9:1".parse().unwrap();
    let result = peer_frame(
        FrameKind::ConnectResult,
        header.session,
        &Reply::success(bound).encode(),
    );
    drive(&mut nodes, modem.receive(&result)).await;
    drive(&mut nodes, read_n::<12>(&mut client)).await;

    drop(client);
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    let (close, payload) = split_frame(&frame);
    assert_eq!(close.kind, FrameKind::Close);
    assert_eq!(close.session, header.session);
    assert!(payload.is_empty());

    settle(&mut nodes, Duration::from_millis(50)).await;
    assert!(nodes[0].gateway.relay().is_empty());
}

#[tokio::test]
async fn test_peer_close_disconnects_client() {
    let config = TestConfigBuilder::new().build();
    let (node, modem) = Node::with_modem(&config);
    let mut modem = FakeModem::new(modem);
    let addr = node.socks_addr();
    let mut nodes = [node];

    let mut client = socks_client(addr, &connect_request(destination())).await;
    let frame = drive(&mut nodes, modem.next_transmission()).await;
    let (header, _) = split_frame(&frame);
    drive(&mut nodes, modem.deliver()).await;
    let bound = "10.0.0.9:1".parse().unwrap();
    let result = peer_frame(
        FrameKind::ConnectResult,
        header.session,
        &Reply::success(bound).encode(),
    );
    drive(&mut nodes, modem.receive(&result)).await;
    drive(&mut nodes, read_n::<12>(&mut client)).await;

    let close = peer_frame(FrameKind::Close, header.session, &[]);
    drive(&mut nodes, modem.receive(&close)).await;

    let mut buf = [0u8; 1];
    let n = drive(&mut nodes, client.read(&mut buf)).await.unwrap_or(0);
    assert_eq!(n, 0);
}
