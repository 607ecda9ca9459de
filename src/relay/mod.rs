//! SOCKS5 relay over the tunnel
//!
//! The relay owns every local TCP connection. Client connections speak
//! SOCKS5 with this gateway; their CONNECT requests travel to the peer
//! gateway in `New` frames, and the peer answers with a `ConnectResult`
//! once its own connect to the destination finished. From then on every
//! read becomes a `Data` frame and every `Data` frame is written to the
//! socket bound to its session.
//!
//! Outbound frames collect in an outbox that the gateway drains after each
//! callback; the relay never talks to a device directly.

mod connection;
mod header;

pub use connection::{ConnId, ConnState, ConnTable, Connection, Role};
pub use header::{FrameKind, Origin, SessionKey, TunnelHeader, MAX_SESSION_ID, TUNNEL_HEADER_LEN};

use crate::error::{Result, Socks5Error, Socks5ReplyCode};
use crate::gateway::TimerKind;
use crate::helper::{APP_MAX_LENGTH, PACKET_HEADROOM};
use crate::net::{self, SocketOpts};
use crate::packet::{Layer, Owner, Packet};
use crate::reactor::{EventSource, Interest, Reactor, Token};
use crate::socks::{
    method_reply, ConnectRequest, MethodRequest, Reply, SOCKS5_AUTH_METHOD_NONE,
    SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
};
use bytes::Buf;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Relay state: connections, sessions and the outbound frame queue
#[derive(Debug)]
pub struct Relay {
    conns: ConnTable,
    outbox: VecDeque<Packet>,
    next_session: u32,
    max_payload: usize,
    connect_timeout: Duration,
    socket_opts: SocketOpts,
    paused: bool,
}

impl Relay {
    /// Create a relay for a link with the given MTU
    pub fn new(mtu: usize, connect_timeout: Duration) -> Self {
        Relay {
            conns: ConnTable::new(),
            outbox: VecDeque::new(),
            next_session: 0,
            max_payload: APP_MAX_LENGTH.min(mtu.saturating_sub(PACKET_HEADROOM)).max(1),
            connect_timeout,
            socket_opts: SocketOpts::default(),
            paused: false,
        }
    }

    /// Largest payload carried by one `Data` frame
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Take ownership of an accepted client socket
    pub fn accept(
        &mut self,
        reactor: &mut Reactor<TimerKind>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> ConnId {
        let id = self.conns.next_id();
        let token = reactor.register(Interest::READABLE);
        self.conns.insert(Connection::new(
            id,
            stream,
            token,
            peer,
            Role::Client,
            ConnState::Closed,
        ));
        info!("Accepted SOCKS5 client {} as {}", peer, id);
        id
    }

    /// Whether `token` belongs to a relay connection
    pub fn owns(&self, token: Token) -> bool {
        self.conns.by_token(token).is_some()
    }

    /// Readiness source registered under `token`
    pub fn source(&self, token: Token) -> Option<&dyn EventSource> {
        let id = self.conns.by_token(token)?;
        self.conns.get(id).map(|c| &c.stream as &dyn EventSource)
    }

    /// Reactor token of a connection
    pub fn token(&self, id: ConnId) -> Option<Token> {
        self.conns.get(id).map(|c| c.token)
    }

    /// State of a connection
    pub fn connection_state(&self, id: ConnId) -> Option<ConnState> {
        self.conns.get(id).map(Connection::state)
    }

    /// Session bound to a connection
    pub fn session_of(&self, id: ConnId) -> Option<SessionKey> {
        self.conns.get(id).and_then(Connection::session)
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the relay has no connections
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Next frame for the peer gateway
    pub fn pop_frame(&mut self) -> Option<Packet> {
        self.outbox.pop_front()
    }

    /// Whether frames are waiting for the device
    pub fn has_frames(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Whether reading of connected sockets is suspended
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stop or resume reading connected sockets
    pub fn set_paused(&mut self, reactor: &mut Reactor<TimerKind>, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if paused {
            debug!("Device backlog full, pausing local reads");
        } else {
            debug!("Device backlog drained, resuming local reads");
        }
        for id in self.conns.ids() {
            self.update_interest(reactor, id);
        }
    }

    fn update_interest(&self, reactor: &mut Reactor<TimerKind>, id: ConnId) {
        if let Some(conn) = self.conns.get(id) {
            reactor.set_interest(conn.token, conn.interest(self.paused));
        }
    }

    fn allocate_session(&mut self) -> SessionKey {
        loop {
            let id = self.next_session;
            self.next_session = if id >= MAX_SESSION_ID { 0 } else { id + 1 };
            let session = SessionKey::local(id);
            if self.conns.by_session(session).is_none() {
                return session;
            }
        }
    }

    fn build_frame(kind: FrameKind, session: SessionKey, payload: &[u8]) -> Result<Packet> {
        let header = TunnelHeader::new(kind, session).encode()?;
        let mut packet = Packet::with_headroom(PACKET_HEADROOM, payload);
        packet.push_header(&header)?;
        packet.set_layers(Layer::App, Layer::App);
        Ok(packet)
    }

    /// Queue a frame for the peer gateway
    fn emit(&mut self, kind: FrameKind, session: SessionKey, payload: &[u8]) {
        match Self::build_frame(kind, session, payload) {
            Ok(packet) => {
                debug!("Queued {:?} frame for session {} ({} bytes)", kind, session, payload.len());
                self.outbox.push_back(packet);
            }
            Err(e) => error!("Failed to build {:?} frame for session {}: {}", kind, session, e),
        }
    }

    /// Tear a connection down, optionally telling the peer
    fn close(&mut self, reactor: &mut Reactor<TimerKind>, id: ConnId, notify: bool) {
        let Some(mut conn) = self.conns.remove(id) else {
            return;
        };
        if !conn.pending.is_empty() {
            // Best effort; whatever does not fit in the socket buffer is dropped.
            if let Err(e) = conn.flush() {
                debug!("Discarding unsent data for {}: {}", id, e);
            }
        }
        reactor.unregister(conn.token);
        if let Some(timer) = conn.timer {
            reactor.cancel_timer(timer);
        }
        match conn.session {
            Some(session) if notify => {
                info!("Closing {} ({}), session {}", id, conn.peer, session);
                self.emit(FrameKind::Close, session, &[]);
            }
            _ => info!("Closing {} ({})", id, conn.peer),
        }
    }

    /// A local socket became readable
    pub fn on_readable(&mut self, reactor: &mut Reactor<TimerKind>, token: Token) {
        let Some(id) = self.conns.by_token(token) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        let mut buf = vec![0u8; self.max_payload];
        match conn.stream.try_read(&mut buf) {
            Ok(0) => {
                debug!("{} closed by {}", id, conn.peer);
                self.close(reactor, id, true);
            }
            Ok(n) => self.handle_local(reactor, id, &buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Failed to read from {}: {}", id, e);
                self.close(reactor, id, true);
            }
        }
    }

    fn handle_local(&mut self, reactor: &mut Reactor<TimerKind>, id: ConnId, data: &[u8]) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        match conn.state {
            ConnState::Closed | ConnState::AwaitingRequest => {
                conn.handshake.extend_from_slice(data);
                self.negotiate(reactor, id);
            }
            ConnState::AwaitingConnect => {
                debug!("{} dropping {} bytes sent before the connect result", id, data.len());
            }
            ConnState::Connected => {
                if let Some(session) = conn.session {
                    self.emit(FrameKind::Data, session, data);
                }
            }
        }
        self.update_interest(reactor, id);
    }

    /// Parse whatever complete SOCKS5 messages the handshake buffer holds
    ///
    /// A partial message stays buffered until the next read completes it.
    fn negotiate(&mut self, reactor: &mut Reactor<TimerKind>, id: ConnId) {
        loop {
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            match conn.state {
                ConnState::Closed => match MethodRequest::parse(&conn.handshake) {
                    Ok((request, used)) => {
                        debug!("{} offered methods {:?}", id, request.methods);
                        conn.queue(&method_reply(SOCKS5_AUTH_METHOD_NONE));
                        conn.state = ConnState::AwaitingRequest;
                        conn.handshake.advance(used);
                    }
                    Err(Socks5Error::Truncated { .. }) => return,
                    Err(e) => {
                        warn!("{} sent a bad method selection: {}", id, e);
                        conn.queue(&method_reply(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE));
                        conn.handshake.clear();
                        return;
                    }
                },
                ConnState::AwaitingRequest => {
                    match ConnectRequest::parse(&conn.handshake) {
                        Ok((request, used)) => {
                            if conn.handshake.len() > used {
                                debug!(
                                    "{} dropping {} bytes sent before the connect result",
                                    id,
                                    conn.handshake.len() - used
                                );
                            }
                            conn.handshake.clear();
                            self.open_session(reactor, id, request);
                        }
                        Err(Socks5Error::Truncated { .. }) => {}
                        Err(e) => {
                            warn!("{} sent a bad CONNECT request: {}", id, e);
                            conn.queue(&Reply::failure(Socks5ReplyCode::GeneralFailure).encode());
                            conn.state = ConnState::Closed;
                            conn.handshake.clear();
                        }
                    }
                    return;
                }
                ConnState::AwaitingConnect | ConnState::Connected => return,
            }
        }
    }

    fn open_session(&mut self, reactor: &mut Reactor<TimerKind>, id: ConnId, request: ConnectRequest) {
        let session = self.allocate_session();
        self.conns.bind_session(id, session);
        self.emit(FrameKind::New, session, &request.encode());
        let timer = reactor.add_timer(self.connect_timeout, TimerKind::Connect(id));
        if let Some(conn) = self.conns.get_mut(id) {
            conn.state = ConnState::AwaitingConnect;
            conn.timer = Some(timer);
            info!("{} requested {} over session {}", conn.peer, request, session);
        }
    }

    /// A local socket became writable
    pub fn on_writable(&mut self, reactor: &mut Reactor<TimerKind>, token: Token) {
        let Some(id) = self.conns.by_token(token) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        if conn.role == Role::Destination && conn.state == ConnState::AwaitingConnect {
            self.finish_connect(reactor, id);
            return;
        }

        match conn.flush() {
            Ok(n) => {
                if n > 0 {
                    debug!("Wrote {} bytes to {}", n, id);
                }
                self.update_interest(reactor, id);
            }
            Err(e) => {
                warn!("Failed to write to {}: {}", id, e);
                self.close(reactor, id, true);
            }
        }
    }

    /// Complete a destination connect once its socket turned writable
    fn finish_connect(&mut self, reactor: &mut Reactor<TimerKind>, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if let Some(timer) = conn.timer.take() {
            reactor.cancel_timer(timer);
        }
        let Some(session) = conn.session else {
            return;
        };

        let outcome = net::connect_result(&conn.stream).and_then(|()| conn.stream.local_addr());
        match outcome {
            Ok(local) => {
                let bound = match local {
                    SocketAddr::V4(addr) => addr,
                    SocketAddr::V6(_) => SocketAddrV4::new(
                        crate::socks::PLACEHOLDER_ADDR,
                        crate::socks::PLACEHOLDER_PORT,
                    ),
                };
                info!("Connected to {} from {} for session {}", conn.peer, bound, session);
                conn.state = ConnState::Connected;
                self.emit(
                    FrameKind::ConnectResult,
                    session,
                    &Reply::success(bound).encode(),
                );
                self.update_interest(reactor, id);
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", conn.peer, e);
                let code = Socks5ReplyCode::from(&e);
                self.emit(FrameKind::ConnectResult, session, &Reply::failure(code).encode());
                self.close(reactor, id, false);
            }
        }
    }

    /// Dispatch a frame received from the peer gateway
    pub fn on_tunnel_frame(&mut self, reactor: &mut Reactor<TimerKind>, mut packet: Packet) {
        let header = match TunnelHeader::decode(packet.payload()) {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping tunnel frame: {}", e);
                return;
            }
        };
        if let Err(e) = packet.pull_header(TUNNEL_HEADER_LEN) {
            warn!("Dropping tunnel frame: {}", e);
            return;
        }
        debug!(
            "Received {:?} frame for session {} ({} bytes)",
            header.kind,
            header.session,
            packet.len()
        );

        match header.kind {
            FrameKind::New => self.open_destination(reactor, header.session, packet.payload()),
            FrameKind::ConnectResult => {
                self.on_connect_result(reactor, header.session, packet.payload())
            }
            FrameKind::Data => self.on_data(reactor, header.session, packet),
            FrameKind::Close => match self.conns.by_session(header.session) {
                Some(id) => {
                    debug!("Peer closed session {}", header.session);
                    self.close(reactor, id, false);
                }
                None => debug!("Close for unknown session {}", header.session),
            },
        }
    }

    /// Start the destination connect requested by the peer
    fn open_destination(&mut self, reactor: &mut Reactor<TimerKind>, session: SessionKey, payload: &[u8]) {
        if session.origin != Origin::Remote {
            warn!("Ignoring New frame for our own session {}", session);
            return;
        }
        if self.conns.by_session(session).is_some() {
            warn!("Ignoring duplicate New frame for session {}", session);
            return;
        }
        let request = match ConnectRequest::parse(payload) {
            Ok((request, _)) => request,
            Err(e) => {
                warn!("Bad CONNECT request in session {}: {}", session, e);
                let reply = Reply::failure(Socks5ReplyCode::GeneralFailure);
                self.emit(FrameKind::ConnectResult, session, &reply.encode());
                return;
            }
        };

        let target = SocketAddr::V4(request.target);
        let stream = match net::connect_nonblocking(target, &self.socket_opts) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to {} for session {}: {}", target, session, e);
                let reply = Reply::failure(Socks5ReplyCode::from(&e));
                self.emit(FrameKind::ConnectResult, session, &reply.encode());
                return;
            }
        };

        let id = self.conns.next_id();
        let token = reactor.register(Interest::WRITABLE);
        let mut conn = Connection::new(
            id,
            stream,
            token,
            target,
            Role::Destination,
            ConnState::AwaitingConnect,
        );
        conn.session = Some(session);
        conn.timer = Some(reactor.add_timer(self.connect_timeout, TimerKind::Connect(id)));
        self.conns.insert(conn);
        info!("Connecting to {} for session {} as {}", target, session, id);
    }

    fn on_connect_result(&mut self, reactor: &mut Reactor<TimerKind>, session: SessionKey, payload: &[u8]) {
        let Some(id) = self.conns.by_session(session) else {
            warn!("Connect result for unknown session {}", session);
            return;
        };
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.role != Role::Client || conn.state != ConnState::AwaitingConnect {
            warn!("Unexpected connect result for {} in state {}", id, conn.state);
            return;
        }
        if let Some(timer) = conn.timer.take() {
            reactor.cancel_timer(timer);
        }

        let success = match Reply::parse(payload) {
            Ok(reply) => {
                conn.queue(&payload[..crate::socks::REPLY_LEN]);
                reply.is_success()
            }
            Err(e) => {
                warn!("Bad connect result for session {}: {}", session, e);
                conn.queue(&Reply::failure(Socks5ReplyCode::GeneralFailure).encode());
                false
            }
        };

        if success {
            info!("Session {} connected for {}", session, conn.peer);
            conn.state = ConnState::Connected;
        } else {
            info!("Session {} failed for {}", session, conn.peer);
            conn.state = ConnState::Closed;
            self.conns.unbind_session(id);
        }
        self.update_interest(reactor, id);
    }

    fn on_data(&mut self, reactor: &mut Reactor<TimerKind>, session: SessionKey, mut packet: Packet) {
        let Some(id) = self.conns.by_session(session) else {
            warn!("Data for unknown session {}, closing it", session);
            self.emit(FrameKind::Close, session, &[]);
            return;
        };
        if let Some(conn) = self.conns.get_mut(id) {
            packet.set_owner(Owner::Connection(id));
            packet.set_layers(Layer::App, Layer::App);
            conn.pending.push_back(packet);
        }
        self.update_interest(reactor, id);
    }

    /// The connect timer of connection `id` fired
    pub fn on_connect_timeout(&mut self, reactor: &mut Reactor<TimerKind>, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.timer = None;
        if conn.state != ConnState::AwaitingConnect {
            return;
        }
        let Some(session) = conn.session else {
            return;
        };
        let reply = Reply::failure(Socks5ReplyCode::HostUnreachable).encode();
        let role = conn.role;

        match role {
            Role::Client => {
                warn!("Session {} timed out waiting for the peer", session);
                conn.queue(&reply);
                conn.state = ConnState::Closed;
                self.conns.unbind_session(id);
                self.emit(FrameKind::Close, session, &[]);
                self.update_interest(reactor, id);
            }
            Role::Destination => {
                warn!("Connect to {} timed out for session {}", conn.peer, session);
                self.emit(FrameKind::ConnectResult, session, &reply);
                self.close(reactor, id, false);
            }
        }
    }

    /// A frame this relay emitted was abandoned by the device
    pub fn on_frame_lost(&mut self, reactor: &mut Reactor<TimerKind>, packet: Packet) {
        let header = match TunnelHeader::decode_outbound(packet.payload()) {
            Ok(header) => header,
            Err(e) => {
                warn!("Lost frame with unreadable header: {}", e);
                return;
            }
        };
        warn!("Lost {:?} frame for session {}", header.kind, header.session);
        let Some(id) = self.conns.by_session(header.session) else {
            return;
        };

        match header.kind {
            FrameKind::New => {
                let Some(conn) = self.conns.get_mut(id) else {
                    return;
                };
                if conn.state != ConnState::AwaitingConnect {
                    return;
                }
                if let Some(timer) = conn.timer.take() {
                    reactor.cancel_timer(timer);
                }
                conn.queue(&Reply::failure(Socks5ReplyCode::HostUnreachable).encode());
                conn.state = ConnState::Closed;
                self.conns.unbind_session(id);
                self.update_interest(reactor, id);
            }
            FrameKind::ConnectResult => self.close(reactor, id, false),
            FrameKind::Data => self.close(reactor, id, true),
            FrameKind::Close => {}
        }
    }

    /// Close every connection
    pub fn shutdown(&mut self, reactor: &mut Reactor<TimerKind>) {
        for id in self.conns.ids() {
            self.close(reactor, id, false);
        }
        self.outbox.clear();
    }
}
