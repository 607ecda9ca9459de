//! Local TCP connections of the relay and their lookup table

use super::header::SessionKey;
use crate::packet::{Owner, Packet};
use crate::reactor::{Interest, TimerId, Token};
use bytes::BytesMut;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Identifier of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Which side of the tunnel a connection sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted from a local SOCKS5 client
    Client,
    /// Opened to the destination requested by the peer gateway
    Destination,
}

/// SOCKS5 state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for method selection
    Closed,
    /// Method accepted, waiting for the CONNECT request
    AwaitingRequest,
    /// Waiting for the outcome of the CONNECT
    AwaitingConnect,
    /// Relaying data
    Connected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Closed => "closed",
            ConnState::AwaitingRequest => "awaiting request",
            ConnState::AwaitingConnect => "awaiting connect",
            ConnState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// One local TCP peer
#[derive(Debug)]
pub struct Connection {
    pub(super) id: ConnId,
    pub(super) stream: TcpStream,
    pub(super) token: Token,
    pub(super) peer: SocketAddr,
    pub(super) role: Role,
    pub(super) state: ConnState,
    pub(super) session: Option<SessionKey>,
    pub(super) pending: VecDeque<Packet>,
    /// Unparsed SOCKS5 handshake bytes
    pub(super) handshake: BytesMut,
    pub(super) timer: Option<TimerId>,
}

impl Connection {
    pub(super) fn new(
        id: ConnId,
        stream: TcpStream,
        token: Token,
        peer: SocketAddr,
        role: Role,
        state: ConnState,
    ) -> Self {
        Connection {
            id,
            stream,
            token,
            peer,
            role,
            state,
            session: None,
            pending: VecDeque::new(),
            handshake: BytesMut::new(),
            timer: None,
        }
    }

    /// Remote address of the socket
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Role of the connection
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Bound session, if any
    pub fn session(&self) -> Option<SessionKey> {
        self.session
    }

    /// Queue bytes for the local socket
    pub(super) fn queue(&mut self, bytes: &[u8]) {
        let mut packet = Packet::with_headroom(0, bytes);
        packet.set_owner(Owner::Connection(self.id));
        self.pending.push_back(packet);
    }

    fn wants_read(&self, paused: bool) -> bool {
        match self.state {
            ConnState::Closed | ConnState::AwaitingRequest => true,
            ConnState::AwaitingConnect => false,
            ConnState::Connected => !paused,
        }
    }

    fn wants_write(&self) -> bool {
        !self.pending.is_empty()
            || (self.role == Role::Destination && self.state == ConnState::AwaitingConnect)
    }

    /// Interest matching the connection's state
    pub(super) fn interest(&self, paused: bool) -> Interest {
        Interest::NONE
            .with_read(self.wants_read(paused))
            .with_write(self.wants_write())
    }

    /// Write queued packets until the socket would block
    pub(super) fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while let Some(front) = self.pending.front_mut() {
            match self.stream.try_write(front.payload()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    front.advance(n);
                    if front.is_empty() {
                        self.pending.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// Connections indexed by id, reactor token and session
#[derive(Debug, Default)]
pub struct ConnTable {
    conns: BTreeMap<ConnId, Connection>,
    by_token: HashMap<Token, ConnId>,
    by_session: HashMap<SessionKey, ConnId>,
    next_id: u64,
}

impl ConnTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a new connection
    pub fn next_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Add a connection, indexing its token and session
    pub fn insert(&mut self, conn: Connection) {
        self.by_token.insert(conn.token, conn.id);
        if let Some(session) = conn.session {
            self.by_session.insert(session, conn.id);
        }
        self.conns.insert(conn.id, conn);
    }

    /// Remove a connection and all of its index entries
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        self.by_token.remove(&conn.token);
        if let Some(session) = conn.session {
            self.by_session.remove(&session);
        }
        Some(conn)
    }

    /// Borrow a connection
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    /// Mutably borrow a connection
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Connection registered under `token`
    pub fn by_token(&self, token: Token) -> Option<ConnId> {
        self.by_token.get(&token).copied()
    }

    /// Connection bound to `session`
    pub fn by_session(&self, session: SessionKey) -> Option<ConnId> {
        self.by_session.get(&session).copied()
    }

    /// Bind `session` to connection `id`, replacing any previous binding
    pub fn bind_session(&mut self, id: ConnId, session: SessionKey) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if let Some(old) = conn.session.replace(session) {
                self.by_session.remove(&old);
            }
            self.by_session.insert(session, id);
        }
    }

    /// Forget the session of connection `id`
    pub fn unbind_session(&mut self, id: ConnId) -> Option<SessionKey> {
        let session = self.conns.get_mut(&id)?.session.take()?;
        self.by_session.remove(&session);
        Some(session)
    }

    /// Ids of all connections in ascending order
    pub fn ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
