//! Non-blocking TCP plumbing for the reactor
//!
//! Listening, accepting and connecting never wait: each call either
//! completes immediately or reports `WouldBlock`/in-progress, and the
//! reactor picks the socket up again on readiness.

use futures::task::noop_waker_ref;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;
use tracing::debug;

/// Listen backlog for the SOCKS5 socket
const LISTEN_BACKLOG: i32 = 128;

/// Socket options applied to relay connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive idle time in seconds
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive probe interval in seconds
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply the options to a socket
    pub fn apply(&self, socket: SockRef<'_>) -> io::Result<()> {
        socket.set_nodelay(self.nodelay)?;
        if let (Some(time), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(time))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

/// Listening socket watched by the reactor
pub type Listener = AsyncFd<StdTcpListener>;

/// Bind a non-blocking listener with `SO_REUSEADDR`
pub fn bind_listener(addr: SocketAddr) -> io::Result<Listener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    AsyncFd::new(StdTcpListener::from(socket))
}

/// Accept one pending connection
///
/// Returns `WouldBlock` when the backlog is empty.
pub fn accept_nonblocking(listener: &Listener, opts: &SocketOpts) -> io::Result<(TcpStream, SocketAddr)> {
    let mut cx = Context::from_waker(noop_waker_ref());
    let accepted = match listener.poll_read_ready(&mut cx) {
        Poll::Ready(Ok(mut guard)) => match guard.try_io(|inner| inner.get_ref().accept()) {
            Ok(result) => result?,
            Err(_would_block) => return Err(io::ErrorKind::WouldBlock.into()),
        },
        Poll::Ready(Err(e)) => return Err(e),
        Poll::Pending => return Err(io::ErrorKind::WouldBlock.into()),
    };

    let (stream, peer) = accepted;
    stream.set_nonblocking(true)?;
    opts.apply(SockRef::from(&stream))?;
    Ok((TcpStream::from_std(stream)?, peer))
}

/// Start a TCP connect without waiting for it to complete
///
/// Completion shows up as write readiness; check it with
/// [`connect_result`].
pub fn connect_nonblocking(addr: SocketAddr, opts: &SocketOpts) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    opts.apply(SockRef::from(&socket))?;
    match socket.connect(&addr.into()) {
        Ok(()) => debug!("Connected to {} immediately", addr),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    TcpStream::from_std(socket.into())
}

/// Outcome of a non-blocking connect once the socket turned writable
pub fn connect_result(stream: &TcpStream) -> io::Result<()> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    stream.peer_addr().map(|_| ())
}
