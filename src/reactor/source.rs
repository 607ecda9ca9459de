//! Readiness sources and non-blocking links
//!
//! Anything the reactor waits on implements [`EventSource`]. Byte links that
//! the modem engine drives (a serial port in production, a Unix socket in
//! tests) additionally implement [`Link`].

use std::io;
use std::os::fd::AsRawFd;
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::net::{TcpStream, UnixStream};

/// A descriptor whose readiness the reactor can wait on
pub trait EventSource {
    /// Poll for read readiness
    fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Poll for write readiness
    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

/// A byte link with non-blocking reads and writes
///
/// Both calls return `WouldBlock` when the link is not ready; the caller
/// waits for the matching readiness through the reactor.
pub trait Link: EventSource + Send {
    /// Read available bytes; `Ok(0)` means the link was closed
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as many bytes as the link accepts
    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl EventSource for TcpStream {
    fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_read_ready(cx)
    }

    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_write_ready(cx)
    }
}

impl EventSource for UnixStream {
    fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_read_ready(cx)
    }

    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_write_ready(cx)
    }
}

impl<T: AsRawFd> EventSource for AsyncFd<T> {
    fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_read_ready(cx).map_ok(|_guard| ())
    }

    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_write_ready(cx).map_ok(|_guard| ())
    }
}

impl Link for UnixStream {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;

    #[tokio::test]
    async fn test_unix_link_read_write() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let mut buf = [0u8; 16];
        let err = a.read_nonblocking(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(b.write_nonblocking(b"$MMOKY").unwrap(), 6);
        poll_fn(|cx| EventSource::poll_readable(&a, cx)).await.unwrap();
        let n = a.read_nonblocking(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"$MMOKY");
    }

    #[tokio::test]
    async fn test_unix_link_reports_close() {
        let (mut a, b) = UnixStream::pair().unwrap();
        drop(b);
        poll_fn(|cx| EventSource::poll_readable(&a, cx)).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(a.read_nonblocking(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_source_stays_pending() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut task = tokio_test::task::spawn(poll_fn(|cx| EventSource::poll_readable(&a, cx)));
        tokio_test::assert_pending!(task.poll());
    }
}
