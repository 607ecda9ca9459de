//! Raw serial port link
//!
//! The port is opened non-blocking, switched to raw 8N1 mode at one of the
//! supported baud rates, and registered with the runtime through
//! [`AsyncFd`] so the reactor can wait on it like any socket.

use crate::reactor::{EventSource, Link};
use futures::task::noop_waker_ref;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Baud rates the modem supports
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [9600, 19200, 38400, 115200];

fn speed_for(baud: u32) -> Option<libc::speed_t> {
    match baud {
        9600 => Some(libc::B9600),
        19200 => Some(libc::B19200),
        38400 => Some(libc::B38400),
        115200 => Some(libc::B115200),
        _ => None,
    }
}

/// Put `fd` into raw mode at `baud` and drop any pending input
fn configure(fd: RawFd, baud: u32) -> io::Result<()> {
    let speed = speed_for(baud).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baud rate {}", baud),
        )
    })?;

    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(io::Error::last_os_error());
        }

        libc::cfmakeraw(&mut termios);
        termios.c_cflag = libc::CS8 | libc::CREAD | libc::CLOCAL;
        termios.c_cc[libc::VMIN] = 1;
        termios.c_cc[libc::VTIME] = 5;

        if libc::cfsetospeed(&mut termios, speed) != 0 || libc::cfsetispeed(&mut termios, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcflush(fd, libc::TCIFLUSH) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A serial port in raw non-blocking mode
#[derive(Debug)]
pub struct SerialPort {
    fd: AsyncFd<File>,
    path: PathBuf,
}

impl SerialPort {
    /// Open and configure the port at `path`
    pub fn open(path: &Path, baud: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;
        configure(file.as_raw_fd(), baud)?;
        debug!("Configured {} for {} baud raw mode", path.display(), baud);

        Ok(SerialPort {
            fd: AsyncFd::new(file)?,
            path: path.to_path_buf(),
        })
    }

    /// Path of the device node
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSource for SerialPort {
    fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.fd.poll_readable(cx)
    }

    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.fd.poll_writable(cx)
    }
}

impl Link for SerialPort {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.fd.poll_read_ready(&mut cx) {
            Poll::Ready(Ok(mut guard)) => match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => result,
                Err(_would_block) => Err(io::ErrorKind::WouldBlock.into()),
            },
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.fd.poll_write_ready(&mut cx) {
            Poll::Ready(Ok(mut guard)) => match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => result,
                Err(_would_block) => Err(io::ErrorKind::WouldBlock.into()),
            },
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}
