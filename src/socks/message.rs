//! SOCKS5 wire messages
//!
//! Parsing works on byte slices already read off a socket. Each parser
//! returns the number of bytes it consumed so the caller can keep any
//! trailing bytes for the next state.

use super::consts::*;
use crate::error::{Socks5Error, Socks5ReplyCode};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Method-selection message sent by a client first
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Methods offered by the client
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// Parse a method selection; returns the message and bytes consumed
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), Socks5Error> {
        let version = *buf.first().ok_or(Socks5Error::Truncated {
            expected: 2,
            actual: 0,
        })?;
        if version != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(version));
        }
        let count = *buf.get(1).ok_or(Socks5Error::Truncated {
            expected: 2,
            actual: buf.len(),
        })? as usize;
        let end = 2 + count;
        if buf.len() < end {
            return Err(Socks5Error::Truncated {
                expected: end,
                actual: buf.len(),
            });
        }
        Ok((
            MethodRequest {
                methods: buf[2..end].to_vec(),
            },
            end,
        ))
    }
}

/// Method-selection reply
pub fn method_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// IPv4 CONNECT request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   |    4     |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Destination to connect to
    pub target: SocketAddrV4,
}

impl ConnectRequest {
    /// Create a request for `target`
    pub fn new(target: SocketAddrV4) -> Self {
        ConnectRequest { target }
    }

    /// Parse a request; returns the request and bytes consumed
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), Socks5Error> {
        if buf.len() < 4 {
            return Err(Socks5Error::Truncated {
                expected: CONNECT_REQUEST_LEN,
                actual: buf.len(),
            });
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(buf[0]));
        }
        if buf[1] != SOCKS5_CMD_TCP_CONNECT {
            return Err(Socks5Error::CommandNotSupported(buf[1]));
        }
        if buf[2] != SOCKS5_RESERVED {
            return Err(Socks5Error::InvalidReserved(buf[2]));
        }
        if buf[3] != SOCKS5_ADDR_TYPE_IPV4 {
            return Err(Socks5Error::AddressTypeNotSupported(buf[3]));
        }
        if buf.len() < CONNECT_REQUEST_LEN {
            return Err(Socks5Error::Truncated {
                expected: CONNECT_REQUEST_LEN,
                actual: buf.len(),
            });
        }
        let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
        let port = u16::from_be_bytes([buf[8], buf[9]]);
        Ok((
            ConnectRequest::new(SocketAddrV4::new(ip, port)),
            CONNECT_REQUEST_LEN,
        ))
    }

    /// Wire form of the request
    pub fn encode(&self) -> [u8; CONNECT_REQUEST_LEN] {
        encode_fixed(
            SOCKS5_CMD_TCP_CONNECT,
            self.target.ip().octets(),
            self.target.port(),
        )
    }
}

impl fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CONNECT {}", self.target)
    }
}

/// Reply to a CONNECT request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Outcome
    pub code: Socks5ReplyCode,
    /// Address the destination socket is bound to
    pub bound: SocketAddrV4,
}

impl Reply {
    /// Successful reply carrying the real bound address
    pub fn success(bound: SocketAddrV4) -> Self {
        Reply {
            code: Socks5ReplyCode::Succeeded,
            bound,
        }
    }

    /// Failure reply with the all-ones placeholder address
    pub fn failure(code: Socks5ReplyCode) -> Self {
        Reply {
            code,
            bound: SocketAddrV4::new(PLACEHOLDER_ADDR, PLACEHOLDER_PORT),
        }
    }

    /// Whether the reply reports success
    pub fn is_success(&self) -> bool {
        self.code == Socks5ReplyCode::Succeeded
    }

    /// Wire form of the reply
    pub fn encode(&self) -> [u8; REPLY_LEN] {
        encode_fixed(self.code.into(), self.bound.ip().octets(), self.bound.port())
    }

    /// Parse a reply received from the peer gateway
    pub fn parse(buf: &[u8]) -> Result<Self, Socks5Error> {
        if buf.len() < REPLY_LEN {
            return Err(Socks5Error::Truncated {
                expected: REPLY_LEN,
                actual: buf.len(),
            });
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(buf[0]));
        }
        if buf[3] != SOCKS5_ADDR_TYPE_IPV4 {
            return Err(Socks5Error::AddressTypeNotSupported(buf[3]));
        }
        let code = Socks5ReplyCode::try_from(buf[1])?;
        let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
        let port = u16::from_be_bytes([buf[8], buf[9]]);
        Ok(Reply {
            code,
            bound: SocketAddrV4::new(ip, port),
        })
    }
}

fn encode_fixed(second: u8, ip: [u8; 4], port: u16) -> [u8; 10] {
    let port = port.to_be_bytes();
    [
        SOCKS5_VERSION,
        second,
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}
