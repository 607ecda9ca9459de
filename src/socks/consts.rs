//! SOCKS5 protocol constants
//!
//! Only the subset the gateway speaks: no authentication, CONNECT, IPv4.

use std::net::Ipv4Addr;

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// No acceptable methods
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

// Commands
/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

// Address types
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;

/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

/// Length of an IPv4 CONNECT request
pub const CONNECT_REQUEST_LEN: usize = 10;

/// Length of an IPv4 reply
pub const REPLY_LEN: usize = 10;

/// Bound address reported in failure replies
pub const PLACEHOLDER_ADDR: Ipv4Addr = Ipv4Addr::new(0xFF, 0xFF, 0xFF, 0xFF);

/// Bound port reported in failure replies
pub const PLACEHOLDER_PORT: u16 = 0xFFFF;
