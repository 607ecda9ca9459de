//! Helper utilities for the gateway
//!
//! Shared constants and small conversions used throughout the crate.

use std::time::Duration;

/// Bytes reserved in front of every outbound payload for lower-layer headers
/// (MAC header plus tunnel header).
pub const PACKET_HEADROOM: usize = crate::mac::MAC_HEADER_LEN + crate::relay::TUNNEL_HEADER_LEN;

/// Largest payload the relay reads from one local socket in one go
pub const APP_MAX_LENGTH: usize = 1024;

/// Default modem MTU in bytes
pub const DEFAULT_MTU: usize = 1024;

/// Fixed overhead of a modem command line on top of the hex payload
pub const MODEM_LINE_OVERHEAD: usize = 300;

/// Number of frames queued on a device before the relay stops reading clients
pub const MAX_DEVICE_BACKLOG: usize = 8;

/// Default handshake timeout for one modem transmission in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 60_000;

/// Default timeout for a pending tunnel connect in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 120_000;

/// Parse duration from milliseconds
pub fn duration_from_millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Capacity of the modem line buffer for a given MTU
pub fn modem_line_capacity(mtu: usize) -> usize {
    mtu * 2 + MODEM_LINE_OVERHEAD
}
