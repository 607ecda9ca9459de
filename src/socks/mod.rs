//! SOCKS5 protocol subset spoken by the gateway
//!
//! Method negotiation always selects "no authentication"; the only command
//! is CONNECT with an IPv4 destination.

pub mod consts;
mod message;

pub use consts::*;
pub use message::{method_reply, ConnectRequest, MethodRequest, Reply};
