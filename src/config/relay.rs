//! SOCKS5 listener and relay configuration

use crate::helper::DEFAULT_CONNECT_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn default_socks_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_socks_port() -> u16 {
    34567
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Listener and tunnel connect settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the SOCKS5 server binds to
    #[serde(default = "default_socks_addr")]
    pub socks_addr: IpAddr,

    /// Port the SOCKS5 server binds to
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Time a CONNECT may wait for the peer gateway
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            socks_addr: default_socks_addr(),
            socks_port: default_socks_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RelayConfig {
    /// Socket address of the SOCKS5 listener
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.socks_addr, self.socks_port)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:34567".parse().unwrap());
        assert_eq!(config.connect_timeout_ms, 120_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_config_validate() {
        let config = RelayConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
