//! Modem link configuration

use crate::device::serial::SUPPORTED_BAUD_RATES;
use crate::device::DeviceName;
use crate::helper::{DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_MTU};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest MTU that still leaves room for a useful payload
pub const MIN_MTU: usize = 64;

fn default_port() -> PathBuf {
    PathBuf::from("/dev/ttyUSB0")
}

fn default_baud() -> u32 {
    115_200
}

fn default_name() -> DeviceName {
    DeviceName::new(*b"AM")
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

/// AquaSent modem settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ModemConfig {
    /// Serial device path
    #[serde(default = "default_port")]
    pub aquasent_port: PathBuf,

    /// Serial line speed
    #[serde(default = "default_baud")]
    pub aquasent_baud: u32,

    /// Logical device name
    #[serde(default = "default_name")]
    pub aquasent_name: DeviceName,

    /// Largest frame handed to the modem
    #[serde(default = "default_mtu")]
    pub aquasent_mtu: usize,

    /// Link-local address
    #[serde(default)]
    pub aquasent_ip_addr: u8,

    /// Network mask
    #[serde(default)]
    pub aquasent_netmask: u8,

    /// Gateway address
    #[serde(default)]
    pub aquasent_gateway: u8,

    /// MAC address, used as the MAC layer source
    #[serde(default)]
    pub aquasent_mac_addr: u8,

    /// Time allowed for ack and delivery of one transmission
    #[serde(default = "default_handshake_timeout_ms")]
    pub aquasent_handshake_timeout_ms: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        ModemConfig {
            aquasent_port: default_port(),
            aquasent_baud: default_baud(),
            aquasent_name: default_name(),
            aquasent_mtu: default_mtu(),
            aquasent_ip_addr: 0,
            aquasent_netmask: 0,
            aquasent_gateway: 0,
            aquasent_mac_addr: 0,
            aquasent_handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ModemConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !SUPPORTED_BAUD_RATES.contains(&self.aquasent_baud) {
            return Err(format!(
                "aquasent_baud {} is not one of {:?}",
                self.aquasent_baud, SUPPORTED_BAUD_RATES
            ));
        }
        if self.aquasent_mtu < MIN_MTU {
            return Err(format!(
                "aquasent_mtu {} is below the minimum of {}",
                self.aquasent_mtu, MIN_MTU
            ));
        }
        if self.aquasent_handshake_timeout_ms == 0 {
            return Err("aquasent_handshake_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}
