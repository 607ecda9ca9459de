//! Configuration module for the gateway
//!
//! The configuration is a flat set of keys. It is read either from the
//! line-oriented `key value` format (`uns.conf`) or, for a path ending in
//! `.toml`, from a TOML document with the same keys. Every key has a
//! default, so an empty file is a valid configuration.

mod log;
mod modem;
mod parser;
mod relay;

pub use log::LogConfig;
pub use modem::{ModemConfig, MIN_MTU};
pub use parser::{parse_lines, LineError};
pub use relay::RelayConfig;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// SOCKS5 listener settings
    #[serde(flatten)]
    pub relay: RelayConfig,

    /// Modem settings
    #[serde(flatten)]
    pub modem: ModemConfig,

    /// Log settings
    #[serde(flatten)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.relay.validate()?;
        self.modem.validate()?;
        Ok(())
    }
}

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config = if path.extension().is_some_and(|ext| ext == "toml") {
        parse_toml(&content)?
    } else {
        parse_config(&content)?
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration in {:?}: {}", path, e))?;
    Ok(config)
}

/// Load configuration, falling back to the defaults when `path` is missing
///
/// The flag is `false` when the defaults were used. A file that exists but
/// does not parse is still an error.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<(Config, bool)> {
    let path = path.as_ref();
    match std::fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((Config::default(), false)),
        _ => load_config(path).map(|config| (config, true)),
    }
}

/// Parse configuration from `key value` lines
pub fn parse_config(content: &str) -> Result<Config> {
    let table = parse_lines(content).with_context(|| "Failed to parse configuration")?;
    Config::deserialize(toml::Value::Table(table)).with_context(|| "Failed to parse configuration")
}

/// Parse configuration from a TOML string
pub fn parse_toml(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
