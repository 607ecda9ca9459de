//! # uns-gateway - SOCKS5 over an acoustic modem
//!
//! uns-gateway exposes a SOCKS5 server to local TCP clients and carries
//! their connections to a peer gateway across a half-duplex AquaSent modem
//! link. The modem accepts one transmission at a time and acknowledges it
//! in two stages, so every frame waits for a transmit ack and a delivery
//! notification before the next one goes out.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use uns_gateway::config::load_config;
//! use uns_gateway::run_gateway;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("uns.conf")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_gateway(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Everything runs on one thread. A readiness [`reactor`] multiplexes the
//! listener, the client sockets and the serial port, and fires one-shot
//! timers. Frames pass through these layers:
//!
//! ```text
//! SOCKS5 client <-> relay <-> MAC <-> AquaSent device <-> modem ~~~ peer gateway
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod helper;
pub mod logging;
pub mod mac;
pub mod net;
pub mod packet;
pub mod reactor;
pub mod relay;
pub mod socks;

// Re-export commonly used items
pub use config::{load_config, load_config_or_default, Config};
pub use error::{GatewayError, Socks5Error};
pub use gateway::{run_gateway, Gateway, TimerKind};

/// Version of the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
