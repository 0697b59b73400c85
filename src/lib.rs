//! # Fog
//!
//! A client-side pluggable transport combiner. Fog launches obfuscation
//! proxies ("pluggable transports", PTs) as child processes and chains them
//! so that every application connection passes through each of them in turn
//! before reaching the bridge. Toward the controlling parent it behaves like
//! a single managed transport; toward each child it behaves like the
//! controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Controlling parent                     │
//! │       (managed-transport handshake over stdio/env)       │
//! ├──────────────────────────────────────────────────────────┤
//! │  controller: CMETHOD / CMETHOD-ERROR reporting           │
//! ├──────────────────────────────────────────────────────────┤
//! │  chain: SOCKSv4 interceptor, tail-to-head relay wiring   │
//! ├──────────────────────────────────────────────────────────┤
//! │  relay: single-use SOCKS relays between chain hops       │
//! ├──────────────────────────────────────────────────────────┤
//! │  pt: child supervision, CMETHOD status stream parsing    │
//! ├──────────────────────────────────────────────────────────┤
//! │  config: transport catalog and chain aliases             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! One inbound application connection on a chain `P1|P2|…|Pn` flows
//! interceptor → P1 → relay → P2 → … → Pn → bridge. Every relay accepts
//! exactly one connection and then closes its listening port.

pub mod chain;
pub mod config;
pub mod controller;
pub mod pt;
pub mod relay;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Transport error: {0}")]
    Pt(#[from] pt::PtError),

    #[error("SOCKS error: {0}")]
    Socks(#[from] relay::SocksError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Chain error: {0}")]
    Chain(#[from] chain::ChainError),

    #[error("Controller error: {0}")]
    Controller(#[from] controller::ControllerError),
}
