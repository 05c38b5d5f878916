//! Pure2P NAT - automatic port mapping for Pure2P nodes
//!
//! This library inspects the transport addresses a node is listening on, asks the
//! local gateway to forward matching external ports to them and publishes the
//! resulting externally reachable addresses so remote peers can dial the node.
//!
//! The entry point is [`connectivity::NatManager`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;

pub use config::{FailurePolicy, NatConfig};
pub use connectivity::{
    AddressCandidate, AddressSink, AddressSource, HostCapabilities, MappingPass, NatManager,
    ObservedAddress, PassReport,
};

use std::net::IpAddr;

/// Result type alias for Pure2P NAT operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Pure2P NAT operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The gateway reported an external address that is itself not publicly routable
    #[error(
        "{address} is private - please set config.nat.externalIp to an externally routable IP or ensure you are not behind a double NAT"
    )]
    DoubleNat {
        /// The offending external address
        address: IpAddr,
    },

    /// Port mapping client failure (after retries)
    #[error("Port mapping error: {0}")]
    Mapping(#[from] connectivity::MappingError),

    /// An address could not be parsed or has the wrong family
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize the Pure2P NAT library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
