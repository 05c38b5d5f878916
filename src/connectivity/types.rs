//! Common types for connectivity module

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP protocol
    TCP = 6,
    /// UDP protocol
    UDP = 17,
}

impl IpProtocol {
    /// Upper-case protocol name as gateways expect it
    pub fn as_str(&self) -> &'static str {
        match self {
            IpProtocol::TCP => "TCP",
            IpProtocol::UDP => "UDP",
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpProtocol {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(IpProtocol::TCP),
            "UDP" => Ok(IpProtocol::UDP),
            other => Err(MappingError::Internal(format!(
                "Unknown transport protocol: {}",
                other
            ))),
        }
    }
}

/// A request to forward an external port on the gateway to a local port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingRequest {
    /// Port opened on the gateway's external interface
    pub public_port: u16,
    /// Local port the traffic is forwarded to
    pub private_port: u16,
    /// Transport protocol of the mapping
    pub protocol: IpProtocol,
}

impl MappingRequest {
    /// Mapping whose external port equals the local port
    pub fn same_port(port: u16, protocol: IpProtocol) -> Self {
        Self {
            public_port: port,
            private_port: port,
            protocol,
        }
    }
}

/// A mapping installed on the gateway, kept for renewal and cleanup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingLease {
    /// The installed mapping
    pub request: MappingRequest,
    /// Lifetime granted for the mapping in seconds
    pub lifetime_secs: u32,
    /// Timestamp when the mapping was last (re)installed (Unix milliseconds)
    pub created_at_ms: i64,
}

impl MappingLease {
    /// Record a mapping installed just now
    pub fn new(request: MappingRequest, lifetime_secs: u32) -> Self {
        Self {
            request,
            lifetime_secs,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Unix milliseconds at which the gateway drops the mapping
    pub fn expires_at_ms(&self) -> i64 {
        self.created_at_ms + i64::from(self.lifetime_secs) * 1000
    }

    /// Whether the lease has run out at the given time
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.lifetime_secs > 0 && now_ms >= self.expires_at_ms()
    }
}

/// Errors that can occur during port mapping
#[derive(Debug, Error)]
pub enum MappingError {
    /// Network timeout waiting for response
    #[error("Mapping request timed out")]
    Timeout,

    /// Invalid response from gateway
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Gateway returned an error
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// No gateway found on network
    #[error("No gateway found")]
    NoGateway,

    /// The requested external port is already mapped to another host
    #[error("Port {0} is already in use on the gateway")]
    PortInUse(u16),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol not supported by gateway
    #[error("Protocol not supported")]
    NotSupported,

    /// The client was destroyed while an operation was pending
    #[error("Port mapping client has been destroyed")]
    ClientDestroyed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MappingError {
    /// Whether repeating the operation may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, MappingError::ClientDestroyed | MappingError::NotSupported)
    }
}
