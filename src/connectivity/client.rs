//! Port mapping client capability
//!
//! Everything the NAT manager needs from a concrete port mapping protocol is the
//! three operations of [`PortMappingClient`]. The manager builds its client
//! lazily through a [`ClientFactory`] so tests and embedders can substitute their own.

use super::types::{MappingError, MappingRequest};
use crate::config::NatConfig;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Asynchronous port mapping operations offered by a gateway
#[async_trait]
pub trait PortMappingClient: Send + Sync {
    /// Forward `request.public_port` on the gateway to `request.private_port` locally
    async fn map(&self, request: MappingRequest) -> Result<(), MappingError>;

    /// Remove every mapping installed through this client and release it
    async fn destroy(&self) -> Result<(), MappingError>;

    /// External address of the gateway
    async fn external_ip(&self) -> Result<IpAddr, MappingError>;
}

#[async_trait]
impl<T: PortMappingClient + ?Sized> PortMappingClient for Arc<T> {
    async fn map(&self, request: MappingRequest) -> Result<(), MappingError> {
        (**self).map(request).await
    }

    async fn destroy(&self) -> Result<(), MappingError> {
        (**self).destroy().await
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        (**self).external_ip().await
    }
}

/// Settings a concrete client is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Description attached to the mapping entries
    pub description: String,
    /// Mapping lifetime in seconds
    pub ttl: u32,
    /// Renew mappings before they expire
    pub auto_update: bool,
    /// Gateway address, discovered when unset
    pub gateway: Option<Ipv4Addr>,
    /// Use NAT-PMP instead of UPnP
    pub enable_pmp: bool,
}

impl ClientOptions {
    /// Derive client options from the NAT configuration
    pub fn from_config(config: &NatConfig, description: String) -> Self {
        Self {
            description,
            ttl: config.ttl,
            auto_update: config.auto_update,
            gateway: config.gateway,
            enable_pmp: config.enable_pmp,
        }
    }
}

/// Builds port mapping clients on demand
pub trait ClientFactory: Send + Sync {
    /// Create a fresh client
    fn create(&self, options: &ClientOptions) -> Arc<dyn PortMappingClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(&ClientOptions) -> Arc<dyn PortMappingClient> + Send + Sync,
{
    fn create(&self, options: &ClientOptions) -> Arc<dyn PortMappingClient> {
        self(options)
    }
}
