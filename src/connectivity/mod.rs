//! Connectivity module for gateway port mapping
//!
//! This module keeps a node reachable from behind a home router:
//! - [`NatManager`] - picks mappable listen addresses, maps them and publishes
//!   the external addresses
//! - [`RetryAdapter`] - retries flaky gateway operations with backoff
//! - [`GatewayClient`] - default client over UPnP IGD or NAT-PMP, with lease renewal
//!
//! Any other port mapping implementation can be plugged in through
//! [`PortMappingClient`] and [`ClientFactory`].

// Submodules
pub mod address;
pub mod cgnat;
pub mod client;
pub mod gateway;
pub mod gateway_client;
pub mod manager;
pub mod natpmp;
pub mod retry;
pub mod types;
pub mod upnp;

// Re-export commonly used types
pub use address::{
    AddressCandidate, AddressSink, AddressSource, Family, ObservedAddress, ObservedAddressBook,
    StaticAddressSource,
};
pub use client::{ClientFactory, ClientOptions, PortMappingClient};
pub use types::{IpProtocol, MappingError, MappingLease, MappingRequest};

// Re-export main functions
pub use cgnat::{detect_cgnat, is_private_ip};
pub use gateway::{find_default_gateway, resolve_gateway};
pub use retry::{FailedAttempt, FailureObserver, RetryAdapter, RetryPolicy, log_failed_attempt};

// Re-export clients and the manager
pub use gateway_client::{GatewayClient, GatewayClientFactory, MappingBackend};
pub use manager::{HostCapabilities, MappingPass, NatManager, PassReport};
pub use natpmp::NatPmpBackend;
pub use upnp::UpnpBackend;
