//! UPnP IGD (Internet Gateway Device) port mapping backend
//!
//! Gateway discovery (SSDP) and the SOAP calls are handled by `igd-next`. Its
//! blocking API runs on the blocking thread pool; the discovered gateway is
//! cached until an operation against it fails.

use super::gateway::local_ip_towards;
use super::gateway_client::MappingBackend;
use super::types::{IpProtocol, MappingError, MappingRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for UPnP operations
const UPNP_TIMEOUT: Duration = Duration::from_secs(5);

/// SSDP multicast port
const SSDP_PORT: u16 = 1900;

fn upnp_protocol(protocol: IpProtocol) -> igd_next::PortMappingProtocol {
    match protocol {
        IpProtocol::TCP => igd_next::PortMappingProtocol::TCP,
        IpProtocol::UDP => igd_next::PortMappingProtocol::UDP,
    }
}

/// Search for an IGD gateway, asking `configured` directly when set
fn search_gateway(configured: Option<Ipv4Addr>) -> Result<igd_next::Gateway, MappingError> {
    let mut options = igd_next::SearchOptions {
        timeout: Some(UPNP_TIMEOUT),
        ..Default::default()
    };
    if let Some(gateway) = configured {
        options.broadcast_address = SocketAddr::new(IpAddr::V4(gateway), SSDP_PORT);
    }

    debug!("Searching for UPnP IGD gateway...");
    let gateway = igd_next::search_gateway(options).map_err(|e| {
        debug!("UPnP gateway search failed: {}", e);
        MappingError::NoGateway
    })?;

    debug!("Found UPnP gateway at {}", gateway.addr);
    Ok(gateway)
}

/// Blocking AddPortMapping, replacing a stale entry for the same port once
fn add_port_blocking(
    gateway: &igd_next::Gateway,
    request: MappingRequest,
    lifetime_secs: u32,
    description: &str,
) -> Result<(), MappingError> {
    let gateway_ip = match gateway.addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => {
            return Err(MappingError::Internal(
                "UPnP requires an IPv4 gateway".to_string(),
            ));
        }
    };
    let local_addr = SocketAddr::new(IpAddr::V4(local_ip_towards(gateway_ip)?), request.private_port);
    let protocol = upnp_protocol(request.protocol);

    debug!(
        "Adding port mapping: {} -> {} ({}s)",
        request.public_port, local_addr, lifetime_secs
    );

    for _ in 0..2 {
        match gateway.add_port(protocol, request.public_port, local_addr, lifetime_secs, description) {
            Ok(()) => return Ok(()),
            Err(igd_next::AddPortError::PortInUse) => {
                debug!(
                    "UPnP port {} in use, attempting to remap",
                    request.public_port
                );
                gateway
                    .remove_port(protocol, request.public_port)
                    .map_err(|_| MappingError::PortInUse(request.public_port))?;
            }
            Err(e) => {
                warn!("UPnP AddPortMapping failed: {}", e);
                return Err(MappingError::GatewayError(format!(
                    "AddPortMapping failed: {}",
                    e
                )));
            }
        }
    }

    Err(MappingError::PortInUse(request.public_port))
}

/// Port mapping through a UPnP Internet Gateway Device
pub struct UpnpBackend {
    configured_gateway: Option<Ipv4Addr>,
    cached_gateway: Mutex<Option<igd_next::Gateway>>,
}

impl UpnpBackend {
    /// Create a backend; the gateway is discovered on first use
    pub fn new(configured_gateway: Option<Ipv4Addr>) -> Self {
        Self {
            configured_gateway,
            cached_gateway: Mutex::new(None),
        }
    }

    /// Run a blocking gateway operation on the blocking thread pool
    async fn with_gateway<T, F>(&self, op: F) -> Result<T, MappingError>
    where
        F: FnOnce(&igd_next::Gateway) -> Result<T, MappingError> + Send + 'static,
        T: Send + 'static,
    {
        let cached = self.cached_gateway.lock().clone();
        let configured = self.configured_gateway;

        let (gateway, result) = tokio::task::spawn_blocking(move || {
            let gateway = match cached {
                Some(gateway) => gateway,
                None => search_gateway(configured)?,
            };
            let result = op(&gateway);
            Ok::<_, MappingError>((gateway, result))
        })
        .await
        .map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))??;

        // Forget the gateway on failure so the next attempt searches again
        *self.cached_gateway.lock() = if result.is_ok() { Some(gateway) } else { None };

        result
    }
}

#[async_trait]
impl MappingBackend for UpnpBackend {
    fn name(&self) -> &'static str {
        "UPnP"
    }

    async fn add_mapping(
        &self,
        request: MappingRequest,
        lifetime_secs: u32,
        description: &str,
    ) -> Result<u32, MappingError> {
        info!(
            "Attempting UPnP mapping for port {} (lifetime: {}s, protocol: {})",
            request.public_port, lifetime_secs, request.protocol
        );

        let description = description.to_string();
        self.with_gateway(move |gateway| {
            add_port_blocking(gateway, request, lifetime_secs, &description)
        })
        .await?;

        info!(
            "UPnP mapping successful: port {} (lifetime: {}s)",
            request.public_port, lifetime_secs
        );
        Ok(lifetime_secs)
    }

    async fn remove_mapping(&self, request: MappingRequest) -> Result<(), MappingError> {
        info!(
            "Deleting UPnP mapping for port {} (protocol: {})",
            request.public_port, request.protocol
        );

        self.with_gateway(move |gateway| {
            gateway
                .remove_port(upnp_protocol(request.protocol), request.public_port)
                .map_err(|e| MappingError::GatewayError(format!("DeletePortMapping failed: {}", e)))
        })
        .await
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.with_gateway(|gateway| {
            gateway
                .get_external_ip()
                .map_err(|e| MappingError::GatewayError(format!("GetExternalIPAddress failed: {}", e)))
        })
        .await
    }
}
