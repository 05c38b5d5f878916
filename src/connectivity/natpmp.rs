//! NAT-PMP (NAT Port Mapping Protocol) backend - RFC 6886
//!
//! NAT-PMP is a legacy protocol supported by older routers, particularly Apple AirPort
//! devices and some Cisco routers. Requests go over UDP to port 5351 of the gateway.
//!
//! Only the two requests the NAT manager needs are implemented: the external
//! address request (opcode 0) and port mapping (opcodes 1 and 2). A mapping is
//! removed by requesting it again with a lifetime of zero.

use super::gateway::resolve_gateway;
use super::gateway_client::MappingBackend;
use super::types::{IpProtocol, MappingError, MappingRequest};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// NAT-PMP server port (IANA assigned)
const NATPMP_SERVER_PORT: u16 = 5351;

/// NAT-PMP protocol version
pub(crate) const NATPMP_VERSION: u8 = 0;

/// Default timeout for NAT-PMP requests
const NATPMP_TIMEOUT: Duration = Duration::from_secs(2);

/// Size of a MAP response
const MAP_RESPONSE_LEN: usize = 16;

/// Size of an external address response
const EXTERNAL_ADDRESS_RESPONSE_LEN: usize = 12;

/// NAT-PMP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum NatPmpOpcode {
    /// External address request
    ExternalAddress = 0,
    /// UDP port mapping
    MapUdp = 1,
    /// TCP port mapping
    MapTcp = 2,
}

impl NatPmpOpcode {
    fn for_protocol(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::UDP => NatPmpOpcode::MapUdp,
            IpProtocol::TCP => NatPmpOpcode::MapTcp,
        }
    }

    /// Opcode the gateway answers with
    fn response(self) -> u8 {
        128 + self as u8
    }
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum NatPmpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    pub(crate) fn to_error(self) -> MappingError {
        match self {
            Self::UnsupportedVersion | Self::UnsupportedOpcode => MappingError::NotSupported,
            Self::NotAuthorized => MappingError::GatewayError("Not authorized/refused".to_string()),
            Self::NetworkFailure => MappingError::GatewayError("Network failure".to_string()),
            Self::OutOfResources => MappingError::GatewayError("Out of resources".to_string()),
            Self::Success => MappingError::Internal("Success is not an error".to_string()),
        }
    }
}

/// Mapping granted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NatPmpMapping {
    pub(crate) internal_port: u16,
    pub(crate) external_port: u16,
    pub(crate) lifetime_secs: u32,
}

/// Build a NAT-PMP MAP request packet
pub(crate) fn build_natpmp_map_request(
    internal_port: u16,
    suggested_external_port: u16,
    lifetime_secs: u32,
    protocol: IpProtocol,
) -> [u8; 12] {
    let mut request = [0u8; 12];
    request[0] = NATPMP_VERSION;
    request[1] = NatPmpOpcode::for_protocol(protocol) as u8;
    // bytes 2-3 reserved
    request[4..6].copy_from_slice(&internal_port.to_be_bytes());
    request[6..8].copy_from_slice(&suggested_external_port.to_be_bytes());
    request[8..12].copy_from_slice(&lifetime_secs.to_be_bytes());
    request
}

/// Check version, opcode and result code of a response header
fn check_response_header(response: &[u8], expected_opcode: u8) -> Result<(), MappingError> {
    let version = response[0];
    if version != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse(format!(
            "Invalid version: {} (expected {})",
            version, NATPMP_VERSION
        )));
    }

    let opcode = response[1];
    if opcode != expected_opcode {
        return Err(MappingError::InvalidResponse(format!(
            "Unexpected opcode: {} (expected {})",
            opcode, expected_opcode
        )));
    }

    let result_code = u16::from_be_bytes([response[2], response[3]]);
    match NatPmpResultCode::from_u16(result_code) {
        Some(NatPmpResultCode::Success) => Ok(()),
        Some(code) => Err(code.to_error()),
        None => Err(MappingError::InvalidResponse(format!(
            "Unknown result code: {}",
            result_code
        ))),
    }
}

/// Parse a NAT-PMP MAP response packet
pub(crate) fn parse_natpmp_map_response(
    response: &[u8],
    protocol: IpProtocol,
) -> Result<NatPmpMapping, MappingError> {
    if response.len() < MAP_RESPONSE_LEN {
        return Err(MappingError::InvalidResponse(format!(
            "Response too short: {} bytes (expected {})",
            response.len(),
            MAP_RESPONSE_LEN
        )));
    }

    check_response_header(response, NatPmpOpcode::for_protocol(protocol).response())?;

    // bytes 4-7: seconds since the gateway's mapping table was initialized
    Ok(NatPmpMapping {
        internal_port: u16::from_be_bytes([response[8], response[9]]),
        external_port: u16::from_be_bytes([response[10], response[11]]),
        lifetime_secs: u32::from_be_bytes([response[12], response[13], response[14], response[15]]),
    })
}

/// Parse a NAT-PMP external address response packet
pub(crate) fn parse_natpmp_external_address_response(
    response: &[u8],
) -> Result<Ipv4Addr, MappingError> {
    if response.len() < EXTERNAL_ADDRESS_RESPONSE_LEN {
        return Err(MappingError::InvalidResponse(format!(
            "External IP response too short: {} bytes",
            response.len()
        )));
    }

    check_response_header(response, NatPmpOpcode::ExternalAddress.response())?;

    Ok(Ipv4Addr::new(
        response[8],
        response[9],
        response[10],
        response[11],
    ))
}

/// Port mapping through a NAT-PMP gateway
pub struct NatPmpBackend {
    configured_gateway: Option<Ipv4Addr>,
}

impl NatPmpBackend {
    /// Create a backend; without a configured gateway the default route is used
    pub fn new(configured_gateway: Option<Ipv4Addr>) -> Self {
        Self { configured_gateway }
    }

    /// Send one request and wait for the reply
    async fn exchange(&self, request: &[u8], response: &mut [u8]) -> Result<usize, MappingError> {
        let gateway = resolve_gateway(self.configured_gateway)?;
        let server_addr = SocketAddr::new(IpAddr::V4(gateway), NATPMP_SERVER_PORT);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server_addr).await?;
        socket.send(request).await?;
        debug!("Sent NAT-PMP request (opcode {}) to {}", request[1], server_addr);

        let received = tokio::time::timeout(NATPMP_TIMEOUT, socket.recv(response))
            .await
            .map_err(|_| MappingError::Timeout)??;

        debug!("Received {} bytes from NAT-PMP server", received);
        Ok(received)
    }

    async fn request_mapping(
        &self,
        request: MappingRequest,
        lifetime_secs: u32,
    ) -> Result<NatPmpMapping, MappingError> {
        let packet = build_natpmp_map_request(
            request.private_port,
            request.public_port,
            lifetime_secs,
            request.protocol,
        );
        let mut response = [0u8; MAP_RESPONSE_LEN];
        let received = self.exchange(&packet, &mut response).await?;
        parse_natpmp_map_response(&response[..received], request.protocol)
    }
}

#[async_trait]
impl MappingBackend for NatPmpBackend {
    fn name(&self) -> &'static str {
        "NAT-PMP"
    }

    async fn add_mapping(
        &self,
        request: MappingRequest,
        lifetime_secs: u32,
        _description: &str,
    ) -> Result<u32, MappingError> {
        info!(
            "Attempting NAT-PMP mapping for port {} (lifetime: {}s, protocol: {})",
            request.public_port, lifetime_secs, request.protocol
        );

        let mapping = self.request_mapping(request, lifetime_secs).await?;

        if mapping.external_port != request.public_port {
            // The gateway picked another port; give it back rather than advertise it
            if let Err(e) = self.remove_mapping(request).await {
                debug!("Failed to release NAT-PMP port {}: {}", mapping.external_port, e);
            }
            return Err(MappingError::PortInUse(request.public_port));
        }

        info!(
            "NAT-PMP mapping successful: port {} (lifetime: {}s)",
            mapping.external_port, mapping.lifetime_secs
        );
        Ok(mapping.lifetime_secs)
    }

    async fn remove_mapping(&self, request: MappingRequest) -> Result<(), MappingError> {
        info!(
            "Deleting NAT-PMP mapping for port {} (protocol: {})",
            request.private_port, request.protocol
        );

        let removal = MappingRequest {
            public_port: 0,
            ..request
        };
        self.request_mapping(removal, 0).await.map(|_| ())
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        let packet = [NATPMP_VERSION, NatPmpOpcode::ExternalAddress as u8];
        let mut response = [0u8; EXTERNAL_ADDRESS_RESPONSE_LEN];
        let received = self.exchange(&packet, &mut response).await?;
        parse_natpmp_external_address_response(&response[..received]).map(IpAddr::V4)
    }
}
