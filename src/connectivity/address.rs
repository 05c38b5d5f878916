//! Listen address candidates and observed external addresses
//!
//! A node hands its bound transport addresses to the NAT manager through an
//! [`AddressSource`] and receives the externally reachable ones back through an
//! [`AddressSink`]. Addresses use the textual `/ip4/<host>/tcp/<port>` form.

use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// IP address family of a transport address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl Family {
    fn prefix(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ip4",
            Family::Ipv6 => "ip6",
        }
    }
}

/// A locally bound transport address that may be mapped on the gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressCandidate {
    /// Address family
    pub family: Family,
    /// Host part as it was bound (may be the unspecified address)
    pub host: String,
    /// Bound port
    pub port: u16,
    /// Lower-case transport name, e.g. `tcp`
    pub transport: String,
    /// False when further protocols are layered on top of host/port/transport
    pub thin_waist: bool,
}

impl AddressCandidate {
    /// Bare TCP candidate
    pub fn tcp(family: Family, host: impl Into<String>, port: u16) -> Self {
        Self {
            family,
            host: host.into(),
            port,
            transport: "tcp".to_string(),
            thin_waist: true,
        }
    }

    /// Whether the address is reducible to bare family/host/port/transport
    pub fn is_thin_waist(&self) -> bool {
        self.thin_waist
    }

    /// Whether the host is a loopback address
    pub fn is_loopback(&self) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback(),
            Err(_) => self.host.eq_ignore_ascii_case("localhost"),
        }
    }

    /// Whether the gateway should be asked to forward this address
    ///
    /// Only bare, non-loopback IPv4 TCP addresses qualify.
    pub fn is_eligible(&self) -> bool {
        self.is_thin_waist()
            && self.transport.eq_ignore_ascii_case("tcp")
            && self.family == Family::Ipv4
            && !self.is_loopback()
    }
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.family.prefix(),
            self.host,
            self.transport,
            self.port
        )
    }
}

impl FromStr for AddressCandidate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());

        let mut parts = s.strip_prefix('/').ok_or_else(invalid)?.split('/');

        let family = match parts.next() {
            Some("ip4") => Family::Ipv4,
            Some("ip6") => Family::Ipv6,
            _ => return Err(invalid()),
        };

        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        match (family, host.parse::<IpAddr>()) {
            (Family::Ipv4, Ok(IpAddr::V4(_))) | (Family::Ipv6, Ok(IpAddr::V6(_))) => {}
            _ => return Err(invalid()),
        }

        let transport = match parts.next() {
            Some(t @ ("tcp" | "udp")) => t.to_string(),
            _ => return Err(invalid()),
        };

        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(invalid)?;

        // Anything after the port (e.g. /ws, /p2p/<id>) is an encapsulation
        let thin_waist = parts.next().is_none();

        Ok(Self {
            family,
            host: host.to_string(),
            port,
            transport,
            thin_waist,
        })
    }
}

/// An address the node believes is reachable from the public internet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservedAddress {
    /// Always [`Family::Ipv4`]
    pub family: Family,
    /// External address of the gateway
    pub address: Ipv4Addr,
    /// Mapped port
    pub port: u16,
    /// Lower-case transport name
    pub transport: String,
}

impl ObservedAddress {
    /// Observed IPv4 address
    pub fn ipv4(address: Ipv4Addr, port: u16, transport: impl Into<String>) -> Self {
        Self {
            family: Family::Ipv4,
            address,
            port,
            transport: transport.into(),
        }
    }
}

impl fmt::Display for ObservedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.family.prefix(),
            self.address,
            self.transport,
            self.port
        )
    }
}

/// Supplies the node's bound transport addresses, in a stable order
pub trait AddressSource: Send + Sync {
    /// Current listen addresses
    fn addrs(&self) -> Vec<AddressCandidate>;
}

/// Receives externally reachable addresses discovered by the NAT manager
pub trait AddressSink: Send + Sync {
    /// Record a newly observed address
    fn add_observed_addr(&self, addr: ObservedAddress);
}

/// Fixed list of listen addresses
#[derive(Debug, Clone, Default)]
pub struct StaticAddressSource {
    addrs: Vec<AddressCandidate>,
}

impl StaticAddressSource {
    /// Create a source from already parsed candidates
    pub fn new(addrs: Vec<AddressCandidate>) -> Self {
        Self { addrs }
    }

    /// Parse candidates from their textual form
    pub fn parse<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addrs = addrs
            .into_iter()
            .map(|a| a.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { addrs })
    }
}

impl AddressSource for StaticAddressSource {
    fn addrs(&self) -> Vec<AddressCandidate> {
        self.addrs.clone()
    }
}

/// In-memory set of observed addresses, kept in insertion order
#[derive(Debug, Default)]
pub struct ObservedAddressBook {
    observed: RwLock<Vec<ObservedAddress>>,
}

impl ObservedAddressBook {
    /// Create an empty address book
    pub fn new() -> Self {
        Self::default()
    }

    /// All observed addresses
    pub fn observed(&self) -> Vec<ObservedAddress> {
        self.observed.read().clone()
    }

    /// Whether nothing has been observed yet
    pub fn is_empty(&self) -> bool {
        self.observed.read().is_empty()
    }
}

impl AddressSink for ObservedAddressBook {
    fn add_observed_addr(&self, addr: ObservedAddress) {
        let mut observed = self.observed.write();
        if !observed.contains(&addr) {
            observed.push(addr);
        }
    }
}
