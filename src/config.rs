//! NAT manager configuration
//!
//! The configuration is read from the `nat` section of a node config file. Keys
//! are camelCase:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "externalIp": "82.3.1.5",
//!   "description": "my-node",
//!   "ttl": 7200,
//!   "keepAlive": true,
//!   "gateway": "192.168.1.1",
//!   "pmp": { "enabled": false },
//!   "failurePolicy": "abortPass"
//! }
//! ```

use crate::{Error, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Default mapping lifetime in seconds
pub const DEFAULT_TTL_SECS: u32 = 7200;

/// What a mapping pass does when a single candidate fails to map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Stop the whole pass on the first failed mapping
    #[default]
    AbortPass,
    /// Log the failure and continue with the next candidate
    SkipCandidate,
}

/// NAT traversal configuration
///
/// Immutable once handed to a [`crate::NatManager`]; the manager keeps its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawNatConfig")]
pub struct NatConfig {
    /// Whether automatic port mapping is enabled at all
    pub enabled: bool,
    /// Externally routable address to advertise instead of asking the gateway
    pub external_ip: Option<Ipv4Addr>,
    /// Description attached to the gateway mapping entries
    pub description: Option<String>,
    /// Lifetime of each mapping in seconds
    pub ttl: u32,
    /// Renew mappings before they expire
    pub auto_update: bool,
    /// Gateway address; discovered from the routing table when unset
    pub gateway: Option<Ipv4Addr>,
    /// Use NAT-PMP instead of UPnP
    pub enable_pmp: bool,
    /// Failure isolation inside a mapping pass
    pub failure_policy: FailurePolicy,
}

impl NatConfig {
    /// Load the configuration from a JSON file
    ///
    /// Returns the default configuration if the file doesn't exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        Self::from_json(&data)
    }

    /// Parse the configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawNatConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// Description for the gateway mapping entries
    ///
    /// Falls back to `"{product}@{version} {identity}"` when none was configured.
    pub fn description_for(&self, identity: &str) -> String {
        match &self.description {
            Some(description) if !description.is_empty() => description.clone(),
            _ => format!(
                "{}@{} {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                identity
            ),
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            external_ip: None,
            description: None,
            ttl: DEFAULT_TTL_SECS,
            auto_update: true,
            gateway: None,
            enable_pmp: false,
            failure_policy: FailurePolicy::AbortPass,
        }
    }
}

/// On-disk shape of [`NatConfig`]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNatConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    external_ip: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_ttl")]
    ttl: u32,
    #[serde(default = "default_true")]
    keep_alive: bool,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    pmp: PmpSection,
    #[serde(default)]
    failure_policy: FailurePolicy,
}

#[derive(Debug, Default, Deserialize)]
struct PmpSection {
    #[serde(default)]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u32 {
    DEFAULT_TTL_SECS
}

fn parse_ipv4(key: &str, value: Option<String>) -> Result<Option<Ipv4Addr>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<Ipv4Addr>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be an IPv4 address, got {:?}", key, text))),
    }
}

impl TryFrom<RawNatConfig> for NatConfig {
    type Error = Error;

    fn try_from(raw: RawNatConfig) -> Result<Self> {
        Ok(Self {
            enabled: raw.enabled,
            external_ip: parse_ipv4("externalIp", raw.external_ip)?,
            description: raw.description,
            // A zero lifetime falls back to the default
            ttl: if raw.ttl == 0 { DEFAULT_TTL_SECS } else { raw.ttl },
            auto_update: raw.keep_alive,
            gateway: parse_ipv4("gateway", raw.gateway)?,
            enable_pmp: raw.pmp.enabled,
            failure_policy: raw.failure_policy,
        })
    }
}
