//! Gateway discovery for different platforms

use crate::connectivity::types::MappingError;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use tracing::debug;

/// Use the configured gateway, or look up the default route
pub fn resolve_gateway(configured: Option<Ipv4Addr>) -> Result<Ipv4Addr, MappingError> {
    match configured {
        Some(gateway) => Ok(gateway),
        None => {
            let gateway = find_default_gateway()?;
            debug!("Discovered default gateway {}", gateway);
            Ok(gateway)
        }
    }
}

/// Local IPv4 address used to reach the gateway
///
/// Connecting a UDP socket sends nothing, it only makes the OS pick the
/// outgoing interface.
pub fn local_ip_towards(gateway: Ipv4Addr) -> Result<Ipv4Addr, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(SocketAddr::new(gateway.into(), 9))?;

    match socket.local_addr()? {
        SocketAddr::V4(local) if !local.ip().is_unspecified() => Ok(*local.ip()),
        other => Err(MappingError::Internal(format!(
            "No usable IPv4 interface towards {} (got {})",
            gateway, other
        ))),
    }
}

/// Find the default gateway IPv4 address
///
/// On Linux it reads the kernel routing table, on macOS and Windows it parses
/// the output of the platform routing tools.
pub fn find_default_gateway() -> Result<Ipv4Addr, MappingError> {
    #[cfg(target_os = "linux")]
    {
        find_gateway_linux()
    }

    #[cfg(target_os = "macos")]
    {
        find_gateway_macos()
    }

    #[cfg(target_os = "windows")]
    {
        find_gateway_windows()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(MappingError::NotSupported)
    }
}

#[cfg(target_os = "linux")]
fn find_gateway_linux() -> Result<Ipv4Addr, MappingError> {
    use std::fs;

    // Read /proc/net/route
    let route_table = fs::read_to_string("/proc/net/route")
        .map_err(|e| MappingError::Internal(format!("Failed to read route table: {}", e)))?;

    default_route_from_table(&route_table).ok_or(MappingError::NoGateway)
}

/// Gateway of the default route in a `/proc/net/route` dump
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn default_route_from_table(route_table: &str) -> Option<Ipv4Addr> {
    for line in route_table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }

        // Default route has destination 00000000
        if fields[1] == "00000000" {
            // Gateway is stored as little-endian hex
            let gateway_hex = fields[2];
            if let Some(ip) = parse_route_hex(gateway_hex) {
                return Some(ip);
            }
        }
    }

    None
}

fn parse_route_hex(hex: &str) -> Option<Ipv4Addr> {
    let value = u32::from_str_radix(hex, 16).ok()?;
    let ip = Ipv4Addr::from(value.to_le_bytes());
    (!ip.is_unspecified()).then_some(ip)
}

#[cfg(target_os = "macos")]
fn find_gateway_macos() -> Result<Ipv4Addr, MappingError> {
    use std::process::Command;

    // Use netstat command
    let output = Command::new("netstat")
        .args(["-rn", "-f", "inet"])
        .output()
        .map_err(|e| MappingError::Internal(format!("Failed to run netstat: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        if line.starts_with("default") {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 2 {
                if let Ok(ip) = fields[1].parse::<Ipv4Addr>() {
                    return Ok(ip);
                }
            }
        }
    }

    Err(MappingError::NoGateway)
}

#[cfg(target_os = "windows")]
fn find_gateway_windows() -> Result<Ipv4Addr, MappingError> {
    use std::process::Command;

    // Use route print command
    let output = Command::new("route")
        .args(["print", "0.0.0.0"])
        .output()
        .map_err(|e| MappingError::Internal(format!("Failed to run route: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("0.0.0.0") {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 3 {
                if let Ok(ip) = fields[2].parse::<Ipv4Addr>() {
                    return Ok(ip);
                }
            }
        }
    }

    Err(MappingError::NoGateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";

    #[test]
    fn test_default_route_from_table() {
        assert_eq!(
            default_route_from_table(ROUTE_TABLE),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
    }

    #[test]
    fn test_default_route_missing() {
        let table = "Iface\tDestination\tGateway\neth0\t0000A8C0\t00000000\n";
        assert_eq!(default_route_from_table(table), None);
    }

    #[test]
    fn test_resolve_configured_gateway() {
        let gateway = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(resolve_gateway(Some(gateway)).unwrap(), gateway);
    }
}
