//! CGNAT (Carrier-Grade NAT) detection
//!
//! An external address handed out by the gateway is only useful if the public
//! internet can reach it. These helpers classify addresses that can't, which is
//! how a double NAT is recognised.

use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};

/// CGNAT (RFC 6598) IP range: 100.64.0.0/10
const CGNAT_RANGE: ([u8; 4], u32) = ([100, 64, 0, 0], 10);

/// Detect if an external IP address is within CGNAT range
///
/// CGNAT (Carrier-Grade NAT) uses the shared address space 100.64.0.0/10
/// as defined in RFC 6598. If the gateway's external IP is in this range, the
/// ISP runs a NAT of its own and gateway port mappings can't make the node reachable.
///
/// # Arguments
///
/// * `external_ip` - The external IP address to check
///
/// # Returns
///
/// `true` if the IP is in CGNAT range, `false` otherwise
///
/// # Example
///
/// ```
/// use std::net::IpAddr;
/// use pure2p_nat::connectivity::detect_cgnat;
///
/// let cgnat_ip: IpAddr = "100.64.0.1".parse().unwrap();
/// assert!(detect_cgnat(cgnat_ip));
///
/// let public_ip: IpAddr = "203.0.113.5".parse().unwrap();
/// assert!(!detect_cgnat(public_ip));
/// ```
pub fn detect_cgnat(external_ip: IpAddr) -> bool {
    match external_ip {
        IpAddr::V4(ipv4) => {
            let is_cgnat = in_range(ipv4, CGNAT_RANGE.0, CGNAT_RANGE.1);

            if is_cgnat {
                warn!(
                    "CGNAT detected: External IP {} is in range 100.64.0.0/10. \
                     Gateway port mappings will not be reachable from the internet.",
                    ipv4
                );
            } else {
                debug!("External IP {} is not in CGNAT range", ipv4);
            }

            is_cgnat
        }
        IpAddr::V6(_) => false,
    }
}

/// IPv4 ranges that are never reachable from the public internet
///
/// (network, prefix length)
const NON_ROUTABLE_V4: &[([u8; 4], u32)] = &[
    ([0, 0, 0, 0], 8),       // "this" network
    ([10, 0, 0, 0], 8),      // RFC 1918
    CGNAT_RANGE,
    ([127, 0, 0, 0], 8),     // loopback
    ([169, 254, 0, 0], 16),  // link-local
    ([172, 16, 0, 0], 12),   // RFC 1918
    ([192, 0, 0, 0], 24),    // IETF protocol assignments
    ([192, 0, 2, 0], 24),    // TEST-NET-1
    ([192, 88, 99, 0], 24),  // 6to4 relay anycast
    ([192, 168, 0, 0], 16),  // RFC 1918
    ([198, 18, 0, 0], 15),   // benchmarking
    ([198, 51, 100, 0], 24), // TEST-NET-2
    ([203, 0, 113, 0], 24),  // TEST-NET-3
    ([224, 0, 0, 0], 3),     // multicast, reserved and broadcast
];

fn in_range(ip: Ipv4Addr, network: [u8; 4], prefix: u32) -> bool {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    (u32::from(ip) & mask) == (u32::from(Ipv4Addr::from(network)) & mask)
}

/// Check if an IP is a private/local address
///
/// An external address for which this returns `true` cannot be dialed from the
/// internet, which means the gateway itself sits behind another NAT.
///
/// # Arguments
///
/// * `ip` - The IP address to check
///
/// # Returns
///
/// `true` if the IP is private, shared (CGNAT), loopback, link-local, reserved
/// for documentation or otherwise not globally routable, `false` otherwise
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => NON_ROUTABLE_V4
            .iter()
            .any(|(network, prefix)| in_range(ipv4, *network, *prefix)),
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback() || ipv6.is_unspecified() || is_ipv6_private(&ipv6)
        }
    }
}

/// Check if an IPv6 address is private
fn is_ipv6_private(ipv6: &std::net::Ipv6Addr) -> bool {
    let segments = ipv6.segments();
    // ULA (Unique Local Address): fc00::/7
    (segments[0] & 0xfe00) == 0xfc00 ||
    // Link-local: fe80::/10
    (segments[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cgnat_in_range() {
        // Start of range
        let ip: IpAddr = "100.64.0.0".parse().unwrap();
        assert!(detect_cgnat(ip));

        // Middle of range
        let ip: IpAddr = "100.100.50.25".parse().unwrap();
        assert!(detect_cgnat(ip));

        // End of range
        let ip: IpAddr = "100.127.255.255".parse().unwrap();
        assert!(detect_cgnat(ip));
    }

    #[test]
    fn test_detect_cgnat_outside_range() {
        // Just before range
        let ip: IpAddr = "100.63.255.255".parse().unwrap();
        assert!(!detect_cgnat(ip));

        // Just after range
        let ip: IpAddr = "100.128.0.0".parse().unwrap();
        assert!(!detect_cgnat(ip));

        // Public IP
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(!detect_cgnat(ip));

        // Private IP (not CGNAT)
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(!detect_cgnat(ip));
    }

    #[test]
    fn test_detect_cgnat_ipv6() {
        // IPv6 should never be CGNAT
        let ip: IpAddr = "2001:4860:4860::8888".parse().unwrap();
        assert!(!detect_cgnat(ip));

        let ip: IpAddr = "::1".parse().unwrap();
        assert!(!detect_cgnat(ip));
    }

    #[test]
    fn test_is_private_ip_v4() {
        // RFC 1918 addresses
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));

        // Loopback
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));

        // Link-local
        assert!(is_private_ip("169.254.0.1".parse().unwrap()));

        // Public IPs
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("82.3.1.5".parse().unwrap()));

        // CGNAT shared space is not routable either
        assert!(is_private_ip("100.64.0.1".parse().unwrap()));

        // Unspecified, documentation and broadcast ranges
        assert!(is_private_ip("0.0.0.0".parse().unwrap()));
        assert!(is_private_ip("203.0.113.5".parse().unwrap()));
        assert!(is_private_ip("255.255.255.255".parse().unwrap()));

        // Edges of RFC 1918 172.16.0.0/12
        assert!(is_private_ip("172.31.255.255".parse().unwrap()));
        assert!(!is_private_ip("172.32.0.1".parse().unwrap()));
    }

    #[test]
    fn test_is_private_ip_v6() {
        // Loopback
        assert!(is_private_ip("::1".parse().unwrap()));

        // Link-local
        assert!(is_private_ip("fe80::1".parse().unwrap()));

        // ULA
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("fd00::1".parse().unwrap()));

        // Public IPv6
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }
}
