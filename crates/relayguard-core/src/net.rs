//! Address classification helpers

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IANA-reserved IPv4 ranges that never appear as peer addresses.
/// Sources in one of these are rejected before any evaluation.
const RESERVED_V4: &[(u32, u8)] = &[
    (0x0000_0000, 8),   // 0.0.0.0/8
    (0x0A00_0000, 8),   // 10.0.0.0/8
    (0x6440_0000, 10),  // 100.64.0.0/10
    (0x7F00_0000, 8),   // 127.0.0.0/8
    (0xA9FE_0000, 16),  // 169.254.0.0/16
    (0xAC10_0000, 12),  // 172.16.0.0/12
    (0xC000_0000, 24),  // 192.0.0.0/24
    (0xC0A8_0000, 16),  // 192.168.0.0/16
    (0xC612_0000, 15),  // 198.18.0.0/15
    (0xE000_0000, 4),   // 224.0.0.0/4
    (0xF000_0000, 4),   // 240.0.0.0/4
];
// The RFC 5737 documentation ranges are deliberately absent, matching
// the IPv6 side: documentation addresses evaluate like any other peer.

fn v4_in(addr: Ipv4Addr, net: u32, prefix: u8) -> bool {
    let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
    (u32::from(addr) & mask) == (net & mask)
}

/// Whether an address belongs to a LAN range (private, loopback, link-local)
pub fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Whether an address falls in any IANA-reserved range
pub fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => RESERVED_V4
            .iter()
            .any(|&(net, prefix)| v4_in(v4, net, prefix)),
        IpAddr::V6(v6) => is_lan(IpAddr::V6(v6)) || (v6.segments()[0] & 0xff00) == 0xff00,
    }
}

/// Whether an IPv4 CIDR overlaps a reserved range
pub fn v4_net_reserved(net: &Ipv4Net) -> bool {
    RESERVED_V4.iter().any(|&(res_net, res_prefix)| {
        let reserved = Ipv4Net::new(Ipv4Addr::from(res_net), res_prefix).unwrap();
        reserved.contains(&net.network()) || net.contains(&reserved.network())
    })
}

/// The abuse-accounting CIDR a source address belongs to:
/// /25 for IPv4, /52 for IPv6
pub fn abuse_cidr(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new(v4, 25).unwrap().trunc()),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new(v6, 52).unwrap().trunc()),
    }
}

/// Reversed query labels for an address under a DNS-list zone:
/// octets for IPv4, nibbles for IPv6
pub fn reverse_labels(ip: IpAddr) -> Vec<String> {
    match ip {
        IpAddr::V4(v4) => v4.octets().iter().rev().map(|o| o.to_string()).collect(),
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0f));
                labels.push(format!("{:x}", byte >> 4));
            }
            labels
        }
    }
}

/// Parse reversed labels back into an address, the inverse of
/// [`reverse_labels`]
pub fn parse_reverse_labels(labels: &[&str]) -> Option<IpAddr> {
    match labels.len() {
        4 => {
            let mut octets = [0u8; 4];
            for (i, label) in labels.iter().rev().enumerate() {
                octets[i] = label.parse().ok()?;
            }
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, pair) in labels.rchunks(2).enumerate() {
                let lo = u8::from_str_radix(pair[0], 16).ok()?;
                let hi = u8::from_str_radix(pair[1], 16).ok()?;
                octets[i] = (hi << 4) | lo;
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lan_and_reserved() {
        assert!(is_lan("10.1.2.3".parse().unwrap()));
        assert!(is_lan("127.0.0.1".parse().unwrap()));
        assert!(is_lan("fe80::1".parse().unwrap()));
        assert!(!is_lan("203.0.113.7".parse().unwrap()));

        assert!(is_reserved("198.18.0.1".parse().unwrap()));
        assert!(is_reserved("240.0.0.1".parse().unwrap()));
        assert!(!is_reserved("8.8.8.8".parse().unwrap()));

        // Documentation addresses are valid peers
        assert!(!is_reserved("192.0.2.5".parse().unwrap()));
        assert!(!is_reserved("198.51.100.1".parse().unwrap()));
        assert!(!is_reserved("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_v4_net_reserved() {
        assert!(v4_net_reserved(&"10.0.0.0/8".parse().unwrap()));
        assert!(v4_net_reserved(&"10.2.0.0/16".parse().unwrap()));
        assert!(!v4_net_reserved(&"198.41.0.0/24".parse().unwrap()));
        // Documentation space publishes like any other range
        assert!(!v4_net_reserved(&"192.0.2.0/24".parse().unwrap()));
    }

    #[test]
    fn test_abuse_cidr() {
        assert_eq!(
            abuse_cidr("192.0.2.130".parse().unwrap()).to_string(),
            "192.0.2.128/25"
        );
        assert_eq!(
            abuse_cidr("2001:db8:0:1234::1".parse().unwrap()).to_string(),
            "2001:db8:0:1000::/52"
        );
    }

    #[test]
    fn test_reverse_labels_roundtrip() {
        let v4: IpAddr = "192.0.2.5".parse().unwrap();
        let labels = reverse_labels(v4);
        assert_eq!(labels, vec!["5", "2", "0", "192"]);
        let refs: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
        assert_eq!(parse_reverse_labels(&refs), Some(v4));

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let labels = reverse_labels(v6);
        assert_eq!(labels.len(), 32);
        let refs: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
        assert_eq!(parse_reverse_labels(&refs), Some(v6));
    }
}
