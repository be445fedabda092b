//! Peer address allocation inside the interface subnet

use crate::error::{Result, WireGuardError};
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Next free host address in `interface_address`'s subnet, as a /32.
///
/// Host `.1` and the server's own address are never handed out; `used`
/// holds the allowed-IP entries of existing peers.
pub fn allocate<'a>(
    interface_address: &str,
    used: impl IntoIterator<Item = &'a str>,
) -> Result<String> {
    let network: IpNetwork = interface_address
        .trim()
        .parse()
        .map_err(|e| WireGuardError::validation(format!("Invalid interface address: {}", e)))?;

    let IpNetwork::V4(network) = network else {
        return Err(WireGuardError::validation(
            "Automatic address allocation requires an IPv4 interface address",
        ));
    };

    let taken: HashSet<Ipv4Addr> = used
        .into_iter()
        .filter_map(host_of)
        .collect();

    let base = u32::from(network.network());
    let broadcast = u32::from(network.broadcast());
    let server = network.ip();

    for candidate in base.saturating_add(2)..broadcast {
        let ip = Ipv4Addr::from(candidate);
        if ip != server && !taken.contains(&ip) {
            return Ok(format!("{}/32", ip));
        }
    }

    Err(WireGuardError::AddressExhausted(network.to_string()))
}

fn host_of(cidr: &str) -> Option<Ipv4Addr> {
    let host = cidr.trim().split('/').next()?;
    match host.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_address_is_two() {
        assert_eq!(allocate("10.66.66.1/24", []).unwrap(), "10.66.66.2/32");
    }

    #[test]
    fn test_skips_used_and_server() {
        let used = ["10.66.66.2/32", "10.66.66.3/32", "192.168.1.0/24"];
        assert_eq!(allocate("10.66.66.1/24", used).unwrap(), "10.66.66.4/32");

        // Server sitting on .4 is skipped as well
        assert_eq!(allocate("10.66.66.4/24", used).unwrap(), "10.66.66.5/32");
    }

    #[test]
    fn test_reuses_gaps() {
        let used = ["10.66.66.2/32", "10.66.66.4/32"];
        assert_eq!(allocate("10.66.66.1/24", used).unwrap(), "10.66.66.3/32");
    }

    #[test]
    fn test_exhaustion() {
        // /30: network .0, server .1, host .2, broadcast .3
        let err = allocate("10.0.0.1/30", ["10.0.0.2/32"]).unwrap_err();
        assert!(matches!(err, WireGuardError::AddressExhausted(_)));
    }

    #[test]
    fn test_ipv6_interface_rejected() {
        assert!(allocate("fd00::1/64", []).is_err());
    }
}
