//! Input validation utilities

use crate::error::{CommonError, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Port number validation
pub struct PortValidator;

impl PortValidator {
    /// Validate a port number (1-65535)
    pub fn validate(port: u16) -> Result<()> {
        if port == 0 {
            return Err(CommonError::Validation(
                "Port number cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate a port given as a wider integer, e.g. from JSON input
    pub fn validate_u32(port: u32) -> Result<u16> {
        if port == 0 || port > u16::MAX as u32 {
            return Err(CommonError::Validation(format!(
                "Port {} is out of range 1-65535",
                port
            )));
        }
        Ok(port as u16)
    }
}

/// Host validation: IP literal or DNS name
#[derive(Debug, Default)]
pub struct HostValidator;

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

impl HostValidator {
    /// Validate a target host
    pub fn validate(&self, host: &str) -> Result<()> {
        let host = host.trim();
        if host.is_empty() {
            return Err(CommonError::Validation("Host cannot be empty".to_string()));
        }

        if host.len() > 253 {
            return Err(CommonError::Validation("Host name is too long".to_string()));
        }

        let unbracketed = host.trim_start_matches('[').trim_end_matches(']');
        if unbracketed.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        if !host.split('.').all(is_valid_label) {
            return Err(CommonError::Validation(format!(
                "Invalid host '{}'",
                host
            )));
        }

        Ok(())
    }

    /// Validate a listen address; must be an IP literal
    pub fn validate_listen_address(address: &str) -> Result<IpAddr> {
        address
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| {
                CommonError::Validation(format!("Invalid listen address '{}'", address))
            })
    }
}

/// CIDR validation
pub struct CidrValidator;

impl CidrValidator {
    /// Validate a single CIDR block
    pub fn validate(cidr: &str) -> Result<IpNetwork> {
        let cidr = cidr.trim();
        if !cidr.contains('/') {
            return Err(CommonError::Validation(format!(
                "'{}' is not in CIDR notation",
                cidr
            )));
        }
        cidr.parse::<IpNetwork>()
            .map_err(|e| CommonError::Validation(format!("Invalid CIDR '{}': {}", cidr, e)))
    }

    /// Validate a comma-separated list of CIDR blocks
    pub fn validate_list(list: &str) -> Result<Vec<IpNetwork>> {
        let networks = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::validate)
            .collect::<Result<Vec<_>>>()?;

        if networks.is_empty() {
            return Err(CommonError::Validation(
                "At least one CIDR block is required".to_string(),
            ));
        }
        Ok(networks)
    }
}

/// Network interface name validation (Linux IFNAMSIZ)
#[derive(Debug, Default)]
pub struct InterfaceNameValidator;

impl InterfaceNameValidator {
    pub fn validate(&self, name: &str) -> Result<()> {
        let valid = (1..=15).contains(&name.len())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_=+.-".contains(c));
        if !valid {
            return Err(CommonError::Validation(format!(
                "Invalid interface name '{}': 1-15 characters of [a-zA-Z0-9_=+.-]",
                name
            )));
        }
        Ok(())
    }
}

/// DNS server list validation
pub struct DnsValidator;

impl DnsValidator {
    /// Validate a comma-separated list of resolver IPs; empty means "no DNS"
    pub fn validate(list: &str) -> Result<Vec<IpAddr>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| CommonError::Validation(format!("Invalid DNS server '{}'", s)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_port_validation() {
        assert!(PortValidator::validate(1).is_ok());
        assert!(PortValidator::validate(65535).is_ok());
        assert!(PortValidator::validate(0).is_err());
        assert!(PortValidator::validate_u32(70000).is_err());
        assert_eq!(PortValidator::validate_u32(22).unwrap(), 22);
    }

    #[test]
    fn test_host_validation() {
        let validator = HostValidator::default();

        assert!(validator.validate("10.0.0.5").is_ok());
        assert!(validator.validate("::1").is_ok());
        assert!(validator.validate("[fe80::1]").is_ok());
        assert!(validator.validate("vpn.example.com").is_ok());
        assert!(validator.validate("localhost").is_ok());

        assert!(validator.validate("").is_err());
        assert!(validator.validate("bad host").is_err());
        assert!(validator.validate("-leading.example").is_err());
    }

    #[test]
    fn test_listen_address_validation() {
        assert!(HostValidator::validate_listen_address("0.0.0.0").is_ok());
        assert!(HostValidator::validate_listen_address("::").is_ok());
        assert!(HostValidator::validate_listen_address("example.com").is_err());
    }

    #[test]
    fn test_cidr_validation() {
        assert!(CidrValidator::validate("10.66.66.2/32").is_ok());
        assert!(CidrValidator::validate("::/0").is_ok());
        assert!(CidrValidator::validate("10.66.66.2").is_err());
        assert!(CidrValidator::validate("10.66.66.300/32").is_err());

        let list = CidrValidator::validate_list("0.0.0.0/0, ::/0").unwrap();
        assert_eq!(list.len(), 2);
        assert!(CidrValidator::validate_list(" , ").is_err());
    }

    #[test]
    fn test_interface_name_validation() {
        let validator = InterfaceNameValidator::default();
        assert!(validator.validate("wg0").is_ok());
        assert!(validator.validate("omniwire").is_ok());
        assert!(validator.validate("").is_err());
        assert!(validator.validate("a-very-long-interface-name").is_err());
        assert!(validator.validate("wg0; rm").is_err());
    }

    #[test]
    fn test_dns_validation() {
        assert_eq!(DnsValidator::validate("1.1.1.1, 8.8.8.8").unwrap().len(), 2);
        assert!(DnsValidator::validate("").unwrap().is_empty());
        assert!(DnsValidator::validate("dns.google").is_err());
    }

    proptest! {
        #[test]
        fn prop_nonzero_ports_are_valid(port in 1u16..=65535u16) {
            prop_assert!(PortValidator::validate(port).is_ok());
        }

        #[test]
        fn prop_ipv4_host_cidrs_are_valid(a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
            let cidr = format!("{}.{}.{}.{}/32", a, b, c, d);
            prop_assert!(CidrValidator::validate(&cidr).is_ok());
        }
    }
}
