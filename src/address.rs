//! Address parsing and whitelist network specifications.
//!
//! Address syntax comes from `std::net`, subnet math from [`ipnet`].

use crate::error::AddressError;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// Parse a textual IPv4 or IPv6 address.
pub fn parse_address(raw: &str) -> Result<IpAddr, AddressError> {
    raw.parse::<IpAddr>().map_err(|_| AddressError::InvalidAddress(raw.to_string()))
}

/// True if `raw` parses as an IP address.
pub fn is_ip_address(raw: &str) -> bool {
    parse_address(raw).is_ok()
}

/// Parse a CIDR network. A bare address becomes a single-host network (/32 or /128).
pub fn parse_network(raw: &str) -> Result<IpNet, AddressError> {
    let trimmed = raw.trim();
    if trimmed.contains('/') {
        return trimmed.parse::<IpNet>().map_err(|_| AddressError::InvalidNetwork(raw.to_string()));
    }
    trimmed
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| AddressError::InvalidNetwork(raw.to_string()))
}

/// A whitelist entry: either raw text parsed on first use, or an already typed network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSpec {
    /// CIDR text such as `10.0.0.0/8` or a bare address.
    Text(String),
    /// A parsed network.
    Net(IpNet),
}

impl NetworkSpec {
    /// Resolve to a typed network.
    pub fn to_net(&self) -> Result<IpNet, AddressError> {
        match self {
            NetworkSpec::Text(raw) => parse_network(raw),
            NetworkSpec::Net(net) => Ok(*net),
        }
    }
}

impl From<&str> for NetworkSpec {
    fn from(raw: &str) -> Self {
        NetworkSpec::Text(raw.to_string())
    }
}

impl From<String> for NetworkSpec {
    fn from(raw: String) -> Self {
        NetworkSpec::Text(raw)
    }
}

impl From<IpNet> for NetworkSpec {
    fn from(net: IpNet) -> Self {
        NetworkSpec::Net(net)
    }
}

impl fmt::Display for NetworkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkSpec::Text(raw) => write!(f, "{}", raw),
            NetworkSpec::Net(net) => write!(f, "{}", net),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6() {
        assert_eq!(parse_address("127.0.0.1").unwrap().to_string(), "127.0.0.1");
        assert!(parse_address("::1").unwrap().is_ipv6());
        assert!(is_ip_address("fe80::200:5aee:feaa:20a2"));
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_address("asd").unwrap_err();
        assert_eq!(err.to_string(), "invalid IP address: asd");
        assert!(!is_ip_address("hello world"));
        assert!(!is_ip_address("127.0.0.1/32"));
        assert!(!is_ip_address(""));
        assert!(!is_ip_address(" 127.0.0.1"));
    }

    #[test]
    fn bare_address_is_host_network() {
        let net = parse_network("127.0.0.1").unwrap();
        assert_eq!(net.prefix_len(), 32);
        let net = parse_network("::1").unwrap();
        assert_eq!(net.prefix_len(), 128);
    }

    #[test]
    fn cidr_containment() {
        let net = parse_network("10.0.0.0/8").unwrap();
        assert!(net.contains(&parse_address("10.0.0.5").unwrap()));
        assert!(!net.contains(&parse_address("11.0.0.5").unwrap()));
        let link_local = parse_network("fe80::/64").unwrap();
        assert!(link_local.contains(&parse_address("fe80::200:5aee:feaa:20a2").unwrap()));
        assert!(!link_local.contains(&parse_address("10.0.0.5").unwrap()));
    }

    #[test]
    fn invalid_network_reports_text() {
        let err = parse_network("10.0.0.0/33").unwrap_err();
        assert_eq!(err, AddressError::InvalidNetwork("10.0.0.0/33".into()));
        assert!(NetworkSpec::from("unknown").to_net().is_err());
    }
}
