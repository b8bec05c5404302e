//! IPv4 interface addressing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Address, netmask and gateway of one network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl IpInfo {
    pub const fn new(ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            ip,
            netmask,
            gateway,
        }
    }

    /// Returns the network address (`ip & netmask`).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(self.netmask))
    }

    /// Returns the prefix length of the netmask, if it is contiguous.
    pub fn prefix_len(&self) -> Option<u8> {
        netmask_prefix_len(self.netmask)
    }

    /// Formats the interface address in CIDR notation (`10.0.0.1/24`).
    pub fn cidr(&self) -> Option<String> {
        self.prefix_len().map(|len| format!("{}/{}", self.ip, len))
    }
}

impl fmt::Display for IpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip {} netmask {} gw {}",
            self.ip, self.netmask, self.gateway
        )
    }
}

/// Returns the prefix length of a contiguous netmask.
///
/// `255.255.255.0` gives `Some(24)`; `255.0.255.0` gives `None`.
pub fn netmask_prefix_len(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) == 0 {
        Some(ones as u8)
    } else {
        None
    }
}

/// Parses a dotted-quad IPv4 string, trimming surrounding whitespace.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, ParseError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prefix_len() {
        assert_eq!(netmask_prefix_len(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
        assert_eq!(netmask_prefix_len(Ipv4Addr::new(255, 0, 0, 0)), Some(8));
        assert_eq!(netmask_prefix_len(Ipv4Addr::new(255, 255, 255, 255)), Some(32));
        assert_eq!(netmask_prefix_len(Ipv4Addr::new(0, 0, 0, 0)), Some(0));
        assert_eq!(netmask_prefix_len(Ipv4Addr::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn test_network_and_cidr() {
        let info = IpInfo::new(
            Ipv4Addr::new(192, 168, 4, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 4, 1),
        );
        assert_eq!(info.network(), Ipv4Addr::new(192, 168, 4, 0));
        assert_eq!(info.cidr().as_deref(), Some("192.168.4.1/24"));
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4(" 10.0.0.5 ").unwrap(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(parse_ipv4("10.0.0").is_err());
        assert!(parse_ipv4("").is_err());
    }
}
