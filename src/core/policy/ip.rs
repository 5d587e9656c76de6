//! Address ranges in CIDR notation.
use std::{fmt, net::IpAddr, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid IP address '{0}'")]
    Address(String),
    #[error("invalid prefix length '{0}'")]
    Prefix(String),
    #[error("prefix length {prefix} exceeds {max} for this address family")]
    PrefixTooLong { prefix: u8, max: u8 },
}

/// A network address with prefix length. A bare address is a host range
/// (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, CidrError> {
        let max = max_prefix(addr);
        if prefix_len > max {
            return Err(CidrError::PrefixTooLong {
                prefix: prefix_len,
                max,
            });
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn parse(s: &str) -> Result<Self, CidrError> {
        let s = s.trim();
        let (ip_str, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let addr = IpAddr::from_str(ip_str).map_err(|_| CidrError::Address(ip_str.to_string()))?;
        let prefix_len = match prefix {
            Some(p) => p.parse().map_err(|_| CidrError::Prefix(p.to_string()))?,
            None => max_prefix(addr),
        };
        Self::new(addr, prefix_len)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        // IPv4-mapped IPv6 clients are compared as IPv4.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl FromStr for IpNetwork {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::parse(s)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_v4_range() {
        let network = IpNetwork::parse("192.168.1.0/24").unwrap();
        assert!(network.contains(ip("192.168.1.1")));
        assert!(network.contains(ip("192.168.1.255")));
        assert!(!network.contains(ip("192.168.2.1")));
        assert!(network.contains(ip("::ffff:192.168.1.7")));
    }

    #[test]
    fn test_single_address_and_zero_prefix() {
        let host = IpNetwork::parse(" 10.0.0.1 ").unwrap();
        assert!(host.contains(ip("10.0.0.1")));
        assert!(!host.contains(ip("10.0.0.2")));
        assert_eq!(host.to_string(), "10.0.0.1/32");

        let everything = IpNetwork::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(ip("8.8.8.8")));
        assert!(!everything.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_v6_range() {
        let network = IpNetwork::parse("2001:db8::/32").unwrap();
        assert!(network.contains(ip("2001:db8:1::5")));
        assert!(!network.contains(ip("2001:db9::1")));
    }

    #[test]
    fn test_invalid_input() {
        assert_eq!(
            IpNetwork::parse("10.0.0.0/33"),
            Err(CidrError::PrefixTooLong { prefix: 33, max: 32 })
        );
        assert!(matches!(IpNetwork::parse("nope/8"), Err(CidrError::Address(_))));
        assert!(matches!(IpNetwork::parse("10.0.0.0/x"), Err(CidrError::Prefix(_))));
    }
}
