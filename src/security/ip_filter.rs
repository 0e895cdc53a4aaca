//! IP allow/deny lists with CIDR ranges
//!
//! A non-empty whitelist takes precedence: only listed addresses pass and
//! the blacklist is not consulted. Otherwise everything passes except
//! blacklisted addresses.

use super::IpPolicy;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address list entry that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IP address or CIDR range: {0}")]
pub struct ParseIpNetError(pub String);

/// An address range: `10.0.0.0/8`, `2001:db8::/32`, or a single address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ParseIpNetError> {
        let max = max_prefix(addr);
        if prefix > max {
            return Err(ParseIpNetError(format!("{}/{}", addr, prefix)));
        }
        Ok(IpNet { addr, prefix })
    }

    /// Whether `addr` falls inside the range
    ///
    /// IPv4-mapped IPv6 addresses match IPv4 ranges.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
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

fn mask_u32(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0)
}

fn mask_u128(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0)
}

impl FromStr for IpNet {
    type Err = ParseIpNetError;

    /// Host bits below the prefix are allowed and ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseIpNetError(s.to_string());
        match s.trim().split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                IpNet::new(addr, prefix).map_err(|_| invalid())
            }
            None => {
                let addr: IpAddr = s.trim().parse().map_err(|_| invalid())?;
                let addr = addr.to_canonical();
                Ok(IpNet {
                    addr,
                    prefix: max_prefix(addr),
                })
            }
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Whitelist/blacklist filter
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    whitelist: Vec<IpNet>,
    blacklist: Vec<IpNet>,
}

impl IpFilter {
    pub fn new() -> Self {
        IpFilter::default()
    }

    pub fn from_lists<S: AsRef<str>>(whitelist: &[S], blacklist: &[S]) -> Result<Self, ParseIpNetError> {
        let mut filter = IpFilter::new();
        for entry in whitelist {
            filter.allow(entry.as_ref())?;
        }
        for entry in blacklist {
            filter.deny(entry.as_ref())?;
        }
        Ok(filter)
    }

    /// Add an address or range to the whitelist
    pub fn allow(&mut self, entry: &str) -> Result<(), ParseIpNetError> {
        self.whitelist.push(entry.parse()?);
        Ok(())
    }

    /// Add an address or range to the blacklist
    pub fn deny(&mut self, entry: &str) -> Result<(), ParseIpNetError> {
        self.blacklist.push(entry.parse()?);
        Ok(())
    }
}

impl IpPolicy for IpFilter {
    fn is_allowed(&self, addr: IpAddr) -> bool {
        if !self.whitelist.is_empty() {
            return self.whitelist.iter().any(|net| net.contains(addr));
        }
        !self.blacklist.iter().any(|net| net.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_entries() {
        assert_eq!("10.0.0.0/8".parse::<IpNet>().unwrap().to_string(), "10.0.0.0/8");
        assert_eq!("192.168.1.5".parse::<IpNet>().unwrap().to_string(), "192.168.1.5/32");
        assert!("2001:db8::/32".parse::<IpNet>().is_ok());

        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
        assert!("not-an-ip".parse::<IpNet>().is_err());
        assert!("1.2.3.4/x".parse::<IpNet>().is_err());
    }

    #[test]
    fn test_contains_with_host_bits() {
        let net: IpNet = "192.168.1.77/24".parse().unwrap();
        assert!(net.contains(ip("192.168.1.1")));
        assert!(!net.contains(ip("192.168.2.1")));
        assert!(!net.contains(ip("::1")));
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let net: IpNet = "0.0.0.0/0".parse().unwrap();
        assert!(net.contains(ip("8.8.8.8")));
        assert!(!net.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_mapped_ipv6_matches_ipv4_range() {
        let net: IpNet = "127.0.0.0/8".parse().unwrap();
        assert!(net.contains(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn test_blacklist() {
        let filter = IpFilter::from_lists::<&str>(&[], &["10.0.0.0/8", "2001:db8::/32"]).unwrap();
        assert!(!filter.is_allowed(ip("10.9.9.9")));
        assert!(!filter.is_allowed(ip("2001:db8::42")));
        assert!(filter.is_allowed(ip("11.0.0.1")));
    }

    #[test]
    fn test_whitelist_takes_precedence() {
        let filter = IpFilter::from_lists(&["127.0.0.1"], &["127.0.0.0/8"]).unwrap();
        assert!(filter.is_allowed(ip("127.0.0.1")));
        assert!(!filter.is_allowed(ip("127.0.0.2")));
        assert!(!filter.is_allowed(ip("8.8.8.8")));
    }
}
