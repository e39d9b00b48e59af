use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{bail, Context};

/// An IPv4 CIDR block, always stored in normalized form (host bits zeroed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Build a block from any address inside it and a prefix length.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> anyhow::Result<Self> {
        if prefix > 32 {
            bail!("prefix length {} exceeds 32", prefix);
        }
        let network = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Last address of the block (the broadcast address for prefixes up to /30).
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask(self.prefix))
    }

    /// Whether `addr` falls anywhere inside the block.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix) == u32::from(self.network)
    }

    /// First and last assignable addresses as integers.
    ///
    /// Up to /30 the network and broadcast addresses are excluded; /31 and /32
    /// have no such addresses and every member is assignable.
    fn host_bounds(&self) -> (u32, u32) {
        let first = u32::from(self.network);
        let last = u32::from(self.broadcast());
        if self.prefix <= 30 {
            (first + 1, last - 1)
        } else {
            (first, last)
        }
    }

    /// Whether `addr` is an assignable host address of the block.
    pub fn is_host(&self, addr: Ipv4Addr) -> bool {
        let (first, last) = self.host_bounds();
        (first..=last).contains(&u32::from(addr))
    }

    /// Assignable host addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (first, last) = self.host_bounds();
        (first..=last).map(Ipv4Addr::from)
    }

    /// Number of assignable host addresses.
    pub fn usable_count(&self) -> u64 {
        let (first, last) = self.host_bounds();
        u64::from(last - first) + 1
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .with_context(|| format!("missing '/<prefix>' in {:?}", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("invalid IPv4 address in {:?}", s))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid prefix length in {:?}", s))?;
        Self::new(addr, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cidr: Cidr = "172.24.24.128/25".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(172, 24, 24, 128));
        assert_eq!(cidr.prefix(), 25);
        assert_eq!(cidr.to_string(), "172.24.24.128/25");
    }

    #[test]
    fn parse_normalizes_host_bits() {
        let cidr: Cidr = "10.0.0.5/30".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.4/30");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0/24".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn slash_30_hosts_skip_network_and_broadcast() {
        let cidr: Cidr = "10.0.0.0/30".parse().unwrap();
        let hosts: Vec<_> = cidr.hosts().collect();
        assert_eq!(hosts, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(cidr.usable_count(), 2);
        assert!(!cidr.is_host(Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!cidr.is_host(Ipv4Addr::new(10, 0, 0, 3)));
        assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn slash_31_and_32_use_every_address() {
        let p2p: Cidr = "10.0.0.0/31".parse().unwrap();
        assert_eq!(p2p.hosts().count(), 2);

        let single: Cidr = "10.0.0.9/32".parse().unwrap();
        assert_eq!(single.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 0, 0, 9)]);
    }

    #[test]
    fn default_range_bounds() {
        let cidr: Cidr = "172.24.24.128/25".parse().unwrap();
        assert_eq!(cidr.usable_count(), 126);
        assert_eq!(cidr.hosts().next(), Some(Ipv4Addr::new(172, 24, 24, 129)));
        assert_eq!(cidr.hosts().last(), Some(Ipv4Addr::new(172, 24, 24, 254)));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(172, 24, 24, 255));
    }

    #[test]
    fn contains_checks_prefix() {
        let cidr: Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }
}
