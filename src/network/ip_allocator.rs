//! Enclave subnets and private-IP allocation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

// =============================================================================
// Subnet
// =============================================================================

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Creates a subnet, masking the host bits off the network address.
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 30 {
            // Narrower than /30 leaves no usable host addresses.
            return Err(Error::InvalidConfig(format!(
                "subnet prefix /{prefix_len} leaves no room for hosts"
            )));
        }
        let mask = u32::MAX << (32 - prefix_len);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(network) & mask),
            prefix_len,
        })
    }

    /// The network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The first usable host address (conventionally the gateway).
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// True if `ip` falls inside this subnet.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix_len);
        (u32::from(ip) & mask) == u32::from(self.network)
    }

    /// Iterates the usable host addresses, excluding the network and
    /// broadcast addresses.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network);
        let size = 1u32 << (32 - self.prefix_len);
        (1..size - 1).map(move |offset| Ipv4Addr::from(base + offset))
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 96, 0, 0),
            prefix_len: 24,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| {
            Error::InvalidConfig(format!("subnet '{s}' is missing a '/' prefix length"))
        })?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid subnet address '{addr}'")))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid prefix length '{prefix}'")))?;
        Self::new(network, prefix_len)
    }
}

// =============================================================================
// IP Allocator
// =============================================================================

/// Hands out private IPs from an enclave subnet in FIFO order.
///
/// The pool is seeded with every usable host address minus the reserved set
/// (network gateway, the runtime itself). Released addresses go to the back
/// of the queue, so recently-freed IPs are not immediately reused.
///
/// Not internally synchronized: the service network serializes access under
/// its own mutex.
#[derive(Debug)]
pub struct IpAllocator {
    subnet: Subnet,
    free: VecDeque<Ipv4Addr>,
    taken: HashSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Creates an allocator over the subnet with the given reserved IPs.
    #[must_use]
    pub fn new(subnet: Subnet, reserved: &HashSet<Ipv4Addr>) -> Self {
        let free: VecDeque<Ipv4Addr> = subnet
            .hosts()
            .filter(|ip| *ip != subnet.gateway() && !reserved.contains(ip))
            .collect();
        Self {
            subnet,
            free,
            taken: HashSet::new(),
        }
    }

    /// Takes the next free IP.
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let ip = self.free.pop_front().ok_or_else(|| Error::IpPoolExhausted {
            subnet: self.subnet.to_string(),
        })?;
        self.taken.insert(ip);
        Ok(ip)
    }

    /// Returns an IP to the pool.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<()> {
        if !self.taken.remove(&ip) {
            return Err(Error::IpNotAllocated(ip.to_string()));
        }
        self.free.push_back(ip);
        Ok(())
    }

    /// Number of IPs still free.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_subnet() -> Subnet {
        // 10.0.0.0/29: hosts .1-.6, gateway .1 → 5 allocatable
        Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 29).unwrap()
    }

    #[test]
    fn test_subnet_parse_and_display() {
        let subnet: Subnet = "10.96.3.0/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.96.3.0/24");
        assert_eq!(subnet.gateway(), Ipv4Addr::new(10, 96, 3, 1));
        assert!(subnet.contains(Ipv4Addr::new(10, 96, 3, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 96, 4, 1)));
    }

    #[test]
    fn test_subnet_masks_host_bits() {
        let subnet = Subnet::new(Ipv4Addr::new(10, 96, 3, 77), 24).unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 96, 3, 0));
    }

    #[test]
    fn test_subnet_rejects_tiny_prefix() {
        assert!(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 31).is_err());
        assert!("10.0.0.0/32".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_allocation_is_fifo_and_unique() {
        let mut allocator = IpAllocator::new(small_subnet(), &HashSet::new());
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        // Gateway .1 is excluded, so the first handout is .2.
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_released_ips_return_to_pool_tail() {
        let mut allocator = IpAllocator::new(small_subnet(), &HashSet::new());
        let a = allocator.allocate().unwrap();
        allocator.release(a).unwrap();
        // .3 comes out before the released .2 cycles back around.
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = IpAllocator::new(small_subnet(), &HashSet::new());
        while allocator.free_count() > 0 {
            allocator.allocate().unwrap();
        }
        assert!(matches!(
            allocator.allocate(),
            Err(Error::IpPoolExhausted { .. })
        ));
    }

    #[test]
    fn test_release_of_unallocated_ip_fails() {
        let mut allocator = IpAllocator::new(small_subnet(), &HashSet::new());
        assert!(allocator.release(Ipv4Addr::new(10, 0, 0, 2)).is_err());
    }

    #[test]
    fn test_reserved_ips_never_handed_out() {
        let reserved = HashSet::from([Ipv4Addr::new(10, 0, 0, 2)]);
        let mut allocator = IpAllocator::new(small_subnet(), &reserved);
        while allocator.free_count() > 0 {
            assert_ne!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        }
    }
}
