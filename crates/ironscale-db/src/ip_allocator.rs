//! ip address allocation for nodes.
//!
//! every node gets one address from the ipv4 pool and one from the ipv6
//! prefix. allocation is sequential over the configured prefixes with a
//! set of already-used addresses loaded from the node table at startup.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::Error;

/// allocates tailnet addresses for new nodes.
pub struct IpAllocator {
    prefix_v4: Option<IpNet>,
    prefix_v6: Option<IpNet>,
    allocated_v4: HashSet<IpAddr>,
    allocated_v6: HashSet<IpAddr>,
}

impl IpAllocator {
    /// create an allocator over the configured prefixes.
    pub fn new(prefix_v4: Option<IpNet>, prefix_v6: Option<IpNet>) -> Self {
        Self {
            prefix_v4,
            prefix_v6,
            allocated_v4: HashSet::new(),
            allocated_v6: HashSet::new(),
        }
    }

    /// seed the allocator with addresses already assigned in the database.
    pub fn load_allocated(&mut self, addresses: impl IntoIterator<Item = IpAddr>) {
        for addr in addresses {
            match addr {
                IpAddr::V4(_) => {
                    self.allocated_v4.insert(addr);
                }
                IpAddr::V6(_) => {
                    self.allocated_v6.insert(addr);
                }
            }
        }
    }

    /// allocate a free ipv4 address, or `None` when no pool is configured.
    pub fn allocate_v4(&mut self) -> Result<Option<IpAddr>, Error> {
        let Some(prefix) = &self.prefix_v4 else {
            return Ok(None);
        };

        for addr in prefix.hosts() {
            let ip = match addr {
                IpAddr::V4(_) => addr,
                IpAddr::V6(_) => continue,
            };
            if !self.allocated_v4.contains(&ip) {
                self.allocated_v4.insert(ip);
                return Ok(Some(ip));
            }
        }

        Err(Error::InvalidData("IPv4 address pool exhausted".to_string()))
    }

    /// allocate a free ipv6 address, or `None` when no prefix is configured.
    ///
    /// hosts are numbered sequentially in the low 64 bits of the prefix.
    pub fn allocate_v6(&mut self) -> Result<Option<IpAddr>, Error> {
        let Some(prefix) = &self.prefix_v6 else {
            return Ok(None);
        };

        let base = match prefix.network() {
            IpAddr::V6(v6) => v6,
            IpAddr::V4(_) => return Ok(None),
        };

        let mut count: u64 = 1;
        loop {
            if count > 1_000_000 {
                return Err(Error::InvalidData("IPv6 address pool exhausted".to_string()));
            }

            let segments = base.segments();
            let new_segments = [
                segments[0],
                segments[1],
                segments[2],
                segments[3],
                0,
                0,
                (count >> 16) as u16,
                count as u16,
            ];

            let ip = IpAddr::V6(std::net::Ipv6Addr::from(new_segments));
            if !self.allocated_v6.contains(&ip) {
                self.allocated_v6.insert(ip);
                return Ok(Some(ip));
            }

            count += 1;
        }
    }

    /// allocate both families for a new node.
    pub fn allocate(&mut self) -> Result<(Option<IpAddr>, Option<IpAddr>), Error> {
        let v4 = self.allocate_v4()?;
        let v6 = self.allocate_v6()?;
        Ok((v4, v6))
    }

    /// return an address to the pool (node deletion).
    pub fn release(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(_) => {
                self.allocated_v4.remove(&addr);
            }
            IpAddr::V6(_) => {
                self.allocated_v6.remove(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_v4_sequential() {
        let prefix: IpNet = "100.64.0.0/30".parse().unwrap();
        let mut allocator = IpAllocator::new(Some(prefix), None);

        let ip1 = allocator.allocate_v4().unwrap();
        let ip2 = allocator.allocate_v4().unwrap();
        assert!(ip1.is_some());
        assert!(ip2.is_some());
        assert_ne!(ip1, ip2);
    }

    #[test]
    fn v4_pool_exhaustion() {
        let prefix: IpNet = "100.64.0.0/30".parse().unwrap();
        let mut allocator = IpAllocator::new(Some(prefix), None);

        // /30 has two host addresses
        allocator.allocate_v4().unwrap();
        allocator.allocate_v4().unwrap();
        assert!(allocator.allocate_v4().is_err());
    }

    #[test]
    fn release_makes_address_reusable() {
        let prefix: IpNet = "100.64.0.0/30".parse().unwrap();
        let mut allocator = IpAllocator::new(Some(prefix), None);

        let ip1 = allocator.allocate_v4().unwrap().unwrap();
        allocator.release(ip1);
        let ip2 = allocator.allocate_v4().unwrap().unwrap();
        assert_eq!(ip1, ip2);
    }

    #[test]
    fn allocate_v6_in_prefix() {
        let prefix: IpNet = "fd7a:115c:a1e0::/48".parse().unwrap();
        let mut allocator = IpAllocator::new(None, Some(prefix));

        let ip = allocator.allocate_v6().unwrap().unwrap();
        assert_eq!(ip, "fd7a:115c:a1e0::1".parse::<IpAddr>().unwrap());

        let ip2 = allocator.allocate_v6().unwrap().unwrap();
        assert_eq!(ip2, "fd7a:115c:a1e0::2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn load_allocated_skips_used() {
        let prefix: IpNet = "100.64.0.0/29".parse().unwrap();
        let mut allocator = IpAllocator::new(Some(prefix), None);
        allocator.load_allocated(["100.64.0.1".parse().unwrap()]);

        let ip = allocator.allocate_v4().unwrap().unwrap();
        assert_eq!(ip, "100.64.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn no_pool_configured() {
        let mut allocator = IpAllocator::new(None, None);
        let (v4, v6) = allocator.allocate().unwrap();
        assert!(v4.is_none());
        assert!(v6.is_none());
    }
}
