//! ip set arithmetic for alias resolution.
//!
//! aliases resolve to sets of addresses that are unioned, subtracted and
//! re-emitted as minimal prefix lists. sets are kept as sorted inclusive
//! integer ranges per address family, which makes add/remove interval
//! arithmetic and keeps prefix emission deterministic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// an immutable set of ip addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    /// sorted, non-overlapping inclusive v4 ranges (u64 to dodge overflow).
    v4: Vec<(u64, u64)>,
    /// sorted, non-overlapping inclusive v6 ranges.
    v6: Vec<(u128, u128)>,
}

impl IpSet {
    /// whether the set holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// whether the set contains an address.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let n = u64::from(u32::from(*v4));
                range_contains(&self.v4, n)
            }
            IpAddr::V6(v6) => {
                let n = u128::from(*v6);
                range_contains(&self.v6, n)
            }
        }
    }

    /// whether the set contains any of the given addresses.
    pub fn contains_any(&self, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| self.contains(ip))
    }

    /// whether the set overlaps a prefix.
    pub fn overlaps_prefix(&self, prefix: &IpNet) -> bool {
        match prefix {
            IpNet::V4(p) => {
                let (start, end) = v4_bounds(p);
                self.v4.iter().any(|&(s, e)| s <= end && start <= e)
            }
            IpNet::V6(p) => {
                let (start, end) = v6_bounds(p);
                self.v6.iter().any(|&(s, e)| s <= end && start <= e)
            }
        }
    }

    /// the minimal list of prefixes covering the set, v4 first, sorted.
    pub fn prefixes(&self) -> Vec<IpNet> {
        let mut out = Vec::new();
        for &(start, end) in &self.v4 {
            v4_range_to_prefixes(start, end, &mut out);
        }
        for &(start, end) in &self.v6 {
            v6_range_to_prefixes(start, end, &mut out);
        }
        out
    }

    /// prefixes rendered as strings, in emission order.
    pub fn prefix_strings(&self) -> Vec<String> {
        self.prefixes().iter().map(|p| p.to_string()).collect()
    }
}

/// builder accumulating set operations in order.
#[derive(Debug, Default)]
pub struct IpSetBuilder {
    v4: Vec<(u64, u64)>,
    v6: Vec<(u128, u128)>,
}

impl IpSetBuilder {
    /// a fresh empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// add a single address.
    pub fn add_ip(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                let n = u64::from(u32::from(v4));
                self.v4.push((n, n));
                normalize(&mut self.v4);
            }
            IpAddr::V6(v6) => {
                let n = u128::from(v6);
                self.v6.push((n, n));
                normalize(&mut self.v6);
            }
        }
    }

    /// add every address in a prefix.
    pub fn add_prefix(&mut self, prefix: IpNet) {
        match prefix {
            IpNet::V4(p) => {
                self.v4.push(v4_bounds(&p));
                normalize(&mut self.v4);
            }
            IpNet::V6(p) => {
                self.v6.push(v6_bounds(&p));
                normalize(&mut self.v6);
            }
        }
    }

    /// remove every address in a prefix.
    pub fn remove_prefix(&mut self, prefix: IpNet) {
        match prefix {
            IpNet::V4(p) => {
                let bounds = v4_bounds(&p);
                self.v4 = subtract(&self.v4, bounds);
            }
            IpNet::V6(p) => {
                let bounds = v6_bounds(&p);
                self.v6 = subtract(&self.v6, bounds);
            }
        }
    }

    /// union another set into this builder.
    pub fn add_set(&mut self, set: &IpSet) {
        self.v4.extend_from_slice(&set.v4);
        self.v6.extend_from_slice(&set.v6);
        normalize(&mut self.v4);
        normalize(&mut self.v6);
    }

    /// finish building.
    pub fn build(self) -> IpSet {
        IpSet {
            v4: self.v4,
            v6: self.v6,
        }
    }
}

fn range_contains<T: Ord + Copy>(ranges: &[(T, T)], n: T) -> bool {
    ranges
        .binary_search_by(|&(s, e)| {
            if n < s {
                std::cmp::Ordering::Greater
            } else if n > e {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .is_ok()
}

/// sort and merge overlapping or adjacent ranges in place.
fn normalize<T: Ord + Copy + num_like::NumLike>(ranges: &mut Vec<(T, T)>) {
    if ranges.len() < 2 {
        return;
    }
    ranges.sort_unstable();
    let mut merged: Vec<(T, T)> = Vec::with_capacity(ranges.len());
    for &(s, e) in ranges.iter() {
        match merged.last_mut() {
            Some((_, last_e)) if s <= last_e.saturating_succ() => {
                if e > *last_e {
                    *last_e = e;
                }
            }
            _ => merged.push((s, e)),
        }
    }
    *ranges = merged;
}

/// subtract an inclusive range from a normalized range list.
fn subtract<T: Ord + Copy + num_like::NumLike>(ranges: &[(T, T)], (rs, re): (T, T)) -> Vec<(T, T)> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(s, e) in ranges {
        if e < rs || s > re {
            out.push((s, e));
            continue;
        }
        if s < rs {
            out.push((s, rs.saturating_pred()));
        }
        if e > re {
            out.push((re.saturating_succ(), e));
        }
    }
    out
}

/// minimal integer trait for the range arithmetic above.
mod num_like {
    pub trait NumLike {
        fn saturating_succ(self) -> Self;
        fn saturating_pred(self) -> Self;
    }

    impl NumLike for u64 {
        fn saturating_succ(self) -> Self {
            self.saturating_add(1)
        }
        fn saturating_pred(self) -> Self {
            self.saturating_sub(1)
        }
    }

    impl NumLike for u128 {
        fn saturating_succ(self) -> Self {
            self.saturating_add(1)
        }
        fn saturating_pred(self) -> Self {
            self.saturating_sub(1)
        }
    }
}

fn v4_bounds(p: &Ipv4Net) -> (u64, u64) {
    (
        u64::from(u32::from(p.network())),
        u64::from(u32::from(p.broadcast())),
    )
}

fn v6_bounds(p: &Ipv6Net) -> (u128, u128) {
    (u128::from(p.network()), u128::from(p.broadcast()))
}

/// decompose an inclusive v4 range into aligned power-of-two prefixes.
fn v4_range_to_prefixes(start: u64, end: u64, out: &mut Vec<IpNet>) {
    let mut s = start;
    while s <= end {
        // the largest aligned block starting at s that fits in [s, end]
        let align = if s == 0 { 1u64 << 32 } else { 1u64 << s.trailing_zeros().min(32) };
        let mut size = align;
        while s + (size - 1) > end {
            size >>= 1;
        }
        let prefix_len = 32 - size.trailing_zeros() as u8;
        let net = Ipv4Net::new(Ipv4Addr::from(s as u32), prefix_len)
            .expect("prefix length is bounded by construction");
        out.push(IpNet::V4(net));
        s += size;
    }
}

/// decompose an inclusive v6 range into aligned power-of-two prefixes.
fn v6_range_to_prefixes(start: u128, end: u128, out: &mut Vec<IpNet>) {
    if start == 0 && end == u128::MAX {
        out.push(IpNet::V6(
            Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 0).expect("::/0 is valid"),
        ));
        return;
    }
    let mut s = start;
    loop {
        let align_bits = if s == 0 { 127 } else { s.trailing_zeros().min(127) };
        let mut size = 1u128 << align_bits;
        while s + (size - 1) > end {
            size >>= 1;
        }
        let prefix_len = 128 - size.trailing_zeros() as u8;
        let net = Ipv6Net::new(Ipv6Addr::from(s), prefix_len)
            .expect("prefix length is bounded by construction");
        out.push(IpNet::V6(net));
        match (s + (size - 1)).checked_add(1) {
            Some(next) if next <= end => s = next,
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn single_prefix_roundtrips() {
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("10.0.0.0/8"));
        let set = b.build();
        assert_eq!(set.prefixes(), vec![net("10.0.0.0/8")]);
    }

    #[test]
    fn adjacent_prefixes_merge() {
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("10.0.0.0/9"));
        b.add_prefix(net("10.128.0.0/9"));
        let set = b.build();
        assert_eq!(set.prefixes(), vec![net("10.0.0.0/8")]);
    }

    #[test]
    fn subtraction_splits_prefix() {
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("10.0.0.0/8"));
        b.remove_prefix(net("10.64.0.0/10"));
        let set = b.build();

        assert!(!set.contains(&"10.64.0.1".parse().unwrap()));
        assert!(set.contains(&"10.0.0.1".parse().unwrap()));
        assert!(set.contains(&"10.128.0.1".parse().unwrap()));

        // 10.0.0.0/10 + 10.128.0.0/9 remain
        assert_eq!(set.prefixes(), vec![net("10.0.0.0/10"), net("10.128.0.0/9")]);
    }

    #[test]
    fn full_v4_range() {
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("0.0.0.0/0"));
        let set = b.build();
        assert_eq!(set.prefixes(), vec![net("0.0.0.0/0")]);
        assert!(set.contains(&"255.255.255.255".parse().unwrap()));
        assert!(set.contains(&"0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn full_v6_range() {
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("::/0"));
        let set = b.build();
        assert_eq!(set.prefixes(), vec![net("::/0")]);
    }

    #[test]
    fn single_ip_emits_host_prefix() {
        let mut b = IpSetBuilder::new();
        b.add_ip("100.64.0.1".parse().unwrap());
        b.add_ip("fd7a:115c:a1e0::1".parse().unwrap());
        let set = b.build();
        assert_eq!(
            set.prefixes(),
            vec![net("100.64.0.1/32"), net("fd7a:115c:a1e0::1/128")]
        );
    }

    #[test]
    fn unaligned_range_decomposes() {
        // 10.0.0.1 - 10.0.0.6 = .1/32 .2/31 .4/31 .6/32
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("10.0.0.0/29"));
        b.remove_prefix(net("10.0.0.0/32"));
        b.remove_prefix(net("10.0.0.7/32"));
        let set = b.build();
        assert_eq!(
            set.prefixes(),
            vec![
                net("10.0.0.1/32"),
                net("10.0.0.2/31"),
                net("10.0.0.4/31"),
                net("10.0.0.6/32"),
            ]
        );
    }

    #[test]
    fn overlaps_prefix() {
        let mut b = IpSetBuilder::new();
        b.add_prefix(net("10.33.0.0/16"));
        let set = b.build();
        assert!(set.overlaps_prefix(&net("10.0.0.0/8")));
        assert!(set.overlaps_prefix(&net("10.33.5.0/24")));
        assert!(!set.overlaps_prefix(&net("10.34.0.0/16")));
        assert!(!set.overlaps_prefix(&net("fd7a::/48")));
    }

    #[test]
    fn union_of_sets() {
        let mut a = IpSetBuilder::new();
        a.add_prefix(net("192.168.0.0/24"));
        let a = a.build();

        let mut b = IpSetBuilder::new();
        b.add_prefix(net("192.168.1.0/24"));
        b.add_set(&a);
        let set = b.build();

        assert_eq!(set.prefixes(), vec![net("192.168.0.0/23")]);
    }

    #[test]
    fn empty_set() {
        let set = IpSetBuilder::new().build();
        assert!(set.is_empty());
        assert!(set.prefixes().is_empty());
        assert!(!set.contains(&"10.0.0.1".parse().unwrap()));
    }
}
