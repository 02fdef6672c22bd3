//! Flow identifiers.
//!
//! Provides the endpoint tuple used to key a flow, and the hashing used to
//! place a flow (and its reverse-direction twin) in the same bucket.

use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// The endpoint tuple identifying a flow, independent of which side sent
/// the first observed packet.
///
/// Two packets — one and its reverse-direction reply — produce `FlowId`s
/// that compare and hash identically, because the two endpoints are stored
/// in a fixed order (`cmp::max`/`cmp::min` of the two `(addr, port)`
/// pairs) rather than in "source"/"destination" order.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub struct FlowId {
    hi: (IpAddr, u16),
    lo: (IpAddr, u16),
    proto: u8,
    vlan0: u16,
    vlan1: u16,
}

impl FlowId {
    /// Builds a `FlowId` from a packet's raw (sender-relative) tuple.
    pub fn new(
        src: IpAddr,
        dst: IpAddr,
        sport: u16,
        dport: u16,
        proto: u8,
        vlan0: u16,
        vlan1: u16,
    ) -> Self {
        let src_pair = (src, sport);
        let dst_pair = (dst, dport);
        let (hi, lo) = if src_pair >= dst_pair {
            (src_pair, dst_pair)
        } else {
            (dst_pair, src_pair)
        };
        FlowId {
            hi,
            lo,
            proto,
            vlan0,
            vlan1,
        }
    }

    /// The bucket index this flow hashes to in a table of `hash_size`
    /// buckets, mixing in `hash_rand` to resist adversarial collisions.
    ///
    /// The hash need not be cryptographically strong, only commutative in
    /// the two endpoints (guaranteed by [`FlowId::new`]'s canonical
    /// ordering) and well distributed across buckets.
    pub fn bucket_index(&self, hash_rand: u64, hash_size: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hash_rand.hash(&mut hasher);
        self.hash(&mut hasher);
        (hasher.finish() as usize) % hash_size
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <> {}:{} proto {}",
            self.hi.0, self.hi.1, self.lo.0, self.lo.1, self.proto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(b: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, b))
    }

    #[test]
    fn commutative_over_endpoints() {
        let fwd = FlowId::new(addr(1), addr(2), 1000, 80, 6, 0, 0);
        let rev = FlowId::new(addr(2), addr(1), 80, 1000, 6, 0, 0);
        assert_eq!(fwd, rev);
        assert_eq!(fwd.bucket_index(42, 1024), rev.bucket_index(42, 1024));
    }

    #[test]
    fn distinguishes_different_flows() {
        let a = FlowId::new(addr(1), addr(2), 1000, 80, 6, 0, 0);
        let b = FlowId::new(addr(1), addr(3), 1000, 80, 6, 0, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn distinguishes_vlan() {
        let a = FlowId::new(addr(1), addr(2), 1000, 80, 6, 10, 0);
        let b = FlowId::new(addr(1), addr(2), 1000, 80, 6, 20, 0);
        assert_ne!(a, b);
    }
}
