//! Flow acquisition, the spare queue, and memory-cap accounting.
//!
//! Grounded on the slab-backed, fixed-capacity pool pattern used for packet
//! buffers in `examples/RephlexZero-strata/crates/strata-transport/src/pool.rs`
//! (pre-allocated slots, `O(1)` insert/remove, a `Handle` newtype over a
//! slab key), adapted to flows, a memory cap rather than a slot count, and
//! a spare queue for O(1) reuse (`spec.md` §4.3).

use crate::flow::flow::Flow;
use crate::flow::packet::PacketMeta;

use slab::Slab;
use std::any::Any;
use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle to a flow in the pool's arena. Stable for the flow's lifetime,
/// whether it currently lives in a bucket or in the spare queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle(pub usize);

/// Approximate per-flow memory charge used for cap accounting
/// (`spec.md` §3: "`flow_memuse` equals the sum of `sizeof(Flow)` for every
/// live flow plus `hash_size × sizeof(Bucket)`").
pub const FLOW_SIZE: u64 = size_of::<Flow>() as u64;

/// Flow acquisition pool: arena + spare queue + memcap accounting.
pub struct FlowPool {
    arena: Mutex<Slab<Arc<Flow>>>,
    spare: Mutex<VecDeque<FlowHandle>>,
    memuse: AtomicU64,
    memcap: u64,
    prealloc: usize,
}

impl FlowPool {
    /// Creates a pool with the given `memcap` (bytes) and spare-queue
    /// target length `prealloc`. `reserved` bytes (the hash table's own
    /// footprint) are charged against the cap up front.
    pub fn new(memcap: u64, prealloc: usize, reserved: u64) -> Self {
        FlowPool {
            arena: Mutex::new(Slab::with_capacity(prealloc)),
            spare: Mutex::new(VecDeque::with_capacity(prealloc)),
            memuse: AtomicU64::new(reserved),
            memcap,
            prealloc,
        }
    }

    /// Current committed bytes.
    pub fn memuse(&self) -> u64 {
        self.memuse.load(Ordering::SeqCst)
    }

    /// The configured memory cap, in bytes.
    pub fn memcap(&self) -> u64 {
        self.memcap
    }

    /// `flow_memuse + n <= memcap` (`spec.md` §4.3).
    fn would_fit(&self, n: u64) -> bool {
        self.memuse.load(Ordering::SeqCst) + n <= self.memcap
    }

    /// Number of flows currently parked in the spare queue.
    pub fn spare_len(&self) -> usize {
        self.spare.lock().expect("spare lock poisoned").len()
    }

    /// Total number of flows tracked by the arena (spare + live).
    pub fn len(&self) -> usize {
        self.arena.lock().expect("arena lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a handle to its flow.
    pub fn get(&self, handle: FlowHandle) -> Option<Arc<Flow>> {
        self.arena
            .lock()
            .expect("arena lock poisoned")
            .get(handle.0)
            .cloned()
    }

    /// Acquires a flow for `pkt` (`spec.md` §4.3):
    /// 1. Reuse a spare flow if one is available.
    /// 2. Otherwise allocate fresh, subject to the memory cap.
    /// 3. Otherwise return `None` (caller trips emergency mode).
    pub fn acquire(&self, pkt: &PacketMeta, in_emergency: bool) -> Option<(FlowHandle, Arc<Flow>)> {
        if let Some(handle) = self.spare.lock().expect("spare lock poisoned").pop_front() {
            let arena = self.arena.lock().expect("arena lock poisoned");
            if let Some(slot) = arena.get(handle.0) {
                slot.reinit(pkt, in_emergency);
                return Some((handle, slot.clone()));
            }
            log::warn!("flow pool: dangling spare handle {}", handle.0);
        }

        if !self.would_fit(FLOW_SIZE) {
            return None;
        }
        let flow = Arc::new(Flow::new(pkt, in_emergency));
        let mut arena = self.arena.lock().expect("arena lock poisoned");
        let key = arena.insert(flow.clone());
        self.memuse.fetch_add(FLOW_SIZE, Ordering::SeqCst);
        Some((FlowHandle(key), flow))
    }

    /// Returns a flow to the spare queue after clearing it. If the spare
    /// queue now exceeds `prealloc`, the oldest excess flows are freed and
    /// `flow_memuse` decremented (`spec.md` §4.3).
    pub fn release(&self, handle: FlowHandle, free_cb: Option<&dyn Fn(Box<dyn Any + Send>)>) {
        {
            let arena = self.arena.lock().expect("arena lock poisoned");
            if let Some(slot) = arena.get(handle.0) {
                slot.clear(free_cb);
            }
        }
        self.spare.lock().expect("spare lock poisoned").push_back(handle);
        self.trim_spare();
    }

    /// Brings the spare queue toward `prealloc`: allocates up to the
    /// deficit (subject to the cap) or frees down to the surplus
    /// (`spec.md` §4.3, `update_spare_flows`).
    pub fn update_spare_flows(&self) {
        loop {
            let len = self.spare_len();
            if len >= self.prealloc {
                break;
            }
            if !self.would_fit(FLOW_SIZE) {
                break;
            }
            let placeholder = PacketMeta::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                0,
                0,
                0,
                0,
                0,
            );
            let flow = Arc::new(Flow::new(&placeholder, false));
            let key = {
                let mut arena = self.arena.lock().expect("arena lock poisoned");
                arena.insert(flow)
            };
            self.memuse.fetch_add(FLOW_SIZE, Ordering::SeqCst);
            self.spare.lock().expect("spare lock poisoned").push_back(FlowHandle(key));
        }
        self.trim_spare();
    }

    fn trim_spare(&self) {
        while self.spare_len() > self.prealloc {
            let handle = {
                let mut spare = self.spare.lock().expect("spare lock poisoned");
                spare.pop_front()
            };
            let Some(handle) = handle else { break };
            let mut arena = self.arena.lock().expect("arena lock poisoned");
            if arena.contains(handle.0) {
                arena.remove(handle.0);
                self.memuse.fetch_sub(FLOW_SIZE, Ordering::SeqCst);
            }
        }
    }

    /// Drains and frees every flow — live or spare — for engine shutdown.
    /// Returns the number of flows freed.
    pub fn drain_all(&self) -> usize {
        self.spare.lock().expect("spare lock poisoned").clear();
        let mut arena = self.arena.lock().expect("arena lock poisoned");
        let n = arena.len();
        arena.clear();
        self.memuse.store(0, Ordering::SeqCst);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn pkt(b: u8) -> PacketMeta {
        PacketMeta::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            1000,
            80,
            6,
            0,
            0,
        )
    }

    #[test]
    fn acquire_then_cap_exhausted() {
        let pool = FlowPool::new(FLOW_SIZE, 0, 0);
        let (h1, _f1) = pool.acquire(&pkt(2), false).expect("first acquire fits");
        assert!(pool.acquire(&pkt(3), false).is_none(), "cap should be exhausted");
        pool.release(h1, None);
        assert_eq!(pool.spare_len(), 0, "prealloc=0 frees immediately");
    }

    #[test]
    fn release_then_reacquire_reuses_spare() {
        let pool = FlowPool::new(FLOW_SIZE * 4, 4, 0);
        let (h1, f1) = pool.acquire(&pkt(2), false).unwrap();
        let id1 = f1.lock().id();
        pool.release(h1, None);
        assert_eq!(pool.spare_len(), 1);
        let (h2, f2) = pool.acquire(&pkt(3), false).unwrap();
        assert_eq!(h1, h2, "spare flow should be reused in place");
        assert_eq!(pool.spare_len(), 0);
        let id2 = f2.lock().id();
        assert_ne!(id1, id2, "reused flow must be reinitialized for the new packet");
        assert_eq!(
            id2,
            crate::flow::flow_id::FlowId::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
                1000,
                80,
                6,
                0,
                0,
            ),
            "reused flow must carry the new packet's tuple, not the old one"
        );
    }

    #[test]
    fn update_spare_flows_reaches_target() {
        let pool = FlowPool::new(FLOW_SIZE * 10, 3, 0);
        pool.update_spare_flows();
        assert_eq!(pool.spare_len(), 3);
        pool.update_spare_flows();
        assert_eq!(pool.spare_len(), 3, "idempotent once target reached");
    }

    #[test]
    fn update_spare_flows_bounded_by_cap() {
        let pool = FlowPool::new(FLOW_SIZE * 2, 10, 0);
        pool.update_spare_flows();
        assert_eq!(pool.spare_len(), 2, "spare target bounded by cap");
    }
}
