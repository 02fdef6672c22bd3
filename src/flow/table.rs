//! The bucketed, per-bucket-locked flow hash table.
//!
//! Generalizes the teacher's per-core `LinkedHashMap<ConnId, Conn<T>>`
//! (`examples/stanford-esrg-retina/core/src/conntrack/mod.rs`) into a
//! single shared table whose buckets are individually locked, as
//! `spec.md` §2 and §4.2 require for a table shared across worker
//! threads rather than sharded one-per-core.

use crate::flow::flow::{Flow, FlowFlags};
use crate::flow::flow_id::FlowId;
use crate::flow::packet::{Direction, PacketMeta};
use crate::flow::pool::{FlowHandle, FlowPool};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A successful lookup-or-create result: the flow handle plus the bits
/// of derived state a caller needs without taking a second lock.
pub struct FlowLookup {
    pub handle: FlowHandle,
    pub flow: Arc<Flow>,
    pub direction: Direction,
    pub flags: FlowFlags,
}

impl FlowLookup {
    /// Whether the flow is established as of this lookup. Re-locks the
    /// flow rather than caching a snapshot, so callers that hold onto a
    /// `FlowLookup` across other work still see the current state.
    pub fn established(&self) -> bool {
        self.flow.lock().established()
    }
}

/// The flow hash table: a fixed array of mutex-guarded bucket chains.
///
/// Buckets hold [`FlowHandle`]s rather than flows directly — the table
/// does not own flow storage, [`FlowPool`] does (`spec.md` §9 Design
/// Notes: "a handle-based design is an acceptable substitute" for the
/// original's intrusive list pointers).
pub struct FlowTable {
    buckets: Vec<Mutex<Vec<FlowHandle>>>,
    hash_rand: u64,
    emergency: AtomicBool,
    prune_idx: AtomicUsize,
}

impl FlowTable {
    /// Builds a table with `hash_size` buckets, seeded with `hash_rand`
    /// (generated once at engine init so collisions can't be predicted
    /// across restarts, `spec.md` §4.2 step 1).
    pub fn new(hash_size: usize, hash_rand: u64) -> Self {
        let mut buckets = Vec::with_capacity(hash_size);
        buckets.resize_with(hash_size, || Mutex::new(Vec::new()));
        FlowTable {
            buckets,
            hash_rand,
            emergency: AtomicBool::new(false),
            prune_idx: AtomicUsize::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Direct bucket access, for the reclaimer's circular walk.
    pub fn bucket(&self, idx: usize) -> &Mutex<Vec<FlowHandle>> {
        &self.buckets[idx]
    }

    pub fn in_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    pub fn set_emergency(&self, value: bool) {
        self.emergency.store(value, Ordering::SeqCst);
    }

    /// Reads, then advances, the persisted reclaim cursor by up to
    /// `bucket_count()` buckets, wrapping around (`spec.md` §4.5 step 1:
    /// "the walk resumes where the previous cycle left off").
    pub fn take_prune_cursor(&self) -> usize {
        self.prune_idx.load(Ordering::SeqCst) % self.bucket_count().max(1)
    }

    pub fn store_prune_cursor(&self, idx: usize) {
        self.prune_idx.store(idx % self.bucket_count().max(1), Ordering::SeqCst);
    }

    /// Total number of flow handles currently held across all buckets.
    pub fn occupancy(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("bucket lock poisoned").len())
            .sum()
    }

    /// Finds or creates the flow for `pkt` (`spec.md` §4.2):
    /// 1. Compute the bucket index from the packet's `FlowId`.
    /// 2. Lock the bucket, scan its chain for a match.
    /// 3. On a hit, resolve direction and update seen-flags.
    /// 4. On a miss, acquire a flow from `pool`, insert it at the head of
    ///    the chain, and return it — marked `ToServer` by definition.
    /// 5. If the pool is exhausted, trip emergency mode and return `None`.
    pub fn get_or_create(&self, pkt: &PacketMeta, pool: &FlowPool) -> Option<FlowLookup> {
        let id = FlowId::new(
            pkt.src, pkt.dst, pkt.sport, pkt.dport, pkt.proto, pkt.vlan0, pkt.vlan1,
        );
        let idx = id.bucket_index(self.hash_rand, self.bucket_count());

        {
            let bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
            if let Some(found) = Self::scan_bucket(&bucket, pkt, pool) {
                return Some(found);
            }
        }

        // Allocation never happens with the bucket lock held (`spec.md` §5):
        // `pool.acquire` takes the spare-queue and arena locks on its own, so
        // holding the bucket lock across it would invert that lock order
        // under contention. The bucket is re-scanned after re-locking in
        // case another thread inserted a matching flow in the meantime.
        let in_emergency = self.in_emergency();
        let (handle, flow) = match pool.acquire(pkt, in_emergency) {
            Some(pair) => pair,
            None => {
                log::warn!("flow table: pool exhausted, entering emergency mode");
                self.set_emergency(true);
                return None;
            }
        };

        let mut bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        if let Some(found) = Self::scan_bucket(&bucket, pkt, pool) {
            drop(bucket);
            pool.release(handle, None);
            return Some(found);
        }
        bucket.insert(0, handle);
        drop(bucket);

        let direction = Direction::ToServer;
        let flags = {
            let mut guard = flow.lock();
            guard.mark_seen(direction, pkt.should_update_seen());
            guard.flags()
        };
        Some(FlowLookup {
            handle,
            flow,
            direction,
            flags,
        })
    }

    /// Scans an already-locked bucket chain for a flow matching `pkt`,
    /// updating its seen-flags on a hit. Shared between the initial scan
    /// and the post-allocation re-check in [`FlowTable::get_or_create`].
    fn scan_bucket(
        bucket: &[FlowHandle],
        pkt: &PacketMeta,
        pool: &FlowPool,
    ) -> Option<FlowLookup> {
        for &handle in bucket.iter() {
            if let Some(flow) = pool.get(handle) {
                if flow.matches(pkt) {
                    let direction = flow.direction(pkt);
                    let flags = {
                        let mut guard = flow.lock();
                        guard.mark_seen(direction, pkt.should_update_seen());
                        guard.flags()
                    };
                    return Some(FlowLookup {
                        handle,
                        flow,
                        direction,
                        flags,
                    });
                }
            }
        }
        None
    }

    /// Removes `handle` from bucket `idx`'s chain, if present. Used by the
    /// reclaimer once a flow has been released back to the pool.
    pub fn remove_from_bucket(&self, idx: usize, handle: FlowHandle) {
        let mut bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        bucket.retain(|&h| h != handle);
    }

    /// Drops every bucket's contents, for engine shutdown. Flow
    /// reclamation itself is the pool's job; the table just forgets the
    /// handles.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().expect("bucket lock poisoned").clear();
        }
        self.prune_idx.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::pool::FLOW_SIZE;
    use std::net::{IpAddr, Ipv4Addr};

    fn pkt(a: u8, b: u8, sport: u16, dport: u16) -> PacketMeta {
        PacketMeta::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            sport,
            dport,
            6,
            0,
            0,
        )
    }

    #[test]
    fn same_flow_reused_across_directions() {
        let table = FlowTable::new(16, 1234);
        let pool = FlowPool::new(FLOW_SIZE * 8, 0, 0);

        let first = table.get_or_create(&pkt(1, 2, 1000, 80), &pool).unwrap();
        assert_eq!(first.direction, Direction::ToServer);
        assert!(!first.established());

        let second = table.get_or_create(&pkt(2, 1, 80, 1000), &pool).unwrap();
        assert_eq!(second.handle, first.handle, "reverse packet hits same flow");
        assert_eq!(second.direction, Direction::ToClient);
        assert!(second.established(), "both directions now seen");

        assert_eq!(table.occupancy(), 1);
    }

    #[test]
    fn distinct_flows_land_in_chain() {
        let table = FlowTable::new(1, 1234);
        let pool = FlowPool::new(FLOW_SIZE * 8, 0, 0);
        let a = table.get_or_create(&pkt(1, 2, 1000, 80), &pool).unwrap();
        let b = table.get_or_create(&pkt(1, 3, 1000, 80), &pool).unwrap();
        assert_ne!(a.handle, b.handle);
        assert_eq!(table.occupancy(), 2);
    }

    #[test]
    fn exhaustion_trips_emergency() {
        let table = FlowTable::new(4, 1234);
        let pool = FlowPool::new(FLOW_SIZE, 0, 0);
        assert!(table.get_or_create(&pkt(1, 2, 1000, 80), &pool).is_some());
        assert!(!table.in_emergency());
        assert!(table.get_or_create(&pkt(1, 3, 1000, 80), &pool).is_none());
        assert!(table.in_emergency());
    }

    #[test]
    fn prune_cursor_wraps() {
        let table = FlowTable::new(4, 1234);
        table.store_prune_cursor(3);
        assert_eq!(table.take_prune_cursor(), 3);
        table.store_prune_cursor(5);
        assert_eq!(table.take_prune_cursor(), 1);
    }
}
