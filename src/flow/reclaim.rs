//! The flow lifecycle/reclamation engine.
//!
//! A circular, resumable walk over the table's buckets that expires idle
//! flows and manages emergency mode, grounded on the teacher's
//! `TimerWheel` (`examples/stanford-esrg-retina/core/src/conntrack/timerwheel.rs`):
//! same `crossbeam_channel::tick` cadence and persisted-cursor resume
//! discipline, generalized from one fixed expiry duration per entry to a
//! per-protocol, state-dependent timeout (`spec.md` §4.5).

use crate::flow::pool::FlowPool;
use crate::flow::proto_table::{map_proto, ProtoTable};
use crate::flow::table::FlowTable;
use crate::config::ConfigStore;

use crossbeam_channel::{select, Receiver};
use std::time::{Duration, SystemTime};

const DEFAULT_PRUNE_FLOWS: usize = 5;
const DEFAULT_EMERGENCY_RECOVERY_PCT: u64 = 30;

/// Walks the flow table evicting idle flows and tracking emergency mode.
pub struct Reclaimer {
    /// Max flows freed per bucket visited in one pass (`spec.md` §4.5,
    /// config key `flow.prune-flows`).
    max_per_visit: usize,
    /// Emergency mode clears once occupied memory falls to
    /// `memcap * (100 - emergency_recovery_pct) / 100` (`spec.md` §4.5
    /// step 4, config key `flow.emergency-recovery`).
    emergency_recovery_pct: u64,
}

impl Reclaimer {
    pub fn init(config: &ConfigStore) -> Self {
        let max_per_visit = config
            .get_int("flow.prune-flows")
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_PRUNE_FLOWS);
        let emergency_recovery_pct = match config.get_int("flow.emergency-recovery") {
            Some(v) if (1..=100).contains(&v) => v as u64,
            Some(v) => {
                log::warn!(
                    "config: flow.emergency-recovery must be in 1..=100, got {v}, using default"
                );
                DEFAULT_EMERGENCY_RECOVERY_PCT
            }
            None => DEFAULT_EMERGENCY_RECOVERY_PCT,
        };
        Reclaimer {
            max_per_visit,
            emergency_recovery_pct,
        }
    }

    /// One reclamation pass: resumes from the table's persisted cursor,
    /// visits buckets circularly until `max_per_visit` flows have been
    /// freed or every bucket has been visited once, then persists the
    /// cursor for the next pass. Returns the number of flows freed.
    pub fn run_once(
        &self,
        table: &FlowTable,
        pool: &FlowPool,
        protos: &ProtoTable,
        now: SystemTime,
    ) -> usize {
        let bucket_count = table.bucket_count();
        if bucket_count == 0 {
            return 0;
        }
        let emergency = table.in_emergency();
        let start = table.take_prune_cursor();
        let mut freed = 0usize;
        let mut visited = 0usize;
        let mut idx = start;

        while visited < bucket_count && freed < self.max_per_visit {
            freed += self.visit_bucket(table, pool, protos, idx, emergency, now);
            idx = (idx + 1) % bucket_count;
            visited += 1;
        }
        table.store_prune_cursor(idx);

        if emergency && self.recovered(pool) {
            log::info!("flow reclaim: leaving emergency mode");
            table.set_emergency(false);
        }
        freed
    }

    fn recovered(&self, pool: &FlowPool) -> bool {
        let threshold = pool.memcap() * (100 - self.emergency_recovery_pct) / 100;
        pool.memuse() <= threshold
    }

    fn visit_bucket(
        &self,
        table: &FlowTable,
        pool: &FlowPool,
        protos: &ProtoTable,
        idx: usize,
        emergency: bool,
        now: SystemTime,
    ) -> usize {
        let handles: Vec<_> = {
            let bucket = table.bucket(idx).lock().expect("bucket lock poisoned");
            bucket.clone()
        };

        let mut freed = 0usize;
        for handle in handles {
            let Some(flow) = pool.get(handle) else {
                table.remove_from_bucket(idx, handle);
                continue;
            };
            // Never block on a flow a packet worker currently holds, and
            // never evict one still retained by another subsystem
            // (`spec.md` §4.5 step 2, §3 invariant on `use_cnt`).
            if flow.use_cnt() > 0 {
                continue;
            }
            let Some(guard) = flow.try_lock() else {
                continue;
            };

            let proto_idx = map_proto(flow.proto());
            let state = match protos.state_fn(proto_idx) {
                Some(state_fn) => state_fn(&flow),
                None => guard.state(),
            };
            let timeout = protos.effective_timeout(proto_idx, emergency, state);
            let elapsed = now
                .duration_since(guard.lastts())
                .unwrap_or(Duration::ZERO)
                .as_secs();

            if elapsed < timeout as u64 {
                continue;
            }
            drop(guard);

            table.remove_from_bucket(idx, handle);
            pool.release(handle, protos.free_fn(proto_idx).map(|f| f.as_ref()));
            freed += 1;
        }
        freed
    }

    /// Runs reclamation on a fixed cadence until `shutdown` fires, in the
    /// same tick-driven-loop shape as the teacher's `TimerWheel::run`.
    pub fn run(
        &self,
        table: &FlowTable,
        pool: &FlowPool,
        protos: &ProtoTable,
        interval: Duration,
        shutdown: &Receiver<()>,
    ) {
        let ticker = crossbeam_channel::tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let freed = self.run_once(table, pool, protos, SystemTime::now());
                    if freed > 0 {
                        log::debug!("flow reclaim: freed {freed} flows");
                    }
                }
                recv(shutdown) -> _ => {
                    log::info!("flow reclaim: shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::packet::PacketMeta;
    use crate::flow::pool::FLOW_SIZE;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn pkt(a: u8, b: u8) -> PacketMeta {
        PacketMeta::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            1000,
            80,
            6,
            0,
            0,
        )
    }

    #[test]
    fn idle_flow_is_evicted_after_timeout() {
        let table = FlowTable::new(16, 1);
        let pool = FlowPool::new(FLOW_SIZE * 8, 0, 0);
        let mut protos = ProtoTable::init(&ConfigStore::new());
        protos.set_proto_timeout(crate::flow::proto_table::TCP_IDX, 10, 10, 10);

        let lookup = table.get_or_create(&pkt(1, 2), &pool).unwrap();
        assert_eq!(table.occupancy(), 1);

        let reclaimer = Reclaimer {
            max_per_visit: 10,
            emergency_recovery_pct: 30,
        };
        let soon = SystemTime::now() + Duration::from_secs(1);
        assert_eq!(reclaimer.run_once(&table, &pool, &protos, soon), 0, "not idle yet");

        let later = SystemTime::now() + Duration::from_secs(20);
        assert_eq!(reclaimer.run_once(&table, &pool, &protos, later), 1);
        assert_eq!(table.occupancy(), 0);
        drop(lookup);
    }

    #[test]
    fn retained_flow_survives_reclaim() {
        let table = FlowTable::new(16, 1);
        let pool = FlowPool::new(FLOW_SIZE * 8, 0, 0);
        let mut protos = ProtoTable::init(&ConfigStore::new());
        protos.set_proto_timeout(crate::flow::proto_table::TCP_IDX, 1, 1, 1);

        let lookup = table.get_or_create(&pkt(1, 2), &pool).unwrap();
        lookup.flow.incr_use_cnt();

        let reclaimer = Reclaimer {
            max_per_visit: 10,
            emergency_recovery_pct: 30,
        };
        let later = SystemTime::now() + Duration::from_secs(20);
        assert_eq!(reclaimer.run_once(&table, &pool, &protos, later), 0, "retained flow is skipped");
        assert_eq!(table.occupancy(), 1);
        lookup.flow.decr_use_cnt();
    }

    #[test]
    fn emergency_clears_once_recovered() {
        let table = FlowTable::new(4, 1);
        let pool = FlowPool::new(FLOW_SIZE, 0, 0);
        let protos = ProtoTable::init(&ConfigStore::new());

        assert!(table.get_or_create(&pkt(1, 2), &pool).is_some());
        assert!(table.get_or_create(&pkt(1, 3), &pool).is_none());
        assert!(table.in_emergency());

        let reclaimer = Reclaimer {
            max_per_visit: 10,
            emergency_recovery_pct: 0,
        };
        let later = SystemTime::now() + Duration::from_secs(10_000);
        reclaimer.run_once(&table, &pool, &protos, later);
        assert!(!table.in_emergency(), "occupancy dropped to zero, well under threshold");
    }
}
