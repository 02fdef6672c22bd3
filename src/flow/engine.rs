//! The top-level flow engine: the external interface a packet pipeline
//! actually calls.
//!
//! Composes [`FlowTable`], [`FlowPool`] and [`ProtoTable`] the way the
//! teacher's `conntrack` module is composed from `ConnTracker` + its
//! `TimerWheel` in `mod.rs`, and runs reclamation on its own background
//! thread using the same ticking-loop shape as the teacher's
//! `TimerWheel::run`.

use crate::config::ConfigStore;
use crate::flow::flow::Flow;
use crate::flow::packet::PacketMeta;
use crate::flow::pool::FlowPool;
use crate::flow::proto_table::ProtoTable;
use crate::flow::reclaim::Reclaimer;
use crate::flow::table::{FlowLookup, FlowTable};

use anyhow::{bail, Result};
use crossbeam_channel::{unbounded, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_MEMCAP: u64 = 128 * 1024 * 1024;
const DEFAULT_HASH_SIZE: usize = 65_536;
const DEFAULT_PREALLOC: usize = 1_000;
const DEFAULT_RECLAIM_INTERVAL_MS: u64 = 1_000;
/// Rough per-bucket footprint used when reserving the hash table's own
/// share of the memory cap (`spec.md` §3's `flow_memuse` invariant).
const BUCKET_SIZE: u64 = 32;

/// Ties the flow table, pool, and protocol timeout table together behind
/// the interface a packet-processing pipeline calls.
pub struct FlowEngine {
    table: Arc<FlowTable>,
    pool: Arc<FlowPool>,
    protos: Arc<ProtoTable>,
    reclaimer: Arc<Reclaimer>,
    reclaim_interval: Duration,
    reclaim_shutdown: Mutex<Option<Sender<()>>>,
    reclaim_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FlowEngine {
    /// Initializes the engine from `config` (`spec.md` §6):
    ///
    /// - `flow.memcap` (size, default 128mb)
    /// - `flow.hash-size` (int, default 65536)
    /// - `flow.prealloc` (int, default 1000)
    /// - `flow.reclaim-interval-ms` (int, default 1000; `0` disables the
    ///   background reclaim thread, for embedding in a caller that drives
    ///   reclamation itself)
    /// - per-protocol keys consumed by [`ProtoTable::init`]
    /// - `flow.prune-flows` / `flow.emergency-recovery`, consumed by
    ///   [`Reclaimer::init`]
    ///
    /// Fails if `memcap` cannot even hold the hash table itself
    /// (`spec.md` §4.1: "a misconfigured memcap smaller than the hash
    /// table's own footprint is a fatal initialization error").
    pub fn init(config: &ConfigStore, quiet: bool) -> Result<Self> {
        let memcap = config.get_size("flow.memcap").unwrap_or(DEFAULT_MEMCAP);
        let hash_size = config
            .get_int("flow.hash-size")
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_HASH_SIZE);
        let prealloc = config
            .get_int("flow.prealloc")
            .filter(|v| *v >= 0)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_PREALLOC);
        let reclaim_interval_ms = config
            .get_int("flow.reclaim-interval-ms")
            .filter(|v| *v >= 0)
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_RECLAIM_INTERVAL_MS);

        let reserved = hash_size as u64 * BUCKET_SIZE;
        if memcap < reserved {
            bail!(
                "flow.memcap ({memcap} bytes) is smaller than the hash table's own \
                 footprint ({reserved} bytes for {hash_size} buckets)"
            );
        }

        let hash_rand: u64 = rand::random();
        let table = Arc::new(FlowTable::new(hash_size, hash_rand));
        let pool = Arc::new(FlowPool::new(memcap, prealloc, reserved));
        let protos = Arc::new(ProtoTable::init(config));
        let reclaimer = Arc::new(Reclaimer::init(config));

        pool.update_spare_flows();

        if !quiet {
            log::info!(
                "flow engine: initialized, memcap={memcap} hash-size={hash_size} prealloc={prealloc}"
            );
        }

        let mut engine = FlowEngine {
            table,
            pool,
            protos,
            reclaimer,
            reclaim_interval: Duration::from_millis(reclaim_interval_ms),
            reclaim_shutdown: Mutex::new(None),
            reclaim_thread: Mutex::new(None),
        };
        if reclaim_interval_ms > 0 {
            engine.spawn_reclaim_thread();
        }
        Ok(engine)
    }

    fn spawn_reclaim_thread(&mut self) {
        let (tx, rx) = unbounded();
        let table = self.table.clone();
        let pool = self.pool.clone();
        let protos = self.protos.clone();
        let reclaimer = self.reclaimer.clone();
        let interval = self.reclaim_interval;
        let handle = std::thread::spawn(move || {
            reclaimer.run(&table, &pool, &protos, interval, &rx);
        });
        *self.reclaim_shutdown.lock().expect("poisoned") = Some(tx);
        *self.reclaim_thread.lock().expect("poisoned") = Some(handle);
    }

    /// Finds or creates the flow for `pkt`, updating seen-flags and
    /// established state along the way (`spec.md` §4.2). Returns `None`
    /// if the table is at capacity and a new flow could not be allocated
    /// (emergency mode is now active).
    pub fn handle_packet(&self, pkt: &PacketMeta) -> Option<FlowLookup> {
        self.table.get_or_create(pkt, &self.pool)
    }

    /// Retains `flow` beyond the call that returned it.
    pub fn incr_use_cnt(&self, flow: &Flow) {
        flow.incr_use_cnt();
    }

    /// Releases a retention taken with [`FlowEngine::incr_use_cnt`].
    pub fn decr_use_cnt(&self, flow: &Flow) {
        flow.decr_use_cnt();
    }

    /// Drops a flow's application-layer context once a higher layer is
    /// done parsing it, without otherwise disturbing the flow
    /// (`spec.md` §4.4: app-layer context lifetime is independent of the
    /// flow's own).
    pub fn cleanup_app_layer(&self, lookup: &FlowLookup) {
        lookup.flow.lock().clear_appctx();
    }

    /// Tops the spare queue back up to its configured target, e.g. after
    /// a burst of allocations (`spec.md` §4.3).
    pub fn update_spare_flows(&self) {
        self.pool.update_spare_flows();
    }

    /// Runs one reclamation pass synchronously, bypassing the background
    /// thread. Mainly useful for callers that disabled it via
    /// `flow.reclaim-interval-ms = 0` and want to drive the cadence
    /// themselves.
    pub fn run_reclaim_once(&self) -> usize {
        self.reclaimer
            .run_once(&self.table, &self.pool, &self.protos, std::time::SystemTime::now())
    }

    pub fn in_emergency(&self) -> bool {
        self.table.in_emergency()
    }

    pub fn memuse(&self) -> u64 {
        self.pool.memuse()
    }

    pub fn occupancy(&self) -> usize {
        self.table.occupancy()
    }

    /// Stops the background reclaim thread and drains every flow, live or
    /// spare (`spec.md` §5 "Suspension": engine shutdown frees all flow
    /// memory).
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.reclaim_shutdown.lock().expect("poisoned").take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reclaim_thread.lock().expect("poisoned").take() {
            let _ = handle.join();
        }
        self.table.clear();
        let freed = self.pool.drain_all();
        log::info!("flow engine: shutdown, freed {freed} flows");
    }
}

impl Drop for FlowEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.reclaim_shutdown.lock().expect("poisoned").take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reclaim_thread.lock().expect("poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::proto_table::TCP_PROTO;
    use std::net::{IpAddr, Ipv4Addr};

    fn pkt(a: u8, b: u8) -> PacketMeta {
        PacketMeta::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            1000,
            80,
            TCP_PROTO,
            0,
            0,
        )
    }

    fn quiet_config() -> ConfigStore {
        let mut config = ConfigStore::new();
        config.set("flow.reclaim-interval-ms", "0", true);
        config.set("flow.hash-size", "16", true);
        config
    }

    #[test]
    fn memcap_smaller_than_hash_table_is_fatal() {
        let mut config = ConfigStore::new();
        config.set("flow.hash-size", "65536", true);
        config.set("flow.memcap", "1", true);
        assert!(FlowEngine::init(&config, true).is_err());
    }

    #[test]
    fn handle_packet_creates_and_reuses_flow() {
        let mut engine = FlowEngine::init(&quiet_config(), true).unwrap();
        let first = engine.handle_packet(&pkt(1, 2)).unwrap();
        assert!(!first.established());
        let second = engine.handle_packet(&pkt(2, 1)).unwrap();
        assert_eq!(second.handle, first.handle);
        assert!(second.established());
        assert_eq!(engine.occupancy(), 1);
        engine.shutdown();
        assert_eq!(engine.occupancy(), 0);
    }

    #[test]
    fn use_cnt_retention_round_trips() {
        let mut engine = FlowEngine::init(&quiet_config(), true).unwrap();
        let lookup = engine.handle_packet(&pkt(1, 2)).unwrap();
        engine.incr_use_cnt(&lookup.flow);
        assert_eq!(lookup.flow.use_cnt(), 1);
        engine.decr_use_cnt(&lookup.flow);
        assert_eq!(lookup.flow.use_cnt(), 0);
        engine.shutdown();
    }

    #[test]
    fn manual_reclaim_runs_without_background_thread() {
        let mut engine = FlowEngine::init(&quiet_config(), true).unwrap();
        engine.handle_packet(&pkt(1, 2));
        assert_eq!(engine.run_reclaim_once(), 0, "flow is fresh, not idle yet");
        engine.shutdown();
    }
}
