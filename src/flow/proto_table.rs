//! Per-protocol timeout policy table.
//!
//! A small, dense table indexed by [`map_proto`] rather than the full IP
//! protocol number space (`spec.md` §4.6); generalizes the teacher's
//! inline TCP/UDP timeout fields on `ConnTrackConfig`
//! (`conntrack/mod.rs`'s `TrackerConfig`) into a proper per-protocol array
//! with an emergency column, as the spec requires.

use crate::config::ConfigStore;
use crate::flow::flow::{Flow, FlowState};

use std::any::Any;
use std::sync::Arc;

/// IP protocol number for TCP.
pub const TCP_PROTO: u8 = 6;
/// IP protocol number for UDP.
pub const UDP_PROTO: u8 = 17;
/// IP protocol number for ICMPv4.
pub const ICMP_PROTO: u8 = 1;
/// IP protocol number for ICMPv6.
pub const ICMPV6_PROTO: u8 = 58;

/// Dense index into [`ProtoTable`]'s entries.
pub const DEFAULT_IDX: usize = 0;
pub const TCP_IDX: usize = 1;
pub const UDP_IDX: usize = 2;
pub const ICMP_IDX: usize = 3;
const NUM_PROTOS: usize = 4;

/// Projects an arbitrary IP protocol number onto the dense
/// `{default, tcp, udp, icmp}` index space. Unknown protocols map to
/// `DEFAULT_IDX`.
pub fn map_proto(ip_proto: u8) -> usize {
    match ip_proto {
        TCP_PROTO => TCP_IDX,
        UDP_PROTO => UDP_IDX,
        ICMP_PROTO | ICMPV6_PROTO => ICMP_IDX,
        _ => DEFAULT_IDX,
    }
}

pub const DEFAULT_NEW_DEFAULT: u32 = 30;
pub const DEFAULT_EST_DEFAULT: u32 = 300;
pub const DEFAULT_CLOSED_DEFAULT: u32 = 30;
pub const DEFAULT_EMERG_NEW_DEFAULT: u32 = 10;
pub const DEFAULT_EMERG_EST_DEFAULT: u32 = 30;
pub const DEFAULT_EMERG_CLOSED_DEFAULT: u32 = 10;

pub const TCP_NEW_DEFAULT: u32 = 60;
pub const TCP_EST_DEFAULT: u32 = 3600;
pub const TCP_CLOSED_DEFAULT: u32 = 120;
pub const TCP_EMERG_NEW_DEFAULT: u32 = 10;
pub const TCP_EMERG_EST_DEFAULT: u32 = 100;
pub const TCP_EMERG_CLOSED_DEFAULT: u32 = 20;

pub const UDP_NEW_DEFAULT: u32 = 30;
pub const UDP_EST_DEFAULT: u32 = 300;
pub const UDP_EMERG_NEW_DEFAULT: u32 = 10;
pub const UDP_EMERG_EST_DEFAULT: u32 = 100;

pub const ICMP_NEW_DEFAULT: u32 = 30;
pub const ICMP_EST_DEFAULT: u32 = 300;
pub const ICMP_EMERG_NEW_DEFAULT: u32 = 10;
pub const ICMP_EMERG_EST_DEFAULT: u32 = 100;

/// `{new, established, closed} x {normal, emergency}` timeouts for one
/// protocol, in seconds. UDP and ICMP ignore `closed`/`emergency_closed`
/// (`spec.md` §4.6: "UDP and ICMP have no 'closed' concept").
#[derive(Debug, Clone, Copy)]
pub struct ProtoTimeouts {
    pub new: u32,
    pub established: u32,
    pub closed: u32,
    pub emergency_new: u32,
    pub emergency_established: u32,
    pub emergency_closed: u32,
}

/// Frees a protocol-specific context. Expected not to fail
/// (`spec.md` §7: "callback failures: treated as void").
pub type FreeFn = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;
/// Derives a flow's [`FlowState`] from its protocol context.
pub type StateFn = Arc<dyn Fn(&Flow) -> FlowState + Send + Sync>;

#[derive(Clone)]
struct ProtoEntry {
    timeouts: ProtoTimeouts,
    free_fn: Option<FreeFn>,
    state_fn: Option<StateFn>,
}

/// The per-protocol timeout/callback table (`spec.md` §4.6).
///
/// Written only during initialization, on a single thread; read without
/// locking thereafter — the same discipline as [`crate::config::ConfigStore`].
pub struct ProtoTable {
    entries: [ProtoEntry; NUM_PROTOS],
}

impl ProtoTable {
    /// Builds the table from compile-time defaults, then applies any
    /// `flow-timeouts.<proto>.*` overrides found in `config`.
    pub fn init(config: &ConfigStore) -> Self {
        let mut table = ProtoTable {
            entries: [
                ProtoEntry {
                    timeouts: ProtoTimeouts {
                        new: DEFAULT_NEW_DEFAULT,
                        established: DEFAULT_EST_DEFAULT,
                        closed: DEFAULT_CLOSED_DEFAULT,
                        emergency_new: DEFAULT_EMERG_NEW_DEFAULT,
                        emergency_established: DEFAULT_EMERG_EST_DEFAULT,
                        emergency_closed: DEFAULT_EMERG_CLOSED_DEFAULT,
                    },
                    free_fn: None,
                    state_fn: None,
                },
                ProtoEntry {
                    timeouts: ProtoTimeouts {
                        new: TCP_NEW_DEFAULT,
                        established: TCP_EST_DEFAULT,
                        closed: TCP_CLOSED_DEFAULT,
                        emergency_new: TCP_EMERG_NEW_DEFAULT,
                        emergency_established: TCP_EMERG_EST_DEFAULT,
                        emergency_closed: TCP_EMERG_CLOSED_DEFAULT,
                    },
                    free_fn: None,
                    state_fn: None,
                },
                ProtoEntry {
                    timeouts: ProtoTimeouts {
                        new: UDP_NEW_DEFAULT,
                        established: UDP_EST_DEFAULT,
                        closed: 0,
                        emergency_new: UDP_EMERG_NEW_DEFAULT,
                        emergency_established: UDP_EMERG_EST_DEFAULT,
                        emergency_closed: 0,
                    },
                    free_fn: None,
                    state_fn: None,
                },
                ProtoEntry {
                    timeouts: ProtoTimeouts {
                        new: ICMP_NEW_DEFAULT,
                        established: ICMP_EST_DEFAULT,
                        closed: 0,
                        emergency_new: ICMP_EMERG_NEW_DEFAULT,
                        emergency_established: ICMP_EMERG_EST_DEFAULT,
                        emergency_closed: 0,
                    },
                    free_fn: None,
                    state_fn: None,
                },
            ],
        };
        table.apply_config(config);
        table
    }

    fn apply_config(&mut self, config: &ConfigStore) {
        const NAMES: [&str; NUM_PROTOS] = ["default", "tcp", "udp", "icmp"];
        const FIELDS: [&str; 6] = [
            "new",
            "established",
            "closed",
            "emergency-new",
            "emergency-established",
            "emergency-closed",
        ];
        for (idx, name) in NAMES.iter().enumerate() {
            for field in FIELDS {
                let key = format!("flow-timeouts.{name}.{field}");
                let Some(raw) = config.get_int(&key) else {
                    continue;
                };
                if raw <= 0 {
                    log::warn!("config: {key} must be a positive integer, ignoring");
                    continue;
                }
                let value = raw as u32;
                let timeouts = &mut self.entries[idx].timeouts;
                match field {
                    "new" => timeouts.new = value,
                    "established" => timeouts.established = value,
                    "closed" => timeouts.closed = value,
                    "emergency-new" => timeouts.emergency_new = value,
                    "emergency-established" => timeouts.emergency_established = value,
                    "emergency-closed" => timeouts.emergency_closed = value,
                    _ => unreachable!(),
                }
            }
        }
    }

    /// Overrides the normal timeouts for `proto`.
    pub fn set_proto_timeout(&mut self, proto: usize, new: u32, established: u32, closed: u32) {
        let t = &mut self.entries[proto].timeouts;
        t.new = new;
        t.established = established;
        t.closed = closed;
    }

    /// Overrides the emergency timeouts for `proto`.
    pub fn set_proto_emergency_timeout(
        &mut self,
        proto: usize,
        new: u32,
        established: u32,
        closed: u32,
    ) {
        let t = &mut self.entries[proto].timeouts;
        t.emergency_new = new;
        t.emergency_established = established;
        t.emergency_closed = closed;
    }

    /// Registers the protocol-context free callback for `proto`.
    pub fn set_proto_free_func(&mut self, proto: usize, f: FreeFn) {
        self.entries[proto].free_fn = Some(f);
    }

    /// Registers the flow-state derivation callback for `proto`.
    pub fn set_flow_state_func(&mut self, proto: usize, f: StateFn) {
        self.entries[proto].state_fn = Some(f);
    }

    pub fn free_fn(&self, proto: usize) -> Option<&FreeFn> {
        self.entries[proto].free_fn.as_ref()
    }

    pub fn state_fn(&self, proto: usize) -> Option<&StateFn> {
        self.entries[proto].state_fn.as_ref()
    }

    pub fn timeouts(&self, proto: usize) -> ProtoTimeouts {
        self.entries[proto].timeouts
    }

    /// The timeout that applies right now, given `emergency_mode` and
    /// `state` (`spec.md` §4.5 step 2).
    pub fn effective_timeout(&self, proto: usize, emergency_mode: bool, state: FlowState) -> u32 {
        let t = self.timeouts(proto);
        match (emergency_mode, state) {
            (false, FlowState::New) => t.new,
            (false, FlowState::Established) => t.established,
            (false, FlowState::Closed) => t.closed,
            (true, FlowState::New) => t.emergency_new,
            (true, FlowState::Established) => t.emergency_established,
            (true, FlowState::Closed) => t.emergency_closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_timeout_defaults() {
        let table = ProtoTable::init(&ConfigStore::new());
        assert_eq!(table.timeouts(TCP_IDX).new, TCP_NEW_DEFAULT);
        assert_eq!(table.timeouts(UDP_IDX).established, UDP_EST_DEFAULT);
        assert_eq!(table.timeouts(DEFAULT_IDX).new, DEFAULT_NEW_DEFAULT);
        assert_eq!(map_proto(255), DEFAULT_IDX);
    }

    #[test]
    fn free_function_registration() {
        let mut table = ProtoTable::init(&ConfigStore::new());
        let f: FreeFn = Arc::new(|_ctx| {});
        table.set_proto_free_func(TCP_IDX, f.clone());
        table.set_proto_free_func(UDP_IDX, f.clone());
        assert!(table.free_fn(TCP_IDX).is_some());
        assert!(table.free_fn(UDP_IDX).is_some());
        assert!(table.free_fn(ICMP_IDX).is_none());
    }

    #[test]
    fn config_overrides_applied() {
        let mut config = ConfigStore::new();
        config.set("flow-timeouts.tcp.new", "42", true);
        config.set("flow-timeouts.tcp.emergency-established", "7", true);
        let table = ProtoTable::init(&config);
        assert_eq!(table.timeouts(TCP_IDX).new, 42);
        assert_eq!(table.timeouts(TCP_IDX).emergency_established, 7);
        assert_eq!(table.timeouts(TCP_IDX).established, TCP_EST_DEFAULT);
    }

    #[test]
    fn invalid_override_falls_back_to_default() {
        let mut config = ConfigStore::new();
        config.set("flow-timeouts.tcp.new", "-5", true);
        let table = ProtoTable::init(&config);
        assert_eq!(table.timeouts(TCP_IDX).new, TCP_NEW_DEFAULT);
    }
}
