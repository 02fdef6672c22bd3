//! The flow record: per-conversation state tracked by the engine.

use crate::flow::flow_id::FlowId;
use crate::flow::packet::{Direction, PacketMeta};

use bitmask_enum::bitmask;
use std::any::Any;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Per-flow bitset.
///
/// `Emergency` is set on flows created while the engine is in emergency
/// mode (`spec.md` §3); the `*IpOnlySet` bits mark that the IP-layer-only
/// filter stage has already run in that direction.
#[bitmask(u8)]
pub enum FlowFlags {
    ToDstSeen,
    ToSrcSeen,
    ToServerIpOnlySet,
    ToClientIpOnlySet,
    NoPacketInspection,
    NoPayloadInspection,
    Emergency,
}

/// Coarse connection state.
///
/// For TCP this is derived via the per-protocol state callback
/// (`spec.md` §3, §4.5); for other protocols it transitions `New ->
/// Established` once both direction-seen bits are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    Established,
    Closed,
}

/// The portion of a flow mutated under its own lock.
///
/// The endpoint tuple lives here too, even though `spec.md` §3's invariant
/// is "tuple never mutates after insertion": the only code that mutates it
/// is [`Flow::reinit`], called while the flow sits in the spare queue
/// rather than a bucket, and it must go through the same lock as every
/// other mutation so that `clear`/`reinit` never need unique ownership of
/// the `Flow` — only `Arc<Flow>` is ever handed out, so `&mut Flow` is
/// never actually available to callers.
pub struct FlowMut {
    pub(crate) id: FlowId,
    /// Address/port of the packet that created this flow — the
    /// originator side, used for direction resolution.
    pub(crate) orig_src: IpAddr,
    pub(crate) orig_sport: u16,
    pub(crate) proto: u8,
    pub(crate) lastts: SystemTime,
    pub(crate) flags: FlowFlags,
    pub(crate) state: FlowState,
    pub(crate) protoctx: Option<Box<dyn Any + Send>>,
    pub(crate) appctx: Option<Box<dyn Any + Send>>,
}

/// A flow: the per-conversation state object.
///
/// Bucket/spare-queue membership is tracked by the table and pool via
/// [`crate::flow::pool::FlowHandle`] indices into a shared arena, rather
/// than intrusive pointers embedded in the flow itself (`spec.md` §9
/// Design Notes).
pub struct Flow {
    /// Retention count: incremented by subsystems holding this flow beyond
    /// the call that returned it. Reclamation must not evict a flow with
    /// `use_cnt > 0` (`spec.md` §3, §4.5).
    use_cnt: AtomicU32,
    inner: Mutex<FlowMut>,
}

impl Flow {
    /// Creates a new flow, initialized from the packet that created it.
    /// The packet's own address/port become the originator ("to server")
    /// side (`spec.md` §4.2 step 4: "canonical orientation = packet
    /// direction at first sight").
    pub fn new(pkt: &PacketMeta, in_emergency: bool) -> Self {
        let id = FlowId::new(
            pkt.src, pkt.dst, pkt.sport, pkt.dport, pkt.proto, pkt.vlan0, pkt.vlan1,
        );
        let mut flags = FlowFlags::none();
        if in_emergency {
            flags |= FlowFlags::Emergency;
        }
        Flow {
            use_cnt: AtomicU32::new(0),
            inner: Mutex::new(FlowMut {
                id,
                orig_src: pkt.src,
                orig_sport: pkt.sport,
                proto: pkt.proto,
                lastts: pkt.timestamp,
                flags,
                state: FlowState::New,
                protoctx: None,
                appctx: None,
            }),
        }
    }

    /// Returns `true` if `pkt` matches this flow's tuple in either
    /// orientation (`spec.md` §4.2 step 3).
    pub fn matches(&self, pkt: &PacketMeta) -> bool {
        let inner = self.inner.lock().expect("flow lock poisoned");
        inner.id
            == FlowId::new(
                pkt.src, pkt.dst, pkt.sport, pkt.dport, pkt.proto, pkt.vlan0, pkt.vlan1,
            )
    }

    /// Direction resolution (`spec.md` §4.2): for TCP/UDP/SCTP with
    /// differing ports, compare source ports; when ports match, compare
    /// addresses. For ICMP(v6), compare addresses only. Default is
    /// `ToServer`.
    pub fn direction(&self, pkt: &PacketMeta) -> Direction {
        const TCP: u8 = 6;
        const UDP: u8 = 17;
        const SCTP: u8 = 132;

        let inner = self.inner.lock().expect("flow lock poisoned");
        let matches_orig = if matches!(inner.proto, TCP | UDP | SCTP) && pkt.sport != pkt.dport {
            pkt.sport == inner.orig_sport
        } else if matches!(inner.proto, 1 | 58) {
            pkt.src == inner.orig_src
        } else {
            pkt.src == inner.orig_src && pkt.sport == inner.orig_sport
        };
        if matches_orig {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// Acquires the per-flow lock and returns a scoped accessor.
    ///
    /// This resolves the "flow lock returned held" Open Question from
    /// `spec.md` §9 Design Notes in favor of an RAII guard: the lock is
    /// released when the returned [`FlowGuard`] is dropped, rather than by
    /// an explicit, easy-to-forget unlock call.
    pub fn lock(&self) -> FlowGuard<'_> {
        FlowGuard {
            flow: self,
            inner: self.inner.lock().expect("flow lock poisoned"),
        }
    }

    /// Non-blocking lock attempt, used by the reclaimer so it never blocks
    /// on a lock a packet worker holds (`spec.md` §5).
    pub fn try_lock(&self) -> Option<FlowGuard<'_>> {
        self.inner.try_lock().ok().map(|inner| FlowGuard {
            flow: self,
            inner,
        })
    }

    /// IP protocol number this flow was created from.
    pub fn proto(&self) -> u8 {
        self.inner.lock().expect("flow lock poisoned").proto
    }

    /// Current retention count.
    pub fn use_cnt(&self) -> u32 {
        self.use_cnt.load(Ordering::SeqCst)
    }

    pub fn incr_use_cnt(&self) {
        self.use_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the retention count. Panics on underflow: a `use_cnt`
    /// that would go negative is a misuse of the incr/decr contract
    /// (`spec.md` §3 invariant "`use_cnt >= 0` at all times").
    pub fn decr_use_cnt(&self) {
        let prev = self.use_cnt.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "use_cnt underflow");
    }

    /// Prepares the flow for reuse (`spec.md` §4.4): invokes `free_cb` on
    /// any protocol context, then resets all fields except the identity
    /// fields mutated in place by the caller on next use. Idempotent.
    ///
    /// Takes `&self`, not `&mut self`: the pool only ever holds flows
    /// behind `Arc<Flow>`, and mutating through the flow's own lock rather
    /// than `Arc::get_mut` means this works regardless of how many `Arc`
    /// clones of the flow happen to be outstanding.
    pub fn clear(&self, free_cb: Option<&dyn Fn(Box<dyn Any + Send>)>) {
        self.use_cnt.store(0, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("flow lock poisoned");
        if let Some(ctx) = inner.protoctx.take() {
            if let Some(free_cb) = free_cb {
                free_cb(ctx);
            }
        }
        inner.appctx = None;
        inner.flags = FlowFlags::none();
        inner.state = FlowState::New;
        inner.lastts = SystemTime::UNIX_EPOCH;
    }

    /// Reinitializes a cleared flow in place for reuse from the spare
    /// queue, as if freshly allocated (`spec.md` §4.3 step 1). Also takes
    /// `&self`, for the same reason as [`Flow::clear`].
    pub fn reinit(&self, pkt: &PacketMeta, in_emergency: bool) {
        let mut inner = self.inner.lock().expect("flow lock poisoned");
        inner.id = FlowId::new(
            pkt.src, pkt.dst, pkt.sport, pkt.dport, pkt.proto, pkt.vlan0, pkt.vlan1,
        );
        inner.orig_src = pkt.src;
        inner.orig_sport = pkt.sport;
        inner.proto = pkt.proto;
        inner.lastts = pkt.timestamp;
        inner.state = FlowState::New;
        inner.flags = if in_emergency {
            FlowFlags::Emergency
        } else {
            FlowFlags::none()
        };
    }
}

/// A scoped, locked accessor for a flow's mutable state.
///
/// Dropping the guard releases the per-flow lock. Downstream stages that
/// need to retain the flow beyond this call should call
/// [`Flow::incr_use_cnt`] (via [`crate::flow::engine::FlowEngine::incr_use_cnt`])
/// before dropping their guard; `use_cnt` is independent of the lock
/// (`spec.md` §9 Design Notes, "`use_cnt` vs. lock").
pub struct FlowGuard<'a> {
    flow: &'a Flow,
    inner: MutexGuard<'a, FlowMut>,
}

impl<'a> FlowGuard<'a> {
    pub fn id(&self) -> FlowId {
        self.inner.id
    }

    pub fn state(&self) -> FlowState {
        self.inner.state
    }

    pub fn set_state(&mut self, state: FlowState) {
        self.inner.state = state;
    }

    pub fn flags(&self) -> FlowFlags {
        self.inner.flags
    }

    pub fn set_flag(&mut self, flag: FlowFlags) {
        self.inner.flags |= flag;
    }

    pub fn has_flag(&self, flag: FlowFlags) -> bool {
        self.inner.flags.contains(flag)
    }

    pub fn established(&self) -> bool {
        self.inner.state == FlowState::Established
    }

    pub fn lastts(&self) -> SystemTime {
        self.inner.lastts
    }

    pub fn touch(&mut self, ts: SystemTime) {
        self.inner.lastts = ts;
    }

    pub fn use_cnt(&self) -> u32 {
        self.flow.use_cnt()
    }

    pub fn protoctx(&self) -> Option<&(dyn Any + Send)> {
        self.inner.protoctx.as_deref()
    }

    pub fn set_protoctx(&mut self, ctx: Box<dyn Any + Send>) {
        self.inner.protoctx = Some(ctx);
    }

    pub fn appctx(&self) -> Option<&(dyn Any + Send)> {
        self.inner.appctx.as_deref()
    }

    pub fn set_appctx(&mut self, ctx: Box<dyn Any + Send>) {
        self.inner.appctx = Some(ctx);
    }

    /// Drops the application-layer context once a higher layer is done
    /// with it, independent of clearing the whole flow for reuse.
    pub fn clear_appctx(&mut self) {
        self.inner.appctx = None;
    }

    /// Seen-flag maintenance and established-state promotion
    /// (`spec.md` §4.2): on a qualifying packet, sets the direction's seen
    /// bit; once both are set, marks the flow `Established`.
    pub fn mark_seen(&mut self, dir: Direction, should_update: bool) {
        if !should_update {
            return;
        }
        match dir {
            Direction::ToServer => self.set_flag(FlowFlags::ToDstSeen),
            Direction::ToClient => self.set_flag(FlowFlags::ToSrcSeen),
        }
        if self.has_flag(FlowFlags::ToDstSeen) && self.has_flag(FlowFlags::ToSrcSeen) {
            self.set_state(FlowState::Established);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pkt(src: u8, dst: u8, sport: u16, dport: u16) -> PacketMeta {
        PacketMeta::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, src)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, dst)),
            sport,
            dport,
            6,
            0,
            0,
        )
    }

    #[test]
    fn direction_stability() {
        let p0 = pkt(1, 2, 1000, 80);
        let flow = Flow::new(&p0, false);
        assert_eq!(flow.direction(&p0), Direction::ToServer);
        let reply = pkt(2, 1, 80, 1000);
        assert_eq!(flow.direction(&reply), Direction::ToClient);
    }

    #[test]
    fn seen_idempotence_and_established() {
        let p0 = pkt(1, 2, 1000, 80);
        let flow = Flow::new(&p0, false);
        let mut guard = flow.lock();
        guard.mark_seen(Direction::ToServer, true);
        guard.mark_seen(Direction::ToServer, true);
        assert!(!guard.established());
        guard.mark_seen(Direction::ToClient, true);
        assert!(guard.established());
        guard.mark_seen(Direction::ToServer, true);
        assert!(guard.established(), "established is monotonic");
    }

    #[test]
    fn icmpv4_error_does_not_set_seen() {
        let p0 = pkt(1, 2, 1000, 80);
        let flow = Flow::new(&p0, false);
        let mut err = pkt(2, 1, 80, 1000);
        err.icmpv4_error = true;
        let dir = flow.direction(&err);
        let mut guard = flow.lock();
        guard.mark_seen(dir, err.should_update_seen());
        assert!(!guard.has_flag(FlowFlags::ToSrcSeen));
    }

    #[test]
    fn use_cnt_nonnegative() {
        let p0 = pkt(1, 2, 1000, 80);
        let flow = Flow::new(&p0, false);
        flow.incr_use_cnt();
        flow.decr_use_cnt();
        assert_eq!(flow.use_cnt(), 0);
    }

    #[test]
    #[should_panic(expected = "use_cnt underflow")]
    fn use_cnt_underflow_panics() {
        let p0 = pkt(1, 2, 1000, 80);
        let flow = Flow::new(&p0, false);
        flow.decr_use_cnt();
    }

    #[test]
    fn clear_is_idempotent() {
        let p0 = pkt(1, 2, 1000, 80);
        let flow = Flow::new(&p0, false);
        flow.clear(None);
        flow.clear(None);
        assert_eq!(flow.lock().flags(), FlowFlags::none());
    }
}
