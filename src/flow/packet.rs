//! The decoded-packet boundary type.
//!
//! Packet decoding itself is out of scope for this crate (it is handled by
//! an external collaborator); `PacketMeta` is the narrowest view of a
//! decoded packet the flow engine needs in order to locate or create a
//! flow, resolve direction, and maintain seen-flags.

use std::net::IpAddr;
use std::time::SystemTime;

/// An already-decoded packet, as handed to [`crate::flow::engine::FlowEngine::handle_packet`].
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
    /// IP protocol number (e.g. 6 = TCP, 17 = UDP, 1 = ICMPv4).
    pub proto: u8,
    pub vlan0: u16,
    pub vlan1: u16,
    /// `true` if this is an ICMPv4 "error message" packet (destination
    /// unreachable, time exceeded, etc.) — such packets do not update seen
    /// flags, per `spec.md` §4.2 and §8.
    pub icmpv4_error: bool,
    /// Observation time, seconds resolution.
    pub timestamp: SystemTime,
}

impl PacketMeta {
    /// Convenience constructor for a non-ICMP-error packet observed "now".
    pub fn new(
        src: IpAddr,
        dst: IpAddr,
        sport: u16,
        dport: u16,
        proto: u8,
        vlan0: u16,
        vlan1: u16,
    ) -> Self {
        PacketMeta {
            src,
            dst,
            sport,
            dport,
            proto,
            vlan0,
            vlan1,
            icmpv4_error: false,
            timestamp: SystemTime::now(),
        }
    }

    /// Whether seen-flags should be updated for this packet: true unless
    /// it is an ICMPv4 error message (`spec.md` §4.2).
    pub fn should_update_seen(&self) -> bool {
        !self.icmpv4_error
    }
}

/// The direction of a packet relative to the flow that "owns" it.
///
/// `ToServer` is the direction of the packet that created the flow (the
/// originator); `ToClient` is its reverse. Default is `ToServer`
/// (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    pub fn is_to_server(self) -> bool {
        matches!(self, Direction::ToServer)
    }
}
