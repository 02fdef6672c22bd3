//! Flow state management.
//!
//! Most of this module's functionality is maintained internally by the
//! engine and is not meant to be directly managed by callers. It publicly
//! exposes the flow identifiers, the packet-boundary types, and the
//! top-level [`engine::FlowEngine`] handle that a packet-processing
//! pipeline drives.

pub mod engine;
pub mod flow;
pub mod flow_id;
pub mod packet;
pub mod pool;
pub mod proto_table;
pub mod reclaim;
pub mod table;
