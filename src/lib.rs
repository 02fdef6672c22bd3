#![allow(clippy::needless_doctest_main)]

//! The flow table at the center of a packet-inspection engine.
//!
//! This crate implements the data structure and protocols that associate
//! every observed packet with a bidirectional "flow" record, maintain
//! per-flow state across the lifetime of a network conversation, and
//! reclaim memory under pressure. It does not decode packets, reassemble
//! TCP streams, parse application-layer protocols, or perform detection —
//! those are external collaborators that consume the [`flow::flow::FlowGuard`]s
//! this crate hands back.
//!
//! Three pieces make up the engine:
//!
//! - A bucketed, per-bucket-locked flow hash table ([`flow::table::FlowTable`])
//!   with capacity governed by a memory cap ([`flow::pool::FlowPool`]).
//! - The flow lifecycle and reclamation engine: preallocation pool,
//!   timeout-driven eviction, and an emergency mode that activates when the
//!   cap is neared ([`flow::reclaim::Reclaimer`]).
//! - The per-protocol timeout policy table driving eviction decisions
//!   ([`flow::proto_table::ProtoTable`]).
//!
//! [`flow::engine::FlowEngine`] ties these together behind the external
//! interface a packet-processing pipeline actually calls:
//!
//! ```rust
//! use flow_table::config::ConfigStore;
//! use flow_table::flow::engine::FlowEngine;
//! use flow_table::flow::packet::PacketMeta;
//! use flow_table::flow::proto_table::TCP_PROTO;
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! let config = ConfigStore::new();
//! let mut engine = FlowEngine::init(&config, true).unwrap();
//!
//! let pkt = PacketMeta::new(
//!     IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
//!     IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
//!     1000,
//!     80,
//!     TCP_PROTO,
//!     0,
//!     0,
//! );
//! if let Some(guard) = engine.handle_packet(&pkt) {
//!     println!("established: {}", guard.established());
//! }
//! engine.shutdown();
//! ```

pub mod config;
pub mod flow;

pub use self::flow::engine::FlowEngine;
pub use self::flow::flow_id::FlowId;
