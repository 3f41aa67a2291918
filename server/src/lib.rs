//! # Replication Server Library
//!
//! This library implements the authoritative side of entity replication. It
//! owns the canonical world, decides per peer which entities and fields may
//! be seen, applies the narrow set of writes peers are trusted to make, and
//! streams the resulting state over framed TCP connections.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The world held here is the definitive one. Peers receive projections of
//! it filtered by ownership and per-field policy; nothing a peer sends is
//! applied without passing the same policy in reverse.
//!
//! ### Connection Lifecycle
//! Every connection walks the same path: accepted, authenticated through a
//! version and schema handshake, joined with its own client entity, and
//! eventually torn down with its owned entities reclaimed. Each step has a
//! timeout so half-open connections cannot accumulate.
//!
//! ### Visibility Bookkeeping
//! For every joined peer the server tracks which entities have had their
//! initial sync, which are currently visible, and which components changed
//! since the last flush. Initial sync happens at most once per entity per
//! connection; visibility afterwards is expressed purely through removes.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Driver
//! All replication decisions run on one task. The transport tasks do
//! nothing but frame bytes and forward [`connection::NetEvent`]s into a
//! channel the driver drains, so ledger and visibility state need no locks
//! and every decision is deterministic for a given event order.
//!
//! ### Bounded Outbound Queues
//! Each connection buffers a fixed number of outbound envelopes. A peer
//! that cannot keep up overflows its queue and is disconnected, rather
//! than growing server memory without bound.
//!
//! ### Tick-Batched Flushing
//! World changes accumulate as per-peer marks and go out in one batch per
//! tick: removes first, then initial syncs, then deltas, then events. A
//! component that changes five times between ticks is packed once.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! TCP accept loop and the per-connection task: length-prefixed frame
//! reassembly inbound, envelope encoding outbound, teardown reporting.
//!
//! ### Ledger Module (`ledger`)
//! Network id allocation and the ownership forest, including the
//! depth-capped chain walk and subtree enumeration.
//!
//! ### Peer Module (`peer`)
//! Per-peer visibility and dirty-mark state between flushes.
//!
//! ### Replication Module (`replication`)
//! The driver itself: handshake state machine, trust enforcement on
//! inbound traffic, audience evaluation, and the per-tick flush.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::connection::run_listener;
//! use server::replication::{ReplicationConfig, ReplicationServer};
//! use shared::components::standard_schema;
//! use shared::world::World;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReplicationConfig::default();
//!     let mut world = World::new();
//!     let mut replication =
//!         ReplicationServer::new(config.clone(), Arc::new(standard_schema()));
//!
//!     let listener = TcpListener::bind("127.0.0.1:9000").await?;
//!     let (events_tx, mut events_rx) = mpsc::channel(1024);
//!     tokio::spawn(run_listener(listener, events_tx, config.queue_capacity));
//!
//!     let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms));
//!     loop {
//!         tokio::select! {
//!             Some(event) = events_rx.recv() => {
//!                 replication.handle_event(&mut world, event);
//!             }
//!             _ = ticker.tick() => {
//!                 // Simulation runs here, then the flush sends the results.
//!                 replication.flush(&mut world);
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! ## Security Considerations
//!
//! ### Ownership Checks
//! Every peer-sourced update and event is checked against the ownership
//! forest before anything else. A peer can only affect entities whose
//! chain reaches its client entity.
//!
//! ### Field Policy
//! Within an owned entity, only fields declared owner-sourced are
//! accepted. Forbidden fields are dropped individually and logged for
//! audit while the rest of the message still applies, so a buggy client
//! degrades instead of desyncing.
//!
//! ### Malformed Traffic
//! Frames over the size cap, undecodable envelopes, and messages that make
//! no sense in the connection's lifecycle state all end the connection.

pub mod connection;
pub mod ledger;
pub mod peer;
pub mod replication;
pub mod utils;
