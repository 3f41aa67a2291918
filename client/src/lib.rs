//! # Replication Client Library
//!
//! This library provides the peer-side implementation of the replication
//! protocol. It connects to an authority, negotiates the handshake, and
//! maintains a local mirror of every entity the authority chooses to show
//! this peer.
//!
//! ## Architecture Overview
//!
//! The client is deliberately thin. It holds no authoritative state and
//! makes no gameplay decisions; it mirrors what the authority sends and
//! reports back only the narrow slice of state it is allowed to assert.
//!
//! ### Mirrored World
//! Entities exist locally only because the authority announced them. The
//! mirror maps the authority's net ids onto local entities and applies
//! creates, updates, and removes in arrival order, so it is always a
//! consistent (if slightly stale) view of the authoritative graph.
//!
//! ### Owner-Sourced Input
//! For entities this peer owns, designated fields flow the other way: the
//! client edits them locally, marks them dirty, and flushes them as
//! deltas once per tick. The packing layer filters those deltas by field
//! policy before they reach the wire, so a misbehaving client build
//! cannot even express an illegal update.
//!
//! ### Sequential Handshake
//! Version, schema table, and identity are exchanged before any entity
//! state flows. A mismatch on any of them ends the session with a typed
//! reason instead of letting two incompatible builds exchange garbage.
//!
//! ## Module Organization
//!
//! ### Remote Module (`remote`)
//! The client-side entity mirror:
//! - Net id to local entity mapping
//! - Policy-checked application of entity traffic
//! - Dirty tracking and delta packing for owned entities
//! - Entity reference resolution for events
//!
//! ### Network Module (`network`)
//! The session driver:
//! - TCP connect and the three-step handshake
//! - Framed envelope encode and decode
//! - The per-tick select loop: apply inbound, flush outbound
//! - Keep-alive and clean farewell
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080", "wanderer", true).await?;
//!
//!     // Handshake, then mirror entity traffic until the session ends.
//!     client.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Trust Model
//!
//! ### The Authority Is Believed
//! Every declared field the authority sends is applied. The client does
//! not second-guess visibility or ownership decisions; it cannot see
//! enough of the graph to do so correctly.
//!
//! ### The Client Is Not
//! Everything this client sends is re-checked by the authority against
//! ownership and field policy. The local filtering in this library is a
//! correctness aid, not a security boundary; the server-side checks hold
//! even against a modified client.

pub mod network;
pub mod remote;
