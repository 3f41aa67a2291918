//! # Replication Shared Library
//!
//! Protocol pieces used by both ends of a replication session: the
//! authoritative server and every connected client depend on this crate and
//! nothing here depends on which side it runs on.
//!
//! ## What Lives Here
//!
//! ### Wire Format
//! [`wire`] frames, compresses, and encodes discrete messages; [`messages`]
//! defines the envelope those frames carry. Both directions use the same
//! codec, so a frame produced by either side can be decoded by the other.
//!
//! ### Replication Policy
//! [`policy`] holds the per-field send/accept rules for both trust levels,
//! and [`schema`] the explicitly-registered descriptor tables those rules
//! consult. [`pack`] applies policy to live components, producing and
//! consuming the packed field lists that ride in entity messages.
//!
//! ### World Model
//! [`world`] is the minimal entity store both sides simulate against, with
//! a change-event queue the replication layer drains each tick.
//! [`entity_ref`] turns entity handles into transferable references and
//! back. [`components`] is the concrete replicated component/event set and
//! the schema registration both binaries share.
//!
//! ## Trust Model
//!
//! The authority's view is canonical. A client may only assert fields whose
//! direction is owner-sourced, and only for entities its client entity
//! owns; everything else it sends is dropped and audited on the authority.
//! In the other direction clients apply whatever the authority says.

pub mod components;
pub mod entity_ref;
pub mod error;
pub mod messages;
pub mod pack;
pub mod policy;
pub mod schema;
pub mod wire;
pub mod world;
