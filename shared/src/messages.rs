//! Protocol messages and the connection lifecycle states.
//!
//! [`Envelope`] is the single discriminated union that crosses the wire;
//! every frame carries exactly one. Entity payloads travel as
//! [`PackedComponent`] values: per-field tag/value pairs already filtered by
//! the replication policy on the sending side.

use crate::entity_ref::WireRef;
use crate::error::DisconnectReason;
use crate::schema::{ComponentTypeId, EventId, FieldId, SchemaTable};
use crate::world::NetId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of this wire protocol. Bumped on any incompatible change to the
/// envelope or framing; the handshake refuses mismatches.
pub const PROTOCOL_VERSION: u32 = 1;

/// Interval of the authority's replication flush, in milliseconds.
pub const NET_TICK_MS: u64 = 50;

/// One replicated field: the field id from the component's descriptor and
/// its encoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedField {
    pub field: FieldId,
    pub data: Vec<u8>,
}

/// One component's worth of replicated fields. For an initial send this is
/// a full snapshot (all fields the policy allows); for a delta it carries
/// only changed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedComponent {
    pub type_id: ComponentTypeId,
    pub fields: Vec<PackedField>,
}

/// Every message that can cross the wire, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Client → authority. Opens the handshake.
    HandshakeRequest {
        protocol_version: u32,
        player_name: String,
        schema: SchemaTable,
    },
    /// Authority → client. The handshake succeeded.
    HandshakeAccept {
        server_name: String,
        tick_ms: u64,
        schema: SchemaTable,
    },
    /// Authority → client. The handshake failed; the connection closes
    /// after this message.
    HandshakeReject {
        reason: DisconnectReason,
        detail: String,
    },
    /// Client → authority. Requests entry into the session.
    JoinRequest { view_distance: u32 },
    /// Authority → client. The client entity exists and the initial sweep
    /// is queued; the session is live.
    JoinResponse { client_net_id: NetId, tick: u64 },

    /// Authority → client. Full initial state of one entity. `owned` tells
    /// the receiving peer whether its own client entity is in this entity's
    /// ownership chain.
    EntityCreate {
        net_id: NetId,
        anchor: Option<[i32; 3]>,
        owned: bool,
        components: Vec<PackedComponent>,
    },
    /// Incremental entity state. Authority → client it may carry component
    /// removals, additions, field deltas, and an ownership flip; client →
    /// authority only `changed` is meaningful and only owner-sourced fields
    /// are accepted.
    EntityUpdate {
        net_id: NetId,
        owned: Option<bool>,
        removed: Vec<ComponentTypeId>,
        added: Vec<PackedComponent>,
        changed: Vec<PackedComponent>,
    },
    /// Authority → client. The entity is no longer visible to this peer.
    EntityRemove { net_id: NetId },

    /// An event dispatched against a target entity reference.
    Event {
        target: WireRef,
        event_id: EventId,
        payload: Vec<u8>,
    },

    /// Keep-alive and clock exchange, both directions.
    TimeSync { tick: u64, server_time_ms: u64 },

    /// Deliberate teardown with a reason, both directions.
    Disconnect { reason: DisconnectReason },
}

impl Envelope {
    /// Short name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::HandshakeRequest { .. } => "handshake-request",
            Envelope::HandshakeAccept { .. } => "handshake-accept",
            Envelope::HandshakeReject { .. } => "handshake-reject",
            Envelope::JoinRequest { .. } => "join-request",
            Envelope::JoinResponse { .. } => "join-response",
            Envelope::EntityCreate { .. } => "entity-create",
            Envelope::EntityUpdate { .. } => "entity-update",
            Envelope::EntityRemove { .. } => "entity-remove",
            Envelope::Event { .. } => "event",
            Envelope::TimeSync { .. } => "time-sync",
            Envelope::Disconnect { .. } => "disconnect",
        }
    }
}

/// Per-connection lifecycle. `Disconnected` is terminal; `Joined` is the
/// only state that exchanges steady-state entity traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connect in progress (client side) or just accepted.
    Connecting,
    /// Waiting on identity and version exchange.
    Authenticating,
    /// Handshake accepted, waiting on the join step.
    AwaitingJoin,
    /// Session live: entity state and events flow.
    Joined,
    /// Terminal, with the reason the session ended.
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::AwaitingJoin => "awaiting-join",
            ConnectionState::Joined => "joined",
            ConnectionState::Disconnected(_) => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}
