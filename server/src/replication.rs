//! The authority-side replication driver.
//!
//! [`ReplicationServer`] owns everything between the simulation and the
//! sockets: connection lifecycle, the handshake, per-peer visibility,
//! inbound trust enforcement, and the once-per-tick flush that turns world
//! events into wire envelopes. It runs entirely on the simulation task;
//! the transport hands it [`NetEvent`]s and it hands envelopes back through
//! each connection's bounded outbound queue.
//!
//! ## Trust
//!
//! Everything a peer sends is checked against the ownership forest and the
//! per-field policy before it touches the world. Violations fall into two
//! classes: malformed traffic (undecodable frames, messages that make no
//! sense in the connection's state) ends the connection, while well-formed
//! traffic that oversteps policy is dropped field by field and logged for
//! audit, because a buggy client should degrade rather than vanish.

use crate::connection::{ConnId, NetEvent};
use crate::ledger::Ledger;
use crate::peer::{Peer, PeerId};
use crate::utils::get_timestamp;
use log::{debug, error, info, warn};
use shared::components::spawn_avatar;
use shared::entity_ref::{decode_ref, encode_ref, AnchorMap, WireRef};
use shared::error::DisconnectReason;
use shared::messages::{ConnectionState, Envelope, PackedComponent, NET_TICK_MS, PROTOCOL_VERSION};
use shared::pack::{pack_component, unpack_component};
use shared::policy::{AuthorityCheck, ReplicateMode};
use shared::schema::{ComponentTypeId, EventId, EventKind, SchemaRegistry, SchemaTable};
use shared::world::{Entity, NetId, World, WorldEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What happens to a departing peer's entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Tear down the whole subtree rooted at the client entity.
    Despawn,
    /// Keep the entities; direct children become authority-owned. The
    /// client entity itself is always despawned.
    Reassign,
}

impl std::str::FromStr for ReclaimPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "despawn" => Ok(ReclaimPolicy::Despawn),
            "reassign" => Ok(ReclaimPolicy::Reassign),
            other => Err(format!(
                "unknown reclaim policy '{}', expected 'despawn' or 'reassign'",
                other
            )),
        }
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReclaimPolicy::Despawn => "despawn",
            ReclaimPolicy::Reassign => "reassign",
        })
    }
}

/// Audience predicate for `Relevant`-mode entities: given the world, the
/// entity, and a peer's client entity, decide whether the peer should
/// receive it. Without one, `Relevant` behaves like `Always`.
pub type RelevanceFn = fn(&World, Entity, Entity) -> bool;

/// Builds the entity representing a freshly joined peer.
pub type SpawnClientFn = fn(&mut World, &str) -> Entity;

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub server_name: String,
    pub max_peers: usize,
    /// Outbound frames buffered per connection before the peer is
    /// considered too slow and dropped.
    pub queue_capacity: usize,
    /// How long a connection may sit in the handshake before it is cut.
    pub handshake_timeout: Duration,
    /// How long a joined peer may stay silent. Zero disables the check.
    pub idle_timeout: Duration,
    /// Send a time-sync every this many ticks. Zero disables keepalives.
    pub keepalive_interval_ticks: u64,
    pub reclaim: ReclaimPolicy,
    pub tick_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            server_name: "authority".to_string(),
            max_peers: 32,
            queue_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keepalive_interval_ticks: 20,
            reclaim: ReclaimPolicy::Despawn,
            tick_ms: NET_TICK_MS,
        }
    }
}

/// A peer-raised event that passed every check and awaits the simulation.
#[derive(Debug)]
pub struct InboundEvent {
    pub peer: PeerId,
    pub target: Entity,
    pub name: &'static str,
    pub payload: Vec<u8>,
}

struct Remote {
    addr: SocketAddr,
    state: ConnectionState,
    outbound: mpsc::Sender<Envelope>,
    last_seen_ms: u64,
    /// Name claimed in the handshake, held until the join creates the peer.
    pending_name: Option<String>,
    /// The outbound queue overflowed; the connection is cut at the next
    /// sweep and nothing more is sent to it.
    backpressured: bool,
    peer: Option<Peer>,
}

/// The authority's replication state machine.
pub struct ReplicationServer {
    config: ReplicationConfig,
    registry: Arc<SchemaRegistry>,
    ledger: Ledger,
    anchors: AnchorMap,
    remotes: HashMap<ConnId, Remote>,
    next_peer: u32,
    tick: u64,
    relevance: Option<RelevanceFn>,
    spawn_client: SpawnClientFn,
    inbound_events: Vec<InboundEvent>,
}

/// Decides whether `peer` should receive `entity`, and queues the initial
/// sync when it should and has not had it yet. Free-standing so callers can
/// hold the peer mutably while the ledger stays shared.
fn evaluate_initial(
    ledger: &Ledger,
    relevance: Option<RelevanceFn>,
    world: &World,
    entity: Entity,
    net_id: NetId,
    peer: &mut Peer,
) -> bool {
    let Some(network) = world.network(entity) else {
        return false;
    };
    let entitled = match network.replicate_mode {
        ReplicateMode::Always => true,
        ReplicateMode::Owner => ledger.owner_chain_contains(world, entity, peer.client_entity),
        ReplicateMode::Relevant => match relevance {
            Some(predicate) => predicate(world, entity, peer.client_entity),
            None => true,
        },
    };
    entitled && peer.grant_initial(net_id)
}

impl ReplicationServer {
    pub fn new(config: ReplicationConfig, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            config,
            registry,
            ledger: Ledger::new(),
            anchors: AnchorMap::new(),
            remotes: HashMap::new(),
            next_peer: 0,
            tick: 0,
            relevance: None,
            spawn_client: spawn_avatar,
            inbound_events: Vec::new(),
        }
    }

    pub fn set_relevance(&mut self, predicate: RelevanceFn) {
        self.relevance = Some(predicate);
    }

    pub fn set_spawn_client(&mut self, spawn: SpawnClientFn) {
        self.spawn_client = spawn;
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn connections(&self) -> usize {
        self.remotes.len()
    }

    pub fn joined_peers(&self) -> usize {
        self.remotes.values().filter(|r| r.peer.is_some()).count()
    }

    /// Events raised by peers since the last call, ready for the simulation.
    pub fn take_inbound_events(&mut self) -> Vec<InboundEvent> {
        std::mem::take(&mut self.inbound_events)
    }

    /// Makes an entity network-visible: assigns its id and offers it to
    /// every joined peer. Set the entity's spatial anchor (if any) before
    /// calling this, so anchored references resolve from the start.
    pub fn register_entity(&mut self, world: &mut World, entity: Entity) -> Option<NetId> {
        let net_id = self.ledger.register(world, entity)?;
        if let Some(anchor) = world.anchor(entity) {
            self.anchors.insert(entity, anchor.x, anchor.y, anchor.z);
        }
        for remote in self.remotes.values_mut() {
            if let Some(peer) = remote.peer.as_mut() {
                evaluate_initial(&self.ledger, self.relevance, world, entity, net_id, peer);
            }
        }
        Some(net_id)
    }

    /// Withdraws an entity from replication without despawning it. Peers
    /// that see it get a remove, its net id is retired, and its anchor
    /// entry is dropped; the entity itself stays in the world.
    pub fn unregister_entity(&mut self, world: &mut World, entity: Entity) {
        self.anchors.remove(entity);
        if let Some(net_id) = self.ledger.net_id(entity) {
            self.for_each_peer(|peer| peer.hide(net_id));
            self.ledger.unregister(world, entity);
        }
    }

    /// Rewires an entity's owner and re-evaluates the audience of its whole
    /// owned subtree. Owner-mode descendants disappear from peers that lost
    /// their chain and are offered to peers that gained one; everyone who
    /// still sees a member is told its new owned flag.
    pub fn update_ownership(
        &mut self,
        world: &mut World,
        entity: Entity,
        new_owner: Option<Entity>,
    ) {
        match world.network_mut(entity) {
            Some(network) => network.owner = new_owner,
            None => {
                warn!(
                    "cannot reassign entity {} without a network component",
                    entity
                );
                return;
            }
        }
        self.ledger.set_owner_edge(entity, new_owner);
        debug!(
            "entity {} owner changed to {}",
            entity,
            new_owner.map(|o| o.to_string()).unwrap_or_else(|| "authority".to_string())
        );

        for member in self.ledger.owned_subtree(entity) {
            let Some(net_id) = self.ledger.net_id(member) else {
                continue;
            };
            let Some(network) = world.network(member) else {
                continue;
            };
            let mode = network.replicate_mode;
            for remote in self.remotes.values_mut() {
                let Some(peer) = remote.peer.as_mut() else {
                    continue;
                };
                let in_chain =
                    self.ledger
                        .owner_chain_contains(world, member, peer.client_entity);
                match mode {
                    ReplicateMode::Owner => {
                        if in_chain {
                            evaluate_initial(
                                &self.ledger,
                                self.relevance,
                                world,
                                member,
                                net_id,
                                peer,
                            );
                        } else {
                            peer.hide(net_id);
                        }
                    }
                    ReplicateMode::Always | ReplicateMode::Relevant => {
                        evaluate_initial(
                            &self.ledger,
                            self.relevance,
                            world,
                            member,
                            net_id,
                            peer,
                        );
                    }
                }
                if peer.sees(net_id) {
                    peer.mark_owned(net_id, in_chain);
                }
            }
        }
    }

    /// Queues an authority-raised event for delivery. Owner-bound events go
    /// to the peer owning the target; broadcasts go to every peer that
    /// currently sees it. Envelopes ride out with the next flush.
    pub fn send_event(&mut self, world: &World, target: Entity, name: &str, payload: Vec<u8>) {
        let Some(spec) = self.registry.event_named(name) else {
            error!("event {} is not in the schema", name);
            return;
        };
        if spec.kind == EventKind::ServerBound {
            error!("event {} is raised by peers, not the authority", name);
            return;
        }
        let wire = encode_ref(world, Some(target));
        let event_id = spec.id;
        let net_id = self.ledger.net_id(target);
        for remote in self.remotes.values_mut() {
            let Some(peer) = remote.peer.as_mut() else {
                continue;
            };
            let deliver = match spec.kind {
                EventKind::OwnerBound => {
                    self.ledger
                        .owner_chain_contains(world, target, peer.client_entity)
                }
                EventKind::Broadcast => net_id.map(|id| peer.sees(id)).unwrap_or(false),
                EventKind::ServerBound => false,
            };
            if deliver {
                peer.queue_event(Envelope::Event {
                    target: wire,
                    event_id,
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Feeds one transport event through the connection state machine.
    pub fn handle_event(&mut self, world: &mut World, event: NetEvent) {
        match event {
            NetEvent::Connected {
                conn,
                addr,
                outbound,
            } => {
                debug!("{} from {} awaiting handshake", conn, addr);
                self.remotes.insert(
                    conn,
                    Remote {
                        addr,
                        state: ConnectionState::Connecting,
                        outbound,
                        last_seen_ms: get_timestamp(),
                        pending_name: None,
                        backpressured: false,
                        peer: None,
                    },
                );
            }
            NetEvent::Message { conn, envelope } => self.handle_message(world, conn, envelope),
            NetEvent::Disconnected { conn, reason } => {
                self.drop_connection(world, conn, reason)
            }
        }
    }

    fn handle_message(&mut self, world: &mut World, conn: ConnId, envelope: Envelope) {
        let state = match self.remotes.get_mut(&conn) {
            Some(remote) => {
                remote.last_seen_ms = get_timestamp();
                remote.state
            }
            None => {
                debug!("message from unknown {}", conn);
                return;
            }
        };
        match (state, envelope) {
            (
                ConnectionState::Connecting,
                Envelope::HandshakeRequest {
                    protocol_version,
                    player_name,
                    schema,
                },
            ) => self.handle_handshake(world, conn, protocol_version, player_name, schema),
            (ConnectionState::AwaitingJoin, Envelope::JoinRequest { view_distance }) => {
                self.handle_join(world, conn, view_distance)
            }
            (
                ConnectionState::Joined,
                Envelope::EntityUpdate {
                    net_id,
                    removed,
                    added,
                    changed,
                    ..
                },
            ) => self.handle_entity_update(world, conn, net_id, removed, added, changed),
            (
                ConnectionState::Joined,
                Envelope::Event {
                    target,
                    event_id,
                    payload,
                },
            ) => self.handle_peer_event(world, conn, target, event_id, payload),
            // Any state: keepalives only refresh last_seen, done above.
            (_, Envelope::TimeSync { .. }) => {}
            (_, Envelope::Disconnect { reason }) => {
                info!("{} disconnecting: {}", conn, reason);
                self.drop_connection(world, conn, reason);
            }
            (state, other) => {
                warn!(
                    "{} sent {} while {}, closing",
                    conn,
                    other.kind(),
                    state.name()
                );
                self.disconnect(world, conn, DisconnectReason::ProtocolError);
            }
        }
    }

    fn handle_handshake(
        &mut self,
        world: &mut World,
        conn: ConnId,
        protocol_version: u32,
        player_name: String,
        schema: SchemaTable,
    ) {
        if protocol_version != PROTOCOL_VERSION {
            self.reject(
                world,
                conn,
                DisconnectReason::UnsupportedVersion,
                format!(
                    "peer speaks protocol {}, this server speaks {}",
                    protocol_version, PROTOCOL_VERSION
                ),
            );
            return;
        }
        if !self.registry.matches(&schema) {
            self.reject(
                world,
                conn,
                DisconnectReason::SchemaMismatch,
                "component schema differs from the server's".to_string(),
            );
            return;
        }
        let occupied = self
            .remotes
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    ConnectionState::AwaitingJoin | ConnectionState::Joined
                )
            })
            .count();
        if occupied >= self.config.max_peers {
            self.reject(
                world,
                conn,
                DisconnectReason::ServerFull,
                format!("server is at its {} peer capacity", self.config.max_peers),
            );
            return;
        }

        let accept = Envelope::HandshakeAccept {
            server_name: self.config.server_name.clone(),
            tick_ms: self.config.tick_ms,
            schema: self.registry.table(),
        };
        if let Some(remote) = self.remotes.get_mut(&conn) {
            info!("{} ({}) authenticated as '{}'", conn, remote.addr, player_name);
            remote.state = ConnectionState::AwaitingJoin;
            remote.pending_name = Some(player_name);
        }
        self.send(conn, accept);
    }

    fn handle_join(&mut self, world: &mut World, conn: ConnId, view_distance: u32) {
        let name = match self.remotes.get_mut(&conn) {
            Some(remote) => remote
                .pending_name
                .take()
                .unwrap_or_else(|| conn.to_string()),
            None => return,
        };
        debug!("{} joining with view distance {}", conn, view_distance);

        self.next_peer += 1;
        let peer_id = PeerId(self.next_peer);
        let client_entity = (self.spawn_client)(world, &name);
        let Some(client_net_id) = self.register_entity(world, client_entity) else {
            error!("client entity for {} is not network-visible", conn);
            self.disconnect(world, conn, DisconnectReason::ProtocolError);
            return;
        };

        let mut peer = Peer::new(peer_id, name, client_entity);
        // The join sweep: offer everything already registered. New
        // registrations while joined arrive through register_entity.
        for (net_id, entity) in self.ledger.registered() {
            evaluate_initial(&self.ledger, self.relevance, world, entity, net_id, &mut peer);
        }

        info!(
            "{} joined as {} with client entity {} (net id {})",
            conn, peer_id, client_entity, client_net_id
        );
        if let Some(remote) = self.remotes.get_mut(&conn) {
            remote.state = ConnectionState::Joined;
            remote.peer = Some(peer);
        }
        let tick = self.tick;
        self.send(
            conn,
            Envelope::JoinResponse {
                client_net_id,
                tick,
            },
        );
    }

    fn handle_entity_update(
        &mut self,
        world: &mut World,
        conn: ConnId,
        net_id: NetId,
        removed: Vec<ComponentTypeId>,
        added: Vec<PackedComponent>,
        changed: Vec<PackedComponent>,
    ) {
        let (peer_id, client_entity) = match self.remotes.get(&conn).and_then(|r| r.peer.as_ref())
        {
            Some(peer) => (peer.id, peer.client_entity),
            None => return,
        };
        let Some(entity) = self.ledger.entity_by_net_id(net_id) else {
            // Likely an update racing an entity removal; not hostile.
            debug!("{} updated unknown net id {}", peer_id, net_id);
            return;
        };
        if !self.ledger.owner_chain_contains(world, entity, client_entity) {
            warn!(
                "audit: {} sent an update for entity {} outside its ownership",
                peer_id, net_id
            );
            return;
        }
        if !removed.is_empty() || !added.is_empty() {
            // Structure is authority-only; field deltas may still apply.
            warn!(
                "audit: {} tried to change the component set of entity {}",
                peer_id, net_id
            );
        }

        let check = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        for packed in &changed {
            let Some(spec) = self.registry.component(packed.type_id) else {
                warn!(
                    "audit: {} referenced unknown component type {}",
                    peer_id, packed.type_id
                );
                continue;
            };
            let outcome = match world.component_mut_named(entity, spec.name) {
                Some(component) => unpack_component(spec, component, packed, &check),
                None => {
                    debug!(
                        "{} updated {} on entity {} which lacks it",
                        peer_id, spec.name, net_id
                    );
                    continue;
                }
            };
            match outcome {
                Ok(report) => {
                    if !report.clean() {
                        warn!(
                            "audit: {} asserted forbidden fields {:?} of {} on entity {}",
                            peer_id, report.rejected, spec.name, net_id
                        );
                    }
                    if report.applied > 0 {
                        world.mark_changed(entity, spec.name);
                    }
                }
                Err(e) => {
                    warn!(
                        "{} sent undecodable data for {} on entity {}: {}",
                        conn, spec.name, net_id, e
                    );
                    self.disconnect(world, conn, DisconnectReason::ProtocolError);
                    return;
                }
            }
        }
    }

    fn handle_peer_event(
        &mut self,
        world: &mut World,
        conn: ConnId,
        target: WireRef,
        event_id: EventId,
        payload: Vec<u8>,
    ) {
        let (peer_id, client_entity) = match self.remotes.get(&conn).and_then(|r| r.peer.as_ref())
        {
            Some(peer) => (peer.id, peer.client_entity),
            None => return,
        };
        let Some(spec) = self.registry.event(event_id) else {
            warn!("{} raised unregistered event {}", conn, event_id);
            self.disconnect(world, conn, DisconnectReason::ProtocolError);
            return;
        };
        if spec.kind != EventKind::ServerBound {
            warn!(
                "audit: {} raised {} which only the authority may send",
                peer_id, spec.name
            );
            return;
        }
        let Some(entity) = decode_ref(target, &self.anchors, &self.ledger) else {
            // References may legitimately outlive their target.
            debug!("{} raised {} against a dangling reference", peer_id, spec.name);
            return;
        };
        if !self.ledger.owner_chain_contains(world, entity, client_entity) {
            warn!(
                "audit: {} raised {} against an entity outside its ownership",
                peer_id, spec.name
            );
            return;
        }
        self.inbound_events.push(InboundEvent {
            peer: peer_id,
            target: entity,
            name: spec.name,
            payload,
        });
    }

    /// The per-tick flush: folds world events into per-peer marks, runs the
    /// relevance sweep, emits every queued envelope, then enforces
    /// keepalives, timeouts, and backpressure.
    pub fn flush(&mut self, world: &mut World) {
        self.tick += 1;

        for event in world.drain_events() {
            match event {
                WorldEvent::ComponentAdded { entity, type_name } => {
                    if let Some(net_id) = self.ledger.net_id(entity) {
                        self.for_each_peer(|peer| peer.mark_component_added(net_id, type_name));
                    }
                }
                WorldEvent::ComponentChanged { entity, type_name } => {
                    if let Some(net_id) = self.ledger.net_id(entity) {
                        self.for_each_peer(|peer| peer.mark_component_changed(net_id, type_name));
                    }
                }
                WorldEvent::ComponentRemoved { entity, type_name } => {
                    if let Some(net_id) = self.ledger.net_id(entity) {
                        self.for_each_peer(|peer| peer.mark_component_removed(net_id, type_name));
                    }
                }
                WorldEvent::Despawned { entity } => {
                    self.anchors.remove(entity);
                    if let Some(net_id) = self.ledger.net_id(entity) {
                        self.for_each_peer(|peer| peer.hide(net_id));
                        self.ledger.unregister(world, entity);
                    }
                }
            }
        }

        self.sweep_relevance(world);

        let conns: Vec<ConnId> = self.remotes.keys().copied().collect();
        for conn in conns {
            self.flush_remote(world, conn);
        }

        if self.config.keepalive_interval_ticks > 0
            && self.tick % self.config.keepalive_interval_ticks == 0
        {
            let conns: Vec<ConnId> = self.remotes.keys().copied().collect();
            for conn in conns {
                self.send(
                    conn,
                    Envelope::TimeSync {
                        tick: self.tick,
                        server_time_ms: get_timestamp(),
                    },
                );
            }
        }

        self.sweep_connections(world);
    }

    fn for_each_peer(&mut self, mut f: impl FnMut(&mut Peer)) {
        for remote in self.remotes.values_mut() {
            if let Some(peer) = remote.peer.as_mut() {
                f(peer);
            }
        }
    }

    /// Offers every `Relevant`-mode entity to every joined peer. The sweep
    /// only grants: an entity that stops being relevant stays visible, it
    /// just never starts replicating to peers it was not relevant for.
    fn sweep_relevance(&mut self, world: &World) {
        for (net_id, entity) in self.ledger.registered() {
            let Some(network) = world.network(entity) else {
                continue;
            };
            if network.replicate_mode != ReplicateMode::Relevant {
                continue;
            }
            for remote in self.remotes.values_mut() {
                if let Some(peer) = remote.peer.as_mut() {
                    evaluate_initial(&self.ledger, self.relevance, world, entity, net_id, peer);
                }
            }
        }
    }

    fn flush_remote(&mut self, world: &World, conn: ConnId) {
        let Some(remote) = self.remotes.get_mut(&conn) else {
            return;
        };
        if remote.backpressured {
            return;
        }
        let Some(peer) = remote.peer.as_mut() else {
            return;
        };
        let client_entity = peer.client_entity;
        let removed = peer.take_pending_removed();
        let initials = peer.take_pending_initial();
        let dirty = peer.take_dirty();
        let events = peer.take_pending_events();

        let mut out: Vec<Envelope> = Vec::new();
        for net_id in removed {
            out.push(Envelope::EntityRemove { net_id });
        }

        for net_id in initials {
            let Some(entity) = self.ledger.entity_by_net_id(net_id) else {
                continue;
            };
            if !world.contains(entity) {
                continue;
            }
            let owned = self
                .ledger
                .owner_chain_contains(world, entity, client_entity);
            let check = AuthorityCheck {
                owned,
                entity_initial: true,
            };
            let anchor = world.anchor(entity).map(|a| [a.x, a.y, a.z]);
            let mut components = Vec::new();
            let mut packed_ok = true;
            for (name, component) in world.components(entity) {
                // Components outside the schema are simulation-local.
                let Some(spec) = self.registry.component_named(name) else {
                    continue;
                };
                match pack_component(spec, component, &check, true) {
                    Ok(Some(packed)) => components.push(packed),
                    Ok(None) => {}
                    Err(e) => {
                        error!("cannot pack {} of entity {}: {}", name, net_id, e);
                        packed_ok = false;
                        break;
                    }
                }
            }
            if !packed_ok {
                continue;
            }
            peer.note_initial_sent(net_id);
            out.push(Envelope::EntityCreate {
                net_id,
                anchor,
                owned,
                components,
            });
        }

        for (net_id, marks) in dirty {
            let Some(entity) = self.ledger.entity_by_net_id(net_id) else {
                continue;
            };
            if !world.contains(entity) {
                continue;
            }
            let owned = self
                .ledger
                .owner_chain_contains(world, entity, client_entity);
            let check = AuthorityCheck {
                owned,
                entity_initial: false,
            };

            let mut removed_types = Vec::new();
            for name in marks.removed {
                if let Some(spec) = self.registry.component_named(name) {
                    removed_types.push(spec.type_id);
                }
            }
            let mut added = Vec::new();
            for name in marks.added {
                let Some(spec) = self.registry.component_named(name) else {
                    continue;
                };
                let Some(component) = world.component_named(entity, name) else {
                    continue;
                };
                // A newly attached component goes out in full.
                match pack_component(spec, component, &check, true) {
                    Ok(Some(packed)) => added.push(packed),
                    Ok(None) => {}
                    Err(e) => error!("cannot pack {} of entity {}: {}", name, net_id, e),
                }
            }
            let mut changed = Vec::new();
            for name in marks.changed {
                let Some(spec) = self.registry.component_named(name) else {
                    continue;
                };
                let Some(component) = world.component_named(entity, name) else {
                    continue;
                };
                match pack_component(spec, component, &check, false) {
                    Ok(Some(packed)) => changed.push(packed),
                    Ok(None) => {}
                    Err(e) => error!("cannot pack {} of entity {}: {}", name, net_id, e),
                }
            }

            if removed_types.is_empty()
                && added.is_empty()
                && changed.is_empty()
                && marks.owned_change.is_none()
            {
                continue;
            }
            out.push(Envelope::EntityUpdate {
                net_id,
                owned: marks.owned_change,
                removed: removed_types,
                added,
                changed,
            });
        }

        out.extend(events);
        for envelope in out {
            self.send(conn, envelope);
        }
    }

    fn sweep_connections(&mut self, world: &mut World) {
        let now = get_timestamp();
        let mut expired: Vec<(ConnId, DisconnectReason)> = Vec::new();
        for (&conn, remote) in &self.remotes {
            if remote.backpressured {
                expired.push((conn, DisconnectReason::Backpressure));
                continue;
            }
            let limit = match remote.state {
                ConnectionState::Joined => self.config.idle_timeout,
                _ => self.config.handshake_timeout,
            };
            if !limit.is_zero() && now.saturating_sub(remote.last_seen_ms) > limit.as_millis() as u64
            {
                expired.push((conn, DisconnectReason::Timeout));
            }
        }
        for (conn, reason) in expired {
            match reason {
                // The queue is full; a farewell would not fit anyway.
                DisconnectReason::Backpressure => {
                    warn!("{} dropped: outbound queue overflowed", conn);
                    self.drop_connection(world, conn, reason);
                }
                _ => {
                    warn!("{} timed out", conn);
                    self.disconnect(world, conn, reason);
                }
            }
        }
    }

    /// Refuses a handshake: the reject envelope is queued, then the remote
    /// is dropped, which closes the socket once the queue drains.
    fn reject(&mut self, world: &mut World, conn: ConnId, reason: DisconnectReason, detail: String) {
        warn!("{} rejected: {} ({})", conn, reason, detail);
        self.send(conn, Envelope::HandshakeReject { reason, detail });
        self.drop_connection(world, conn, reason);
    }

    /// Server-initiated teardown with a farewell envelope.
    fn disconnect(&mut self, world: &mut World, conn: ConnId, reason: DisconnectReason) {
        self.send(conn, Envelope::Disconnect { reason });
        self.drop_connection(world, conn, reason);
    }

    fn drop_connection(&mut self, world: &mut World, conn: ConnId, reason: DisconnectReason) {
        let Some(remote) = self.remotes.remove(&conn) else {
            return;
        };
        info!("{} ({}) closed: {}", conn, remote.addr, reason);
        if let Some(peer) = remote.peer {
            self.reclaim_peer(world, peer);
        }
        // Dropping `remote.outbound` lets the connection task write what is
        // queued and then shut the socket down.
    }

    fn reclaim_peer(&mut self, world: &mut World, peer: Peer) {
        info!(
            "{} left, reclaiming entities under client entity {} ({})",
            peer.id, peer.client_entity, self.config.reclaim
        );
        match self.config.reclaim {
            ReclaimPolicy::Despawn => {
                for entity in self.ledger.owned_subtree(peer.client_entity) {
                    world.despawn(entity);
                }
            }
            ReclaimPolicy::Reassign => {
                let children: Vec<Entity> =
                    self.ledger.owned_children(peer.client_entity).collect();
                for child in children {
                    self.update_ownership(world, child, None);
                }
                world.despawn(peer.client_entity);
            }
        }
        // Despawns surface as world events; the next flush tells the
        // remaining peers and releases the ids.
    }

    fn send(&mut self, conn: ConnId, envelope: Envelope) {
        let Some(remote) = self.remotes.get_mut(&conn) else {
            return;
        };
        if remote.backpressured {
            return;
        }
        match remote.outbound.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(
                    "{} outbound queue full, dropping {} and scheduling disconnect",
                    conn,
                    envelope.kind()
                );
                remote.backpressured = true;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The task is gone; its Disconnected event is in flight.
                debug!("{} outbound queue closed", conn);
                remote.backpressured = true;
            }
        }
    }
}
