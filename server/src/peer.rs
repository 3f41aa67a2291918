//! Per-peer replication bookkeeping.
//!
//! A [`Peer`] tracks, for one joined connection, which entities it has been
//! told about and which marks are waiting for the next flush. The central
//! invariant is at-most-once initial sync: once an entity's full state has
//! gone to a peer, `sent_initial` records it for the life of the connection
//! and no second create is ever emitted, even if the entity is hidden and
//! later becomes visible again. Visibility after that point is communicated
//! purely through remove messages.

use shared::messages::Envelope;
use shared::world::NetId;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Stable identifier for a joined peer, independent of the connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Component-level marks accumulated for one entity between flushes.
/// Removals and additions of the same component collapse pairwise so a
/// flush never sends contradictory instructions.
#[derive(Debug, Default, Clone)]
pub struct DirtyMarks {
    pub added: BTreeSet<&'static str>,
    pub changed: BTreeSet<&'static str>,
    pub removed: BTreeSet<&'static str>,
    pub owned_change: Option<bool>,
}

impl DirtyMarks {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.owned_change.is_none()
    }
}

/// Replication state for one joined connection.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    /// The entity acting as this peer's presence in the world. Ownership
    /// chains ending here make an entity "owned" by this peer.
    pub client_entity: shared::world::Entity,
    /// Entities whose full initial state has been sent. Grows only.
    sent_initial: HashSet<NetId>,
    /// Entities granted initial sync but not yet flushed. Ordered so the
    /// create messages go out in id order.
    pending_initial: BTreeSet<NetId>,
    /// Entities the peer currently knows exist.
    visible: HashSet<NetId>,
    /// Entities to remove from the peer's view at the next flush.
    pending_removed: BTreeSet<NetId>,
    dirty: BTreeMap<NetId, DirtyMarks>,
    /// Event envelopes queued for the next flush.
    pending_events: Vec<Envelope>,
}

impl Peer {
    pub fn new(id: PeerId, name: String, client_entity: shared::world::Entity) -> Self {
        Self {
            id,
            name,
            client_entity,
            sent_initial: HashSet::new(),
            pending_initial: BTreeSet::new(),
            visible: HashSet::new(),
            pending_removed: BTreeSet::new(),
            dirty: BTreeMap::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn has_seen(&self, id: NetId) -> bool {
        self.sent_initial.contains(&id)
    }

    pub fn sees(&self, id: NetId) -> bool {
        self.visible.contains(&id)
    }

    pub fn visible_ids(&self) -> impl Iterator<Item = NetId> + '_ {
        self.visible.iter().copied()
    }

    /// Grants initial sync to the entity if it has never been decided for
    /// this peer. Returns true when the entity was newly queued.
    ///
    /// An entity already sent, already queued, or currently visible is left
    /// alone: initial sync happens at most once per entity per connection.
    pub fn grant_initial(&mut self, id: NetId) -> bool {
        if self.sent_initial.contains(&id) || self.visible.contains(&id) {
            return false;
        }
        // A queued removal that never reached the wire cancels out.
        self.pending_removed.remove(&id);
        self.pending_initial.insert(id)
    }

    /// Takes the entity out of the peer's view. A create still queued is
    /// cancelled silently, so the peer never hears about an entity that was
    /// hidden before its initial sync flushed.
    pub fn hide(&mut self, id: NetId) {
        if self.pending_initial.remove(&id) {
            self.dirty.remove(&id);
            return;
        }
        if self.visible.remove(&id) {
            self.dirty.remove(&id);
            self.pending_removed.insert(id);
        }
    }

    /// Records that the initial sync for the entity was put on the wire.
    pub fn note_initial_sent(&mut self, id: NetId) {
        self.sent_initial.insert(id);
        self.visible.insert(id);
    }

    pub fn mark_component_added(&mut self, id: NetId, type_name: &'static str) {
        if !self.visible.contains(&id) {
            return;
        }
        let marks = self.dirty.entry(id).or_default();
        if marks.removed.remove(type_name) {
            // Removed and re-added within one tick: the peer still has the
            // old copy, so treat it as a change.
            marks.changed.insert(type_name);
        } else {
            marks.added.insert(type_name);
        }
    }

    pub fn mark_component_removed(&mut self, id: NetId, type_name: &'static str) {
        if !self.visible.contains(&id) {
            return;
        }
        let marks = self.dirty.entry(id).or_default();
        if marks.added.remove(type_name) {
            // Added and removed within one tick: the peer never knew.
            marks.changed.remove(type_name);
            return;
        }
        marks.changed.remove(type_name);
        marks.removed.insert(type_name);
    }

    pub fn mark_component_changed(&mut self, id: NetId, type_name: &'static str) {
        if !self.visible.contains(&id) {
            return;
        }
        let marks = self.dirty.entry(id).or_default();
        if marks.added.contains(type_name) {
            // The pending add already carries full state.
            return;
        }
        marks.changed.insert(type_name);
    }

    /// Records an ownership flip to announce with the next update.
    pub fn mark_owned(&mut self, id: NetId, owned: bool) {
        if !self.visible.contains(&id) {
            return;
        }
        self.dirty.entry(id).or_default().owned_change = Some(owned);
    }

    pub fn queue_event(&mut self, envelope: Envelope) {
        self.pending_events.push(envelope);
    }

    pub fn take_pending_initial(&mut self) -> BTreeSet<NetId> {
        std::mem::take(&mut self.pending_initial)
    }

    pub fn take_pending_removed(&mut self) -> BTreeSet<NetId> {
        std::mem::take(&mut self.pending_removed)
    }

    pub fn take_dirty(&mut self) -> BTreeMap<NetId, DirtyMarks> {
        std::mem::take(&mut self.dirty)
    }

    pub fn take_pending_events(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.pending_events)
    }
}
