//! Entity references on the wire.
//!
//! A replicated payload cannot carry an [`Entity`] handle, since those are
//! process-local. References travel as [`WireRef`]: a spatial coordinate
//! for anchored entities, a network id for everything else that is
//! network-visible, and a null marker otherwise. Position wins over id
//! because an anchored entity can be destroyed and rebuilt (a reload, a
//! chunk swap) while keeping its position; the id would dangle, the
//! coordinate would not.

use crate::world::{Entity, NetId, World};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A transferable entity reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRef {
    Null,
    Network(NetId),
    Anchored { x: i32, y: i32, z: i32 },
}

/// Position → entity lookup, supplied by the world/registry side.
pub trait AnchorIndex {
    fn entity_at(&self, x: i32, y: i32, z: i32) -> Option<Entity>;
}

/// Network id → entity lookup. The authority's ledger implements this; a
/// client's mirror keeps its own map.
pub trait NetIdIndex {
    fn entity_by_net_id(&self, id: NetId) -> Option<Entity>;
}

impl NetIdIndex for HashMap<NetId, Entity> {
    fn entity_by_net_id(&self, id: NetId) -> Option<Entity> {
        self.get(&id).copied()
    }
}

/// Encodes a reference. Checked in order: spatial anchor, then network id,
/// then null. A dead or never-registered entity encodes as null.
pub fn encode_ref(world: &World, entity: Option<Entity>) -> WireRef {
    let Some(entity) = entity else {
        return WireRef::Null;
    };
    if let Some(anchor) = world.anchor(entity) {
        return WireRef::Anchored {
            x: anchor.x,
            y: anchor.y,
            z: anchor.z,
        };
    }
    match world.network(entity).and_then(|n| n.net_id) {
        Some(id) => WireRef::Network(id),
        None => WireRef::Null,
    }
}

/// Decodes a reference through the two collaborator lookups. Unknown
/// positions and ids resolve to `None` rather than erroring: a reference
/// can legitimately outlive its target.
pub fn decode_ref(
    wire: WireRef,
    anchors: &dyn AnchorIndex,
    ids: &dyn NetIdIndex,
) -> Option<Entity> {
    match wire {
        WireRef::Null => None,
        WireRef::Network(id) => ids.entity_by_net_id(id),
        WireRef::Anchored { x, y, z } => anchors.entity_at(x, y, z),
    }
}

/// Bidirectional anchor bookkeeping: the position→entity index consumed by
/// [`decode_ref`], plus the reverse map needed to clean up when an entity
/// goes away.
#[derive(Debug, Default)]
pub struct AnchorMap {
    by_pos: HashMap<(i32, i32, i32), Entity>,
    by_entity: HashMap<Entity, (i32, i32, i32)>,
}

impl AnchorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity at a position, displacing any previous holder of
    /// that position.
    pub fn insert(&mut self, entity: Entity, x: i32, y: i32, z: i32) {
        if let Some(old_pos) = self.by_entity.insert(entity, (x, y, z)) {
            self.by_pos.remove(&old_pos);
        }
        if let Some(displaced) = self.by_pos.insert((x, y, z), entity) {
            if displaced != entity {
                self.by_entity.remove(&displaced);
            }
        }
    }

    pub fn remove(&mut self, entity: Entity) {
        if let Some(pos) = self.by_entity.remove(&entity) {
            self.by_pos.remove(&pos);
        }
    }

    pub fn len(&self) -> usize {
        self.by_pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pos.is_empty()
    }
}

impl AnchorIndex for AnchorMap {
    fn entity_at(&self, x: i32, y: i32, z: i32) -> Option<Entity> {
        self.by_pos.get(&(x, y, z)).copied()
    }
}
