//! Client-side mirror of the authority's entity graph.
//!
//! [`RemoteWorld`] owns a [`World`] whose entities exist only because the
//! authority announced them. Create, update, and remove envelopes are
//! applied in arrival order through [`RemoteCheck`], which trusts the
//! authority on every declared field; anything the local descriptor does
//! not declare is dropped and logged instead of applied.
//!
//! Local edits flow the other way: [`RemoteWorld::modify`] touches a
//! component on an owned entity and marks it dirty, and
//! [`RemoteWorld::take_owned_updates`] drains the dirty set into
//! owner-sourced [`Envelope::EntityUpdate`] deltas for the next send. The
//! mirror never invents entities and never assigns net ids; both are the
//! authority's job alone.

use log::{debug, warn};
use shared::entity_ref::{decode_ref, AnchorMap, WireRef};
use shared::error::WireError;
use shared::messages::{Envelope, PackedComponent};
use shared::pack::{pack_component, unpack_component};
use shared::policy::RemoteCheck;
use shared::schema::{ComponentTypeId, SchemaRegistry};
use shared::world::{Entity, NetId, Replicated, SpatialAnchor, World, WorldEvent};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Replicated state as seen from one peer.
pub struct RemoteWorld {
    world: World,
    registry: Arc<SchemaRegistry>,
    by_net_id: HashMap<NetId, Entity>,
    ids: HashMap<Entity, NetId>,
    anchors: AnchorMap,
    owned: HashSet<NetId>,
    client_net_id: Option<NetId>,
    /// Owned components edited locally since the last drain, by net id.
    dirty: BTreeMap<NetId, BTreeSet<&'static str>>,
}

impl RemoteWorld {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            world: World::new(),
            registry,
            by_net_id: HashMap::new(),
            ids: HashMap::new(),
            anchors: AnchorMap::new(),
            owned: HashSet::new(),
            client_net_id: None,
            dirty: BTreeMap::new(),
        }
    }

    /// Records which net id the join response named as ours.
    pub fn set_client_net_id(&mut self, id: NetId) {
        self.client_net_id = Some(id);
    }

    pub fn client_net_id(&self) -> Option<NetId> {
        self.client_net_id
    }

    /// The local entity mirroring our own client entity, once its initial
    /// state has arrived.
    pub fn client_entity(&self) -> Option<Entity> {
        self.by_net_id.get(&self.client_net_id?).copied()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn entity(&self, id: NetId) -> Option<Entity> {
        self.by_net_id.get(&id).copied()
    }

    pub fn net_id(&self, entity: Entity) -> Option<NetId> {
        self.ids.get(&entity).copied()
    }

    pub fn is_owned(&self, id: NetId) -> bool {
        self.owned.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.by_net_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_net_id.is_empty()
    }

    pub fn get<T: Replicated>(&self, id: NetId, name: &str) -> Option<&T> {
        self.world.get(self.entity(id)?, name)
    }

    /// Full initial state of one entity.
    ///
    /// The authority sends at most one create per net id per session; a
    /// repeat is logged and applied as a refresh rather than torn down.
    pub fn apply_create(
        &mut self,
        net_id: NetId,
        anchor: Option<[i32; 3]>,
        owned: bool,
        components: Vec<PackedComponent>,
    ) -> Result<(), WireError> {
        let entity = match self.by_net_id.get(&net_id) {
            Some(&existing) => {
                warn!("duplicate create for net id {}, refreshing in place", net_id);
                existing
            }
            None => {
                let entity = self.world.spawn();
                self.by_net_id.insert(net_id, entity);
                self.ids.insert(entity, net_id);
                entity
            }
        };

        if let Some([x, y, z]) = anchor {
            self.world.set_anchor(entity, SpatialAnchor::new(x, y, z));
            self.anchors.insert(entity, x, y, z);
        }
        if owned {
            self.owned.insert(net_id);
        }

        for packed in &components {
            self.apply_packed(entity, packed)?;
        }
        debug!(
            "net id {} appeared with {} components (owned: {})",
            net_id,
            components.len(),
            owned
        );
        Ok(())
    }

    /// Incremental entity state: removals, then additions, then field
    /// deltas, so a remove-and-re-add lands as fresh state.
    pub fn apply_update(
        &mut self,
        net_id: NetId,
        owned: Option<bool>,
        removed: Vec<ComponentTypeId>,
        added: Vec<PackedComponent>,
        changed: Vec<PackedComponent>,
    ) -> Result<(), WireError> {
        let Some(entity) = self.by_net_id.get(&net_id).copied() else {
            // An update can cross a remove in flight; nothing to apply.
            debug!("update for unknown net id {}, skipping", net_id);
            return Ok(());
        };

        match owned {
            Some(true) => {
                self.owned.insert(net_id);
            }
            Some(false) => {
                self.owned.remove(&net_id);
                self.dirty.remove(&net_id);
            }
            None => {}
        }

        for type_id in removed {
            let Some(spec) = self.registry.component(type_id) else {
                warn!("removal names unknown component type {}", type_id.0);
                continue;
            };
            self.world.remove_named(entity, spec.name);
        }
        for packed in added.iter().chain(changed.iter()) {
            self.apply_packed(entity, packed)?;
        }
        Ok(())
    }

    /// The entity left our view. Forgets every local handle to it.
    pub fn apply_remove(&mut self, net_id: NetId) {
        let Some(entity) = self.by_net_id.remove(&net_id) else {
            return;
        };
        self.ids.remove(&entity);
        self.anchors.remove(entity);
        self.owned.remove(&net_id);
        self.dirty.remove(&net_id);
        self.world.despawn(entity);
        debug!("net id {} left view", net_id);
    }

    /// Resolves an event target reference against the mirror.
    pub fn resolve_ref(&self, wire: WireRef) -> Option<Entity> {
        decode_ref(wire, &self.anchors, &self.by_net_id)
    }

    /// Edits a component on an entity we own and marks it for the next
    /// outbound delta. Returns `None` for entities we do not own; the
    /// authority would refuse the update anyway.
    pub fn modify<T: Replicated, R>(
        &mut self,
        id: NetId,
        name: &'static str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        if !self.owned.contains(&id) {
            return None;
        }
        let entity = self.entity(id)?;
        let value = self.world.modify(entity, name, f)?;
        self.dirty.entry(id).or_default().insert(name);
        Some(value)
    }

    /// Drains locally edited owned components into outbound update
    /// envelopes. Fields the policy does not let a peer assert are filtered
    /// out here, before they ever reach the wire.
    pub fn take_owned_updates(&mut self) -> Result<Vec<Envelope>, WireError> {
        let mut updates = Vec::new();
        for (net_id, names) in std::mem::take(&mut self.dirty) {
            let Some(entity) = self.by_net_id.get(&net_id).copied() else {
                continue;
            };
            let mut changed = Vec::new();
            for name in names {
                let Some(spec) = self.registry.component_named(name) else {
                    continue;
                };
                let Some(component) = self.world.component_named(entity, name) else {
                    continue;
                };
                if let Some(packed) = pack_component(spec, component, &RemoteCheck, false)? {
                    changed.push(packed);
                }
            }
            if changed.is_empty() {
                continue;
            }
            updates.push(Envelope::EntityUpdate {
                net_id,
                owned: None,
                removed: Vec::new(),
                added: Vec::new(),
                changed,
            });
        }
        Ok(updates)
    }

    /// Everything that changed in the mirror since the last drain.
    pub fn take_world_events(&mut self) -> Vec<WorldEvent> {
        self.world.drain_events()
    }

    fn apply_packed(&mut self, entity: Entity, packed: &PackedComponent) -> Result<(), WireError> {
        let Some(spec) = self.registry.component(packed.type_id) else {
            warn!("authority sent unknown component type {}", packed.type_id.0);
            return Ok(());
        };
        let name = spec.name;

        if self.world.component_named(entity, name).is_some() {
            if let Some(component) = self.world.component_mut_named(entity, name) {
                let report = unpack_component(spec, component, packed, &RemoteCheck)?;
                if !report.clean() {
                    warn!(
                        "authority sent {} fields of {} the policy refuses: {:?}",
                        report.rejected.len(),
                        name,
                        report.rejected
                    );
                }
                if report.applied > 0 {
                    self.world.mark_changed(entity, name);
                }
            }
        } else if let Some(mut component) = self.registry.instantiate(packed.type_id) {
            let report = unpack_component(spec, &mut *component, packed, &RemoteCheck)?;
            if !report.clean() {
                warn!(
                    "authority sent {} fields of {} the policy refuses: {:?}",
                    report.rejected.len(),
                    name,
                    report.rejected
                );
            }
            self.world.insert_boxed(entity, component);
        }
        Ok(())
    }
}
