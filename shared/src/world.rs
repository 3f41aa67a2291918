//! Simulation-side entity store.
//!
//! Deliberately small: entities are opaque ids, components live behind the
//! [`Replicated`] trait, and every mutation that matters to replication is
//! recorded in an event queue the replication driver drains once per tick.
//! The store itself knows nothing about peers or the wire; that separation
//! keeps it usable on both ends of the connection (the authority's canonical
//! world and each client's mirror).

use crate::error::WireError;
use crate::policy::ReplicateMode;
use crate::schema::FieldId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// Opaque entity handle. Unique within one `World` for its lifetime; never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(u64);

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-unique id of a network-visible entity. Assigned by the
/// authority's ledger, starting at 1; zero never appears as a live id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NetId(pub u32);

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marks an entity as network-visible and carries its replication settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkComponent {
    /// Assigned when the entity is registered with the ledger; `None`
    /// before registration and after release.
    pub net_id: Option<NetId>,
    pub replicate_mode: ReplicateMode,
    /// Back-reference forming the ownership forest. `None` means the
    /// authority itself owns the entity.
    pub owner: Option<Entity>,
}

impl NetworkComponent {
    pub fn new(replicate_mode: ReplicateMode) -> Self {
        Self {
            net_id: None,
            replicate_mode,
            owner: None,
        }
    }

    pub fn owned_by(replicate_mode: ReplicateMode, owner: Entity) -> Self {
        Self {
            net_id: None,
            replicate_mode,
            owner: Some(owner),
        }
    }
}

/// Fixes an entity to integer world coordinates. Anchored entities are
/// referenced by position on the wire, since position survives a destroy
/// and recreate where a network id would not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialAnchor {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SpatialAnchor {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// A component whose fields can replicate. Implementations encode and
/// decode one field at a time so the policy layer can filter per field.
pub trait Replicated: Any + Send {
    /// Stable name; must match the component's schema registration.
    fn type_name(&self) -> &'static str;

    /// Encodes one field's current value.
    fn write_field(&self, field: FieldId) -> Result<Vec<u8>, WireError>;

    /// Overwrites one field from its encoded value.
    fn read_field(&mut self, field: FieldId, data: &[u8]) -> Result<(), WireError>;

    fn clone_box(&self) -> Box<dyn Replicated>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A change the replication driver needs to hear about. Drained in order
/// once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldEvent {
    ComponentAdded {
        entity: Entity,
        type_name: &'static str,
    },
    ComponentChanged {
        entity: Entity,
        type_name: &'static str,
    },
    ComponentRemoved {
        entity: Entity,
        type_name: &'static str,
    },
    Despawned {
        entity: Entity,
    },
}

#[derive(Default)]
struct EntityRecord {
    network: Option<NetworkComponent>,
    anchor: Option<SpatialAnchor>,
    components: BTreeMap<&'static str, Box<dyn Replicated>>,
}

/// The entity store.
#[derive(Default)]
pub struct World {
    next_entity: u64,
    entities: HashMap<Entity, EntityRecord>,
    events: VecDeque<WorldEvent>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self) -> Entity {
        self.next_entity += 1;
        let entity = Entity(self.next_entity);
        self.entities.insert(entity, EntityRecord::default());
        entity
    }

    /// Removes the entity and records [`WorldEvent::Despawned`]. Safe to
    /// call for an already-gone entity.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if self.entities.remove(&entity).is_some() {
            self.events.push_back(WorldEvent::Despawned { entity });
            true
        } else {
            false
        }
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.keys().copied()
    }

    pub fn set_network(&mut self, entity: Entity, network: NetworkComponent) -> bool {
        match self.entities.get_mut(&entity) {
            Some(record) => {
                record.network = Some(network);
                true
            }
            None => false,
        }
    }

    pub fn network(&self, entity: Entity) -> Option<&NetworkComponent> {
        self.entities.get(&entity)?.network.as_ref()
    }

    pub fn network_mut(&mut self, entity: Entity) -> Option<&mut NetworkComponent> {
        self.entities.get_mut(&entity)?.network.as_mut()
    }

    pub fn set_anchor(&mut self, entity: Entity, anchor: SpatialAnchor) -> bool {
        match self.entities.get_mut(&entity) {
            Some(record) => {
                record.anchor = Some(anchor);
                true
            }
            None => false,
        }
    }

    pub fn anchor(&self, entity: Entity) -> Option<SpatialAnchor> {
        self.entities.get(&entity)?.anchor
    }

    /// Attaches a component, recording `ComponentAdded`, or
    /// `ComponentChanged` when it replaces an existing one of the same
    /// type.
    pub fn insert<T: Replicated>(&mut self, entity: Entity, component: T) -> bool {
        self.insert_boxed(entity, Box::new(component))
    }

    pub fn insert_boxed(&mut self, entity: Entity, component: Box<dyn Replicated>) -> bool {
        let type_name = component.type_name();
        match self.entities.get_mut(&entity) {
            Some(record) => {
                let replaced = record.components.insert(type_name, component).is_some();
                self.events.push_back(if replaced {
                    WorldEvent::ComponentChanged { entity, type_name }
                } else {
                    WorldEvent::ComponentAdded { entity, type_name }
                });
                true
            }
            None => false,
        }
    }

    /// Detaches a component by schema name, recording `ComponentRemoved`.
    pub fn remove_named(&mut self, entity: Entity, name: &str) -> bool {
        let Some(record) = self.entities.get_mut(&entity) else {
            return false;
        };
        match record.components.remove(name) {
            Some(component) => {
                self.events.push_back(WorldEvent::ComponentRemoved {
                    entity,
                    type_name: component.type_name(),
                });
                true
            }
            None => false,
        }
    }

    pub fn get<T: Replicated>(&self, entity: Entity, name: &str) -> Option<&T> {
        self.component_named(entity, name)?.as_any().downcast_ref()
    }

    /// Mutable access without a change record. Callers that alter state the
    /// network should see must use [`World::modify`] or follow up with
    /// [`World::mark_changed`].
    pub fn get_mut<T: Replicated>(&mut self, entity: Entity, name: &str) -> Option<&mut T> {
        self.component_mut_named(entity, name)?
            .as_any_mut()
            .downcast_mut()
    }

    /// Runs a closure against a component and records `ComponentChanged`.
    pub fn modify<T: Replicated, R>(
        &mut self,
        entity: Entity,
        name: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let record = self.entities.get_mut(&entity)?;
        let component = record.components.get_mut(name)?;
        let type_name = component.type_name();
        let value = f(component.as_any_mut().downcast_mut()?);
        self.events
            .push_back(WorldEvent::ComponentChanged { entity, type_name });
        Some(value)
    }

    /// Records `ComponentChanged` for an edit already made through
    /// [`World::get_mut`] or [`World::component_mut_named`].
    pub fn mark_changed(&mut self, entity: Entity, name: &str) -> bool {
        let Some(record) = self.entities.get(&entity) else {
            return false;
        };
        match record.components.get(name) {
            Some(component) => {
                self.events.push_back(WorldEvent::ComponentChanged {
                    entity,
                    type_name: component.type_name(),
                });
                true
            }
            None => false,
        }
    }

    pub fn component_named(&self, entity: Entity, name: &str) -> Option<&dyn Replicated> {
        self.entities
            .get(&entity)?
            .components
            .get(name)
            .map(|c| c.as_ref())
    }

    pub fn component_mut_named(
        &mut self,
        entity: Entity,
        name: &str,
    ) -> Option<&mut dyn Replicated> {
        self.entities
            .get_mut(&entity)?
            .components
            .get_mut(name)
            .map(|c| c.as_mut())
    }

    /// All replicated components of an entity, in stable name order.
    pub fn components(
        &self,
        entity: Entity,
    ) -> impl Iterator<Item = (&'static str, &dyn Replicated)> {
        self.entities
            .get(&entity)
            .into_iter()
            .flat_map(|record| record.components.iter())
            .map(|(name, component)| (*name, component.as_ref()))
    }

    /// Takes everything recorded since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{CharacterState, DisplayName, CHARACTER_STATE, DISPLAY_NAME};

    #[test]
    fn test_spawned_entities_get_fresh_ids() {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        assert_ne!(a, b);
        assert!(world.contains(a));
        assert!(world.contains(b));
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn test_insert_then_get_roundtrips() {
        let mut world = World::new();
        let e = world.spawn();
        world.insert(
            e,
            DisplayName {
                name: "scout".to_string(),
            },
        );
        let name: &DisplayName = world.get(e, DISPLAY_NAME).unwrap();
        assert_eq!(name.name, "scout");
        assert!(world.get::<CharacterState>(e, CHARACTER_STATE).is_none());
    }

    #[test]
    fn test_insert_records_added_and_replace_records_changed() {
        let mut world = World::new();
        let e = world.spawn();
        world.insert(e, DisplayName::default());
        world.insert(
            e,
            DisplayName {
                name: "again".to_string(),
            },
        );
        let events = world.drain_events();
        assert_eq!(
            events,
            vec![
                WorldEvent::ComponentAdded {
                    entity: e,
                    type_name: DISPLAY_NAME
                },
                WorldEvent::ComponentChanged {
                    entity: e,
                    type_name: DISPLAY_NAME
                },
            ]
        );
        assert!(world.drain_events().is_empty());
    }

    #[test]
    fn test_modify_records_changed_but_get_mut_does_not() {
        let mut world = World::new();
        let e = world.spawn();
        world.insert(e, CharacterState::default());
        world.drain_events();

        world
            .get_mut::<CharacterState>(e, CHARACTER_STATE)
            .unwrap()
            .stamina = 5.0;
        assert!(world.drain_events().is_empty());

        world
            .modify(e, CHARACTER_STATE, |c: &mut CharacterState| {
                c.stamina = 7.0;
            })
            .unwrap();
        assert_eq!(
            world.drain_events(),
            vec![WorldEvent::ComponentChanged {
                entity: e,
                type_name: CHARACTER_STATE
            }]
        );
        assert_eq!(
            world
                .get::<CharacterState>(e, CHARACTER_STATE)
                .unwrap()
                .stamina,
            7.0
        );
    }

    #[test]
    fn test_remove_and_despawn_record_events() {
        let mut world = World::new();
        let e = world.spawn();
        world.insert(e, DisplayName::default());
        world.drain_events();

        assert!(world.remove_named(e, DISPLAY_NAME));
        assert!(!world.remove_named(e, DISPLAY_NAME));
        assert!(world.despawn(e));
        assert!(!world.despawn(e));

        assert_eq!(
            world.drain_events(),
            vec![
                WorldEvent::ComponentRemoved {
                    entity: e,
                    type_name: DISPLAY_NAME
                },
                WorldEvent::Despawned { entity: e },
            ]
        );
    }

    #[test]
    fn test_components_iterate_in_name_order() {
        let mut world = World::new();
        let e = world.spawn();
        world.insert(e, DisplayName::default());
        world.insert(e, CharacterState::default());
        let names: Vec<&str> = world.components(e).map(|(name, _)| name).collect();
        assert_eq!(names, vec![CHARACTER_STATE, DISPLAY_NAME]);
    }

    #[test]
    fn test_network_and_anchor_attachments() {
        let mut world = World::new();
        let e = world.spawn();
        assert!(world.network(e).is_none());
        world.set_network(e, NetworkComponent::new(ReplicateMode::Always));
        assert_eq!(
            world.network(e).unwrap().replicate_mode,
            ReplicateMode::Always
        );
        world.set_anchor(e, SpatialAnchor::new(1, -2, 3));
        assert_eq!(world.anchor(e), Some(SpatialAnchor::new(1, -2, 3)));
    }
}
