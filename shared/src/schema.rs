//! Component and event descriptor tables.
//!
//! Replication metadata is registered explicitly at startup instead of being
//! discovered by reflection: each component type contributes a descriptor
//! (field ids, directions, initial-only flags, optional send hook) and each
//! event a kind. Type and event ids are assigned by registration order, so
//! both ends build identical tables by running the same registration code,
//! and the handshake exchanges the tables to verify exactly that.

use crate::policy::FieldDirection;
use crate::world::Replicated;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifies a component type within the session's schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ComponentTypeId(pub u16);

/// Identifies a field within its component's descriptor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FieldId(pub u8);

/// Identifies a registered event type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventId(pub u16);

impl fmt::Display for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication metadata for one field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub id: FieldId,
    pub name: &'static str,
    pub direction: FieldDirection,
    /// Sent only in full snapshots, never as a delta.
    pub initial_only: bool,
}

/// Component-specific refinement of the blanket send rule. Receives the
/// field, whether this is an initial send, and whether the receiving peer
/// owns the entity; returning false drops the field. It cannot include a
/// field the blanket rule already excluded.
pub type SendOverride = fn(field: &FieldSpec, initial: bool, owned: bool) -> bool;

/// Everything the replication layer knows about one component type.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub type_id: ComponentTypeId,
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
    pub send_override: Option<SendOverride>,
    /// Builds an empty instance; the receiving side fills it from packed
    /// fields.
    pub factory: fn() -> Box<dyn Replicated>,
}

impl ComponentSpec {
    pub fn field(&self, id: FieldId) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.id == id)
    }
}

/// Who may raise an event and who hears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Raised by a peer against an entity it owns; handled by the authority.
    ServerBound,
    /// Raised by the authority; delivered to the target's owning peer.
    OwnerBound,
    /// Raised by the authority; delivered to every peer that sees the
    /// target.
    Broadcast,
}

/// Descriptor for one registered event type.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub id: EventId,
    pub name: &'static str,
    pub kind: EventKind,
}

/// Static schema contribution of a component type. Implemented alongside
/// [`Replicated`]; the instance-side `type_name` must return the same
/// string as [`ReplicatedInfo::name`].
pub trait ReplicatedInfo: Replicated + Default {
    fn name() -> &'static str;
    fn fields() -> Vec<FieldSpec>;
    fn send_override() -> Option<SendOverride> {
        None
    }
}

fn make_boxed<T: ReplicatedInfo + 'static>() -> Box<dyn Replicated> {
    Box::new(T::default())
}

/// The resolved descriptor tables for a session. Built once at startup and
/// shared read-only afterwards.
#[derive(Debug)]
pub struct SchemaRegistry {
    components: Vec<ComponentSpec>,
    by_name: HashMap<&'static str, usize>,
    events: Vec<EventSpec>,
    events_by_name: HashMap<&'static str, usize>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            components: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn component(&self, id: ComponentTypeId) -> Option<&ComponentSpec> {
        self.components.get(id.0 as usize)
    }

    pub fn component_named(&self, name: &str) -> Option<&ComponentSpec> {
        self.by_name.get(name).map(|&i| &self.components[i])
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentSpec> {
        self.components.iter()
    }

    pub fn event(&self, id: EventId) -> Option<&EventSpec> {
        self.events.get(id.0 as usize)
    }

    pub fn event_named(&self, name: &str) -> Option<&EventSpec> {
        self.events_by_name.get(name).map(|&i| &self.events[i])
    }

    pub fn events(&self) -> impl Iterator<Item = &EventSpec> {
        self.events.iter()
    }

    /// Builds an empty instance of the given component type.
    pub fn instantiate(&self, id: ComponentTypeId) -> Option<Box<dyn Replicated>> {
        self.component(id).map(|spec| (spec.factory)())
    }

    /// The wire form of these tables, exchanged during the handshake.
    pub fn table(&self) -> SchemaTable {
        SchemaTable {
            components: self
                .components
                .iter()
                .map(|c| TableComponent {
                    name: c.name.to_string(),
                    fields: c
                        .fields
                        .iter()
                        .map(|f| TableField {
                            id: f.id,
                            name: f.name.to_string(),
                            direction: f.direction,
                            initial_only: f.initial_only,
                        })
                        .collect(),
                })
                .collect(),
            events: self
                .events
                .iter()
                .map(|e| TableEvent {
                    name: e.name.to_string(),
                    kind: e.kind,
                })
                .collect(),
        }
    }

    /// True when the remote's table is identical to ours: same components,
    /// same field layout and directions, same events, same order.
    pub fn matches(&self, remote: &SchemaTable) -> bool {
        self.table() == *remote
    }
}

/// Accumulates registrations; ids follow registration order.
pub struct SchemaBuilder {
    components: Vec<ComponentSpec>,
    events: Vec<EventSpec>,
}

impl SchemaBuilder {
    pub fn component<T: ReplicatedInfo + 'static>(mut self) -> Self {
        let fields = T::fields();
        debug_assert!(
            self.components.iter().all(|c| c.name != T::name()),
            "component {} registered twice",
            T::name()
        );
        debug_assert!(
            fields
                .iter()
                .enumerate()
                .all(|(i, f)| fields[..i].iter().all(|g| g.id != f.id)),
            "component {} declares a duplicate field id",
            T::name()
        );
        let type_id = ComponentTypeId(self.components.len() as u16);
        self.components.push(ComponentSpec {
            type_id,
            name: T::name(),
            fields,
            send_override: T::send_override(),
            factory: make_boxed::<T>,
        });
        self
    }

    pub fn event(mut self, name: &'static str, kind: EventKind) -> Self {
        debug_assert!(
            self.events.iter().all(|e| e.name != name),
            "event {} registered twice",
            name
        );
        let id = EventId(self.events.len() as u16);
        self.events.push(EventSpec { id, name, kind });
        self
    }

    pub fn build(self) -> SchemaRegistry {
        let by_name = self
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name, i))
            .collect();
        let events_by_name = self
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name, i))
            .collect();
        SchemaRegistry {
            components: self.components,
            by_name,
            events: self.events,
            events_by_name,
        }
    }
}

/// Serializable schema tables, compared during the handshake to catch
/// version drift before any entity state flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTable {
    pub components: Vec<TableComponent>,
    pub events: Vec<TableEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableComponent {
    pub name: String,
    pub fields: Vec<TableField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableField {
    pub id: FieldId,
    pub name: String,
    pub direction: FieldDirection,
    pub initial_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEvent {
    pub name: String,
    pub kind: EventKind,
}

#[cfg(test)]
pub(crate) fn test_factory() -> Box<dyn Replicated> {
    Box::new(crate::components::DisplayName::default())
}
