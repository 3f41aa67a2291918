//! The replicated component and event set.
//!
//! These are the concrete types both binaries register; together they cover
//! every replication direction, the initial-only flag, and a component send
//! hook, so the whole policy surface is exercised by real traffic.
//! [`standard_schema`] is the single registration point: server and client
//! must call the same one or the handshake's table comparison will refuse
//! the session.

use crate::error::WireError;
use crate::policy::{FieldDirection, ReplicateMode};
use crate::schema::{
    EventKind, FieldId, FieldSpec, ReplicatedInfo, SchemaRegistry, SendOverride,
};
use crate::world::{Entity, NetworkComponent, Replicated, World};
use serde::{Deserialize, Serialize};
use std::any::Any;

pub const CHARACTER_STATE: &str = "character_state";
pub const DISPLAY_NAME: &str = "display_name";
pub const HEALTH: &str = "health";
pub const INVENTORY: &str = "inventory";

pub const EVENT_PERFORM_ACTION: &str = "perform_action";
pub const EVENT_NOTIFY: &str = "notify";
pub const EVENT_ANNOUNCEMENT: &str = "announcement";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(WireError::Encode)
}

fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(data).map_err(WireError::Decode)
}

/// A moving character. Position and velocity are authority-driven; stamina
/// is private to the owner; the look direction comes from the owner and is
/// relayed to everyone else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterState {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub stamina: f32,
    pub look_yaw: f32,
}

impl CharacterState {
    pub const POSITION: FieldId = FieldId(0);
    pub const VELOCITY: FieldId = FieldId(1);
    pub const STAMINA: FieldId = FieldId(2);
    pub const LOOK_YAW: FieldId = FieldId(3);
}

impl Replicated for CharacterState {
    fn type_name(&self) -> &'static str {
        CHARACTER_STATE
    }

    fn write_field(&self, field: FieldId) -> Result<Vec<u8>, WireError> {
        match field {
            Self::POSITION => encode(&self.position),
            Self::VELOCITY => encode(&self.velocity),
            Self::STAMINA => encode(&self.stamina),
            Self::LOOK_YAW => encode(&self.look_yaw),
            other => Err(WireError::UnknownField {
                component: CHARACTER_STATE,
                field: other.0,
            }),
        }
    }

    fn read_field(&mut self, field: FieldId, data: &[u8]) -> Result<(), WireError> {
        match field {
            Self::POSITION => self.position = decode(data)?,
            Self::VELOCITY => self.velocity = decode(data)?,
            Self::STAMINA => self.stamina = decode(data)?,
            Self::LOOK_YAW => self.look_yaw = decode(data)?,
            other => {
                return Err(WireError::UnknownField {
                    component: CHARACTER_STATE,
                    field: other.0,
                })
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Replicated> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatedInfo for CharacterState {
    fn name() -> &'static str {
        CHARACTER_STATE
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                id: Self::POSITION,
                name: "position",
                direction: FieldDirection::ServerToClient,
                initial_only: false,
            },
            FieldSpec {
                id: Self::VELOCITY,
                name: "velocity",
                direction: FieldDirection::ServerToClient,
                initial_only: false,
            },
            FieldSpec {
                id: Self::STAMINA,
                name: "stamina",
                direction: FieldDirection::ServerToOwner,
                initial_only: false,
            },
            FieldSpec {
                id: Self::LOOK_YAW,
                name: "look_yaw",
                direction: FieldDirection::OwnerToServerToClient,
                initial_only: false,
            },
        ]
    }
}

/// Human-readable label, fixed at spawn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayName {
    pub name: String,
}

impl DisplayName {
    pub const NAME: FieldId = FieldId(0);
}

impl Replicated for DisplayName {
    fn type_name(&self) -> &'static str {
        DISPLAY_NAME
    }

    fn write_field(&self, field: FieldId) -> Result<Vec<u8>, WireError> {
        match field {
            Self::NAME => encode(&self.name),
            other => Err(WireError::UnknownField {
                component: DISPLAY_NAME,
                field: other.0,
            }),
        }
    }

    fn read_field(&mut self, field: FieldId, data: &[u8]) -> Result<(), WireError> {
        match field {
            Self::NAME => {
                self.name = decode(data)?;
                Ok(())
            }
            other => Err(WireError::UnknownField {
                component: DISPLAY_NAME,
                field: other.0,
            }),
        }
    }

    fn clone_box(&self) -> Box<dyn Replicated> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatedInfo for DisplayName {
    fn name() -> &'static str {
        DISPLAY_NAME
    }

    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec {
            id: Self::NAME,
            name: "name",
            direction: FieldDirection::ServerToClient,
            initial_only: true,
        }]
    }
}

/// Vital state. `max` never changes after spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct Health {
    pub current: f32,
    pub max: f32,
}

impl Health {
    pub const CURRENT: FieldId = FieldId(0);
    pub const MAX: FieldId = FieldId(1);
}

impl Default for Health {
    fn default() -> Self {
        Self {
            current: 100.0,
            max: 100.0,
        }
    }
}

impl Replicated for Health {
    fn type_name(&self) -> &'static str {
        HEALTH
    }

    fn write_field(&self, field: FieldId) -> Result<Vec<u8>, WireError> {
        match field {
            Self::CURRENT => encode(&self.current),
            Self::MAX => encode(&self.max),
            other => Err(WireError::UnknownField {
                component: HEALTH,
                field: other.0,
            }),
        }
    }

    fn read_field(&mut self, field: FieldId, data: &[u8]) -> Result<(), WireError> {
        match field {
            Self::CURRENT => self.current = decode(data)?,
            Self::MAX => self.max = decode(data)?,
            other => {
                return Err(WireError::UnknownField {
                    component: HEALTH,
                    field: other.0,
                })
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Replicated> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatedInfo for Health {
    fn name() -> &'static str {
        HEALTH
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                id: Self::CURRENT,
                name: "current",
                direction: FieldDirection::ServerToClient,
                initial_only: false,
            },
            FieldSpec {
                id: Self::MAX,
                name: "max",
                direction: FieldDirection::ServerToClient,
                initial_only: true,
            },
        ]
    }
}

/// Carried items. Everyone gets the contents once with the initial
/// snapshot; after that, slot changes replicate only to the owner (see
/// [`inventory_send_override`]). The selected slot is owner-driven.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub slots: Vec<String>,
    pub selected: u8,
}

impl Inventory {
    pub const SLOTS: FieldId = FieldId(0);
    pub const SELECTED: FieldId = FieldId(1);
}

/// Keeps spectators from tracking another player's inventory live.
fn inventory_send_override(field: &FieldSpec, initial: bool, owned: bool) -> bool {
    field.name != "slots" || initial || owned
}

impl Replicated for Inventory {
    fn type_name(&self) -> &'static str {
        INVENTORY
    }

    fn write_field(&self, field: FieldId) -> Result<Vec<u8>, WireError> {
        match field {
            Self::SLOTS => encode(&self.slots),
            Self::SELECTED => encode(&self.selected),
            other => Err(WireError::UnknownField {
                component: INVENTORY,
                field: other.0,
            }),
        }
    }

    fn read_field(&mut self, field: FieldId, data: &[u8]) -> Result<(), WireError> {
        match field {
            Self::SLOTS => self.slots = decode(data)?,
            Self::SELECTED => self.selected = decode(data)?,
            other => {
                return Err(WireError::UnknownField {
                    component: INVENTORY,
                    field: other.0,
                })
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Replicated> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatedInfo for Inventory {
    fn name() -> &'static str {
        INVENTORY
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                id: Self::SLOTS,
                name: "slots",
                direction: FieldDirection::ServerToClient,
                initial_only: false,
            },
            FieldSpec {
                id: Self::SELECTED,
                name: "selected",
                direction: FieldDirection::OwnerToServerToClient,
                initial_only: false,
            },
        ]
    }

    fn send_override() -> Option<SendOverride> {
        Some(inventory_send_override)
    }
}

/// Payload of [`EVENT_PERFORM_ACTION`]: a peer asks the authority to use
/// an inventory slot of an entity it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformAction {
    pub slot: u8,
}

/// Payload of [`EVENT_NOTIFY`]: a private message to the target's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notify {
    pub text: String,
}

/// Payload of [`EVENT_ANNOUNCEMENT`]: shown to every peer that sees the
/// target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub text: String,
}

/// The session schema. Registration order is the wire contract: changing
/// it is a breaking protocol change caught by the handshake.
pub fn standard_schema() -> SchemaRegistry {
    SchemaRegistry::builder()
        .component::<CharacterState>()
        .component::<DisplayName>()
        .component::<Health>()
        .component::<Inventory>()
        .event(EVENT_PERFORM_ACTION, EventKind::ServerBound)
        .event(EVENT_NOTIFY, EventKind::OwnerBound)
        .event(EVENT_ANNOUNCEMENT, EventKind::Broadcast)
        .build()
}

/// Builds the entity that represents a connected player. Owner-mode, so it
/// replicates to its own peer through the ownership chain and to nobody
/// else.
pub fn spawn_avatar(world: &mut World, name: &str) -> Entity {
    let entity = world.spawn();
    world.set_network(entity, NetworkComponent::new(ReplicateMode::Owner));
    world.insert(entity, CharacterState::default());
    world.insert(
        entity,
        DisplayName {
            name: name.to_string(),
        },
    );
    world.insert(entity, Health::default());
    world.insert(
        entity,
        Inventory {
            slots: vec!["torch".to_string()],
            selected: 0,
        },
    );
    entity
}
