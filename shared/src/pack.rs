//! Policy-filtered component packing.
//!
//! The bridge between live components and the wire: packing consults a
//! [`FieldCheck`] per field on the way out, unpacking consults the
//! receiving side's check on the way in and reports anything the policy
//! refuses instead of applying it. Rejections are not errors here; the
//! caller decides whether they are audit-worthy.

use crate::error::WireError;
use crate::messages::{PackedComponent, PackedField};
use crate::policy::FieldCheck;
use crate::schema::{ComponentSpec, FieldId};
use crate::world::Replicated;
use serde::{Deserialize, Serialize};

/// Encodes the fields of one component that `check` allows.
///
/// With `component_initial` set, an empty field list still yields a packed
/// component, because the receiver needs to learn the component exists.
/// For deltas an empty result returns `None` and nothing should be sent.
pub fn pack_component(
    spec: &ComponentSpec,
    component: &dyn Replicated,
    check: &dyn FieldCheck,
    component_initial: bool,
) -> Result<Option<PackedComponent>, WireError> {
    let mut fields = Vec::new();
    for field in &spec.fields {
        if check.should_send(spec, field, component_initial) {
            fields.push(PackedField {
                field: field.id,
                data: component.write_field(field.id)?,
            });
        }
    }
    if fields.is_empty() && !component_initial {
        return Ok(None);
    }
    Ok(Some(PackedComponent {
        type_id: spec.type_id,
        fields,
    }))
}

/// What [`unpack_component`] did with each incoming field.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnpackReport {
    pub applied: usize,
    /// Field ids the policy refused or the descriptor does not declare.
    pub rejected: Vec<FieldId>,
}

impl UnpackReport {
    pub fn clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Applies the fields of a packed component that `check` accepts.
///
/// A field the policy refuses is skipped and reported; a field that fails
/// to decode is a wire error and aborts the whole message, since nothing
/// after it can be trusted.
pub fn unpack_component(
    spec: &ComponentSpec,
    component: &mut dyn Replicated,
    packed: &PackedComponent,
    check: &dyn FieldCheck,
) -> Result<UnpackReport, WireError> {
    let mut report = UnpackReport::default();
    for incoming in &packed.fields {
        match spec.field(incoming.field) {
            Some(field) if check.should_accept(spec, field) => {
                component.read_field(field.id, &incoming.data)?;
                report.applied += 1;
            }
            _ => report.rejected.push(incoming.field),
        }
    }
    Ok(report)
}

/// Encodes an event payload struct for [`crate::messages::Envelope::Event`].
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(WireError::Encode)
}

/// Decodes an event payload received in an event envelope.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(data).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{standard_schema, CharacterState, Inventory, CHARACTER_STATE};
    use crate::policy::{AuthorityCheck, RemoteCheck};
    use crate::schema::FieldId;

    fn character() -> CharacterState {
        CharacterState {
            position: [1.0, 2.0, 3.0],
            velocity: [0.0, 0.0, 0.0],
            stamina: 50.0,
            look_yaw: 0.5,
        }
    }

    #[test]
    fn test_initial_pack_carries_every_field() {
        let registry = standard_schema();
        let spec = registry.component_named(CHARACTER_STATE).unwrap();
        let check = AuthorityCheck {
            owned: false,
            entity_initial: true,
        };
        let packed = pack_component(spec, &character(), &check, true)
            .unwrap()
            .unwrap();
        assert_eq!(packed.fields.len(), 4);
    }

    #[test]
    fn test_delta_pack_filters_by_direction() {
        let registry = standard_schema();
        let spec = registry.component_named(CHARACTER_STATE).unwrap();

        // To the owner: position/velocity (authority) + stamina (owner-only),
        // but not look_yaw (the owner reported it in the first place).
        let to_owner = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        let packed = pack_component(spec, &character(), &to_owner, false)
            .unwrap()
            .unwrap();
        let ids: Vec<FieldId> = packed.fields.iter().map(|f| f.field).collect();
        assert_eq!(
            ids,
            vec![
                CharacterState::POSITION,
                CharacterState::VELOCITY,
                CharacterState::STAMINA
            ]
        );

        // To a spectator: no stamina, but look_yaw is relayed.
        let to_spectator = AuthorityCheck {
            owned: false,
            entity_initial: false,
        };
        let packed = pack_component(spec, &character(), &to_spectator, false)
            .unwrap()
            .unwrap();
        let ids: Vec<FieldId> = packed.fields.iter().map(|f| f.field).collect();
        assert_eq!(
            ids,
            vec![
                CharacterState::POSITION,
                CharacterState::VELOCITY,
                CharacterState::LOOK_YAW
            ]
        );
    }

    #[test]
    fn test_empty_delta_packs_to_none_but_initial_does_not() {
        let registry = standard_schema();
        let spec = registry.component_named(CHARACTER_STATE).unwrap();

        // A peer owns nothing here: RemoteCheck refuses every
        // authority-driven field of a component with no owner-sourced ones.
        let display = registry.component_named("display_name").unwrap();
        let name = crate::components::DisplayName::default();
        assert!(pack_component(display, &name, &RemoteCheck, false)
            .unwrap()
            .is_none());

        let initial = pack_component(spec, &character(), &RemoteCheck, true)
            .unwrap()
            .unwrap();
        // Initial from a remote still only carries what it may assert.
        assert_eq!(initial.fields.len(), 1);
        assert_eq!(initial.fields[0].field, CharacterState::LOOK_YAW);
    }

    #[test]
    fn test_unpack_rejects_fields_the_policy_forbids() {
        let registry = standard_schema();
        let spec = registry.component_named(CHARACTER_STATE).unwrap();

        // A peer claims position (authority-only) and look_yaw (legal).
        let claim = character();
        let packed = PackedComponent {
            type_id: spec.type_id,
            fields: vec![
                PackedField {
                    field: CharacterState::POSITION,
                    data: claim.write_field(CharacterState::POSITION).unwrap(),
                },
                PackedField {
                    field: CharacterState::LOOK_YAW,
                    data: claim.write_field(CharacterState::LOOK_YAW).unwrap(),
                },
            ],
        };

        let mut target = CharacterState::default();
        let check = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        let report = unpack_component(spec, &mut target, &packed, &check).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected, vec![CharacterState::POSITION]);
        assert!(!report.clean());

        // The legal field landed; the forbidden one did not.
        assert_eq!(target.look_yaw, claim.look_yaw);
        assert_eq!(target.position, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_unpack_reports_undeclared_field_ids() {
        let registry = standard_schema();
        let spec = registry.component_named(CHARACTER_STATE).unwrap();
        let packed = PackedComponent {
            type_id: spec.type_id,
            fields: vec![PackedField {
                field: FieldId(42),
                data: vec![1, 2, 3],
            }],
        };
        let mut target = CharacterState::default();
        let report = unpack_component(spec, &mut target, &packed, &RemoteCheck).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.rejected, vec![FieldId(42)]);
    }

    #[test]
    fn test_malformed_field_data_is_fatal() {
        let registry = standard_schema();
        let spec = registry.component_named(CHARACTER_STATE).unwrap();
        let packed = PackedComponent {
            type_id: spec.type_id,
            fields: vec![PackedField {
                field: CharacterState::POSITION,
                data: vec![0xFF], // far too short for [f32; 3]
            }],
        };
        let mut target = CharacterState::default();
        assert!(unpack_component(spec, &mut target, &packed, &RemoteCheck).is_err());
    }

    #[test]
    fn test_remote_accepts_everything_the_authority_packs() {
        let registry = standard_schema();
        let spec = registry.component_named("inventory").unwrap();
        let source = Inventory {
            slots: vec!["torch".to_string(), "rope".to_string()],
            selected: 1,
        };
        let check = AuthorityCheck {
            owned: true,
            entity_initial: true,
        };
        let packed = pack_component(spec, &source, &check, true).unwrap().unwrap();

        let mut mirror = Inventory::default();
        let report = unpack_component(spec, &mut mirror, &packed, &RemoteCheck).unwrap();
        assert!(report.clean());
        assert_eq!(mirror, source);
    }

    #[test]
    fn test_event_payload_roundtrip() {
        let payload = crate::components::Notify {
            text: "observed".to_string(),
        };
        let data = encode_payload(&payload).unwrap();
        let back: crate::components::Notify = decode_payload(&data).unwrap();
        assert_eq!(back, payload);
    }
}
