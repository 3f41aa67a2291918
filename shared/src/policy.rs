//! Field replication policy.
//!
//! Two implementations of the same interface with opposite trust levels.
//! The authority decides what each peer may see and what it will believe
//! from a peer; a peer sends only what it is allowed to assert and believes
//! everything the authority says. Both sides consult the same per-field
//! descriptors, so the rules stay symmetric by construction.

use crate::schema::{ComponentSpec, FieldSpec};
use serde::{Deserialize, Serialize};

/// Who may write a field and who gets to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldDirection {
    /// Authority writes; every peer that sees the entity reads.
    ServerToClient,
    /// Authority writes; only the owning peer reads.
    ServerToOwner,
    /// The owning peer writes; only the authority reads.
    OwnerToServer,
    /// The owning peer writes; the authority relays to everyone else.
    OwnerToServerToClient,
}

impl FieldDirection {
    /// True for the directions whose values originate at the owning peer.
    pub fn owner_sourced(self) -> bool {
        matches!(
            self,
            FieldDirection::OwnerToServer | FieldDirection::OwnerToServerToClient
        )
    }
}

/// How an entity picks its audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicateMode {
    /// Every joined peer receives it.
    Always,
    /// Only peers whose client entity appears in its ownership chain.
    Owner,
    /// Peers for which the injected relevance predicate says yes.
    Relevant,
}

/// The send/accept decision interface, implemented once per trust level.
pub trait FieldCheck {
    /// Should this field be included in an outgoing message?
    ///
    /// `component_initial` is true when the component itself is being sent
    /// in full (entity initial send, or a component newly added to an
    /// already-visible entity).
    fn should_send(
        &self,
        component: &ComponentSpec,
        field: &FieldSpec,
        component_initial: bool,
    ) -> bool;

    /// Should this field, arriving from the other side, be applied?
    fn should_accept(&self, component: &ComponentSpec, field: &FieldSpec) -> bool;
}

/// Authority-side check, built per (entity, peer) pair at send time.
#[derive(Debug, Clone, Copy)]
pub struct AuthorityCheck {
    /// The receiving peer's client entity is in the entity's owner chain.
    pub owned: bool,
    /// The entity as a whole is being sent for the first time.
    pub entity_initial: bool,
}

impl FieldCheck for AuthorityCheck {
    fn should_send(
        &self,
        component: &ComponentSpec,
        field: &FieldSpec,
        component_initial: bool,
    ) -> bool {
        let initial = self.entity_initial || component_initial;
        let blanket = initial
            || (!field.initial_only
                && match field.direction {
                    FieldDirection::ServerToClient => true,
                    FieldDirection::ServerToOwner => self.owned,
                    FieldDirection::OwnerToServer | FieldDirection::OwnerToServerToClient => {
                        !self.owned
                    }
                });
        // The component hook may only narrow the blanket rule, never widen it.
        match component.send_override {
            Some(hook) => blanket && hook(field, initial, self.owned),
            None => blanket,
        }
    }

    fn should_accept(&self, _component: &ComponentSpec, field: &FieldSpec) -> bool {
        field.direction.owner_sourced()
    }
}

/// Peer-side check: send only what the peer is allowed to assert, accept
/// everything the authority sends.
#[derive(Debug, Clone, Copy)]
pub struct RemoteCheck;

impl FieldCheck for RemoteCheck {
    fn should_send(
        &self,
        _component: &ComponentSpec,
        field: &FieldSpec,
        _component_initial: bool,
    ) -> bool {
        field.direction.owner_sourced()
    }

    fn should_accept(&self, _component: &ComponentSpec, _field: &FieldSpec) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ComponentTypeId, FieldId};

    fn field(direction: FieldDirection, initial_only: bool) -> FieldSpec {
        FieldSpec {
            id: FieldId(0),
            name: "field",
            direction,
            initial_only,
        }
    }

    fn component(send_override: Option<fn(&FieldSpec, bool, bool) -> bool>) -> ComponentSpec {
        ComponentSpec {
            type_id: ComponentTypeId(0),
            name: "component",
            fields: vec![],
            send_override,
            factory: crate::schema::test_factory,
        }
    }

    #[test]
    fn test_initial_send_includes_every_direction() {
        let check = AuthorityCheck {
            owned: false,
            entity_initial: true,
        };
        let spec = component(None);
        for direction in [
            FieldDirection::ServerToClient,
            FieldDirection::ServerToOwner,
            FieldDirection::OwnerToServer,
            FieldDirection::OwnerToServerToClient,
        ] {
            assert!(
                check.should_send(&spec, &field(direction, false), false),
                "{:?} missing from initial send",
                direction
            );
            assert!(
                check.should_send(&spec, &field(direction, true), false),
                "initial-only {:?} missing from initial send",
                direction
            );
        }
    }

    #[test]
    fn test_initial_only_fields_never_sent_as_deltas() {
        let spec = component(None);
        for owned in [false, true] {
            let check = AuthorityCheck {
                owned,
                entity_initial: false,
            };
            assert!(!check.should_send(&spec, &field(FieldDirection::ServerToClient, true), false));
            assert!(!check.should_send(&spec, &field(FieldDirection::ServerToOwner, true), false));
        }
    }

    #[test]
    fn test_server_to_owner_goes_only_to_the_owner() {
        let spec = component(None);
        let f = field(FieldDirection::ServerToOwner, false);
        let owner = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        let spectator = AuthorityCheck {
            owned: false,
            entity_initial: false,
        };
        assert!(owner.should_send(&spec, &f, false));
        assert!(!spectator.should_send(&spec, &f, false));
    }

    #[test]
    fn test_owner_sourced_deltas_skip_the_owner() {
        // Non-owners hear what the owner reported; the owner already knows.
        let spec = component(None);
        let f = field(FieldDirection::OwnerToServerToClient, false);
        let owner = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        let spectator = AuthorityCheck {
            owned: false,
            entity_initial: false,
        };
        assert!(!owner.should_send(&spec, &f, false));
        assert!(spectator.should_send(&spec, &f, false));
    }

    #[test]
    fn test_component_initial_behaves_like_entity_initial() {
        let check = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        let spec = component(None);
        let f = field(FieldDirection::OwnerToServerToClient, false);
        assert!(!check.should_send(&spec, &f, false));
        assert!(check.should_send(&spec, &f, true));
    }

    #[test]
    fn test_hook_can_veto_but_not_widen() {
        fn veto_all(_: &FieldSpec, _: bool, _: bool) -> bool {
            false
        }
        fn allow_all(_: &FieldSpec, _: bool, _: bool) -> bool {
            true
        }

        let f = field(FieldDirection::ServerToClient, false);
        let check = AuthorityCheck {
            owned: false,
            entity_initial: false,
        };
        // Blanket says yes, hook vetoes.
        assert!(!check.should_send(&component(Some(veto_all)), &f, false));

        // Blanket says no (initial-only delta), hook cannot force it in.
        let frozen = field(FieldDirection::ServerToClient, true);
        assert!(!check.should_send(&component(Some(allow_all)), &frozen, false));
    }

    #[test]
    fn test_authority_accepts_only_owner_sourced_fields() {
        let check = AuthorityCheck {
            owned: true,
            entity_initial: false,
        };
        let spec = component(None);
        assert!(check.should_accept(&spec, &field(FieldDirection::OwnerToServer, false)));
        assert!(check.should_accept(&spec, &field(FieldDirection::OwnerToServerToClient, false)));
        assert!(!check.should_accept(&spec, &field(FieldDirection::ServerToClient, false)));
        assert!(!check.should_accept(&spec, &field(FieldDirection::ServerToOwner, false)));
    }

    #[test]
    fn test_remote_sends_only_owner_sourced_fields() {
        let spec = component(None);
        assert!(RemoteCheck.should_send(&spec, &field(FieldDirection::OwnerToServer, false), false));
        assert!(!RemoteCheck.should_send(
            &spec,
            &field(FieldDirection::ServerToClient, false),
            false
        ));
        // The authority is always trusted on the way down.
        assert!(RemoteCheck.should_accept(&spec, &field(FieldDirection::ServerToClient, false)));
    }
}
