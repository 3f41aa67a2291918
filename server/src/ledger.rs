//! Network id allocation and the ownership forest.
//!
//! The ledger is the authority's source of truth for "which entity is
//! net id N" and "who owns whom". Ownership is stored twice: the
//! `NetworkComponent.owner` back-reference lives in the world (and is what
//! chain walks follow), while the ledger keeps a mirrored owner→owned index
//! so a subtree can be enumerated without scanning every entity. All
//! mutation happens on the simulation thread; nothing here locks.

use log::{debug, error};
use shared::entity_ref::NetIdIndex;
use shared::world::{Entity, NetId, World};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Defensive cap on ownership chain walks. Real chains are a handful of
/// hops; hitting this means the forest invariant was broken somewhere.
pub const OWNER_DEPTH_LIMIT: usize = 50;

/// Id and ownership bookkeeping for every network-visible entity.
#[derive(Debug, Default)]
pub struct Ledger {
    next_net_id: u32,
    by_net_id: BTreeMap<NetId, Entity>,
    ids: HashMap<Entity, NetId>,
    owner_of: HashMap<Entity, Entity>,
    owned_by: HashMap<Entity, BTreeSet<Entity>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a network id for the entity and writes it into its
    /// `NetworkComponent`. Idempotent: an already-registered entity keeps
    /// its id. Entities without a `NetworkComponent` are not registrable.
    ///
    /// Ids start at 1 and are never reused within a session, so a stale id
    /// can never silently resolve to a different entity.
    pub fn register(&mut self, world: &mut World, entity: Entity) -> Option<NetId> {
        let owner = {
            let network = world.network_mut(entity)?;
            if let Some(id) = network.net_id {
                debug!("entity {} already registered as {}", entity, id);
                return Some(id);
            }
            self.next_net_id += 1;
            let id = NetId(self.next_net_id);
            network.net_id = Some(id);
            network.owner
        };

        let id = NetId(self.next_net_id);
        self.by_net_id.insert(id, entity);
        self.ids.insert(entity, id);
        if owner.is_some() {
            self.set_owner_edge(entity, owner);
        }
        debug!("registered entity {} as net id {}", entity, id);
        Some(id)
    }

    /// Releases the entity's id and its edge in the ownership index. The id
    /// itself is retired. Children keep their edges; whoever tears the
    /// subtree down walks it first. Idempotent.
    pub fn unregister(&mut self, world: &mut World, entity: Entity) {
        if let Some(id) = self.ids.remove(&entity) {
            self.by_net_id.remove(&id);
            debug!("released net id {} of entity {}", id, entity);
        }
        self.set_owner_edge(entity, None);
        if let Some(network) = world.network_mut(entity) {
            network.net_id = None;
        }
    }

    pub fn net_id(&self, entity: Entity) -> Option<NetId> {
        self.ids.get(&entity).copied()
    }

    pub fn entity_by_net_id(&self, id: NetId) -> Option<Entity> {
        self.by_net_id.get(&id).copied()
    }

    /// All registered entities in id (= registration) order.
    pub fn registered(&self) -> impl Iterator<Item = (NetId, Entity)> + '_ {
        self.by_net_id.iter().map(|(&id, &entity)| (id, entity))
    }

    pub fn len(&self) -> usize {
        self.by_net_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_net_id.is_empty()
    }

    /// Points the ownership index at the entity's current owner. Must be
    /// called whenever `NetworkComponent.owner` changes; `register` and
    /// `unregister` call it themselves.
    pub fn set_owner_edge(&mut self, entity: Entity, new_owner: Option<Entity>) {
        if let Some(old) = self.owner_of.remove(&entity) {
            if let Some(children) = self.owned_by.get_mut(&old) {
                children.remove(&entity);
                if children.is_empty() {
                    self.owned_by.remove(&old);
                }
            }
        }
        if let Some(owner) = new_owner {
            self.owner_of.insert(entity, owner);
            self.owned_by.entry(owner).or_default().insert(entity);
        }
    }

    /// Entities directly owned by `owner`, in stable order.
    pub fn owned_children(&self, owner: Entity) -> impl Iterator<Item = Entity> + '_ {
        self.owned_by
            .get(&owner)
            .into_iter()
            .flat_map(|children| children.iter().copied())
    }

    /// Walks `owner` links upward from `entity` looking for `candidate`.
    /// The chain includes the entity itself, so an entity trivially
    /// contains its own client entity when it *is* that entity.
    ///
    /// The walk is capped at [`OWNER_DEPTH_LIMIT`] hops: a longer chain
    /// means a cycle slipped into the forest, which is reported loudly and
    /// treated as "no owner" for this evaluation instead of looping.
    pub fn owner_chain_contains(
        &self,
        world: &World,
        entity: Entity,
        candidate: Entity,
    ) -> bool {
        let mut current = entity;
        for _ in 0..=OWNER_DEPTH_LIMIT {
            if current == candidate {
                return true;
            }
            match world.network(current).and_then(|n| n.owner) {
                Some(next) => current = next,
                None => return false,
            }
        }
        error!(
            "ownership chain from entity {} exceeded {} hops; ledger corrupt, treating as unowned",
            entity, OWNER_DEPTH_LIMIT
        );
        false
    }

    /// The entity plus everything transitively owned by it, breadth-first
    /// through the owned-by index. Safe against index cycles: a revisit is
    /// reported and skipped.
    pub fn owned_subtree(&self, root: Entity) -> Vec<Entity> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(entity) = queue.pop_front() {
            if !seen.insert(entity) {
                error!("ownership index cycle through entity {}", entity);
                continue;
            }
            out.push(entity);
            if let Some(children) = self.owned_by.get(&entity) {
                queue.extend(children.iter().copied());
            }
        }
        out
    }
}

impl NetIdIndex for Ledger {
    fn entity_by_net_id(&self, id: NetId) -> Option<Entity> {
        Ledger::entity_by_net_id(self, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::policy::ReplicateMode;
    use shared::world::NetworkComponent;

    fn visible(world: &mut World) -> Entity {
        let e = world.spawn();
        world.set_network(e, NetworkComponent::new(ReplicateMode::Always));
        e
    }

    fn owned(world: &mut World, owner: Entity) -> Entity {
        let e = world.spawn();
        world.set_network(e, NetworkComponent::owned_by(ReplicateMode::Owner, owner));
        e
    }

    #[test]
    fn test_ids_start_at_one_and_count_up() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let a = visible(&mut world);
        let b = visible(&mut world);

        assert_eq!(ledger.register(&mut world, a), Some(NetId(1)));
        assert_eq!(ledger.register(&mut world, b), Some(NetId(2)));
        assert_eq!(world.network(a).unwrap().net_id, Some(NetId(1)));
        assert_eq!(ledger.entity_by_net_id(NetId(1)), Some(a));
        assert_eq!(ledger.net_id(b), Some(NetId(2)));
    }

    #[test]
    fn test_duplicate_registration_is_a_noop() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let a = visible(&mut world);

        let first = ledger.register(&mut world, a);
        let second = ledger.register(&mut world, a);
        assert_eq!(first, second);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_entity_without_network_component_is_not_registrable() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let plain = world.spawn();
        assert_eq!(ledger.register(&mut world, plain), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_released_ids_are_never_reused() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let a = visible(&mut world);

        assert_eq!(ledger.register(&mut world, a), Some(NetId(1)));
        ledger.unregister(&mut world, a);
        assert_eq!(ledger.entity_by_net_id(NetId(1)), None);
        assert_eq!(world.network(a).unwrap().net_id, None);

        // Same entity, fresh id.
        assert_eq!(ledger.register(&mut world, a), Some(NetId(2)));
    }

    #[test]
    fn test_owner_chain_contains_walks_to_the_root() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let client = visible(&mut world);
        let a = owned(&mut world, client);
        let b = owned(&mut world, a);
        for e in [client, a, b] {
            ledger.register(&mut world, e);
        }

        assert!(ledger.owner_chain_contains(&world, b, b));
        assert!(ledger.owner_chain_contains(&world, b, a));
        assert!(ledger.owner_chain_contains(&world, b, client));
        assert!(ledger.owner_chain_contains(&world, a, client));
        assert!(!ledger.owner_chain_contains(&world, client, a));

        let stranger = visible(&mut world);
        assert!(!ledger.owner_chain_contains(&world, b, stranger));
    }

    #[test]
    fn test_owner_cycle_terminates_and_reads_as_unowned() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let a = visible(&mut world);
        let b = visible(&mut world);
        world.network_mut(a).unwrap().owner = Some(b);
        world.network_mut(b).unwrap().owner = Some(a);
        ledger.register(&mut world, a);
        ledger.register(&mut world, b);

        let outsider = visible(&mut world);
        // Must return, and must not claim the outsider is in the chain.
        assert!(!ledger.owner_chain_contains(&world, a, outsider));
        // Members of the cycle are still found before the cap.
        assert!(ledger.owner_chain_contains(&world, a, b));
    }

    #[test]
    fn test_owned_subtree_spans_the_forest_below() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let client = visible(&mut world);
        let a = owned(&mut world, client);
        let b = owned(&mut world, a);
        let c = owned(&mut world, a);
        let unrelated = visible(&mut world);
        for e in [client, a, b, c, unrelated] {
            ledger.register(&mut world, e);
        }

        let subtree = ledger.owned_subtree(client);
        assert_eq!(subtree.len(), 4);
        assert_eq!(subtree[0], client);
        assert!(subtree.contains(&a));
        assert!(subtree.contains(&b));
        assert!(subtree.contains(&c));
        assert!(!subtree.contains(&unrelated));

        assert_eq!(ledger.owned_subtree(b), vec![b]);
    }

    #[test]
    fn test_set_owner_edge_moves_between_buckets() {
        let mut world = World::new();
        let mut ledger = Ledger::new();
        let first = visible(&mut world);
        let second = visible(&mut world);
        let item = owned(&mut world, first);
        for e in [first, second, item] {
            ledger.register(&mut world, e);
        }

        assert_eq!(ledger.owned_children(first).collect::<Vec<_>>(), vec![item]);

        world.network_mut(item).unwrap().owner = Some(second);
        ledger.set_owner_edge(item, Some(second));
        assert_eq!(ledger.owned_children(first).count(), 0);
        assert_eq!(
            ledger.owned_children(second).collect::<Vec<_>>(),
            vec![item]
        );

        ledger.set_owner_edge(item, None);
        assert_eq!(ledger.owned_children(second).count(), 0);
    }
}
