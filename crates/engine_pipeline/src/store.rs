//! Primary component storage.
//!
//! The scheduler only needs two things from storage: whether a query has any
//! matching entities (a system without matches is inactive and doesn't take
//! part in merge analysis), and a generation counter that changes whenever
//! what a query could match changes.
//!
//! [`ComponentStore`] is a small dynamically-typed store: components are
//! `serde_json::Value`s keyed by [`Id`]. It is safe to mutate from several
//! threads at once, which is what multi-threaded systems writing their own
//! components in place do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use engine_term::{Entity, Id, QueryDesc};
use serde_json::Value;

/// Storage capabilities the scheduler relies on.
pub trait Storage: Send + Sync + 'static {
    /// Returns `true` if at least one entity matches the `This` terms of
    /// `query`.
    fn has_matches(&self, query: &QueryDesc) -> bool;

    /// Counter that changes whenever an entity is created or destroyed, or
    /// gains or loses a component.
    fn structure_generation(&self) -> u64;
}

/// Concurrent entity/component map.
#[derive(Debug)]
pub struct ComponentStore {
    entities: DashMap<Entity, HashMap<Id, Value>>,
    next_entity: AtomicU64,
    generation: AtomicU64,
}

impl Default for ComponentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            next_entity: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    // -- Entity lifecycle --

    /// Create an empty entity.
    pub fn spawn(&self) -> Entity {
        let entity = Entity(self.next_entity.fetch_add(1, Ordering::Relaxed));
        self.entities.insert(entity, HashMap::new());
        self.bump();
        entity
    }

    /// Remove an entity and all its components. Returns `false` if it didn't
    /// exist.
    pub fn despawn(&self, entity: Entity) -> bool {
        let removed = self.entities.remove(&entity).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Returns `true` if the entity exists.
    #[must_use]
    pub fn exists(&self, entity: Entity) -> bool {
        self.entities.contains_key(&entity)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // -- Component operations --

    /// Set a component, adding it if absent. Returns `false` if the entity
    /// doesn't exist.
    pub fn set(&self, entity: Entity, id: Id, value: Value) -> bool {
        let Some(mut components) = self.entities.get_mut(&entity) else {
            return false;
        };
        let added = components.insert(id, value).is_none();
        drop(components);
        if added {
            self.bump();
        }
        true
    }

    /// Add a tag (a component without data).
    pub fn add(&self, entity: Entity, id: Id) -> bool {
        let Some(mut components) = self.entities.get_mut(&entity) else {
            return false;
        };
        let added = !components.contains_key(&id);
        if added {
            components.insert(id, Value::Null);
        }
        drop(components);
        if added {
            self.bump();
        }
        true
    }

    /// Get a copy of a component value.
    #[must_use]
    pub fn get(&self, entity: Entity, id: Id) -> Option<Value> {
        self.entities.get(&entity)?.get(&id).cloned()
    }

    /// Returns `true` if the entity has `id`, or any id matching it when `id`
    /// is a pattern.
    #[must_use]
    pub fn has(&self, entity: Entity, id: Id) -> bool {
        self.entities
            .get(&entity)
            .is_some_and(|components| Self::has_id(&components, id))
    }

    /// Update a component in place. Returns `false` if the entity or the
    /// component is missing.
    pub fn update(&self, entity: Entity, id: Id, f: impl FnOnce(&mut Value)) -> bool {
        let Some(mut components) = self.entities.get_mut(&entity) else {
            return false;
        };
        match components.get_mut(&id) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    /// Remove a component. Returns the removed value.
    pub fn remove(&self, entity: Entity, id: Id) -> Option<Value> {
        let removed = self.entities.get_mut(&entity)?.remove(&id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    // -- Query --

    /// Entities matching the `This` terms of `query`, in id order.
    #[must_use]
    pub fn query(&self, query: &QueryDesc) -> Vec<Entity> {
        let mut matched: Vec<Entity> = self
            .entities
            .iter()
            .filter(|entry| query.matches_entity(|id| Self::has_id(entry.value(), id)))
            .map(|entry| *entry.key())
            .collect();
        matched.sort_unstable();
        matched
    }

    fn has_id(components: &HashMap<Id, Value>, id: Id) -> bool {
        if id.is_wildcard() {
            components.keys().any(|candidate| candidate.matches(id))
        } else {
            components.contains_key(&id)
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Storage for ComponentStore {
    fn has_matches(&self, query: &QueryDesc) -> bool {
        self.entities
            .iter()
            .any(|entry| query.matches_entity(|id| Self::has_id(entry.value(), id)))
    }

    fn structure_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let store = ComponentStore::new();
        let position = Id::from_name("Position");
        let e = store.spawn();

        assert!(store.set(e, position, json!({"x": 1.0})));
        assert_eq!(store.get(e, position), Some(json!({"x": 1.0})));
        assert!(store.has(e, position));

        assert_eq!(store.remove(e, position), Some(json!({"x": 1.0})));
        assert!(!store.has(e, position));
        assert!(!store.set(Entity(999), position, json!(0)));
    }

    #[test]
    fn test_generation_tracks_structure_only() {
        let store = ComponentStore::new();
        let position = Id::from_name("Position");
        let e = store.spawn();

        let g0 = store.structure_generation();
        store.set(e, position, json!(1));
        let g1 = store.structure_generation();
        assert_ne!(g0, g1, "adding a component must change the generation");

        store.set(e, position, json!(2));
        store.update(e, position, |v| *v = json!(3));
        assert_eq!(store.structure_generation(), g1, "value writes are not structural");

        store.despawn(e);
        assert_ne!(store.structure_generation(), g1);
    }

    #[test]
    fn test_query_and_not() {
        let store = ComponentStore::new();
        let position = Id::from_name("Position");
        let frozen = Id::from_name("Frozen");

        let moving = store.spawn();
        store.set(moving, position, json!(0));
        let stuck = store.spawn();
        store.set(stuck, position, json!(0));
        store.add(stuck, frozen);

        let q = QueryDesc::new().write(position).without(frozen);
        assert_eq!(store.query(&q), vec![moving]);
        assert!(store.has_matches(&q));
        assert!(!store.has_matches(&QueryDesc::new().with(Id::from_name("Velocity"))));
    }

    #[test]
    fn test_pair_patterns() {
        let store = ComponentStore::new();
        let likes = Id::from_name("Likes");
        let apples = Id::from_name("Apples");
        let e = store.spawn();
        store.add(e, Id::pair(likes, apples));

        assert!(store.has(e, Id::pair(likes, Id::WILDCARD)));
        assert!(store.has_matches(&QueryDesc::new().with(Id::pair(likes, Id::WILDCARD))));
    }
}
