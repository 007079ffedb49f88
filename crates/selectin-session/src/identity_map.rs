//! Identity map of loaded entities.
//!
//! Every loaded row corresponds to exactly one [`EntityState`] per session,
//! addressed by an [`EntityId`] handle. Identities are namespaced by the
//! hierarchy base entity, so an `Engineer` and a `Manager` stored in the same
//! table can never share a key.
//!
//! Relationship attributes are stored per entity as [`RelatedValue`]s of
//! entity handles. An attribute that is absent is *unloaded*; an attribute
//! holding `One(None)` or an empty `Many` is *loaded and empty*.
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let id = map.upsert("User", "User", Key::single(1_i64), columns, false).0;
//! map.set_attribute(id, "orders", RelatedValue::Many(vec![]));
//! assert!(map.is_loaded(id, "orders"));
//! ```

use selectin_core::{Key, Value};
use std::collections::HashMap;
use std::fmt;

/// Handle of one entity in an [`IdentityMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

impl EntityId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Added by the caller, not yet persisted; carries no identity.
    Pending,
    /// Loaded from the row source.
    Persistent,
}

/// The loaded value of one relationship attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelatedValue {
    One(Option<EntityId>),
    Many(Vec<EntityId>),
}

impl RelatedValue {
    /// The empty value for a scalar or collection attribute.
    pub fn empty(collection: bool) -> Self {
        if collection {
            RelatedValue::Many(Vec::new())
        } else {
            RelatedValue::One(None)
        }
    }

    /// Related entities, in attribute order.
    pub fn ids(&self) -> &[EntityId] {
        match self {
            RelatedValue::One(Some(id)) => std::slice::from_ref(id),
            RelatedValue::One(None) => &[],
            RelatedValue::Many(ids) => ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }
}

/// State of one tracked entity.
#[derive(Debug, Clone)]
pub struct EntityState {
    /// Concrete entity type (after discriminator resolution).
    pub entity: &'static str,
    /// Primary key; `None` while pending.
    pub key: Option<Key>,
    pub status: EntityStatus,
    /// The entity was loaded through a derived source.
    pub from_derived: bool,
    columns: HashMap<&'static str, Value>,
    attributes: HashMap<&'static str, RelatedValue>,
}

impl EntityState {
    pub fn new(
        entity: &'static str,
        key: Option<Key>,
        columns: HashMap<&'static str, Value>,
    ) -> Self {
        let status = if key.is_some() {
            EntityStatus::Persistent
        } else {
            EntityStatus::Pending
        };
        Self {
            entity,
            key,
            status,
            from_derived: false,
            columns,
            attributes: HashMap::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    /// Is the column loaded (possibly as NULL)?
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn columns(&self) -> &HashMap<&'static str, Value> {
        &self.columns
    }

    /// Values of `names`, or `None` if any of them is not loaded.
    pub fn column_values(&self, names: &[&str]) -> Option<Vec<Value>> {
        names.iter().map(|n| self.columns.get(n).cloned()).collect()
    }

    pub fn attribute(&self, name: &str) -> Option<&RelatedValue> {
        self.attributes.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntityStatus::Pending
    }
}

/// Arena of tracked entities plus the identity index.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entities: Vec<Option<EntityState>>,
    index: HashMap<(&'static str, Key), EntityId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityState> {
        self.entities.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Entity with identity `key` in the hierarchy rooted at `base`.
    pub fn lookup(&self, base: &'static str, key: &Key) -> Option<EntityId> {
        self.index.get(&(base, key.clone())).copied()
    }

    fn push(&mut self, state: EntityState) -> EntityId {
        let id = EntityId(self.entities.len());
        self.entities.push(Some(state));
        id
    }

    /// Insert a persistent entity, or merge into the existing one with the
    /// same identity.
    ///
    /// On merge, `overwrite` replaces loaded column values and the concrete
    /// type; otherwise only columns not yet loaded are filled in. Returns the
    /// handle and whether a new entity was created.
    pub fn upsert(
        &mut self,
        base: &'static str,
        entity: &'static str,
        key: Key,
        columns: HashMap<&'static str, Value>,
        overwrite: bool,
    ) -> (EntityId, bool) {
        if let Some(id) = self.lookup(base, &key) {
            if let Some(state) = self.get_mut(id) {
                if overwrite {
                    state.entity = entity;
                    state.columns.extend(columns);
                } else {
                    for (name, value) in columns {
                        state.columns.entry(name).or_insert(value);
                    }
                }
            }
            return (id, false);
        }
        let id = self.push(EntityState::new(entity, Some(key.clone()), columns));
        self.index.insert((base, key), id);
        (id, true)
    }

    /// Insert a persistent entity loaded through a derived source.
    pub fn upsert_derived(
        &mut self,
        base: &'static str,
        entity: &'static str,
        key: Key,
        columns: HashMap<&'static str, Value>,
        overwrite: bool,
    ) -> (EntityId, bool) {
        let (id, created) = self.upsert(base, entity, key, columns, overwrite);
        if let Some(state) = self.get_mut(id) {
            if created || overwrite {
                state.from_derived = true;
            }
        }
        (id, created)
    }

    /// Track an entity that has no identity yet.
    pub fn add_pending(
        &mut self,
        entity: &'static str,
        columns: HashMap<&'static str, Value>,
    ) -> EntityId {
        self.push(EntityState::new(entity, None, columns))
    }

    pub fn attribute(&self, id: EntityId, name: &str) -> Option<&RelatedValue> {
        self.get(id).and_then(|s| s.attribute(name))
    }

    pub fn is_loaded(&self, id: EntityId, name: &str) -> bool {
        self.get(id).is_some_and(|s| s.is_loaded(name))
    }

    /// Set a relationship attribute, replacing any loaded value.
    pub fn set_attribute(
        &mut self,
        id: EntityId,
        name: &'static str,
        value: RelatedValue,
    ) -> bool {
        match self.get_mut(id) {
            Some(state) => {
                state.attributes.insert(name, value);
                true
            }
            None => false,
        }
    }

    /// Mark attributes unloaded. `None` expires every relationship attribute.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn expire(&mut self, id: EntityId, attributes: Option<&[&str]>) {
        let Some(state) = self.get_mut(id) else {
            tracing::debug!("Entity not tracked, nothing to expire");
            return;
        };
        match attributes {
            None => state.attributes.clear(),
            Some(names) => state.attributes.retain(|name, _| !names.contains(name)),
        }
    }

    /// Stop tracking an entity. Attributes of other entities that refer to
    /// it keep their handles; [`get`](Self::get) returns `None` for them.
    pub fn expunge(&mut self, id: EntityId) -> bool {
        let Some(slot) = self.entities.get_mut(id.0) else {
            return false;
        };
        let Some(state) = slot.take() else {
            return false;
        };
        if state.key.is_some() {
            self.index.retain(|_, v| *v != id);
        }
        true
    }

    /// Live entities, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityState)> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (EntityId(i), s)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
