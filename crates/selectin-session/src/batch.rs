//! Key extraction and chunking.

use crate::identity_map::{EntityId, IdentityMap};
use selectin_core::Key;
use std::collections::HashMap;

/// Distinct correlation keys of a parent set, in first-seen order, plus the
/// parents behind each key.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<Key>,
    members: HashMap<Key, Vec<EntityId>>,
    /// Parents with a NULL or unloaded key column; they get an empty value.
    keyless: Vec<EntityId>,
}

impl KeySet {
    /// Extract the values of `columns` from each parent.
    ///
    /// Identical tuples collapse onto one key; parents whose tuple has a NULL
    /// component, or that are not tracked, contribute no key.
    pub fn extract(map: &IdentityMap, parents: &[EntityId], columns: &[&str]) -> Self {
        let mut set = Self::default();
        for &parent in parents {
            let values = map.get(parent).and_then(|s| s.column_values(columns));
            let key = match values {
                Some(values) => Key::new(values),
                None => {
                    set.keyless.push(parent);
                    continue;
                }
            };
            if key.has_null() {
                set.keyless.push(parent);
                continue;
            }
            match set.members.get_mut(&key) {
                Some(members) => members.push(parent),
                None => {
                    set.keys.push(key.clone());
                    set.members.insert(key, vec![parent]);
                }
            }
        }
        set
    }

    /// Distinct keys, in first-seen order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Parents that share `key`, in input order.
    pub fn members(&self, key: &Key) -> &[EntityId] {
        self.members.get(key).map_or(&[][..], Vec::as_slice)
    }

    /// Parents that contributed no key.
    pub fn keyless(&self) -> &[EntityId] {
        &self.keyless
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keep only the keys for which `keep` returns true, in order.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&Key) -> bool) {
        self.keys.retain(|k| keep(k));
    }

    /// Split the keys into batches of at most `size`.
    pub fn chunks(&self, size: usize) -> std::slice::Chunks<'_, Key> {
        chunk(&self.keys, size)
    }
}

/// Split `keys` into consecutive batches of at most `size` keys, in order.
///
/// Empty input yields no batches. A `size` of zero is treated as one.
pub fn chunk(keys: &[Key], size: usize) -> std::slice::Chunks<'_, Key> {
    keys.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use selectin_core::Value;
    use std::collections::HashMap as Map;

    fn parent(map: &mut IdentityMap, id: i64, fk: Value) -> EntityId {
        let mut cols: Map<&'static str, Value> = Map::new();
        cols.insert("id", Value::BigInt(id));
        cols.insert("b_id", fk);
        map.upsert("A", "A", Key::single(id), cols, false).0
    }

    #[test]
    fn dedup_in_first_seen_order() {
        let mut map = IdentityMap::new();
        let p1 = parent(&mut map, 1, Value::Int(20));
        let p2 = parent(&mut map, 2, Value::Int(10));
        let p3 = parent(&mut map, 3, Value::BigInt(20));
        let p4 = parent(&mut map, 4, Value::Null);

        let set = KeySet::extract(&map, &[p1, p2, p3, p4], &["b_id"]);
        assert_eq!(set.keys(), &[Key::single(20_i64), Key::single(10_i64)]);
        assert_eq!(set.members(&Key::single(20_i64)), &[p1, p3]);
        assert_eq!(set.keyless(), &[p4]);
    }

    #[test]
    fn unloaded_columns_contribute_no_key() {
        let mut map = IdentityMap::new();
        let p1 = parent(&mut map, 1, Value::Int(5));
        let set = KeySet::extract(&map, &[p1], &["missing"]);
        assert!(set.is_empty());
        assert_eq!(set.keyless(), &[p1]);
    }

    #[test]
    fn chunk_sizes() {
        let keys: Vec<Key> = (0..5_i64).map(|i| Key::single(i)).collect();
        let sizes: Vec<usize> = chunk(&keys, 2).map(<[Key]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(chunk(&[], 500).count(), 0);
        assert_eq!(chunk(&keys, 0).count(), 5);

        // every key appears exactly once across batches
        let flattened: Vec<Key> = chunk(&keys, 3).flatten().cloned().collect();
        assert_eq!(flattened, keys);
    }
}
