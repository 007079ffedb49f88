//! Row correlation: attaching secondary rows to their parents.
//!
//! Correlation runs in two phases per batch. Every row is parsed first
//! (correlation key, target identity, concrete type, column values) without
//! touching the identity map, so a malformed row fails the batch with nothing
//! applied. Only then are target entities merged into the map and parent
//! attributes set.

use crate::batch::KeySet;
use crate::identity_map::{EntityId, IdentityMap, RelatedValue};
use crate::report::Diagnostic;
use selectin_core::{Key, MappingRegistry, Result, Row, Value};
use selectin_query::{SecondaryQueryBuilder, key_label};
use std::collections::HashMap;

#[derive(Debug)]
struct ParsedRow {
    key: Key,
    identity: Key,
    entity: &'static str,
    columns: HashMap<&'static str, Value>,
}

/// Result of correlating one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Parents whose attribute was set.
    pub populated: usize,
    /// Target entities materialized from the rows, distinct, in row order.
    pub loaded: Vec<EntityId>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Attaches the rows of one secondary statement to the parents in `keys`.
pub struct RowCorrelator<'a> {
    registry: &'a MappingRegistry,
    builder: &'a SecondaryQueryBuilder,
    base: &'static str,
    discriminator: Option<&'static str>,
    populate_existing: bool,
    path: String,
}

impl<'a> RowCorrelator<'a> {
    pub fn new(
        registry: &'a MappingRegistry,
        builder: &'a SecondaryQueryBuilder,
        path: String,
        populate_existing: bool,
    ) -> Result<Self> {
        let target = builder.target();
        Ok(Self {
            registry,
            builder,
            base: registry.base_of(target)?,
            discriminator: registry.polymorphic_on(target)?,
            populate_existing,
            path,
        })
    }

    fn parse(&self, row: &Row) -> Result<Option<ParsedRow>> {
        let mut key_values = Vec::with_capacity(self.builder.key_arity());
        for i in 0..self.builder.key_arity() {
            key_values.push(row.require(&key_label(i))?.clone());
        }
        let mut identity = Vec::with_capacity(self.builder.target_primary_key().len());
        for col in self.builder.target_primary_key() {
            identity.push(row.require(col)?.clone());
        }
        let identity = Key::new(identity);
        if identity.has_null() {
            return Ok(None);
        }
        let mut columns = HashMap::with_capacity(self.builder.target_columns().len());
        for col in self.builder.target_columns() {
            columns.insert(*col, row.require(col)?.clone());
        }
        let entity = self.registry.concrete_type(
            self.builder.target(),
            self.discriminator.and_then(|d| columns.get(d)),
        );
        Ok(Some(ParsedRow {
            key: Key::new(key_values),
            identity,
            entity,
            columns,
        }))
    }

    /// Populate the attribute of every parent behind `batch`.
    ///
    /// Keys in `batch` with no rows get an empty value. For scalar
    /// relationships the first row per key wins and extra rows are reported.
    pub fn correlate(
        &self,
        map: &mut IdentityMap,
        keys: &KeySet,
        batch: &[Key],
        rows: &[Row],
    ) -> Result<BatchOutcome> {
        let parsed = rows
            .iter()
            .map(|row| self.parse(row))
            .collect::<Result<Vec<_>>>()?;
        let rel = self.builder.relationship();

        let mut outcome = BatchOutcome::default();
        let mut groups: HashMap<Key, Vec<EntityId>> = HashMap::new();
        for row in parsed.into_iter().flatten() {
            let (id, _) = map.upsert(
                self.base,
                row.entity,
                row.identity,
                row.columns,
                self.populate_existing,
            );
            if !outcome.loaded.contains(&id) {
                outcome.loaded.push(id);
            }
            groups.entry(row.key).or_default().push(id);
        }

        for key in batch {
            let ids = groups.remove(key).unwrap_or_default();
            let value = if rel.is_collection() {
                RelatedValue::Many(ids)
            } else {
                if ids.len() > 1 {
                    tracing::warn!(
                        path = %self.path,
                        relationship = rel.name,
                        parent_key = %key,
                        rows = ids.len(),
                        "Multiple rows for a scalar relationship; keeping the first"
                    );
                    outcome.diagnostics.push(Diagnostic::CorrelationAnomaly {
                        path: self.path.clone(),
                        relationship: rel.name,
                        parent_key: key.to_string(),
                        rows: ids.len(),
                    });
                }
                RelatedValue::One(ids.first().copied())
            };
            for &parent in keys.members(key) {
                if map.set_attribute(parent, rel.name, value.clone()) {
                    outcome.populated += 1;
                }
            }
        }

        if !groups.is_empty() {
            tracing::debug!(
                relationship = rel.name,
                unmatched = groups.len(),
                "Rows carried keys outside the batch"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selectin_core::{EntityMapping, Error, RelationshipInfo};
    use selectin_query::{Dialect, LoaderConfig, QueryStrategy};
    use std::sync::Arc;

    fn registry() -> Arc<MappingRegistry> {
        MappingRegistry::builder()
            .entity(
                EntityMapping::new("A", "a")
                    .primary_key(&["id"])
                    .relationship(RelationshipInfo::one_to_many("bs", "B", "a_id"))
                    .relationship(
                        RelationshipInfo::one_to_many("first_b", "B", "a_id").uselist(false),
                    ),
            )
            .entity(
                EntityMapping::new("B", "b")
                    .primary_key(&["id"])
                    .column("a_id"),
            )
            .build()
            .expect("valid mapping")
    }

    fn builder(reg: &MappingRegistry, rel: &str) -> SecondaryQueryBuilder {
        SecondaryQueryBuilder::new(
            reg,
            "A",
            reg.relationship("A", rel).expect("relationship"),
            None,
            QueryStrategy::Plain,
            Dialect::Postgres,
            &LoaderConfig::default(),
        )
        .expect("builder")
    }

    fn parents(map: &mut IdentityMap, ids: &[i64]) -> Vec<EntityId> {
        ids.iter()
            .map(|id| {
                let mut cols = HashMap::new();
                cols.insert("id", Value::BigInt(*id));
                map.upsert("A", "A", Key::single(*id), cols, false).0
            })
            .collect()
    }

    fn child_row(a_id: i64, id: i64) -> Row {
        Row::new(
            vec!["__selectin_key_0".into(), "id".into(), "a_id".into()],
            vec![Value::BigInt(a_id), Value::BigInt(id), Value::BigInt(a_id)],
        )
    }

    #[test]
    fn collections_keep_row_order_and_empty_parents() {
        let reg = registry();
        let b = builder(&reg, "bs");
        let mut map = IdentityMap::new();
        let ps = parents(&mut map, &[1, 2, 3]);
        let keys = KeySet::extract(&map, &ps, b.parent_key_columns());
        let rows = vec![child_row(1, 11), child_row(1, 10), child_row(3, 30)];

        let correlator = RowCorrelator::new(&reg, &b, "A".into(), false).unwrap();
        let outcome = correlator
            .correlate(&mut map, &keys, keys.keys(), &rows)
            .unwrap();
        assert_eq!(outcome.populated, 3);
        assert_eq!(outcome.loaded.len(), 3);

        let children = map.attribute(ps[0], "bs").unwrap().ids().to_vec();
        let child_ids: Vec<&Value> = children
            .iter()
            .filter_map(|c| map.get(*c).and_then(|s| s.column("id")))
            .collect();
        assert_eq!(child_ids, vec![&Value::BigInt(11), &Value::BigInt(10)]);
        assert_eq!(map.attribute(ps[1], "bs"), Some(&RelatedValue::Many(vec![])));
    }

    #[test]
    fn scalar_with_extra_rows_keeps_first_and_reports() {
        let reg = registry();
        let b = builder(&reg, "first_b");
        let mut map = IdentityMap::new();
        let ps = parents(&mut map, &[1]);
        let keys = KeySet::extract(&map, &ps, b.parent_key_columns());
        let rows = vec![child_row(1, 10), child_row(1, 11)];

        let correlator = RowCorrelator::new(&reg, &b, "A".into(), false).unwrap();
        let outcome = correlator
            .correlate(&mut map, &keys, keys.keys(), &rows)
            .unwrap();
        assert_eq!(outcome.diagnostics.len(), 1);
        let first = map.lookup("B", &Key::single(10_i64));
        assert_eq!(map.attribute(ps[0], "first_b"), Some(&RelatedValue::One(first)));
    }

    #[test]
    fn malformed_row_applies_nothing() {
        let reg = registry();
        let b = builder(&reg, "bs");
        let mut map = IdentityMap::new();
        let ps = parents(&mut map, &[1, 2]);
        let keys = KeySet::extract(&map, &ps, b.parent_key_columns());
        let rows = vec![
            child_row(1, 10),
            Row::new(vec!["id".into()], vec![Value::BigInt(20)]),
        ];

        let correlator = RowCorrelator::new(&reg, &b, "A".into(), false).unwrap();
        let err = correlator
            .correlate(&mut map, &keys, keys.keys(), &rows)
            .unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert!(!map.is_loaded(ps[0], "bs"));
        assert_eq!(map.lookup("B", &Key::single(10_i64)), None);
        assert!(err.to_string().contains("__selectin_key_0"));
    }
}
