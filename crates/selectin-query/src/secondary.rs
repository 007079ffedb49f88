//! Secondary statement construction.
//!
//! For one relationship, one owner type and one [`QueryStrategy`], a
//! [`SecondaryQueryBuilder`] turns a batch of correlation keys into a
//! [`SelectQuery`]. Every statement selects the correlation key columns under
//! the labels `__selectin_key_0..n` followed by the target's load columns
//! under their bare names.
//!
//! Shapes, for parent `a` and target `b`:
//!
//! | strategy | relationship | statement |
//! |----------|--------------|-----------|
//! | plain | one-to-many | `FROM b WHERE b.a_id IN (..) ORDER BY b.a_id` |
//! | plain | many-to-one | `FROM b WHERE b.id IN (..)` |
//! | plain | many-to-many | `FROM b JOIN a_b ON a_b.b_id = b.id WHERE a_b.a_id IN (..)` |
//! | join | any | `FROM a AS a_1 JOIN b ON .. WHERE a_1.id IN (..) ORDER BY a_1.id` |

use crate::config::LoaderConfig;
use crate::eager::check_key_arity;
use crate::expr::{ColumnRef, Dialect, Expr};
use crate::select::{Join, OrderBy, SelectQuery, TableRef};
use crate::strategy::QueryStrategy;
use selectin_core::{
    JoinColumns, Key, MappingRegistry, RelationshipInfo, RelationshipKind, Result, Value,
};

/// Label prefix for correlation key columns in secondary rows.
pub const KEY_LABEL_PREFIX: &str = "__selectin_key_";

/// Label of the `index`-th correlation key column.
pub fn key_label(index: usize) -> String {
    format!("{}{}", KEY_LABEL_PREFIX, index)
}

/// Most keys of `arity` columns one statement may bind on `dialect`.
pub fn max_keys_per_statement(dialect: Dialect, arity: usize) -> usize {
    (dialect.max_parameters() / arity.max(1)).max(1)
}

/// Builds the secondary statements for one loader invocation.
#[derive(Debug, Clone)]
pub struct SecondaryQueryBuilder {
    owner: &'static str,
    rel: RelationshipInfo,
    strategy: QueryStrategy,
    dialect: Dialect,
    tuple_in_fallback: bool,
    cols: JoinColumns,
    owner_table: &'static str,
    owner_pk: Vec<&'static str>,
    target: &'static str,
    target_table: &'static str,
    target_pk: Vec<&'static str>,
    target_columns: Vec<&'static str>,
    discriminator: Option<(&'static str, Vec<&'static str>)>,
}

impl SecondaryQueryBuilder {
    /// Resolve everything needed for the statements of `rel` declared on
    /// (or inherited by) `owner`, narrowed to `of_type` when given.
    pub fn new(
        registry: &MappingRegistry,
        owner: &'static str,
        rel: &RelationshipInfo,
        of_type: Option<&'static str>,
        strategy: QueryStrategy,
        dialect: Dialect,
        config: &LoaderConfig,
    ) -> Result<Self> {
        let cols = registry.join_columns(owner, rel)?;
        let target = of_type.unwrap_or(rel.target);
        let discriminator = if registry.needs_discriminator_filter(target)? {
            registry
                .polymorphic_on(target)?
                .map(|column| -> Result<_> { Ok((column, registry.identities_for(target)?)) })
                .transpose()?
        } else {
            None
        };
        let builder = Self {
            owner,
            rel: *rel,
            strategy,
            dialect,
            tuple_in_fallback: config.tuple_in_fallback,
            owner_table: registry.table(owner)?,
            owner_pk: registry.primary_key(owner)?.to_vec(),
            target,
            target_table: registry.table(target)?,
            target_pk: registry.primary_key(target)?.to_vec(),
            target_columns: registry.load_columns(target)?,
            discriminator,
            cols,
        };
        // the join shape correlates on the owner key, whatever the FK arity
        check_key_arity(builder.key_arity(), owner, rel, dialect, config)?;
        Ok(builder)
    }

    pub fn strategy(&self) -> QueryStrategy {
        self.strategy
    }

    /// Entity type the returned rows are materialized as (before
    /// discriminator resolution).
    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn relationship(&self) -> &RelationshipInfo {
        &self.rel
    }

    pub fn join_columns(&self) -> &JoinColumns {
        &self.cols
    }

    /// Parent columns whose values form each parent's correlation key.
    pub fn parent_key_columns(&self) -> &[&'static str] {
        match self.strategy {
            QueryStrategy::Plain => &self.cols.local,
            QueryStrategy::Join => &self.owner_pk,
        }
    }

    pub fn key_arity(&self) -> usize {
        self.parent_key_columns().len()
    }

    /// Labels of the target columns in each returned row.
    pub fn target_columns(&self) -> &[&'static str] {
        &self.target_columns
    }

    pub fn target_primary_key(&self) -> &[&'static str] {
        &self.target_pk
    }

    /// Largest batch one statement can carry on this dialect, leaving room
    /// for the discriminator values bound next to the keys.
    pub fn max_batch(&self) -> usize {
        let reserved = self.discriminator.as_ref().map_or(0, |(_, ids)| ids.len());
        let available = self.dialect.max_parameters().saturating_sub(reserved);
        (available / self.key_arity().max(1)).max(1)
    }

    /// The statement loading related rows for `keys`.
    ///
    /// Keys must be non-empty, free of NULLs and of [`key_arity`](Self::key_arity).
    pub fn build(&self, keys: &[Key]) -> Result<SelectQuery> {
        let target = TableRef::new(self.target_table);
        let link = self.cols.link_table.map(TableRef::new);

        let (mut query, key_refs) = match self.strategy {
            QueryStrategy::Plain => match (&link, self.rel.kind) {
                (Some(link), RelationshipKind::ManyToMany) => {
                    let on = self.equalities(
                        link,
                        &self.cols.link_remote,
                        &target,
                        &self.cols.remote,
                    );
                    let key_refs = self.refs(link, &self.cols.link_local);
                    (
                        SelectQuery::from(target.clone()).join(Join::inner(link.clone(), on)),
                        key_refs,
                    )
                }
                _ => (
                    SelectQuery::from(target.clone()),
                    self.refs(&target, &self.cols.remote),
                ),
            },
            QueryStrategy::Join => {
                let parent = TableRef::aliased(self.owner_table, format!("{}_1", self.owner_table));
                let mut query = SelectQuery::from(parent.clone());
                match &link {
                    Some(link) => {
                        let to_link =
                            self.equalities(link, &self.cols.link_local, &parent, &self.cols.local);
                        let to_target = self.equalities(
                            &target,
                            &self.cols.remote,
                            link,
                            &self.cols.link_remote,
                        );
                        query = query
                            .join(Join::inner(link.clone(), to_link))
                            .join(Join::inner(target.clone(), to_target));
                    }
                    None => {
                        let on =
                            self.equalities(&target, &self.cols.remote, &parent, &self.cols.local);
                        query = query.join(Join::inner(target.clone(), on));
                    }
                }
                let key_refs = self.refs(&parent, &self.owner_pk);
                (query, key_refs)
            }
        };

        for (i, key_ref) in key_refs.iter().enumerate() {
            query = query.column(key_ref.clone(), key_label(i));
        }
        for col in &self.target_columns {
            query = query.column(target.column(*col), *col);
        }

        query = query.filter(self.key_filter(&key_refs, keys));
        if let Some((column, identities)) = &self.discriminator {
            query = query.filter(Expr::in_list(
                target.column(*column),
                identities.iter().map(|id| Value::Text((*id).to_string())).collect(),
            ));
        }

        let collection = self.rel.is_collection();
        let terms = self.rel.order_by_terms();
        if collection || self.strategy == QueryStrategy::Join {
            for key_ref in &key_refs {
                query = query.order_by(OrderBy::asc(key_ref.clone()));
            }
        }
        if collection || !terms.is_empty() {
            for term in terms {
                let table = match (term.table, &link) {
                    (Some(t), Some(link)) if t == link.table => link.scope_name(),
                    _ => target.scope_name(),
                };
                let column = ColumnRef::new(table, term.column);
                query = query.order_by(if term.descending {
                    OrderBy::desc(column)
                } else {
                    OrderBy::asc(column)
                });
            }
            for col in &self.target_pk {
                query = query.order_by(OrderBy::asc(target.column(*col)));
            }
        }

        tracing::trace!(
            owner = self.owner,
            relationship = self.rel.name,
            strategy = %self.strategy,
            keys = keys.len(),
            statement = %query,
            "built secondary statement"
        );
        Ok(query)
    }

    fn refs(&self, table: &TableRef, cols: &[&'static str]) -> Vec<ColumnRef> {
        cols.iter().map(|c| table.column(*c)).collect()
    }

    fn equalities(
        &self,
        left: &TableRef,
        left_cols: &[&'static str],
        right: &TableRef,
        right_cols: &[&'static str],
    ) -> Expr {
        let mut terms: Vec<Expr> = left_cols
            .iter()
            .zip(right_cols)
            .map(|(l, r)| Expr::ColumnEq(left.column(*l), right.column(*r)))
            .collect();
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        }
    }

    fn key_filter(&self, key_refs: &[ColumnRef], keys: &[Key]) -> Expr {
        if let [column] = key_refs {
            return Expr::in_list(
                column.clone(),
                keys.iter()
                    .filter_map(|k| k.values().first().cloned())
                    .collect(),
            );
        }
        if self.dialect.supports_tuple_in() || !self.tuple_in_fallback {
            return Expr::TupleIn {
                columns: key_refs.to_vec(),
                rows: keys.iter().map(|k| k.values().to_vec()).collect(),
            };
        }
        Expr::Or(
            keys.iter()
                .map(|key| {
                    Expr::And(
                        key_refs
                            .iter()
                            .zip(key.values())
                            .map(|(col, value)| Expr::Eq(col.clone(), value.clone()))
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selectin_core::{ConfigErrorKind, EntityMapping, LazyLoadStrategy, LinkTableInfo};
    use std::sync::Arc;

    fn registry() -> Arc<MappingRegistry> {
        MappingRegistry::builder()
            .entity(
                EntityMapping::new("A", "a")
                    .primary_key(&["id"])
                    .deferred_column("b_id")
                    .relationship(
                        RelationshipInfo::one_to_many("bs", "B", "a_id").order_by("position DESC"),
                    )
                    .relationship(RelationshipInfo::many_to_one("b", "B", "b_id"))
                    .relationship(
                        RelationshipInfo::one_to_many("latest_b", "B", "a_id")
                            .uselist(false)
                            .order_by("position DESC"),
                    )
                    .relationship(
                        RelationshipInfo::many_to_many(
                            "tags",
                            "Tag",
                            LinkTableInfo::new("a_tags", "a_id", "tag_id"),
                        )
                        .order_by("a_tags.position"),
                    ),
            )
            .entity(
                EntityMapping::new("B", "b")
                    .primary_key(&["id"])
                    .columns(&["a_id", "position"]),
            )
            .entity(EntityMapping::new("Tag", "tags").primary_key(&["id"]).column("label"))
            .entity(
                EntityMapping::new("P", "p")
                    .primary_key(&["id1", "id2"])
                    .column("b_id")
                    .relationship(RelationshipInfo::many_to_one("b", "B", "b_id"))
                    .relationship(
                        RelationshipInfo::one_to_many("cs", "C", "p_id1")
                            .remote_keys(&["p_id1", "p_id2"])
                            .lazy_strategy(LazyLoadStrategy::Selectin),
                    ),
            )
            .entity(
                EntityMapping::new("C", "c")
                    .primary_key(&["id"])
                    .columns(&["p_id1", "p_id2"]),
            )
            .entity(
                EntityMapping::new("Company", "companies")
                    .primary_key(&["id"])
                    .relationship(RelationshipInfo::one_to_many(
                        "managers",
                        "Manager",
                        "company_id",
                    )),
            )
            .entity(
                EntityMapping::new("Person", "people")
                    .primary_key(&["id"])
                    .column("company_id")
                    .polymorphic_on("type")
                    .polymorphic_identity("person"),
            )
            .entity(
                EntityMapping::subtype("Manager", "Person")
                    .polymorphic_identity("manager")
                    .column("status"),
            )
            .build()
            .expect("valid mapping")
    }

    fn builder(
        reg: &MappingRegistry,
        owner: &'static str,
        rel: &str,
        strategy: QueryStrategy,
        dialect: Dialect,
    ) -> Result<SecondaryQueryBuilder> {
        let info = reg.relationship(owner, rel)?;
        SecondaryQueryBuilder::new(
            reg,
            owner,
            info,
            None,
            strategy,
            dialect,
            &LoaderConfig::default(),
        )
    }

    fn keys(values: &[i64]) -> Vec<Key> {
        values.iter().map(|v| Key::single(*v)).collect()
    }

    #[test]
    fn plain_one_to_many() {
        let reg = registry();
        let b = builder(&reg, "A", "bs", QueryStrategy::Plain, Dialect::Postgres).unwrap();
        assert_eq!(b.parent_key_columns(), &["id"]);
        let query = b.build(&keys(&[1, 2, 3])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT b.a_id AS __selectin_key_0, b.id, b.a_id, b.position FROM b \
             WHERE b.a_id IN (1, 2, 3) ORDER BY b.a_id, b.position DESC, b.id"
        );
    }

    #[test]
    fn plain_many_to_one_is_unordered() {
        let reg = registry();
        let b = builder(&reg, "A", "b", QueryStrategy::Plain, Dialect::Postgres).unwrap();
        assert_eq!(b.parent_key_columns(), &["b_id"]);
        let query = b.build(&keys(&[7, 9])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT b.id AS __selectin_key_0, b.id, b.a_id, b.position FROM b WHERE b.id IN (7, 9)"
        );
    }

    #[test]
    fn scalar_relationship_keeps_its_ordering() {
        let reg = registry();
        let b = builder(&reg, "A", "latest_b", QueryStrategy::Plain, Dialect::Postgres).unwrap();
        let query = b.build(&keys(&[1, 2])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT b.a_id AS __selectin_key_0, b.id, b.a_id, b.position FROM b \
             WHERE b.a_id IN (1, 2) ORDER BY b.position DESC, b.id"
        );
    }

    #[test]
    fn joined_many_to_one_orders_by_parent() {
        let reg = registry();
        let b = builder(&reg, "A", "b", QueryStrategy::Join, Dialect::Postgres).unwrap();
        assert_eq!(b.parent_key_columns(), &["id"]);
        let query = b.build(&keys(&[1, 2])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT a_1.id AS __selectin_key_0, b.id, b.a_id, b.position FROM a AS a_1 \
             JOIN b ON b.id = a_1.b_id WHERE a_1.id IN (1, 2) ORDER BY a_1.id"
        );
    }

    #[test]
    fn many_to_many_through_link() {
        let reg = registry();
        let b = builder(&reg, "A", "tags", QueryStrategy::Plain, Dialect::Postgres).unwrap();
        let query = b.build(&keys(&[1])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT a_tags.a_id AS __selectin_key_0, tags.id, tags.label FROM tags \
             JOIN a_tags ON a_tags.tag_id = tags.id WHERE a_tags.a_id IN (1) \
             ORDER BY a_tags.a_id, a_tags.position, tags.id"
        );

        let joined = builder(&reg, "A", "tags", QueryStrategy::Join, Dialect::Postgres)
            .unwrap()
            .build(&keys(&[1]))
            .unwrap();
        assert_eq!(
            joined.to_string(),
            "SELECT a_1.id AS __selectin_key_0, tags.id, tags.label FROM a AS a_1 \
             JOIN a_tags ON a_tags.a_id = a_1.id JOIN tags ON tags.id = a_tags.tag_id \
             WHERE a_1.id IN (1) ORDER BY a_1.id, a_tags.position, tags.id"
        );
    }

    #[test]
    fn composite_keys_use_row_value_in() {
        let reg = registry();
        let b = builder(&reg, "P", "cs", QueryStrategy::Plain, Dialect::Sqlite).unwrap();
        assert_eq!(b.key_arity(), 2);
        let batch = vec![
            Key::new(vec![Value::Int(1), Value::Int(2)]),
            Key::new(vec![Value::Int(3), Value::Int(4)]),
        ];
        let query = b.build(&batch).unwrap();
        let filter = query.filter.as_ref().map(ToString::to_string);
        assert_eq!(
            filter.as_deref(),
            Some("(c.p_id1, c.p_id2) IN ((1, 2), (3, 4))")
        );
        assert_eq!(query.parameter_count(), 4);
    }

    #[test]
    fn composite_keys_fall_back_to_or_of_and() {
        let reg = registry();
        let b = builder(&reg, "P", "cs", QueryStrategy::Plain, Dialect::Mssql).unwrap();
        let batch = vec![
            Key::new(vec![Value::Int(1), Value::Int(2)]),
            Key::new(vec![Value::Int(3), Value::Int(4)]),
        ];
        let filter = b.build(&batch).unwrap().filter.map(|f| f.to_string());
        assert_eq!(
            filter.as_deref(),
            Some("(c.p_id1 = 1 AND c.p_id2 = 2) OR (c.p_id1 = 3 AND c.p_id2 = 4)")
        );

        let strict = LoaderConfig::default().tuple_in_fallback(false);
        let info = reg.relationship("P", "cs").unwrap();
        let err = SecondaryQueryBuilder::new(
            &reg,
            "P",
            info,
            None,
            QueryStrategy::Plain,
            Dialect::Mssql,
            &strict,
        )
        .unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::TupleInUnsupported));
    }

    #[test]
    fn joined_shape_checks_the_owner_key_arity() {
        let reg = registry();
        let info = reg.relationship("P", "b").unwrap();
        let strict = LoaderConfig::default().tuple_in_fallback(false);
        let build = |strategy| {
            SecondaryQueryBuilder::new(&reg, "P", info, None, strategy, Dialect::Mssql, &strict)
        };

        let plain = build(QueryStrategy::Plain).unwrap();
        assert_eq!(plain.key_arity(), 1);
        let err = build(QueryStrategy::Join).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::TupleInUnsupported));

        let lenient = builder(&reg, "P", "b", QueryStrategy::Join, Dialect::Mssql).unwrap();
        assert_eq!(lenient.parent_key_columns(), &["id1", "id2"]);
        let filter = lenient
            .build(&[Key::new(vec![Value::Int(1), Value::Int(2)])])
            .unwrap()
            .filter
            .map(|f| f.to_string());
        assert_eq!(filter.as_deref(), Some("(p_1.id1 = 1 AND p_1.id2 = 2)"));
    }

    #[test]
    fn subtype_targets_filter_on_discriminator() {
        let reg = registry();
        let b = builder(&reg, "Company", "managers", QueryStrategy::Plain, Dialect::Postgres)
            .unwrap();
        let filter = b.build(&keys(&[1])).unwrap().filter.map(|f| f.to_string());
        assert_eq!(
            filter.as_deref(),
            Some("people.company_id IN (1) AND people.type IN ('manager')")
        );
    }

    #[test]
    fn batch_bound_by_parameter_limit() {
        assert_eq!(max_keys_per_statement(Dialect::Mssql, 1), 2_100);
        assert_eq!(max_keys_per_statement(Dialect::Mssql, 3), 700);
        assert_eq!(max_keys_per_statement(Dialect::Postgres, 0), 65_535);
    }

    #[test]
    fn discriminator_values_share_the_parameter_limit() {
        let reg = registry();
        let plain = builder(&reg, "A", "bs", QueryStrategy::Plain, Dialect::Mssql).unwrap();
        assert_eq!(plain.max_batch(), 2_100);
        let narrowed = builder(&reg, "Company", "managers", QueryStrategy::Plain, Dialect::Mssql)
            .unwrap();
        assert_eq!(narrowed.max_batch(), 2_099);
        let batch: Vec<Key> = (0..2_099_i64).map(Key::single).collect();
        let query = narrowed.build(&batch).unwrap();
        assert_eq!(query.parameter_count(), Dialect::Mssql.max_parameters());
    }
}
