//! Relationship metadata.
//!
//! Relationships are static descriptors attached to an [`EntityMapping`]. The
//! join condition is always an equality between `local_key_cols()` on the
//! source entity and `remote_key_cols()` on the target entity (pairwise, in
//! order). Either side may be left unset, in which case the
//! [`MappingRegistry`] fills in the primary key of that side:
//!
//! - many-to-one: `local_key` is the foreign key, remote defaults to the
//!   target primary key
//! - one-to-many: `remote_key` is the foreign key on the target,
//!   local defaults to the source primary key
//! - many-to-many: both sides default to the primary keys and the
//!   [`LinkTableInfo`] supplies the association columns
//!
//! [`EntityMapping`]: crate::mapping::EntityMapping
//! [`MappingRegistry`]: crate::mapping::MappingRegistry

use serde::{Deserialize, Serialize};

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// Many-to-one: many `Address`es belong to one `User`.
    #[default]
    ManyToOne,
    /// One-to-many: one `User` has many `Address`es.
    OneToMany,
    /// Many-to-many: `Order`s have many `Item`s via a link table.
    ManyToMany,
}

/// Mapper-level loading strategy for a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LazyLoadStrategy {
    /// Load on first access via a separate SELECT (default).
    #[default]
    Select,
    /// Load eagerly with a batched `IN` statement whenever the owner is loaded.
    Selectin,
    /// Never load; the attribute is populated empty.
    NoLoad,
    /// Returns a query object; the attribute never holds loaded values.
    Dynamic,
    /// Append/remove only; the attribute never holds loaded values.
    WriteOnly,
}

impl LazyLoadStrategy {
    /// Can an attribute with this strategy hold loaded values at all?
    pub const fn can_populate(self) -> bool {
        !matches!(self, LazyLoadStrategy::Dynamic | LazyLoadStrategy::WriteOnly)
    }
}

/// Whether a relationship attribute holds one reference or a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Information about a link/join table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"order_items"`).
    pub table_name: &'static str,

    /// Link column pointing to the source entity (e.g., `"order_id"`).
    pub local_column: &'static str,

    /// Link column pointing to the target entity (e.g., `"item_id"`).
    pub remote_column: &'static str,

    /// Composite local columns; takes precedence over `local_column`.
    pub local_columns: Option<&'static [&'static str]>,

    /// Composite remote columns; takes precedence over `remote_column`.
    pub remote_columns: Option<&'static [&'static str]>,
}

impl LinkTableInfo {
    /// Create a new single-column link-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
            local_columns: None,
            remote_columns: None,
        }
    }

    /// Create a new composite link-table definition.
    ///
    /// Column order must match the key ordering of the side they point to.
    #[must_use]
    pub const fn composite(
        table_name: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table_name,
            local_column: "",
            remote_column: "",
            local_columns: Some(local_columns),
            remote_columns: Some(remote_columns),
        }
    }

    /// Link columns pairing with the source side's key, in order.
    #[must_use]
    pub fn local_cols(&self) -> &[&'static str] {
        match self.local_columns {
            Some(cols) => cols,
            None if self.local_column.is_empty() => &[],
            None => std::slice::from_ref(&self.local_column),
        }
    }

    /// Link columns pairing with the target side's key, in order.
    #[must_use]
    pub fn remote_cols(&self) -> &[&'static str] {
        match self.remote_columns {
            Some(cols) => cols,
            None if self.remote_column.is_empty() => &[],
            None => std::slice::from_ref(&self.remote_column),
        }
    }
}

/// One parsed `order_by` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTerm {
    /// Qualifying table, e.g. the association table for many-to-many ordering.
    pub table: Option<&'static str>,
    pub column: &'static str,
    pub descending: bool,
}

/// Metadata about a relationship between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship attribute.
    pub name: &'static str,

    /// The related entity's name (possibly a polymorphic subtype).
    pub target: &'static str,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Single column on the source entity side of the join condition.
    pub local_key: Option<&'static str>,

    /// Composite source-side columns; takes precedence over `local_key`.
    pub local_keys: Option<&'static [&'static str]>,

    /// Single column on the target entity side of the join condition.
    pub remote_key: Option<&'static str>,

    /// Composite target-side columns; takes precedence over `remote_key`.
    pub remote_keys: Option<&'static [&'static str]>,

    /// Link table for ManyToMany relationships.
    pub link_table: Option<LinkTableInfo>,

    /// Default ordering for related items, e.g. `"position"`,
    /// `"created_at DESC, id"` or `"order_items.position"`.
    pub order_by: Option<&'static str>,

    /// Mapper-level loading strategy.
    pub lazy_strategy: Option<LazyLoadStrategy>,

    /// Force list or single (override inference from `kind`).
    pub uselist: Option<bool>,

    /// How many times this relationship may recur on one loader path when
    /// its target type already appears on that path. `None` means never.
    pub join_depth: Option<usize>,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: RelationshipKind) -> Self {
        Self {
            name,
            target,
            kind,
            local_key: None,
            local_keys: None,
            remote_key: None,
            remote_keys: None,
            link_table: None,
            order_by: None,
            lazy_strategy: None,
            uselist: None,
            join_depth: None,
        }
    }

    /// Many-to-one through a single foreign key column on the source.
    #[must_use]
    pub const fn many_to_one(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self::new(name, target, RelationshipKind::ManyToOne).local_key(foreign_key)
    }

    /// One-to-many through a single foreign key column on the target.
    #[must_use]
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self::new(name, target, RelationshipKind::OneToMany).remote_key(foreign_key)
    }

    /// Many-to-many through an association table.
    #[must_use]
    pub const fn many_to_many(
        name: &'static str,
        target: &'static str,
        link: LinkTableInfo,
    ) -> Self {
        Self::new(name, target, RelationshipKind::ManyToMany).link_table(link)
    }

    /// Set a single local key column.
    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self.local_keys = None;
        self
    }

    /// Set composite local key columns. Order pairs with the remote columns.
    #[must_use]
    pub const fn local_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.local_keys = Some(keys);
        self.local_key = None;
        self
    }

    /// Set a single remote key column.
    #[must_use]
    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self.remote_keys = None;
        self
    }

    /// Set composite remote key columns. Order pairs with the local columns.
    #[must_use]
    pub const fn remote_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.remote_keys = Some(keys);
        self.remote_key = None;
        self
    }

    /// Set the link table metadata (ManyToMany).
    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    /// Set default ordering for related items.
    #[must_use]
    pub const fn order_by(mut self, ordering: &'static str) -> Self {
        self.order_by = Some(ordering);
        self
    }

    /// Set the mapper-level loading strategy.
    #[must_use]
    pub const fn lazy_strategy(mut self, strategy: LazyLoadStrategy) -> Self {
        self.lazy_strategy = Some(strategy);
        self
    }

    /// Force list or single.
    #[must_use]
    pub const fn uselist(mut self, value: bool) -> Self {
        self.uselist = Some(value);
        self
    }

    /// Bound recursion for self-referential and cyclic eager chains.
    #[must_use]
    pub const fn join_depth(mut self, depth: usize) -> Self {
        self.join_depth = Some(depth);
        self
    }

    /// Declared local key columns (empty slice if unset).
    #[must_use]
    pub fn local_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.local_keys {
            return keys;
        }
        match &self.local_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Declared remote key columns (empty slice if unset).
    #[must_use]
    pub fn remote_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.remote_keys {
            return keys;
        }
        match &self.remote_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Single reference or collection, honoring `uselist`.
    #[must_use]
    pub const fn cardinality(&self) -> Cardinality {
        match self.uselist {
            Some(true) => Cardinality::Many,
            Some(false) => Cardinality::One,
            None => match self.kind {
                RelationshipKind::ManyToOne => Cardinality::One,
                RelationshipKind::OneToMany | RelationshipKind::ManyToMany => Cardinality::Many,
            },
        }
    }

    #[must_use]
    pub const fn is_collection(&self) -> bool {
        matches!(self.cardinality(), Cardinality::Many)
    }

    /// Effective mapper-level strategy.
    #[must_use]
    pub fn strategy(&self) -> LazyLoadStrategy {
        self.lazy_strategy.unwrap_or_default()
    }

    /// Parse `order_by` into terms. Empty when unset.
    ///
    /// Terms are comma separated; each is `[table.]column [ASC|DESC]`.
    #[must_use]
    pub fn order_by_terms(&self) -> Vec<OrderTerm> {
        let Some(spec) = self.order_by else {
            return Vec::new();
        };
        spec.split(',')
            .filter_map(|raw| {
                let mut parts = raw.split_whitespace();
                let target = parts.next()?;
                let descending = parts
                    .next()
                    .is_some_and(|dir| dir.eq_ignore_ascii_case("desc"));
                let (table, column) = match target.split_once('.') {
                    Some((table, column)) => (Some(table), column),
                    None => (None, target),
                };
                Some(OrderTerm {
                    table,
                    column,
                    descending,
                })
            })
            .collect()
    }
}

impl Default for RelationshipInfo {
    fn default() -> Self {
        Self::new("", "", RelationshipKind::default())
    }
}
