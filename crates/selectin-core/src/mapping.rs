//! Entity mappings and the registry they are resolved into.
//!
//! A [`MappingRegistry`] is built once from a list of [`EntityMapping`]s,
//! validated, and then shared read-only (usually behind an `Arc`) by every
//! session that loads those entities. Single-table inheritance is expressed
//! with [`EntityMapping::subtype`]: subtypes share the base table and
//! primary key, add their own columns and relationships, and are told apart
//! by the base's `polymorphic_on` discriminator column.

use crate::Result;
use crate::error::{ConfigError, ConfigErrorKind, Error};
use crate::relationship::{RelationshipInfo, RelationshipKind};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    /// Deferred columns are left out of entity loads unless asked for.
    pub deferred: bool,
}

impl ColumnDef {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            deferred: false,
        }
    }

    #[must_use]
    pub const fn deferred(name: &'static str) -> Self {
        Self {
            name,
            deferred: true,
        }
    }
}

/// Mapping configuration for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    pub name: &'static str,
    /// Table name; `None` for single-table subtypes (inherited).
    pub table: Option<&'static str>,
    /// Primary key columns; empty for subtypes (inherited).
    pub primary_key: Vec<&'static str>,
    pub columns: Vec<ColumnDef>,
    pub relationships: Vec<RelationshipInfo>,
    /// Parent entity in a single-table inheritance hierarchy.
    pub inherits: Option<&'static str>,
    /// Discriminator column; only set on the hierarchy base.
    pub polymorphic_on: Option<&'static str>,
    /// Discriminator value identifying rows of exactly this type.
    pub polymorphic_identity: Option<&'static str>,
}

impl EntityMapping {
    /// A root entity stored in `table`.
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table: Some(table),
            primary_key: Vec::new(),
            columns: Vec::new(),
            relationships: Vec::new(),
            inherits: None,
            polymorphic_on: None,
            polymorphic_identity: None,
        }
    }

    /// A single-table subtype of `parent`.
    pub fn subtype(name: &'static str, parent: &'static str) -> Self {
        Self {
            table: None,
            inherits: Some(parent),
            ..Self::new(name, "")
        }
    }

    /// Declare primary key columns; they are added as columns if missing.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&'static str]) -> Self {
        for col in columns {
            if !self.columns.iter().any(|c| c.name == *col) {
                self.columns.push(ColumnDef::new(col));
            }
        }
        self.primary_key = columns.to_vec();
        self
    }

    #[must_use]
    pub fn column(mut self, name: &'static str) -> Self {
        self.columns.push(ColumnDef::new(name));
        self
    }

    #[must_use]
    pub fn columns(mut self, names: &[&'static str]) -> Self {
        self.columns.extend(names.iter().map(|n| ColumnDef::new(n)));
        self
    }

    #[must_use]
    pub fn deferred_column(mut self, name: &'static str) -> Self {
        self.columns.push(ColumnDef::deferred(name));
        self
    }

    #[must_use]
    pub fn relationship(mut self, rel: RelationshipInfo) -> Self {
        self.relationships.push(rel);
        self
    }

    /// Set the discriminator column (hierarchy base only).
    #[must_use]
    pub fn polymorphic_on(mut self, column: &'static str) -> Self {
        if !self.columns.iter().any(|c| c.name == column) {
            self.columns.push(ColumnDef::new(column));
        }
        self.polymorphic_on = Some(column);
        self
    }

    #[must_use]
    pub fn polymorphic_identity(mut self, identity: &'static str) -> Self {
        self.polymorphic_identity = Some(identity);
        self
    }
}

/// Resolved join columns for one relationship.
///
/// `local[i]` on the source entity equals `remote[i]` on the target entity.
/// For many-to-many, `link_local[i]` on the association table equals
/// `local[i]` and `link_remote[i]` equals `remote[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumns {
    pub local: Vec<&'static str>,
    pub remote: Vec<&'static str>,
    pub link_table: Option<&'static str>,
    pub link_local: Vec<&'static str>,
    pub link_remote: Vec<&'static str>,
}

impl JoinColumns {
    pub fn arity(&self) -> usize {
        self.local.len()
    }
}

#[derive(Debug)]
struct ResolvedEntity {
    mapping: EntityMapping,
    table: &'static str,
    primary_key: Vec<&'static str>,
    base: &'static str,
    /// Self first, then parent, up to the base.
    lineage: Vec<&'static str>,
    /// Self plus every transitive subtype.
    family: Vec<&'static str>,
}

/// Validated mapping configuration for a set of entities.
#[derive(Debug)]
pub struct MappingRegistry {
    entities: HashMap<&'static str, ResolvedEntity>,
    /// base entity -> discriminator value -> concrete entity
    identities: HashMap<&'static str, HashMap<String, &'static str>>,
}

/// Collects entity mappings before validation.
#[derive(Debug, Default)]
pub struct MappingRegistryBuilder {
    entities: Vec<EntityMapping>,
}

impl MappingRegistryBuilder {
    #[must_use]
    pub fn entity(mut self, mapping: EntityMapping) -> Self {
        self.entities.push(mapping);
        self
    }

    /// Resolve inheritance, fill key defaults and validate every relationship.
    pub fn build(self) -> Result<Arc<MappingRegistry>> {
        let mut by_name: HashMap<&'static str, EntityMapping> = HashMap::new();
        for mapping in self.entities {
            let name = mapping.name;
            if by_name.insert(name, mapping).is_some() {
                return Err(invalid(format!("entity '{}' is mapped twice", name)));
            }
        }

        let mut lineages: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
        for name in by_name.keys() {
            let mut lineage = vec![*name];
            let mut current = *name;
            while let Some(parent) = by_name.get(current).and_then(|m| m.inherits) {
                if !by_name.contains_key(parent) {
                    return Err(invalid(format!(
                        "entity '{}' inherits unknown entity '{}'",
                        current, parent
                    )));
                }
                if lineage.contains(&parent) {
                    return Err(invalid(format!("inheritance cycle through '{}'", parent)));
                }
                lineage.push(parent);
                current = parent;
            }
            lineages.insert(*name, lineage);
        }

        let mut entities = HashMap::new();
        let mut identities: HashMap<&'static str, HashMap<String, &'static str>> = HashMap::new();
        for (name, lineage) in &lineages {
            let base_name = *lineage.last().unwrap_or(name);
            let Some(base) = by_name.get(base_name) else {
                return Err(invalid(format!("entity '{}' has no base", name)));
            };
            let Some(table) = base.table.filter(|t| !t.is_empty()) else {
                return Err(invalid(format!("entity '{}' has no table", base_name)));
            };
            if base.primary_key.is_empty() {
                return Err(invalid(format!("entity '{}' has no primary key", base_name)));
            }
            let Some(mapping) = by_name.get(name).cloned() else {
                continue;
            };
            if mapping.inherits.is_some() && mapping.polymorphic_on.is_some() {
                return Err(invalid(format!(
                    "subtype '{}' cannot declare its own discriminator",
                    name
                )));
            }
            if let Some(identity) = mapping.polymorphic_identity {
                if base.polymorphic_on.is_none() {
                    return Err(invalid(format!(
                        "'{}' has a polymorphic identity but '{}' has no discriminator",
                        name, base_name
                    )));
                }
                let table_ids = identities.entry(base_name).or_default();
                if let Some(other) = table_ids.insert(identity.to_string(), name) {
                    return Err(invalid(format!(
                        "polymorphic identity '{}' is shared by '{}' and '{}'",
                        identity, other, name
                    )));
                }
            }
            let family = lineages
                .iter()
                .filter(|(_, l)| l.contains(name))
                .map(|(n, _)| *n)
                .collect::<Vec<_>>();
            entities.insert(
                *name,
                ResolvedEntity {
                    mapping,
                    table,
                    primary_key: base.primary_key.clone(),
                    base: base_name,
                    lineage: lineage.clone(),
                    family,
                },
            );
        }

        let registry = MappingRegistry {
            entities,
            identities,
        };
        registry.validate_relationships()?;
        tracing::debug!(entities = registry.entities.len(), "mapping registry built");
        Ok(Arc::new(registry))
    }
}

fn invalid(message: String) -> Error {
    Error::config(ConfigErrorKind::InvalidMapping, message)
}

impl MappingRegistry {
    pub fn builder() -> MappingRegistryBuilder {
        MappingRegistryBuilder::default()
    }

    fn resolved(&self, name: &str) -> Result<&ResolvedEntity> {
        self.entities.get(name).ok_or_else(|| {
            Error::Config(
                ConfigError::new(ConfigErrorKind::UnknownEntity, "entity is not mapped")
                    .on_entity(name),
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entity(&self, name: &str) -> Result<&EntityMapping> {
        self.resolved(name).map(|e| &e.mapping)
    }

    /// Table the entity's rows live in (the hierarchy base's table).
    pub fn table(&self, name: &str) -> Result<&'static str> {
        self.resolved(name).map(|e| e.table)
    }

    pub fn primary_key(&self, name: &str) -> Result<&[&'static str]> {
        self.resolved(name).map(|e| e.primary_key.as_slice())
    }

    /// The hierarchy base; identities are namespaced by it.
    pub fn base_of(&self, name: &str) -> Result<&'static str> {
        self.resolved(name).map(|e| e.base)
    }

    /// Is `sub` the same type as, or a subtype of, `sup`?
    pub fn isa(&self, sub: &str, sup: &str) -> bool {
        self.entities
            .get(sub)
            .is_some_and(|e| e.lineage.iter().any(|n| *n == sup))
    }

    /// The entity and every transitive subtype, sorted by name.
    pub fn family(&self, name: &str) -> Result<Vec<&'static str>> {
        let mut family = self.resolved(name)?.family.clone();
        family.sort_unstable();
        Ok(family)
    }

    /// Find a relationship on the entity or any of its ancestors.
    pub fn relationship(&self, entity: &str, name: &str) -> Result<&RelationshipInfo> {
        let resolved = self.resolved(entity)?;
        for ancestor in &resolved.lineage {
            let mapping = &self.resolved(ancestor)?.mapping;
            if let Some(rel) = mapping.relationships.iter().find(|r| r.name == name) {
                return Ok(rel);
            }
        }
        Err(Error::Config(
            ConfigError::new(
                ConfigErrorKind::UnknownRelationship,
                "relationship is not mapped",
            )
            .on_entity(entity)
            .on_relationship(name),
        ))
    }

    /// All relationships available on the entity, base-declared first.
    pub fn relationships(&self, entity: &str) -> Result<Vec<&RelationshipInfo>> {
        let resolved = self.resolved(entity)?;
        let mut out = Vec::new();
        for ancestor in resolved.lineage.iter().rev() {
            out.extend(self.resolved(ancestor)?.mapping.relationships.iter());
        }
        Ok(out)
    }

    /// Columns of the entity and its ancestors, base-declared first.
    pub fn columns(&self, entity: &str) -> Result<Vec<ColumnDef>> {
        let resolved = self.resolved(entity)?;
        let mut out: Vec<ColumnDef> = Vec::new();
        for ancestor in resolved.lineage.iter().rev() {
            for col in &self.resolved(ancestor)?.mapping.columns {
                if !out.iter().any(|c| c.name == col.name) {
                    out.push(*col);
                }
            }
        }
        Ok(out)
    }

    /// Non-deferred columns to select when loading `entity`, covering every
    /// subtype that may come back in the same rows.
    pub fn load_columns(&self, entity: &str) -> Result<Vec<&'static str>> {
        let mut out = Vec::new();
        for col in self.columns(entity)? {
            if !col.deferred {
                out.push(col.name);
            }
        }
        for member in self.family(entity)? {
            for col in &self.resolved(member)?.mapping.columns {
                if !col.deferred && !out.contains(&col.name) {
                    out.push(col.name);
                }
            }
        }
        Ok(out)
    }

    pub fn polymorphic_on(&self, entity: &str) -> Result<Option<&'static str>> {
        let base = self.base_of(entity)?;
        Ok(self.resolved(base)?.mapping.polymorphic_on)
    }

    /// Discriminator values for the entity and all of its subtypes, sorted.
    pub fn identities_for(&self, entity: &str) -> Result<Vec<&'static str>> {
        let resolved = self.resolved(entity)?;
        let mut out = Vec::new();
        for member in &resolved.family {
            if let Some(identity) = self.resolved(member)?.mapping.polymorphic_identity {
                out.push(identity);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Loads of `entity` need a discriminator filter when it is a subtype in
    /// a discriminated hierarchy.
    pub fn needs_discriminator_filter(&self, entity: &str) -> Result<bool> {
        let resolved = self.resolved(entity)?;
        Ok(resolved.lineage.len() > 1 && self.polymorphic_on(entity)?.is_some())
    }

    /// The concrete type for a row of `entity`, given its discriminator.
    ///
    /// Unknown or missing discriminators resolve to `entity` itself.
    pub fn concrete_type(&self, entity: &'static str, discriminator: Option<&Value>) -> &'static str {
        let Some(resolved) = self.entities.get(entity) else {
            return entity;
        };
        let Some(value) = discriminator else {
            return entity;
        };
        let text = match value {
            Value::Text(s) => s.clone(),
            other => match other.as_i64() {
                Some(i) => i.to_string(),
                None => return entity,
            },
        };
        self.identities
            .get(resolved.base)
            .and_then(|ids| ids.get(&text))
            .copied()
            .unwrap_or(entity)
    }

    /// Resolve the join columns of `rel` declared on `source`.
    pub fn join_columns(&self, source: &str, rel: &RelationshipInfo) -> Result<JoinColumns> {
        let source_pk = self.primary_key(source)?;
        let target_pk = self.primary_key(rel.target)?;
        let pick = |declared: &[&'static str], fallback: &[&'static str]| {
            if declared.is_empty() {
                fallback.to_vec()
            } else {
                declared.to_vec()
            }
        };
        let (local, remote) = match rel.kind {
            RelationshipKind::ManyToOne => (
                pick(rel.local_key_cols(), &[]),
                pick(rel.remote_key_cols(), target_pk),
            ),
            RelationshipKind::OneToMany => (
                pick(rel.local_key_cols(), source_pk),
                pick(rel.remote_key_cols(), &[]),
            ),
            RelationshipKind::ManyToMany => (
                pick(rel.local_key_cols(), source_pk),
                pick(rel.remote_key_cols(), target_pk),
            ),
        };
        let (link_table, link_local, link_remote) = match rel.link_table {
            Some(link) => (
                Some(link.table_name),
                link.local_cols().to_vec(),
                link.remote_cols().to_vec(),
            ),
            None => (None, Vec::new(), Vec::new()),
        };
        Ok(JoinColumns {
            local,
            remote,
            link_table,
            link_local,
            link_remote,
        })
    }

    fn validate_relationships(&self) -> Result<()> {
        for (name, resolved) in &self.entities {
            for rel in &resolved.mapping.relationships {
                let fail = |message: String| {
                    Error::Config(
                        ConfigError::new(ConfigErrorKind::InvalidMapping, message)
                            .on_entity(*name)
                            .on_relationship(rel.name),
                    )
                };
                if !self.contains(rel.target) {
                    return Err(fail(format!("targets unknown entity '{}'", rel.target)));
                }
                let cols = self.join_columns(name, rel)?;
                if cols.local.is_empty() || cols.local.len() != cols.remote.len() {
                    return Err(fail(
                        "join condition needs the same non-zero number of local and remote columns"
                            .to_string(),
                    ));
                }
                let source_cols = self.columns(name)?;
                let target_cols = self.load_columns(rel.target)?;
                let all_target = self.columns(rel.target)?;
                for col in &cols.local {
                    if !source_cols.iter().any(|c| c.name == *col) {
                        return Err(fail(format!("local column '{}' is not mapped", col)));
                    }
                }
                for col in &cols.remote {
                    if !target_cols.contains(col) && !all_target.iter().any(|c| c.name == *col) {
                        return Err(fail(format!("remote column '{}' is not mapped", col)));
                    }
                }
                match (rel.kind, cols.link_table) {
                    (RelationshipKind::ManyToMany, None) => {
                        return Err(fail("many-to-many needs a link table".to_string()));
                    }
                    (RelationshipKind::ManyToMany, Some(_))
                        if cols.link_local.len() != cols.arity()
                            || cols.link_remote.len() != cols.remote.len() =>
                    {
                        return Err(fail(
                            "link table columns do not match the key arity".to_string(),
                        ));
                    }
                    (kind, Some(_)) if kind != RelationshipKind::ManyToMany => {
                        return Err(fail("only many-to-many may use a link table".to_string()));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
