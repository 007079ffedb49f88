//! Identity map, row correlation and the selectin loading engine.
//!
//! `selectin-session` is the **execution layer**. It holds loaded entities in
//! an identity map, turns parent sets into batched secondary statements and
//! attaches the returned rows to their parents.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one [`EntityState`] per identity, relationship
//!   attributes as handles.
//! - **Key extraction and chunking**: distinct parent keys, split into
//!   `IN`-list batches.
//! - **Row correlation**: two-phase, per-batch attachment of rows.
//! - **Loading engine**: strategy resolution, statement shape selection and
//!   depth-first recursion into nested paths.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(source, registry);
//! let options = LoadOptions::new().selectin("User", "orders.items");
//! let result = session.query(&cx, &PrimaryQuery::new("User"), &options).await?;
//! for user in &result.entities {
//!     for order in session.related(*user, "orders").unwrap_or_default() {
//!         // ...
//!     }
//! }
//! ```

pub mod batch;
pub mod correlate;
pub mod identity_map;
pub mod loader;
pub mod report;

pub use batch::{KeySet, chunk};
pub use correlate::{BatchOutcome, RowCorrelator};
pub use identity_map::{EntityId, EntityState, EntityStatus, IdentityMap, RelatedValue};
pub use loader::SelectinLoader;
pub use report::{Diagnostic, InvocationSummary, LoadReport};

use asupersync::{Cx, Outcome};
use selectin_core::{Error, Key, MappingRegistry, Result, Row, Value};
use selectin_query::{LoadOptions, LoaderConfig, PrimaryQuery, RowSource};
use std::collections::HashMap;
use std::sync::Arc;

/// Root entities of a session query plus what loading them took.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Distinct root entities, in row order.
    pub entities: Vec<EntityId>,
    pub report: LoadReport,
}

/// Ties a row source and a mapping registry to one identity map.
pub struct Session<S: RowSource> {
    source: S,
    registry: Arc<MappingRegistry>,
    config: LoaderConfig,
    identity_map: IdentityMap,
}

impl<S: RowSource> Session<S> {
    /// Create a session with the default [`LoaderConfig`].
    pub fn new(source: S, registry: Arc<MappingRegistry>) -> Self {
        Self::with_config(source, registry, LoaderConfig::default())
    }

    /// Create a session with an explicit loader configuration.
    pub fn with_config(source: S, registry: Arc<MappingRegistry>, config: LoaderConfig) -> Self {
        Self {
            source,
            registry,
            config,
            identity_map: IdentityMap::new(),
        }
    }

    /// The row source statements run against.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The mapping registry.
    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    /// Loader configuration shared by every query of this session.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Every entity this session tracks.
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Mutable access to tracked entities.
    pub fn identity_map_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity_map
    }

    /// Run `query`, then eagerly load per `options`.
    ///
    /// Load options are validated before the primary statement runs. On an
    /// I/O failure the entities loaded so far stay in the identity map but
    /// must not be relied on: some relationships may be unpopulated.
    #[tracing::instrument(level = "debug", skip(self, cx, query, options), fields(entity = query.entity))]
    pub async fn query(
        &mut self,
        cx: &Cx,
        query: &PrimaryQuery,
        options: &LoadOptions,
    ) -> Outcome<QueryResult, Error> {
        let loader = SelectinLoader::new(&self.registry, &self.source, &self.config, options);
        if let Err(e) = loader.validate(query.entity) {
            return Outcome::Err(e);
        }
        let statement = match query.build(&self.registry) {
            Ok(statement) => statement,
            Err(e) => return Outcome::Err(e),
        };
        tracing::trace!(statement = %statement, "Primary statement");

        let rows = match self.source.fetch(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let entities = match materialize(
            &self.registry,
            &mut self.identity_map,
            query,
            &rows,
            options.populate_existing,
        ) {
            Ok(entities) => entities,
            Err(e) => return Outcome::Err(e),
        };
        tracing::info!(
            entity = query.entity,
            rows = rows.len(),
            entities = entities.len(),
            "Primary query loaded"
        );

        let mut report = match loader
            .load(cx, &mut self.identity_map, query.entity, &entities)
            .await
        {
            Outcome::Ok(report) => report,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        report.statements += 1;
        Outcome::Ok(QueryResult { entities, report })
    }

    /// Eagerly load relationships of entities already in the identity map,
    /// treating them as `root` entities.
    pub async fn load(
        &mut self,
        cx: &Cx,
        root: &'static str,
        parents: &[EntityId],
        options: &LoadOptions,
    ) -> Outcome<LoadReport, Error> {
        SelectinLoader::new(&self.registry, &self.source, &self.config, options)
            .load(cx, &mut self.identity_map, root, parents)
            .await
    }

    /// Tracked state of `id`, if it is still in the identity map.
    pub fn get(&self, id: EntityId) -> Option<&EntityState> {
        self.identity_map.get(id)
    }

    /// Find a tracked entity of `entity`'s hierarchy by primary key.
    pub fn lookup(&self, entity: &str, key: &Key) -> Option<EntityId> {
        let base = self.registry.base_of(entity).ok()?;
        self.identity_map.lookup(base, key)
    }

    /// Loaded value of a relationship attribute.
    pub fn attribute(&self, id: EntityId, relationship: &str) -> Option<&RelatedValue> {
        self.identity_map.attribute(id, relationship)
    }

    /// Entities a loaded attribute points at; `None` if it is not loaded.
    pub fn related(&self, id: EntityId, relationship: &str) -> Option<Vec<EntityId>> {
        self.attribute(id, relationship).map(|v| v.ids().to_vec())
    }

    /// Whether `relationship` has a value on `id`, empty or not.
    pub fn is_loaded(&self, id: EntityId, relationship: &str) -> bool {
        self.identity_map.is_loaded(id, relationship)
    }

    /// Mark attributes of `id` unloaded so the next eager load refills them.
    /// `None` expires every relationship attribute.
    pub fn expire(&mut self, id: EntityId, relationships: Option<&[&str]>) {
        self.identity_map.expire(id, relationships);
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn expunge(&mut self, id: EntityId) -> bool {
        self.identity_map.expunge(id)
    }

    /// Track a new entity that has not been persisted.
    pub fn add_pending(
        &mut self,
        entity: &'static str,
        columns: HashMap<&'static str, Value>,
    ) -> EntityId {
        self.identity_map.add_pending(entity, columns)
    }
}

/// Merge primary rows into the identity map.
fn materialize(
    registry: &MappingRegistry,
    map: &mut IdentityMap,
    query: &PrimaryQuery,
    rows: &[Row],
    overwrite: bool,
) -> Result<Vec<EntityId>> {
    let base = registry.base_of(query.entity)?;
    let pk = registry.primary_key(query.entity)?;
    let discriminator = registry.polymorphic_on(query.entity)?;
    let columns = query.loaded_columns(registry)?;

    let mut parsed = Vec::with_capacity(rows.len());
    for row in rows {
        let mut key = Vec::with_capacity(pk.len());
        for col in pk {
            key.push(row.require(col)?.clone());
        }
        let key = Key::new(key);
        if key.has_null() {
            continue;
        }
        let mut values = HashMap::with_capacity(columns.len());
        for col in &columns {
            values.insert(*col, row.require(col)?.clone());
        }
        let entity =
            registry.concrete_type(query.entity, discriminator.and_then(|d| values.get(d)));
        parsed.push((entity, key, values));
    }

    let mut entities = Vec::with_capacity(parsed.len());
    for (entity, key, values) in parsed {
        let (id, _) = if query.is_from_derived() {
            map.upsert_derived(base, entity, key, values, overwrite)
        } else {
            map.upsert(base, entity, key, values, overwrite)
        };
        if !entities.contains(&id) {
            entities.push(id);
        }
    }
    Ok(entities)
}
