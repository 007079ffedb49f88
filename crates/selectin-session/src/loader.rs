//! The selectin loading engine.
//!
//! Given a set of already-loaded parents at some [`LoaderPath`], the loader
//! resolves the strategy of every relationship on the parents' concrete
//! types, issues the batched secondary statements for the eager ones, and
//! then descends into the newly loaded entities. Levels are processed depth
//! first from an explicit work stack; every batch of a level completes
//! before any of its children start, and statements run strictly one after
//! another on the row source.

use crate::batch::KeySet;
use crate::correlate::RowCorrelator;
use crate::identity_map::{EntityId, IdentityMap, RelatedValue};
use crate::report::{Diagnostic, InvocationSummary, LoadReport};
use asupersync::{Cx, Outcome};
use selectin_core::{Error, MappingRegistry, RelationshipInfo, RelationshipKind, Result};
use selectin_query::{
    LoadOptions, LoadStrategy, LoaderConfig, LoaderPath, QueryStrategy, Resolution, RowSource,
    SecondaryQueryBuilder, StrategyInput,
};
use std::collections::HashSet;

/// Parents at one path that share a relationship and its resolution.
#[derive(Debug)]
struct Bucket {
    owner: &'static str,
    rel: RelationshipInfo,
    resolution: Resolution,
    members: Vec<EntityId>,
}

/// One relationship invocation, prepared and ready to run.
struct Invocation {
    builder: SecondaryQueryBuilder,
    keys: KeySet,
    chunk_size: usize,
    /// Keys answered from the identity map.
    elided: usize,
    populated: usize,
}

/// Runs selectin loads against one row source.
pub struct SelectinLoader<'a, S: RowSource> {
    registry: &'a MappingRegistry,
    source: &'a S,
    config: &'a LoaderConfig,
    options: &'a LoadOptions,
}

impl<'a, S: RowSource> SelectinLoader<'a, S> {
    /// Borrow everything one load needs. Nothing is checked until
    /// [`validate`](Self::validate) or [`load`](Self::load).
    pub fn new(
        registry: &'a MappingRegistry,
        source: &'a S,
        config: &'a LoaderConfig,
        options: &'a LoadOptions,
    ) -> Self {
        Self {
            registry,
            source,
            config,
            options,
        }
    }

    /// Check the loader configuration and every load directive for `root`.
    ///
    /// Called by [`load`](Self::load) before any statement is issued.
    pub fn validate(&self, root: &'static str) -> Result<()> {
        self.config.validate()?;
        self.options
            .validate(self.registry, root, self.source.dialect(), self.config)
    }

    /// Eagerly load relationships of `parents`, which were loaded as `root`
    /// entities, and recursively of everything loaded below them.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, map, parents),
        fields(parents = parents.len())
    )]
    pub async fn load(
        &self,
        cx: &Cx,
        map: &mut IdentityMap,
        root: &'static str,
        parents: &[EntityId],
    ) -> Outcome<LoadReport, Error> {
        if let Err(e) = self.validate(root) {
            return Outcome::Err(e);
        }

        let mut report = LoadReport::default();
        let mut satisfied: HashSet<(EntityId, &'static str)> = HashSet::new();
        let mut stack: Vec<(LoaderPath, Vec<EntityId>)> =
            vec![(LoaderPath::root(root), parents.to_vec())];

        while let Some((path, parents)) = stack.pop() {
            let buckets = match self.buckets(map, &path, &parents) {
                Ok(buckets) => buckets,
                Err(e) => return Outcome::Err(e),
            };
            let mut children: Vec<(LoaderPath, Vec<EntityId>)> = Vec::new();

            for bucket in buckets {
                match bucket.resolution.strategy {
                    LoadStrategy::Lazy => continue,
                    LoadStrategy::NoLoad => {
                        report.populated += self.populate_empty(map, &bucket, &mut satisfied);
                        continue;
                    }
                    LoadStrategy::Selectin => {}
                }

                let level = match self
                    .load_relationship(cx, map, &path, &bucket, &mut satisfied)
                    .await
                {
                    Outcome::Ok(level) => level,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                report.merge(level);

                let child_path = path.child(&bucket.rel, bucket.resolution.of_type);
                let next = related_members(map, &bucket);
                if next.is_empty() {
                    continue;
                }
                if child_path.len() >= self.config.max_path_length {
                    tracing::warn!(
                        path = %child_path,
                        limit = self.config.max_path_length,
                        "Loader path too long; not descending further"
                    );
                    report.diagnostics.push(Diagnostic::PathLengthExceeded {
                        path: child_path.to_string(),
                        limit: self.config.max_path_length,
                    });
                    continue;
                }
                children.push((child_path, next));
            }

            // first child on top of the stack
            stack.extend(children.into_iter().rev());
        }

        tracing::debug!(
            statements = report.statements,
            populated = report.populated,
            invocations = report.invocations.len(),
            "Selectin load complete"
        );
        Outcome::Ok(report)
    }

    /// Group the live parents at `path` by relationship and resolution.
    fn buckets(
        &self,
        map: &IdentityMap,
        path: &LoaderPath,
        parents: &[EntityId],
    ) -> Result<Vec<Bucket>> {
        let mut buckets: Vec<Bucket> = Vec::new();
        let mut seen: HashSet<EntityId> = HashSet::new();
        for &parent in parents {
            if !seen.insert(parent) {
                continue;
            }
            let Some(state) = map.get(parent) else {
                continue;
            };
            if state.is_pending() {
                tracing::trace!(parent = %parent, "Skipping pending parent");
                continue;
            }
            let entity = state.entity;
            for rel in self.registry.relationships(entity)? {
                let resolution = self.options.paths.resolve(self.registry, path, entity, rel)?;
                let Some(resolution) = resolution else {
                    continue;
                };
                match buckets
                    .iter_mut()
                    .find(|b| b.rel == *rel && b.resolution == resolution)
                {
                    Some(bucket) => bucket.members.push(parent),
                    None => buckets.push(Bucket {
                        owner: entity,
                        rel: *rel,
                        resolution,
                        members: vec![parent],
                    }),
                }
            }
        }
        Ok(buckets)
    }

    fn needs_load(
        &self,
        map: &IdentityMap,
        satisfied: &HashSet<(EntityId, &'static str)>,
        parent: EntityId,
        rel: &RelationshipInfo,
    ) -> bool {
        if satisfied.contains(&(parent, rel.name)) {
            return false;
        }
        self.options.populate_existing || !map.is_loaded(parent, rel.name)
    }

    fn populate_empty(
        &self,
        map: &mut IdentityMap,
        bucket: &Bucket,
        satisfied: &mut HashSet<(EntityId, &'static str)>,
    ) -> usize {
        let mut populated = 0;
        for &parent in &bucket.members {
            if !self.needs_load(map, satisfied, parent, &bucket.rel) {
                continue;
            }
            map.set_attribute(
                parent,
                bucket.rel.name,
                RelatedValue::empty(bucket.rel.is_collection()),
            );
            satisfied.insert((parent, bucket.rel.name));
            populated += 1;
        }
        populated
    }

    /// Choose the statement shape, extract keys and settle what can be
    /// settled without a statement.
    fn prepare(
        &self,
        map: &mut IdentityMap,
        bucket: &Bucket,
        pending: &[EntityId],
    ) -> Result<Invocation> {
        let cols = self.registry.join_columns(bucket.owner, &bucket.rel)?;
        let owner_pk = self.registry.primary_key(bucket.owner)?;
        let input = StrategyInput {
            local_loaded_on_all: pending.iter().all(|p| {
                map.get(*p)
                    .is_some_and(|s| cols.local.iter().all(|c| s.has_column(c)))
            }),
            derived_source: pending
                .iter()
                .any(|p| map.get(*p).is_some_and(|s| s.from_derived)),
            local_is_pk: same_columns(&cols.local, owner_pk),
        };
        let strategy = input.choose();
        let builder = SecondaryQueryBuilder::new(
            self.registry,
            bucket.owner,
            &bucket.rel,
            bucket.resolution.of_type,
            strategy,
            self.source.dialect(),
            self.config,
        )?;

        let mut keys = KeySet::extract(map, pending, builder.parent_key_columns());
        let mut populated = 0;
        let empty = RelatedValue::empty(bucket.rel.is_collection());
        for &parent in keys.keyless() {
            if map.set_attribute(parent, bucket.rel.name, empty.clone()) {
                populated += 1;
            }
        }

        let mut elided = 0;
        if self.can_elide(&builder) {
            let base = self.registry.base_of(builder.target())?;
            let mut found = Vec::new();
            for key in keys.keys() {
                let Some(target) = map.lookup(base, key) else {
                    continue;
                };
                let matches = map
                    .get(target)
                    .is_some_and(|s| self.registry.isa(s.entity, builder.target()));
                if matches {
                    found.push((key.clone(), target));
                }
            }
            for (key, target) in &found {
                for &parent in keys.members(key) {
                    let value = RelatedValue::One(Some(*target));
                    if map.set_attribute(parent, bucket.rel.name, value) {
                        populated += 1;
                    }
                }
            }
            elided = found.len();
            let found_keys: HashSet<_> = found.into_iter().map(|(k, _)| k).collect();
            keys.retain_keys(|k| !found_keys.contains(k));
        }

        let chunk_size = self
            .options
            .effective_chunk_size(self.config)
            .min(builder.max_batch());
        Ok(Invocation {
            builder,
            keys,
            chunk_size,
            elided,
            populated,
        })
    }

    /// A plain many-to-one onto the target's primary key can be answered
    /// from the identity map.
    fn can_elide(&self, builder: &SecondaryQueryBuilder) -> bool {
        let rel = builder.relationship();
        if self.options.populate_existing
            || builder.strategy() != QueryStrategy::Plain
            || rel.kind != RelationshipKind::ManyToOne
            || rel.is_collection()
        {
            return false;
        }
        builder.join_columns().remote.as_slice() == builder.target_primary_key()
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, map, path, bucket, satisfied),
        fields(path = %path, relationship = bucket.rel.name)
    )]
    async fn load_relationship(
        &self,
        cx: &Cx,
        map: &mut IdentityMap,
        path: &LoaderPath,
        bucket: &Bucket,
        satisfied: &mut HashSet<(EntityId, &'static str)>,
    ) -> Outcome<LoadReport, Error> {
        let pending: Vec<EntityId> = bucket
            .members
            .iter()
            .copied()
            .filter(|p| self.needs_load(map, satisfied, *p, &bucket.rel))
            .collect();
        let mut report = LoadReport::default();
        if pending.is_empty() {
            tracing::trace!("Every parent already loaded");
            return Outcome::Ok(report);
        }

        let invocation = match self.prepare(map, bucket, &pending) {
            Ok(invocation) => invocation,
            Err(e) => return Outcome::Err(e),
        };
        let builder = &invocation.builder;
        let batches = invocation.keys.chunks(invocation.chunk_size);
        tracing::info!(
            owner = bucket.owner,
            target = builder.target(),
            strategy = %builder.strategy(),
            parent_count = pending.len(),
            key_count = invocation.keys.len(),
            chunk_count = batches.len(),
            elided = invocation.elided,
            "Selectin loading relationship"
        );

        let correlator = match RowCorrelator::new(
            self.registry,
            builder,
            path.to_string(),
            self.options.populate_existing,
        ) {
            Ok(correlator) => correlator,
            Err(e) => return Outcome::Err(e),
        };
        let mut populated = invocation.populated;
        let mut statements = 0;
        for batch in batches {
            let query = match builder.build(batch) {
                Ok(query) => query,
                Err(e) => return Outcome::Err(e),
            };
            tracing::debug!(keys = batch.len(), "Selectin batch");
            tracing::trace!(statement = %query, "Selectin batch statement");

            let rows = match self.source.fetch(cx, &query).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            statements += 1;

            let outcome = match correlator.correlate(map, &invocation.keys, batch, &rows) {
                Ok(outcome) => outcome,
                Err(e) => return Outcome::Err(e),
            };
            populated += outcome.populated;
            report.diagnostics.extend(outcome.diagnostics);
        }

        for parent in pending {
            satisfied.insert((parent, bucket.rel.name));
        }
        report.statements = statements;
        report.populated = populated;
        report.invocations.push(InvocationSummary {
            path: path.to_string(),
            relationship: bucket.rel.name,
            strategy: builder.strategy(),
            parents: populated,
            keys: invocation.keys.len(),
            elided: invocation.elided,
            statements,
        });
        Outcome::Ok(report)
    }
}

/// Entities the bucket's attribute currently points at, distinct, in order.
fn related_members(map: &IdentityMap, bucket: &Bucket) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for &parent in &bucket.members {
        if let Some(value) = map.attribute(parent, bucket.rel.name) {
            for &id in value.ids() {
                if map.get(id).is_some() && seen.insert(id) {
                    out.push(id);
                }
            }
        }
    }
    out
}

fn same_columns(a: &[&str], b: &[&str]) -> bool {
    a.len() == b.len() && a.iter().all(|c| b.contains(c))
}
