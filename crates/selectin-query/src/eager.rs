//! Loader paths and the path registry.
//!
//! A [`LoaderPath`] addresses a position in the object graph: the query's
//! root entity followed by the relationships traversed to get there. The
//! [`PathRegistry`] holds the load directives of one query and answers, for
//! a relationship about to be traversed from some path, which strategy
//! applies:
//!
//! 1. the last explicit directive whose chain matches the path and names the
//!    relationship,
//! 2. otherwise the last wildcard (`*`) directive at that depth,
//! 3. otherwise the relationship's own mapper-level strategy, where eager
//!    defaults stop recursing once the target type is already on the path
//!    more often than `join_depth` allows.
//!
//! ```ignore
//! let paths = PathRegistry::new()
//!     .selectin("User", "orders.items")
//!     .selectin("Company", "employees[Engineer].machines");
//! ```

use crate::config::LoaderConfig;
use crate::expr::Dialect;
use selectin_core::{
    ConfigError, ConfigErrorKind, Error, LazyLoadStrategy, MappingRegistry, RelationshipInfo,
    Result,
};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Wildcard relationship name matching any relationship at one depth.
pub const WILDCARD: &str = "*";

/// Per-query loading strategy for one relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Batched secondary `IN` statement.
    Selectin,
    /// Leave the attribute unloaded.
    Lazy,
    /// Populate an empty value without a statement.
    NoLoad,
}

/// One traversal on a [`LoaderPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathStep {
    pub relationship: &'static str,
    /// Entity type loaded by this step: the narrowed type or the target.
    pub entity: &'static str,
    /// Subtype the step was narrowed to, if any.
    pub narrowed: Option<&'static str>,
}

/// Where in the object graph a set of entities was loaded.
///
/// Compared by value: two paths built independently with the same root and
/// steps are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoaderPath {
    root: &'static str,
    steps: Vec<PathStep>,
}

impl LoaderPath {
    pub fn root(entity: &'static str) -> Self {
        Self {
            root: entity,
            steps: Vec::new(),
        }
    }

    /// The path one relationship deeper.
    #[must_use]
    pub fn child(&self, rel: &RelationshipInfo, narrowed: Option<&'static str>) -> Self {
        let mut steps = self.steps.clone();
        steps.push(PathStep {
            relationship: rel.name,
            entity: narrowed.unwrap_or(rel.target),
            narrowed,
        });
        Self {
            root: self.root,
            steps,
        }
    }

    pub fn root_entity(&self) -> &'static str {
        self.root
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    /// Entity types on the path, root first.
    pub fn entities(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.root).chain(self.steps.iter().map(|s| s.entity))
    }

    /// Entity type loaded at the end of the path.
    pub fn leaf_entity(&self) -> &'static str {
        self.steps.last().map_or(self.root, |s| s.entity)
    }
}

impl fmt::Display for LoaderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for step in &self.steps {
            write!(f, ".{}", step.relationship)?;
            if let Some(ty) = step.narrowed {
                write!(f, "[{}]", ty)?;
            }
        }
        Ok(())
    }
}

/// One step of a directive's relationship chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStep {
    /// Relationship name or [`WILDCARD`].
    pub relationship: &'static str,
    /// Narrow the loaded entities to this subtype.
    pub of_type: Option<&'static str>,
}

impl ChainStep {
    fn is_wildcard(&self) -> bool {
        self.relationship == WILDCARD
    }
}

/// Relationship chain of a directive.
///
/// Parsed from dotted strings: `"orders.items"`, `"employees[Engineer]"`,
/// `"children.*"`. Empty segments are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipChain(Vec<ChainStep>);

impl RelationshipChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(path: &'static str) -> Self {
        let steps = path
            .split('.')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.strip_suffix(']').and_then(|s| s.split_once('[')) {
                Some((relationship, of_type)) => ChainStep {
                    relationship: relationship.trim(),
                    of_type: Some(of_type.trim()),
                },
                None => ChainStep {
                    relationship: segment,
                    of_type: None,
                },
            })
            .collect();
        Self(steps)
    }

    #[must_use]
    pub fn then(mut self, relationship: &'static str) -> Self {
        self.0.push(ChainStep {
            relationship,
            of_type: None,
        });
        self
    }

    /// Narrow the last step to a subtype.
    #[must_use]
    pub fn of_type(mut self, entity: &'static str) -> Self {
        if let Some(last) = self.0.last_mut() {
            last.of_type = Some(entity);
        }
        self
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&'static str> for RelationshipChain {
    fn from(path: &'static str) -> Self {
        Self::parse(path)
    }
}

/// A registered strategy for one relationship chain under a root type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDirective {
    pub root: &'static str,
    pub chain: RelationshipChain,
    pub strategy: LoadStrategy,
}

impl LoadDirective {
    fn last(&self) -> Option<&ChainStep> {
        self.chain.0.last()
    }

    fn is_wildcard(&self) -> bool {
        self.last().is_some_and(ChainStep::is_wildcard)
    }

    /// Relationship-by-relationship match of the chain prefix against `path`,
    /// plus the root qualifier and the owner type of the final step.
    fn applies_at(
        &self,
        registry: &MappingRegistry,
        path: &LoaderPath,
        parent_type: &'static str,
    ) -> bool {
        if self.chain.len() != path.len() + 1 {
            return false;
        }
        let prefix_matches = self
            .chain
            .0
            .iter()
            .zip(path.steps())
            .all(|(want, have)| {
                (want.is_wildcard() || want.relationship == have.relationship)
                    && want.of_type == have.narrowed
            });
        if !prefix_matches {
            return false;
        }
        let root_matches = if path.is_root() {
            registry.isa(parent_type, self.root)
        } else {
            registry.isa(path.root_entity(), self.root)
        };
        if !root_matches {
            return false;
        }
        match path.len().checked_sub(1).and_then(|i| self.chain.0[i].of_type) {
            Some(owner) => registry.isa(parent_type, owner),
            None => true,
        }
    }
}

/// Which rule produced a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Explicit,
    Wildcard,
    MapperDefault,
}

/// The strategy that applies to one relationship at one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub strategy: LoadStrategy,
    /// Subtype the loaded entities are narrowed to.
    pub of_type: Option<&'static str>,
    pub source: ResolutionSource,
}

/// The load directives of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRegistry {
    directives: Vec<LoadDirective>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` for the last step of `chain` under `root`.
    ///
    /// Intermediate steps keep whatever strategy applies to them otherwise.
    pub fn register(
        &mut self,
        root: &'static str,
        chain: impl Into<RelationshipChain>,
        strategy: LoadStrategy,
    ) -> &mut Self {
        self.directives.push(LoadDirective {
            root,
            chain: chain.into(),
            strategy,
        });
        self
    }

    /// Eagerly load every step of `chain`.
    #[must_use]
    pub fn selectin(mut self, root: &'static str, chain: impl Into<RelationshipChain>) -> Self {
        let chain = chain.into();
        for end in 1..=chain.len() {
            let prefix = RelationshipChain(chain.0[..end].to_vec());
            self.register(root, prefix, LoadStrategy::Selectin);
        }
        self
    }

    /// Leave the last step of `chain` unloaded.
    #[must_use]
    pub fn lazy(mut self, root: &'static str, chain: impl Into<RelationshipChain>) -> Self {
        self.register(root, chain, LoadStrategy::Lazy);
        self
    }

    /// Populate the last step of `chain` empty without a statement.
    #[must_use]
    pub fn noload(mut self, root: &'static str, chain: impl Into<RelationshipChain>) -> Self {
        self.register(root, chain, LoadStrategy::NoLoad);
        self
    }

    pub fn directives(&self) -> &[LoadDirective] {
        &self.directives
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Resolve the strategy for traversing `rel` from parents of concrete
    /// type `parent_type` loaded at `path`.
    ///
    /// `Ok(None)` means the attribute is left as it is.
    pub fn resolve(
        &self,
        registry: &MappingRegistry,
        path: &LoaderPath,
        parent_type: &'static str,
        rel: &RelationshipInfo,
    ) -> Result<Option<Resolution>> {
        let explicit = self.directives.iter().rev().find(|d| {
            !d.is_wildcard()
                && d.last().is_some_and(|s| s.relationship == rel.name)
                && d.applies_at(registry, path, parent_type)
        });
        if let Some(directive) = explicit {
            let of_type = directive.last().and_then(|s| s.of_type);
            check_directive_target(registry, parent_type, rel, directive.strategy, of_type)?;
            return Ok(Some(Resolution {
                strategy: directive.strategy,
                of_type,
                source: ResolutionSource::Explicit,
            }));
        }

        let wildcard = self
            .directives
            .iter()
            .rev()
            .find(|d| d.is_wildcard() && d.applies_at(registry, path, parent_type));
        if let Some(directive) = wildcard {
            if rel.strategy().can_populate() {
                return Ok(Some(Resolution {
                    strategy: directive.strategy,
                    of_type: None,
                    source: ResolutionSource::Wildcard,
                }));
            }
        }

        Ok(mapper_default(registry, path, rel))
    }

    /// Check every directive and every mapper-level eager relationship
    /// reachable from `root` before any statement is issued.
    pub fn validate(
        &self,
        registry: &MappingRegistry,
        root: &'static str,
        dialect: Dialect,
        config: &LoaderConfig,
    ) -> Result<()> {
        registry.entity(root)?;
        let mut eager_targets: Vec<&'static str> = vec![root];

        for directive in &self.directives {
            registry.entity(directive.root)?;
            if !registry.isa(root, directive.root) && !registry.isa(directive.root, root) {
                return Err(path_error(
                    directive.root,
                    format!("load path does not apply to query root '{}'", root),
                ));
            }
            let mut owners: Vec<&'static str> = vec![directive.root];
            for (i, step) in directive.chain.steps().iter().enumerate() {
                let is_last = i + 1 == directive.chain.len();
                let mut candidates: Vec<(&'static str, &RelationshipInfo)> = Vec::new();
                for &owner in &owners {
                    if step.is_wildcard() {
                        for rel in registry.relationships(owner)? {
                            if rel.strategy().can_populate() {
                                candidates.push((owner, rel));
                            }
                        }
                    } else {
                        candidates.push((owner, registry.relationship(owner, step.relationship)?));
                    }
                }
                let mut next = Vec::new();
                for (owner, rel) in candidates {
                    if is_last {
                        check_directive_target(
                            registry,
                            owner,
                            rel,
                            directive.strategy,
                            step.of_type,
                        )?;
                        if directive.strategy == LoadStrategy::Selectin {
                            check_tuple_support(registry, owner, rel, dialect, config)?;
                            eager_targets.push(step.of_type.unwrap_or(rel.target));
                        }
                    } else if let Some(of_type) = step.of_type {
                        check_of_type(registry, owner, rel, of_type)?;
                    }
                    let target = step.of_type.unwrap_or(rel.target);
                    if !next.contains(&target) {
                        next.push(target);
                    }
                }
                owners = next;
            }
        }

        validate_mapper_defaults(registry, eager_targets, dialect, config)
    }
}

fn mapper_default(
    registry: &MappingRegistry,
    path: &LoaderPath,
    rel: &RelationshipInfo,
) -> Option<Resolution> {
    let strategy = match rel.strategy() {
        LazyLoadStrategy::Selectin => LoadStrategy::Selectin,
        LazyLoadStrategy::NoLoad => LoadStrategy::NoLoad,
        _ => return None,
    };
    if strategy == LoadStrategy::Selectin {
        let target_base = registry.base_of(rel.target).ok()?;
        let cyclic = path
            .entities()
            .any(|e| registry.base_of(e).is_ok_and(|b| b == target_base));
        if cyclic {
            let occurrences = path
                .steps()
                .iter()
                .filter(|s| {
                    s.relationship == rel.name
                        && registry.base_of(s.entity).is_ok_and(|b| b == target_base)
                })
                .count();
            if occurrences + 1 > rel.join_depth.unwrap_or(0) {
                tracing::trace!(
                    path = %path,
                    relationship = rel.name,
                    join_depth = ?rel.join_depth,
                    "join depth reached; leaving relationship lazy"
                );
                return None;
            }
        }
    }
    Some(Resolution {
        strategy,
        of_type: None,
        source: ResolutionSource::MapperDefault,
    })
}

fn path_error(entity: &str, message: String) -> Error {
    Error::Config(ConfigError::new(ConfigErrorKind::InvalidPath, message).on_entity(entity))
}

fn check_of_type(
    registry: &MappingRegistry,
    owner: &str,
    rel: &RelationshipInfo,
    of_type: &'static str,
) -> Result<()> {
    registry.entity(of_type)?;
    if registry.isa(of_type, rel.target) {
        Ok(())
    } else {
        Err(Error::Config(
            ConfigError::new(
                ConfigErrorKind::InvalidPath,
                format!("'{}' is not a subtype of '{}'", of_type, rel.target),
            )
            .on_entity(owner)
            .on_relationship(rel.name),
        ))
    }
}

fn check_directive_target(
    registry: &MappingRegistry,
    owner: &str,
    rel: &RelationshipInfo,
    strategy: LoadStrategy,
    of_type: Option<&'static str>,
) -> Result<()> {
    if strategy != LoadStrategy::Lazy && !rel.strategy().can_populate() {
        return Err(Error::Config(
            ConfigError::new(
                ConfigErrorKind::NotPopulatable,
                format!(
                    "{:?} relationship does not support object population; \
                     eager loading cannot be applied",
                    rel.strategy()
                ),
            )
            .on_entity(owner)
            .on_relationship(rel.name),
        ));
    }
    match of_type {
        Some(of_type) => check_of_type(registry, owner, rel, of_type),
        None => Ok(()),
    }
}

/// Composite join keys need row-value `IN` or the OR-of-ANDs fallback.
pub fn check_tuple_support(
    registry: &MappingRegistry,
    owner: &str,
    rel: &RelationshipInfo,
    dialect: Dialect,
    config: &LoaderConfig,
) -> Result<()> {
    let arity = registry.join_columns(owner, rel)?.arity();
    check_key_arity(arity, owner, rel, dialect, config)
}

/// Fail when a correlation key of `arity` columns cannot be filtered on
/// `dialect` under `config`.
pub fn check_key_arity(
    arity: usize,
    owner: &str,
    rel: &RelationshipInfo,
    dialect: Dialect,
    config: &LoaderConfig,
) -> Result<()> {
    if arity > 1 && !dialect.supports_tuple_in() && !config.tuple_in_fallback {
        return Err(Error::Config(
            ConfigError::new(
                ConfigErrorKind::TupleInUnsupported,
                format!(
                    "{:?} has no row-value IN for a {}-column key and tuple_in_fallback is off",
                    dialect, arity
                ),
            )
            .on_entity(owner)
            .on_relationship(rel.name),
        ));
    }
    Ok(())
}

fn validate_mapper_defaults(
    registry: &MappingRegistry,
    seeds: Vec<&'static str>,
    dialect: Dialect,
    config: &LoaderConfig,
) -> Result<()> {
    let mut seen: HashSet<&'static str> = HashSet::new();
    let mut queue: VecDeque<&'static str> = seeds.into_iter().collect();
    while let Some(entity) = queue.pop_front() {
        for member in registry.family(entity)? {
            if !seen.insert(member) {
                continue;
            }
            for rel in registry.relationships(member)? {
                if rel.strategy() == LazyLoadStrategy::Selectin {
                    check_tuple_support(registry, member, rel, dialect, config)?;
                    queue.push_back(rel.target);
                }
            }
        }
    }
    Ok(())
}

/// Per-query loading options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub paths: PathRegistry,
    /// Overrides [`LoaderConfig::chunk_size`] for this query.
    pub chunk_size: Option<usize>,
    /// Overwrite attributes that are already loaded on existing entities.
    pub populate_existing: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn paths(mut self, paths: PathRegistry) -> Self {
        self.paths = paths;
        self
    }

    /// Shorthand for `PathRegistry::selectin` on the contained registry.
    #[must_use]
    pub fn selectin(mut self, root: &'static str, chain: impl Into<RelationshipChain>) -> Self {
        self.paths = self.paths.selectin(root, chain);
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    #[must_use]
    pub fn populate_existing(mut self, enabled: bool) -> Self {
        self.populate_existing = enabled;
        self
    }

    pub fn effective_chunk_size(&self, config: &LoaderConfig) -> usize {
        self.chunk_size.unwrap_or(config.chunk_size)
    }

    pub fn validate(
        &self,
        registry: &MappingRegistry,
        root: &'static str,
        dialect: Dialect,
        config: &LoaderConfig,
    ) -> Result<()> {
        if self.chunk_size == Some(0) {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                "chunk_size override must be at least 1",
            ));
        }
        self.paths.validate(registry, root, dialect, config)
    }
}
