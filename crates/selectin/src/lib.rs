//! Selectin - batched select-IN eager loading for relationship graphs.
//!
//! Loading a relationship for N parent entities one at a time costs N
//! statements. Selectin loads it for all of them with one statement per
//! chunk of parent keys, attaches the rows back to their parents and then
//! recurses into nested relationships the same way:
//!
//! - Per-query load directives resolved against mapper-level defaults
//! - Plain or joined secondary statements chosen per relationship
//! - Composite keys, many-to-many link tables, single-table inheritance
//! - Cancel-correct async execution on asupersync
//!
//! # Quick Start
//!
//! ```ignore
//! use selectin::prelude::*;
//!
//! let registry = MappingRegistry::builder()
//!     .entity(
//!         EntityMapping::new("User", "users")
//!             .primary_key(&["id"])
//!             .column("name")
//!             .relationship(RelationshipInfo::one_to_many("orders", "Order", "user_id")),
//!     )
//!     .entity(
//!         EntityMapping::new("Order", "orders")
//!             .primary_key(&["id"])
//!             .column("user_id"),
//!     )
//!     .build()?;
//!
//! let mut session = Session::new(connection, registry);
//! let options = LoadOptions::new().selectin("User", "orders");
//! let result = session.query(cx, &PrimaryQuery::new("User"), &options).await;
//! ```
//!
//! The engine never renders SQL. A [`RowSource`] implementation executes each
//! [`SelectQuery`] against its backend and returns rows labeled the way the
//! statement asks.

pub use selectin_core::{
    Cardinality, ColumnDef, ColumnInfo, ConfigError, ConfigErrorKind, ConnectionError,
    ConnectionErrorKind, Cx, EntityMapping, Error, JoinColumns, Key, LazyLoadStrategy,
    LinkTableInfo, MappingRegistry, MappingRegistryBuilder, OrderTerm, Outcome, QueryError,
    QueryErrorKind, RelationshipInfo, RelationshipKind, Result, Row, TypeError, Value,
};
pub use selectin_query::{
    ChainStep, ColumnRef, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PATH_LENGTH, Dialect, Expr,
    KEY_LABEL_PREFIX, Join, LoadDirective, LoadOptions, LoadStrategy, LoaderConfig, LoaderPath,
    OrderBy, OrderDirection, PathRegistry, PathStep, PrimaryQuery, QueryStrategy,
    RelationshipChain, Resolution, ResolutionSource, RowSource, SecondaryQueryBuilder,
    SelectColumn, SelectQuery, StrategyInput, TableRef, WILDCARD, key_label,
    max_keys_per_statement,
};
pub use selectin_session::{
    BatchOutcome, Diagnostic, EntityId, EntityState, EntityStatus, IdentityMap,
    InvocationSummary, KeySet, LoadReport, QueryResult, RelatedValue, RowCorrelator,
    SelectinLoader, Session, chunk,
};

/// Everything needed to declare mappings and run loads.
pub mod prelude {
    pub use crate::{
        Cx, EntityId, EntityMapping, Error, Key, LazyLoadStrategy, LinkTableInfo, LoadOptions,
        LoadReport, LoadStrategy, LoaderConfig, MappingRegistry, Outcome, PrimaryQuery,
        RelatedValue, RelationshipChain, RelationshipInfo, Result, Row, RowSource, Session,
        Value,
    };
}
