//! Core types for selectin eager loading.
//!
//! This crate provides the foundational pieces shared by the statement
//! builder and the loading engine:
//!
//! - `Value`, `Row` and hashable `Key` tuples
//! - the `Error` taxonomy
//! - mapping configuration: entities, columns, relationships and the
//!   validated `MappingRegistry`
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod key;
pub mod mapping;
pub mod relationship;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConfigErrorKind, ConnectionError, ConnectionErrorKind, Error, QueryError,
    QueryErrorKind, Result, TypeError,
};
pub use key::Key;
pub use mapping::{ColumnDef, EntityMapping, JoinColumns, MappingRegistry, MappingRegistryBuilder};
pub use relationship::{
    Cardinality, LazyLoadStrategy, LinkTableInfo, OrderTerm, RelationshipInfo, RelationshipKind,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
