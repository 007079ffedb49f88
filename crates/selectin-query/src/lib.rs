//! Statement model and planning for selectin eager loading.
//!
//! `selectin-query` knows how to describe what to load, never how to run it:
//!
//! - [`SelectQuery`] and [`Expr`]: dialect-neutral statement specifications
//! - [`RowSource`]: the driver seam that executes them
//! - [`PathRegistry`] and [`LoaderPath`]: per-query load directives and
//!   strategy resolution
//! - [`QueryStrategy`]: plain versus joined secondary statements
//! - [`SecondaryQueryBuilder`]: the batched `IN` statement for one relationship
//! - [`PrimaryQuery`]: the root select a load starts from

pub mod config;
pub mod eager;
pub mod expr;
pub mod primary;
pub mod secondary;
pub mod select;
pub mod source;
pub mod strategy;

pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PATH_LENGTH, LoaderConfig};
pub use eager::{
    ChainStep, LoadDirective, LoadOptions, LoadStrategy, LoaderPath, PathRegistry, PathStep,
    RelationshipChain, Resolution, ResolutionSource, WILDCARD,
};
pub use expr::{ColumnRef, Dialect, Expr};
pub use primary::PrimaryQuery;
pub use secondary::{KEY_LABEL_PREFIX, SecondaryQueryBuilder, key_label, max_keys_per_statement};
pub use select::{Join, OrderBy, OrderDirection, SelectColumn, SelectQuery, TableRef};
pub use source::RowSource;
pub use strategy::{QueryStrategy, StrategyInput};
