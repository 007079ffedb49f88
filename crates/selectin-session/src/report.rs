//! What a load did.

use selectin_query::QueryStrategy;
use serde::Serialize;
use std::fmt;

/// A non-fatal condition noticed during a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A scalar relationship received more than one row for one parent key.
    /// The first row was kept.
    CorrelationAnomaly {
        path: String,
        relationship: &'static str,
        parent_key: String,
        rows: usize,
    },
    /// Eager recursion stopped at the configured path length.
    PathLengthExceeded { path: String, limit: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::CorrelationAnomaly {
                path,
                relationship,
                parent_key,
                rows,
            } => write!(
                f,
                "{}.{}: {} rows for scalar key {}; kept the first",
                path, relationship, rows, parent_key
            ),
            Diagnostic::PathLengthExceeded { path, limit } => {
                write!(f, "{}: eager loading stopped at path length {}", path, limit)
            }
        }
    }
}

/// One relationship loaded for one bucket of parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationSummary {
    /// Loader path of the parents.
    pub path: String,
    pub relationship: &'static str,
    #[serde(serialize_with = "serialize_strategy")]
    pub strategy: QueryStrategy,
    /// Parents whose attribute was populated.
    pub parents: usize,
    /// Distinct correlation keys sent to the row source.
    pub keys: usize,
    /// Keys answered from the identity map without a statement.
    pub elided: usize,
    pub statements: usize,
}

fn serialize_strategy<S: serde::Serializer>(
    strategy: &QueryStrategy,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(strategy)
}

/// Summary returned by every load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Secondary statements issued (plus the primary one for session queries).
    pub statements: usize,
    /// Relationship attributes populated, across all parents.
    pub populated: usize,
    pub invocations: Vec<InvocationSummary>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LoadReport {
    pub fn has_anomalies(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::CorrelationAnomaly { .. }))
    }

    /// Invocations for one relationship name, in execution order.
    pub fn invocations_for<'a>(
        &'a self,
        relationship: &'a str,
    ) -> impl Iterator<Item = &'a InvocationSummary> + 'a {
        self.invocations
            .iter()
            .filter(move |i| i.relationship == relationship)
    }

    pub(crate) fn merge(&mut self, other: LoadReport) {
        self.statements += other.statements;
        self.populated += other.populated;
        self.invocations.extend(other.invocations);
        self.diagnostics.extend(other.diagnostics);
    }
}
