//! Choosing between the plain and joined secondary statement shapes.

use std::fmt;

/// Shape of the secondary statement for one loader invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Filter the target directly on the correlation key values taken from
    /// the parents' loaded columns.
    Plain,
    /// Re-select the parent table by primary key and join through to the
    /// target, correlating on the parent's primary key.
    Join,
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStrategy::Plain => write!(f, "plain"),
            QueryStrategy::Join => write!(f, "join"),
        }
    }
}

/// What is known about a bucket of parents when the strategy is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyInput {
    /// Every parent has every local join column loaded.
    pub local_loaded_on_all: bool,
    /// Some parent was produced by a derived source (subquery, aliased
    /// select) and the local columns may not reflect the table.
    pub derived_source: bool,
    /// The local join columns are exactly the parent's primary key.
    pub local_is_pk: bool,
}

impl StrategyInput {
    /// Pick the statement shape. Decided once for the whole invocation so
    /// every batch uses the same shape.
    pub fn choose(self) -> QueryStrategy {
        if !self.local_loaded_on_all {
            return QueryStrategy::Join;
        }
        if self.derived_source && !self.local_is_pk {
            return QueryStrategy::Join;
        }
        QueryStrategy::Plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(loaded: bool, derived: bool, pk: bool) -> StrategyInput {
        StrategyInput {
            local_loaded_on_all: loaded,
            derived_source: derived,
            local_is_pk: pk,
        }
    }

    #[test]
    fn plain_when_keys_are_present() {
        assert_eq!(input(true, false, false).choose(), QueryStrategy::Plain);
        assert_eq!(input(true, false, true).choose(), QueryStrategy::Plain);
        // the primary key survives derived sources
        assert_eq!(input(true, true, true).choose(), QueryStrategy::Plain);
    }

    #[test]
    fn join_when_keys_are_missing_or_untrusted() {
        assert_eq!(input(false, false, false).choose(), QueryStrategy::Join);
        assert_eq!(input(false, false, true).choose(), QueryStrategy::Join);
        assert_eq!(input(true, true, false).choose(), QueryStrategy::Join);
    }
}
