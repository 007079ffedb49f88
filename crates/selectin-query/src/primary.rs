//! The primary entity query a load starts from.

use crate::expr::{ColumnRef, Expr};
use crate::select::{OrderBy, SelectQuery, TableRef};
use selectin_core::{MappingRegistry, Result, Value};

/// Selects root entities of one type.
///
/// Columns are the entity's load columns, minus anything deferred with
/// [`defer`](Self::defer), plus anything un-deferred with
/// [`undefer`](Self::undefer). Subtype queries carry a discriminator filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryQuery {
    pub entity: &'static str,
    filters: Vec<(&'static str, Filter)>,
    order_by: Vec<(&'static str, bool)>,
    deferred: Vec<&'static str>,
    undeferred: Vec<&'static str>,
    from_derived: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Eq(Value),
    In(Vec<Value>),
}

impl PrimaryQuery {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            filters: Vec::new(),
            order_by: Vec::new(),
            deferred: Vec::new(),
            undeferred: Vec::new(),
            from_derived: false,
        }
    }

    /// `column = value`
    #[must_use]
    pub fn filter_eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push((column, Filter::Eq(value.into())));
        self
    }

    /// `column IN (values)`
    #[must_use]
    pub fn filter_in(mut self, column: &'static str, values: Vec<Value>) -> Self {
        self.filters.push((column, Filter::In(values)));
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &'static str) -> Self {
        self.order_by.push((column, false));
        self
    }

    #[must_use]
    pub fn order_by_desc(mut self, column: &'static str) -> Self {
        self.order_by.push((column, true));
        self
    }

    /// Leave `column` out of the loaded entities.
    #[must_use]
    pub fn defer(mut self, column: &'static str) -> Self {
        self.deferred.push(column);
        self.undeferred.retain(|c| *c != column);
        self
    }

    /// Load a column mapped as deferred.
    #[must_use]
    pub fn undefer(mut self, column: &'static str) -> Self {
        self.undeferred.push(column);
        self.deferred.retain(|c| *c != column);
        self
    }

    /// Mark the rows as coming from a derived source (subquery or aliased
    /// select) whose non-key columns may not match the table.
    #[must_use]
    pub fn from_derived(mut self, derived: bool) -> Self {
        self.from_derived = derived;
        self
    }

    pub fn is_from_derived(&self) -> bool {
        self.from_derived
    }

    /// Columns the loaded entities will carry.
    pub fn loaded_columns(&self, registry: &MappingRegistry) -> Result<Vec<&'static str>> {
        let pk = registry.primary_key(self.entity)?;
        let discriminator = registry.polymorphic_on(self.entity)?;
        let mut columns: Vec<&'static str> = registry
            .load_columns(self.entity)?
            .into_iter()
            .filter(|c| !self.deferred.contains(c) || pk.contains(c) || discriminator == Some(*c))
            .collect();
        let mapped = registry.columns(self.entity)?;
        for col in &self.undeferred {
            if mapped.iter().any(|c| c.name == *col) && !columns.contains(col) {
                columns.push(col);
            }
        }
        Ok(columns)
    }

    pub fn build(&self, registry: &MappingRegistry) -> Result<SelectQuery> {
        let table = TableRef::new(registry.table(self.entity)?);
        let mut query = SelectQuery::from(table.clone());
        for col in self.loaded_columns(registry)? {
            query = query.column(table.column(col), col);
        }
        for (col, filter) in &self.filters {
            let column: ColumnRef = table.column(*col);
            query = query.filter(match filter {
                Filter::Eq(value) => Expr::Eq(column, value.clone()),
                Filter::In(values) => Expr::in_list(column, values.clone()),
            });
        }
        if registry.needs_discriminator_filter(self.entity)? {
            if let Some(column) = registry.polymorphic_on(self.entity)? {
                let identities = registry
                    .identities_for(self.entity)?
                    .into_iter()
                    .map(|id| Value::Text(id.to_string()))
                    .collect();
                query = query.filter(Expr::in_list(table.column(column), identities));
            }
        }
        for (col, descending) in &self.order_by {
            let column = table.column(*col);
            query = query.order_by(if *descending {
                OrderBy::desc(column)
            } else {
                OrderBy::asc(column)
            });
        }
        for col in registry.primary_key(self.entity)? {
            query = query.order_by(OrderBy::asc(table.column(*col)));
        }
        Ok(query)
    }
}
