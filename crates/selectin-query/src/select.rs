//! Abstract SELECT statements.
//!
//! A [`SelectQuery`] is the specification handed to a [`RowSource`]; it is
//! never rendered to SQL text here. Its `Display` impl produces a
//! dialect-neutral preview used in logs and test assertions.
//!
//! [`RowSource`]: crate::source::RowSource

use crate::expr::{ColumnRef, Expr};
use std::fmt;

/// A table in the FROM list, optionally aliased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
        }
    }

    pub fn aliased(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: Some(alias.into()),
        }
    }

    /// The name columns of this table are qualified with.
    pub fn scope_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    pub fn column(&self, column: impl Into<String>) -> ColumnRef {
        ColumnRef::new(self.scope_name(), column)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} AS {}", self.table, alias),
            None => write!(f, "{}", self.table),
        }
    }
}

/// An inner join.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: TableRef,
    pub on: Expr,
}

impl Join {
    pub fn inner(table: TableRef, on: Expr) -> Self {
        Self { table, on }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(column: ColumnRef) -> Self {
        Self {
            column,
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(column: ColumnRef) -> Self {
        Self {
            column,
            direction: OrderDirection::Desc,
        }
    }
}

/// One entry of the select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectColumn {
    pub source: ColumnRef,
    /// Label the value is returned under in each [`Row`](selectin_core::Row).
    pub label: String,
}

/// A SELECT statement specification.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub columns: Vec<SelectColumn>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub order_by: Vec<OrderBy>,
}

impl SelectQuery {
    pub fn from(table: TableRef) -> Self {
        Self {
            columns: Vec::new(),
            from: table,
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, source: ColumnRef, label: impl Into<String>) -> Self {
        self.columns.push(SelectColumn {
            source,
            label: label.into(),
        });
        self
    }

    #[must_use]
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// AND a condition onto the filter.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        if !self.order_by.iter().any(|o| o.column == order.column) {
            self.order_by.push(order);
        }
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.label.as_str())
    }

    /// Number of bound values in the filter.
    pub fn parameter_count(&self) -> usize {
        self.filter.as_ref().map_or(0, Expr::parameter_count)
    }

    /// Tables referenced by FROM and JOIN, in order.
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        std::iter::once(&self.from).chain(self.joins.iter().map(|j| &j.table))
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if col.label == col.source.column {
                write!(f, "{}", col.source)?;
            } else {
                write!(f, "{} AS {}", col.source, col.label)?;
            }
        }
        write!(f, " FROM {}", self.from)?;
        for join in &self.joins {
            write!(f, " JOIN {} ON {}", join.table, join.on)?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY ")?;
            for (i, order) in self.order_by.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", order.column)?;
                if order.direction == OrderDirection::Desc {
                    write!(f, " DESC")?;
                }
            }
        }
        Ok(())
    }
}
