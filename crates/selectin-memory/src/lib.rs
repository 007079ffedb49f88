//! In-process row source for selectin.
//!
//! `selectin-memory` evaluates [`SelectQuery`] specifications directly
//! against tables held in memory. It is the driver used by the selectin test
//! suites and works for prototyping mappings without a database.
//!
//! # Role In The Architecture
//!
//! - Implements `selectin-query::RowSource`
//! - Inner joins, `=`/`IN`/row-value `IN` filters, multi-column ordering
//! - Records every executed statement so callers can assert on query counts
//!   and shapes
//! - Injects connection failures after a given number of statements
//!
//! # Semantics
//!
//! Comparisons follow SQL: integer widths are ignored and NULL never equals
//! anything. A column absent from a stored row reads as NULL. Rows that tie on
//! every ORDER BY term keep insertion order.

use asupersync::{Cx, Outcome};
use selectin_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    Row, Value,
};
use selectin_query::{ColumnRef, Dialect, Expr, OrderDirection, RowSource, SelectQuery};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

type StoredRow = HashMap<String, Value>;

#[derive(Debug, Default)]
struct MemoryInner {
    tables: HashMap<String, Vec<StoredRow>>,
    log: Vec<SelectQuery>,
    /// Fail every statement once this many have succeeded.
    fail_after: Option<usize>,
}

/// A row source backed by in-memory tables.
///
/// Cloning shares the tables and the statement log.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<MemoryInner>>,
    dialect: Dialect,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            dialect: Dialect::Postgres,
        }
    }

    /// Report `dialect` capabilities to the loader.
    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare an empty table so statements against it return no rows.
    pub fn create_table(&self, table: &str) {
        self.lock().tables.entry(table.to_string()).or_default();
    }

    /// Append one row to `table`, creating the table if needed.
    pub fn insert<I, K, V>(&self, table: &str, row: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let row: StoredRow = row
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Number of rows stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Let `successful` more statements run, then fail every statement with
    /// a connection error.
    pub fn fail_after(&self, successful: usize) {
        let mut inner = self.lock();
        inner.fail_after = Some(inner.log.len() + successful);
    }

    pub fn clear_failure(&self) {
        self.lock().fail_after = None;
    }

    /// Statements executed so far, in order.
    pub fn statements(&self) -> Vec<SelectQuery> {
        self.lock().log.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Previews of the executed statements.
    pub fn previews(&self) -> Vec<String> {
        self.lock().log.iter().map(ToString::to_string).collect()
    }

    pub fn clear_log(&self) {
        let mut inner = self.lock();
        inner.log.clear();
        inner.fail_after = None;
    }

    /// Evaluate `query` and return its rows.
    pub fn query_sync(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        if inner.fail_after.is_some_and(|limit| inner.log.len() >= limit) {
            tracing::debug!(statement = %query, "Injected connection failure");
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "connection lost (injected)".to_string(),
                source: None,
            }));
        }
        let rows = evaluate(&inner.tables, query)?;
        tracing::trace!(statement = %query, rows = rows.len(), "Memory statement");
        inner.log.push(query.clone());
        Ok(rows)
    }
}

impl RowSource for MemorySource {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn fetch(
        &self,
        cx: &Cx,
        query: &SelectQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => self
                .query_sync(query)
                .map_or_else(Outcome::Err, Outcome::Ok),
        };
        async move { result }
    }
}

/// One candidate result row: a stored row per FROM/JOIN scope.
struct Binding<'t> {
    rows: Vec<&'t StoredRow>,
}

struct Scopes<'q> {
    names: Vec<&'q str>,
}

impl<'q> Scopes<'q> {
    fn new(query: &'q SelectQuery) -> Result<Self> {
        let mut names = Vec::new();
        for table in query.tables() {
            let name = table.scope_name();
            if names.contains(&name) {
                return Err(query_error(
                    QueryErrorKind::Unsupported,
                    query,
                    format!("duplicate table scope '{}'", name),
                ));
            }
            names.push(name);
        }
        Ok(Self { names })
    }

    fn value(
        &self,
        binding: &Binding<'_>,
        column: &ColumnRef,
        query: &SelectQuery,
    ) -> Result<Value> {
        let index = self
            .names
            .iter()
            .position(|n| *n == column.table)
            .filter(|i| *i < binding.rows.len())
            .ok_or_else(|| {
                query_error(
                    QueryErrorKind::NotFound,
                    query,
                    format!("no table in scope for column {}", column),
                )
            })?;
        Ok(binding.rows[index]
            .get(&column.column)
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn test(&self, binding: &Binding<'_>, expr: &Expr, query: &SelectQuery) -> Result<bool> {
        Ok(match expr {
            Expr::Eq(column, value) => self.value(binding, column, query)?.sql_eq(value),
            Expr::ColumnEq(left, right) => self
                .value(binding, left, query)?
                .sql_eq(&self.value(binding, right, query)?),
            Expr::InList { column, values } => {
                let v = self.value(binding, column, query)?;
                values.iter().any(|candidate| v.sql_eq(candidate))
            }
            Expr::TupleIn { columns, rows } => {
                let mut actual = Vec::with_capacity(columns.len());
                for column in columns {
                    actual.push(self.value(binding, column, query)?);
                }
                rows.iter().any(|row| {
                    row.len() == actual.len() && row.iter().zip(&actual).all(|(r, a)| a.sql_eq(r))
                })
            }
            Expr::And(items) => {
                for item in items {
                    if !self.test(binding, item, query)? {
                        return Ok(false);
                    }
                }
                true
            }
            Expr::Or(items) => {
                for item in items {
                    if self.test(binding, item, query)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }
}

fn query_error(kind: QueryErrorKind, query: &SelectQuery, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        statement: Some(query.to_string()),
        message,
        source: None,
    })
}

fn table_rows<'t>(
    tables: &'t HashMap<String, Vec<StoredRow>>,
    table: &str,
    query: &SelectQuery,
) -> Result<&'t [StoredRow]> {
    tables.get(table).map(Vec::as_slice).ok_or_else(|| {
        query_error(
            QueryErrorKind::NotFound,
            query,
            format!("no such table: {}", table),
        )
    })
}

fn evaluate(tables: &HashMap<String, Vec<StoredRow>>, query: &SelectQuery) -> Result<Vec<Row>> {
    let scopes = Scopes::new(query)?;

    let mut bindings: Vec<Binding<'_>> = table_rows(tables, &query.from.table, query)?
        .iter()
        .map(|row| Binding { rows: vec![row] })
        .collect();
    for join in &query.joins {
        let candidates = table_rows(tables, &join.table.table, query)?;
        let mut joined = Vec::new();
        for binding in &bindings {
            for row in candidates {
                let mut rows = binding.rows.clone();
                rows.push(row);
                let extended = Binding { rows };
                if scopes.test(&extended, &join.on, query)? {
                    joined.push(extended);
                }
            }
        }
        bindings = joined;
    }

    let mut matched = Vec::new();
    for binding in bindings {
        let keep = match &query.filter {
            Some(filter) => scopes.test(&binding, filter, query)?,
            None => true,
        };
        if keep {
            let mut sort_key = Vec::with_capacity(query.order_by.len());
            for order in &query.order_by {
                sort_key.push(scopes.value(&binding, &order.column, query)?);
            }
            matched.push((sort_key, binding));
        }
    }

    matched.sort_by(|(a, _), (b, _)| {
        for ((left, right), order) in a.iter().zip(b).zip(&query.order_by) {
            let ordering = match order.direction {
                OrderDirection::Asc => left.total_cmp(right),
                OrderDirection::Desc => right.total_cmp(left),
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });

    let columns = Arc::new(ColumnInfo::new(
        query.columns.iter().map(|c| c.label.clone()).collect(),
    ));
    let mut rows = Vec::with_capacity(matched.len());
    for (_, binding) in &matched {
        let mut values = Vec::with_capacity(query.columns.len());
        for column in &query.columns {
            values.push(scopes.value(binding, &column.source, query)?);
        }
        rows.push(Row::with_columns(Arc::clone(&columns), values));
    }
    Ok(rows)
}
