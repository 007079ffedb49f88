//! Filter expressions and dialect capabilities.

use selectin_core::Value;
use std::fmt;

/// Target database dialect.
///
/// The loading engine never renders SQL; the dialect only answers the
/// capability questions that change which statement shape is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
    Mysql,
    /// SQL Server: no row-value `IN`, low bound-parameter limit.
    Mssql,
}

impl Dialect {
    /// Does `(a, b) IN ((1, 2), (3, 4))` work on this dialect?
    pub const fn supports_tuple_in(self) -> bool {
        !matches!(self, Dialect::Mssql)
    }

    /// Upper bound on bound parameters in one statement.
    pub const fn max_parameters(self) -> usize {
        match self {
            Dialect::Postgres | Dialect::Mysql => 65_535,
            Dialect::Sqlite => 32_766,
            Dialect::Mssql => 2_100,
        }
    }
}

/// A column qualified by the table name or alias it is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// A boolean filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `column = value`
    Eq(ColumnRef, Value),
    /// `column = column`, used for join conditions
    ColumnEq(ColumnRef, ColumnRef),
    /// `column IN (v1, v2, ...)`
    InList { column: ColumnRef, values: Vec<Value> },
    /// `(c1, c2) IN ((v1, v2), ...)`
    TupleIn {
        columns: Vec<ColumnRef>,
        rows: Vec<Vec<Value>>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn eq(column: ColumnRef, value: impl Into<Value>) -> Self {
        Expr::Eq(column, value.into())
    }

    pub fn in_list(column: ColumnRef, values: Vec<Value>) -> Self {
        Expr::InList { column, values }
    }

    /// Combine with AND, flattening nested conjunctions.
    #[must_use]
    pub fn and(self, other: Expr) -> Self {
        match (self, other) {
            (Expr::And(mut left), Expr::And(right)) => {
                left.extend(right);
                Expr::And(left)
            }
            (Expr::And(mut left), right) => {
                left.push(right);
                Expr::And(left)
            }
            (left, right) => Expr::And(vec![left, right]),
        }
    }

    /// Number of bound values this expression would carry.
    pub fn parameter_count(&self) -> usize {
        match self {
            Expr::Eq(..) => 1,
            Expr::ColumnEq(..) => 0,
            Expr::InList { values, .. } => values.len(),
            Expr::TupleIn { rows, .. } => rows.iter().map(Vec::len).sum(),
            Expr::And(items) | Expr::Or(items) => items.iter().map(Expr::parameter_count).sum(),
        }
    }

    fn write_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }

    fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr], op: &str) -> fmt::Result {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", op)?;
            }
            match item {
                Expr::And(_) | Expr::Or(_) => write!(f, "({})", item)?,
                _ => write!(f, "{}", item)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Eq(col, value) => write!(f, "{} = {}", col, value),
            Expr::ColumnEq(left, right) => write!(f, "{} = {}", left, right),
            Expr::InList { column, values } => {
                write!(f, "{} IN (", column)?;
                Self::write_values(f, values)?;
                write!(f, ")")
            }
            Expr::TupleIn { columns, rows } => {
                write!(f, "(")?;
                for (i, col) in columns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", col)?;
                }
                write!(f, ") IN (")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "(")?;
                    Self::write_values(f, row)?;
                    write!(f, ")")?;
                }
                write!(f, ")")
            }
            Expr::And(items) => Self::write_joined(f, items, "AND"),
            Expr::Or(items) => Self::write_joined(f, items, "OR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_in_support() {
        assert!(Dialect::Postgres.supports_tuple_in());
        assert!(Dialect::Sqlite.supports_tuple_in());
        assert!(!Dialect::Mssql.supports_tuple_in());
        assert!(Dialect::Mssql.max_parameters() < Dialect::Sqlite.max_parameters());
    }

    #[test]
    fn display_nested() {
        let expr = Expr::Or(vec![
            Expr::And(vec![
                Expr::eq(ColumnRef::new("b", "x"), 1_i64),
                Expr::eq(ColumnRef::new("b", "y"), 2_i64),
            ]),
            Expr::in_list(ColumnRef::new("b", "x"), vec![Value::Int(3)]),
        ]);
        assert_eq!(expr.to_string(), "(b.x = 1 AND b.y = 2) OR b.x IN (3)");
        assert_eq!(expr.parameter_count(), 3);
    }

    #[test]
    fn and_flattens() {
        let a = Expr::eq(ColumnRef::new("t", "a"), 1_i64);
        let b = Expr::eq(ColumnRef::new("t", "b"), 2_i64);
        let c = Expr::eq(ColumnRef::new("t", "c"), 3_i64);
        let combined = a.and(b).and(c);
        match combined {
            Expr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn tuple_in_display() {
        let expr = Expr::TupleIn {
            columns: vec![ColumnRef::new("b", "a_id1"), ColumnRef::new("b", "a_id2")],
            rows: vec![
                vec![Value::Int(1), Value::Int(2)],
                vec![Value::Int(3), Value::Int(4)],
            ],
        };
        assert_eq!(expr.to_string(), "(b.a_id1, b.a_id2) IN ((1, 2), (3, 4))");
    }
}
