//! The row-source collaborator.
//!
//! A [`RowSource`] compiles and executes a [`SelectQuery`] against a real
//! backend. Drivers own dialect rendering, parameter binding and the wire
//! protocol; the loading engine only builds statement specifications and
//! reads back labeled rows.

use crate::expr::Dialect;
use crate::select::SelectQuery;
use asupersync::{Cx, Outcome};
use selectin_core::{Error, Row};
use std::future::Future;

/// Executes statement specifications and returns labeled rows.
///
/// Every returned [`Row`] must expose each select-list entry under its
/// `label`. Row order must follow `order_by`; rows that tie may come back in
/// any order.
///
/// One load issues its statements strictly one after another on the same
/// source, never concurrently.
pub trait RowSource: Send + Sync {
    /// Capabilities of the backend this source talks to.
    fn dialect(&self) -> Dialect;

    /// Execute a SELECT and return all rows.
    fn fetch(
        &self,
        cx: &Cx,
        query: &SelectQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;
}

impl<S: RowSource> RowSource for &S {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn fetch(
        &self,
        cx: &Cx,
        query: &SelectQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        (**self).fetch(cx, query)
    }
}
