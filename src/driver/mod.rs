//! Contracts for the SQL connection layer.
//!
//! The cache never talks to a database directly. A [`ConnectionProvider`]
//! hands out connections, connections prepare statements, and prepared
//! statements bind, execute and close. [`sqlite`] implements the contracts on
//! top of `rusqlite`.

use crate::error::DriverError;
use crate::query::value::{BindOp, ReadOp, Value};

pub mod sqlite;

/// Source of connections.
pub trait ConnectionProvider: Send + Sync {
    /// Connection handle produced by [`ConnectionProvider::acquire`].
    type Connection: Connection;

    /// Acquires a connection.
    fn acquire(&self) -> Result<Self::Connection, DriverError>;
}

/// A connection able to prepare statements.
pub trait Connection {
    /// Prepared statement type.
    type Statement: PreparedStatement;

    /// Prepares `sql`. The returned statement owns whatever it needs to run
    /// after the connection handle is dropped.
    fn prepare(&self, sql: &str) -> Result<Self::Statement, DriverError>;
}

/// A prepared statement resource.
pub trait PreparedStatement: Send {
    /// Binds `value` to the 1-based placeholder `index` using `op`.
    fn bind(&mut self, index: usize, op: BindOp, value: &Value) -> Result<(), DriverError>;

    /// Runs the statement with the current bindings, visiting rows in order.
    /// A visitor error stops iteration and is returned unchanged.
    fn execute(
        &mut self,
        visit: &mut dyn FnMut(&dyn ResultRow) -> Result<(), DriverError>,
    ) -> Result<(), DriverError>;

    /// Expected row count, used to pre-size result vectors.
    fn fetch_size(&self) -> usize {
        0
    }

    /// Releases the statement.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// One row of a result set.
pub trait ResultRow {
    /// Reads the 0-based `column` with `op`.
    fn read(&self, column: usize, op: &ReadOp) -> Result<Value, DriverError>;
}
