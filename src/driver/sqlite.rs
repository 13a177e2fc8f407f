//! SQLite implementation of the driver contracts.
//!
//! All connections handed out by one [`SqliteProvider`] share a single
//! `rusqlite` connection behind a mutex. Statements keep their text and
//! bound parameters and run through the connection's statement cache.
//!
//! Closing a statement flushes that cache, finalizing every compiled
//! statement it holds. Statements still open recompile on their next
//! execution. A cache holding more distinct SQL texts than the connection's
//! cache capacity recompiles the least recently used ones the same way.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::OptionalExtension as _;

use crate::driver::{Connection, ConnectionProvider, PreparedStatement, ResultRow};
use crate::error::DriverError;
use crate::query::value::{BindOp, ReadOp, Value};

/// Connection provider backed by one shared SQLite connection.
#[derive(Clone)]
pub struct SqliteProvider {
    conn: Arc<Mutex<rusqlite::Connection>>,
    fetch_size: usize,
}

impl SqliteProvider {
    /// Wraps an open connection.
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            fetch_size: 0,
        }
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DriverError> {
        Ok(Self::new(rusqlite::Connection::open_in_memory()?))
    }

    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self::new(conn))
    }

    /// Row-count hint reported by prepared statements.
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    /// Runs `f` against the underlying connection, e.g. for schema setup.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DriverError> {
        let conn = self.conn.lock();
        Ok(f(&*conn)?)
    }
}

impl ConnectionProvider for SqliteProvider {
    type Connection = SqliteConnection;

    fn acquire(&self) -> Result<SqliteConnection, DriverError> {
        Ok(SqliteConnection {
            conn: Arc::clone(&self.conn),
            fetch_size: self.fetch_size,
        })
    }
}

/// Handle on the provider's shared connection.
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    fetch_size: usize,
}

impl Connection for SqliteConnection {
    type Statement = SqliteStatement;

    fn prepare(&self, sql: &str) -> Result<SqliteStatement, DriverError> {
        {
            // Compiles the statement once and parks it in the connection's
            // statement cache for `execute`.
            let conn = self.conn.lock();
            conn.prepare_cached(sql)?;
        }
        Ok(SqliteStatement {
            conn: Arc::clone(&self.conn),
            sql: sql.into(),
            params: Vec::new(),
            fetch_size: self.fetch_size,
            closed: false,
        })
    }
}

/// Statement prepared through [`SqliteConnection`].
pub struct SqliteStatement {
    conn: Arc<Mutex<rusqlite::Connection>>,
    sql: Arc<str>,
    params: Vec<SqlValue>,
    fetch_size: usize,
    closed: bool,
}

impl SqliteStatement {
    /// Statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether [`PreparedStatement::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PreparedStatement for SqliteStatement {
    fn bind(&mut self, index: usize, op: BindOp, value: &Value) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let converted = to_sql(op, value)?;
        if index == 0 {
            return Err(DriverError::other(format!("placeholder index 0 in `{}`", self.sql)));
        }
        if self.params.len() < index {
            self.params.resize(index, SqlValue::Null);
        }
        self.params[index - 1] = converted;
        Ok(())
    }

    fn execute(
        &mut self,
        visit: &mut dyn FnMut(&dyn ResultRow) -> Result<(), DriverError>,
    ) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&self.sql)?;
        for (i, param) in self.params.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, param)?;
        }
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            visit(&SqliteRow(row))?;
        }
        Ok(())
    }

    fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.params.clear();
        self.conn.lock().flush_prepared_statement_cache();
        Ok(())
    }
}

fn to_sql(op: BindOp, value: &Value) -> Result<SqlValue, DriverError> {
    let unsupported = || DriverError::UnsupportedBind {
        op: format!("{op:?}"),
        value: format!("{value:?}"),
    };
    if op != BindOp::SetObject && !value.is_null() && value.kind().info().bind_op != op {
        return Err(unsupported());
    }
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
        Value::Byte(v) => SqlValue::Integer(i64::from(*v)),
        Value::Short(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int(v) => SqlValue::Integer(i64::from(*v)),
        Value::Long(v) | Value::Timestamp(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(f64::from(*v)),
        Value::Double(v) => SqlValue::Real(*v),
        Value::String(v) => SqlValue::Text(v.clone()),
        Value::Bytes(v) => SqlValue::Blob(v.clone()),
        Value::Object(_) => return Err(unsupported()),
    })
}

struct SqliteRow<'r, 's>(&'r rusqlite::Row<'s>);

impl SqliteRow<'_, '_> {
    fn get<T: rusqlite::types::FromSql>(
        &self,
        column: usize,
        wrap: impl FnOnce(T) -> Value,
    ) -> Result<Value, DriverError> {
        Ok(self.0.get::<_, Option<T>>(column)?.map_or(Value::Null, wrap))
    }
}

impl ResultRow for SqliteRow<'_, '_> {
    fn read(&self, column: usize, op: &ReadOp) -> Result<Value, DriverError> {
        match op {
            ReadOp::GetBool => self.get(column, Value::Bool),
            ReadOp::GetByte => self.get(column, Value::Byte),
            ReadOp::GetShort => self.get(column, Value::Short),
            ReadOp::GetInt => self.get(column, Value::Int),
            ReadOp::GetLong => self.get(column, Value::Long),
            ReadOp::GetFloat => self.get(column, Value::Float),
            ReadOp::GetDouble => self.get(column, Value::Double),
            ReadOp::GetString => self.get(column, Value::String),
            ReadOp::GetTimestamp => self.get(column, Value::Timestamp),
            ReadOp::GetBinaryStream => self.get(column, Value::Bytes),
            ReadOp::GetObject { .. } => Ok(match self.0.get_ref(column)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Long(v),
                ValueRef::Real(v) => Value::Double(v),
                ValueRef::Text(v) => Value::String(String::from_utf8_lossy(v).into_owned()),
                ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
            }),
        }
    }
}

/// Reads a single optional value, for setup and assertions.
pub fn query_scalar(
    provider: &SqliteProvider,
    sql: &str,
) -> Result<Option<i64>, DriverError> {
    provider.with_connection(|conn| {
        conn.query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
            .optional()
            .map(Option::flatten)
    })
}
