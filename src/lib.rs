//! Bitmask-specialized SQL statement caching.
//!
//! A query is declared once as a [`QueryDescriptor`]. Each call supplies a
//! bitmask that switches optional filter fragments on or off; the
//! [`StatementCache`] synthesizes one specialized statement per bitmask, binds
//! its placeholders from the calling record through small compiled binding
//! programs, and keeps the prepared statement open while the executor stays
//! reachable.

#![warn(missing_docs)]

pub mod config;
pub mod driver;
pub mod error;
pub mod query;

pub use config::CacheConfig;
pub use error::{BoxError, DriverError, Error, Result};
pub use query::{
    profile::profile_snapshot, CacheStats, Executor, FilterFragment, Flags, QueryDescriptor,
    QueryRecord, Schema, SharedStatementCache, StatementCache, TypeDef, TypeRef, Value,
};
