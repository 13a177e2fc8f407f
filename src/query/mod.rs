#![forbid(unsafe_code)]

//! Bitmask-specialized statement synthesis and caching.
//!
//! A [`QueryDescriptor`] declares one query. For every bitmask a caller
//! supplies, the [`Planner`] synthesizes a [`StatementPlan`], an [`Executor`]
//! binds it to a prepared statement, and the [`StatementCache`] keeps the
//! executor around while it stays useful.

/// Executor cache keyed by bitmask.
///
/// Open-addressing table of weakly held executors with a bounded retention
/// set and a reclamation queue that closes dead executors' statements.
pub mod cache;

/// Directive compiler producing binding programs.
pub mod compiler;

/// Declarative query descriptors and their builder.
pub mod descriptor;

/// Structured compiler and descriptor errors.
pub mod errors;

/// Prepared-statement executors.
///
/// Binds placeholder values, runs the statement and materializes rows.
pub mod executor;

/// SQL synthesis from a descriptor and a bitmask.
pub mod planner;

/// Performance profiling for statement handling.
///
/// Collects timing and count statistics per phase.
pub mod profile;

/// Binding programs and their stack machine.
pub mod program;

/// Member registry for record and side-provider types.
pub mod schema;

/// Values, kinds and the value-type table.
pub mod value;

/// Runtime option bitmask selecting optional query behavior.
pub type Flags = u32;

pub use cache::{CacheStats, SharedStatementCache, StatementCache, StatementCacheBuilder};
pub use descriptor::{ColumnPath, FilterFragment, JoinOn, Pagination, QueryDescriptor, TableRef};
pub use executor::{Executor, QueryRecord, RowProjection};
pub use planner::{BindStep, ColumnRead, Planner, StatementPlan};
pub use schema::{Schema, TypeDef};
pub use value::{classify, BindOp, KindInfo, ReadOp, TypeRef, Value, ValueKind};
