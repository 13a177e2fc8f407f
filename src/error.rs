use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;
use crate::query::errors::{CompileError, DescriptorError};
use crate::query::Flags;

/// Boxed error returned by host callbacks (getters, methods, row projections).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a connection provider or prepared statement.
#[derive(Debug, Error)]
pub enum DriverError {
    /// SQLite reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The statement was closed before use.
    #[error("statement closed")]
    Closed,
    /// The driver cannot bind this value with the requested setter.
    #[error("cannot bind {value} with {op}")]
    UnsupportedBind {
        /// Setter that was requested.
        op: String,
        /// Rendered value.
        value: String,
    },
    /// Row visitation stopped early at the caller's request.
    #[error("row visitation aborted")]
    Aborted,
    /// Any other driver failure.
    #[error("{0}")]
    Other(BoxError),
}

impl DriverError {
    /// Wraps an arbitrary message or error.
    pub fn other(err: impl Into<BoxError>) -> Self {
        DriverError::Other(err.into())
    }
}

/// Top-level error for descriptor synthesis, execution and cache management.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed descriptor; never retried.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    /// A directive failed to compile for this bitmask.
    #[error("synthesis failed for flags {flags:#x} at {element}: {source}\n - sql so far: {sql}")]
    Synthesis {
        /// Bitmask being synthesized.
        flags: Flags,
        /// SQL text assembled before the failure.
        sql: String,
        /// Fragment or directive that triggered the failure.
        element: String,
        /// Underlying compiler error.
        #[source]
        source: CompileError,
    },
    /// Prepare, bind, execute or close failed.
    #[error("failed to {action} statement for flags {flags:#x}: {source}\n - sql: {sql}")]
    Resource {
        /// Bitmask of the owning executor.
        flags: Flags,
        /// Statement text.
        sql: String,
        /// What was being attempted.
        action: &'static str,
        /// Driver failure.
        #[source]
        source: DriverError,
    },
    /// A binding program callback failed at run time.
    #[error("evaluating `{directive}` for flags {flags:#x} failed: {reason}")]
    Evaluation {
        /// Bitmask of the owning executor.
        flags: Flags,
        /// Directive being evaluated.
        directive: String,
        /// Failure description.
        reason: String,
    },
    /// The row projection callback rejected a row.
    #[error("row projection failed for flags {flags:#x} at row {row}: {source}")]
    Projection {
        /// Bitmask of the owning executor.
        flags: Flags,
        /// Zero-based row number.
        row: usize,
        /// Callback error.
        #[source]
        source: BoxError,
    },
    /// Several statements failed to close during reload.
    #[error("issues closing {} prepared statement(s)", .failures.len())]
    Aggregate {
        /// Individual close failures.
        failures: Vec<Error>,
    },
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An internal invariant was violated; retrying is meaningless.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Descriptor(err) => err.code(),
            Error::Synthesis { source, .. } => source.code(),
            Error::Resource { .. } => "Resource",
            Error::Evaluation { .. } => "Evaluation",
            Error::Projection { .. } => "Projection",
            Error::Aggregate { .. } => "Aggregate",
            Error::Config(_) => "Config",
            Error::Fatal(_) => "Fatal",
        }
    }

    /// Whether this error signals a broken internal invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Builds a [`Error::Fatal`], logging it on the way out.
    pub(crate) fn fatal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(%message, "maskql.fatal");
        Error::Fatal(message)
    }
}
