//! Prepared-statement executors.

use std::any::Any;
use std::sync::mpsc::{SendError, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::driver::{Connection, ConnectionProvider, PreparedStatement};
use crate::error::{BoxError, DriverError, Error, Result};
use crate::query::planner::StatementPlan;
use crate::query::profile::{profile_timer, record_profile_timer, ProfilePhase};
use crate::query::program::{BindEnv, EvalError, Frame};
use crate::query::value::Value;
use crate::query::Flags;

/// Input record handled by a [`StatementCache`](crate::query::StatementCache).
///
/// The record is also the root every directive resolves identifiers against,
/// so its type must be registered in the cache's schema.
pub trait QueryRecord: Any + Send + Sync {
    /// Row type produced by the cache's projection.
    type Output: Send + 'static;

    /// Bitmask selecting optional filters for this call.
    fn flags(&self) -> Flags;

    /// Receives every projected row. Called exactly once per handled record.
    fn complete(&self, rows: Vec<Self::Output>);
}

/// Converts the column values of one row into an output value.
pub type RowProjection<O> = Arc<dyn Fn(&[Value]) -> std::result::Result<O, BoxError> + Send + Sync>;

pub(crate) type StatementOf<P> =
    <<P as ConnectionProvider>::Connection as Connection>::Statement;

/// The prepared statement owned by one executor.
///
/// Shared between the executor and its cache slot so the statement can be
/// closed even after the executor is gone. Closing is idempotent; a closed
/// handle prepares again on next use.
pub(crate) struct StatementHandle<P: ConnectionProvider> {
    flags: Flags,
    sql: Arc<str>,
    statement: Mutex<Option<StatementOf<P>>>,
}

impl<P: ConnectionProvider> StatementHandle<P> {
    pub(crate) fn new(flags: Flags, sql: &str) -> Self {
        Self {
            flags,
            sql: Arc::from(sql),
            statement: Mutex::new(None),
        }
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.statement.lock().is_some()
    }

    fn resource_error(&self, action: &'static str) -> impl FnOnce(DriverError) -> Error + '_ {
        move |source| Error::Resource {
            flags: self.flags,
            sql: self.sql.to_string(),
            action,
            source,
        }
    }

    fn ensure<'a>(
        &self,
        slot: &'a mut Option<StatementOf<P>>,
        provider: &P,
    ) -> Result<&'a mut StatementOf<P>> {
        if slot.is_none() {
            let timer = profile_timer();
            let statement = provider
                .acquire()
                .and_then(|conn| conn.prepare(&self.sql))
                .map_err(self.resource_error("prepare"))?;
            record_profile_timer(ProfilePhase::Prepare, timer);
            debug!(flags = self.flags, sql = %self.sql, "executor.prepare");
            *slot = Some(statement);
        }
        slot.as_mut()
            .ok_or_else(|| Error::fatal("statement vanished after prepare"))
    }

    /// Closes the statement if one is open. Returns whether anything closed.
    pub(crate) fn close(&self) -> Result<bool> {
        let Some(mut statement) = self.statement.lock().take() else {
            return Ok(false);
        };
        statement.close().map_err(self.resource_error("close"))?;
        Ok(true)
    }
}

impl<P: ConnectionProvider> Drop for StatementHandle<P> {
    fn drop(&mut self) {
        if let Some(mut statement) = self.statement.get_mut().take() {
            if let Err(err) = statement.close() {
                warn!(flags = self.flags, error = %err, "executor.close_on_drop");
            }
        }
    }
}

/// Notice posted when an executor's last strong reference drops.
pub(crate) struct Reclaimed<P: ConnectionProvider> {
    pub flags: Flags,
    pub generation: u64,
    pub handle: Arc<StatementHandle<P>>,
}

/// A synthesized plan bound to a prepared statement.
pub struct Executor<R: QueryRecord, P: ConnectionProvider> {
    generation: u64,
    plan: StatementPlan,
    handle: Arc<StatementHandle<P>>,
    provider: Arc<P>,
    projection: RowProjection<R::Output>,
    side: Option<Value>,
    reclaim: Sender<Reclaimed<P>>,
}

impl<R: QueryRecord, P: ConnectionProvider> std::fmt::Debug for Executor<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("generation", &self.generation)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl<R: QueryRecord, P: ConnectionProvider> Executor<R, P> {
    pub(crate) fn new(
        generation: u64,
        plan: StatementPlan,
        provider: Arc<P>,
        projection: RowProjection<R::Output>,
        side: Option<Value>,
        reclaim: Sender<Reclaimed<P>>,
    ) -> Self {
        let handle = Arc::new(StatementHandle::new(plan.flags(), plan.sql()));
        Self {
            generation,
            plan,
            handle,
            provider,
            projection,
            side,
            reclaim,
        }
    }

    /// Bitmask this executor serves.
    pub fn flags(&self) -> Flags {
        self.plan.flags()
    }

    /// Synthesized plan.
    pub fn plan(&self) -> &StatementPlan {
        &self.plan
    }

    /// Statement text.
    pub fn sql(&self) -> &str {
        self.plan.sql()
    }

    /// Whether a prepared statement is currently open.
    pub fn is_prepared(&self) -> bool {
        self.handle.is_prepared()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn handle(&self) -> &Arc<StatementHandle<P>> {
        &self.handle
    }

    /// Prepares the statement unless it is already open.
    pub fn prepare(&self) -> Result<()> {
        let mut slot = self.handle.statement.lock();
        self.handle.ensure(&mut slot, &self.provider)?;
        Ok(())
    }

    /// Evaluates every binding program for `record`, in placeholder order.
    pub fn bind_values(&self, record: &Arc<R>) -> Result<Vec<Value>> {
        let record_value = Value::Object(Arc::clone(record) as Arc<dyn Any + Send + Sync>);
        let env = BindEnv {
            record: &record_value,
            side: self.side.as_ref(),
        };
        let mut frame = Frame::default();
        self.plan
            .bindings()
            .iter()
            .map(|step| {
                step.program
                    .eval(&env, &mut frame)
                    .map_err(|err| self.evaluation_error(step.program.directive(), err))
            })
            .collect()
    }

    fn evaluation_error(&self, directive: &str, err: EvalError) -> Error {
        match err {
            EvalError::Internal(message) => Error::fatal(format!(
                "flags {:#x} directive `{directive}`: {message}",
                self.flags()
            )),
            other => Error::Evaluation {
                flags: self.flags(),
                directive: directive.to_owned(),
                reason: other.to_string(),
            },
        }
    }

    /// Binds, executes and materializes rows for `record`, then completes it.
    ///
    /// The projection runs once per row; `complete` runs once, only on
    /// success.
    pub fn query(&self, record: &Arc<R>) -> Result<()> {
        let bind_timer = profile_timer();
        let values = self.bind_values(record)?;
        let flags = self.flags();
        let mut rows = Vec::new();
        {
            let mut slot = self.handle.statement.lock();
            let statement = self.handle.ensure(&mut slot, &self.provider)?;
            for (step, value) in self.plan.bindings().iter().zip(&values) {
                statement
                    .bind(step.index, step.op, value)
                    .map_err(self.handle.resource_error("bind"))?;
            }
            record_profile_timer(ProfilePhase::Bind, bind_timer);

            let execute_timer = profile_timer();
            rows.reserve(statement.fetch_size());
            let columns = self.plan.columns();
            let mut failure = None;
            let result = statement.execute(&mut |row| {
                let mut values: SmallVec<[Value; 8]> = SmallVec::with_capacity(columns.len());
                for read in columns {
                    values.push(row.read(read.column, &read.op)?);
                }
                match (self.projection)(&values) {
                    Ok(output) => {
                        rows.push(output);
                        Ok(())
                    }
                    Err(source) => {
                        failure = Some(Error::Projection {
                            flags,
                            row: rows.len(),
                            source,
                        });
                        Err(DriverError::Aborted)
                    }
                }
            });
            if let Some(err) = failure {
                return Err(err);
            }
            result.map_err(self.handle.resource_error("execute"))?;
            record_profile_timer(ProfilePhase::Execute, execute_timer);
        }
        debug!(
            flags,
            rows = rows.len(),
            fingerprint = %format_args!("{:016x}", self.plan.fingerprint()),
            "executor.query"
        );
        let materialize_timer = profile_timer();
        record.complete(rows);
        record_profile_timer(ProfilePhase::Materialize, materialize_timer);
        Ok(())
    }
}

impl<R: QueryRecord, P: ConnectionProvider> Drop for Executor<R, P> {
    fn drop(&mut self) {
        let notice = Reclaimed {
            flags: self.plan.flags(),
            generation: self.generation,
            handle: Arc::clone(&self.handle),
        };
        if let Err(SendError(notice)) = self.reclaim.send(notice) {
            // Cache is gone; nobody will drain the notice.
            if let Err(err) = notice.handle.close() {
                warn!(flags = notice.flags, error = %err, "executor.reclaim");
            }
        }
    }
}
