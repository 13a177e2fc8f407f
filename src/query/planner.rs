//! Statement synthesis.
//!
//! Turns a descriptor and one bitmask into a [`StatementPlan`]: the SQL text,
//! the binding program for every placeholder and the read operation for every
//! projected column. The same descriptor and bitmask always produce the same
//! plan.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::trace;
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};
use crate::query::compiler::CompilePass;
use crate::query::descriptor::{alias, QueryDescriptor};
use crate::query::profile::{profile_timer, record_profile_timer, ProfilePhase};
use crate::query::program::Program;
use crate::query::schema::Schema;
use crate::query::value::{BindOp, ReadOp, TypeRef};
use crate::query::Flags;

/// Binding for one placeholder.
#[derive(Clone, Debug)]
pub struct BindStep {
    /// 1-based placeholder index.
    pub index: usize,
    /// Setter chosen from the program's result type.
    pub op: BindOp,
    /// Program producing the value.
    pub program: Program,
}

/// Read operation for one projected column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRead {
    /// 0-based column index.
    pub column: usize,
    /// Getter chosen from the projection's declared type.
    pub op: ReadOp,
    /// Declared type.
    pub kind: TypeRef,
}

/// Everything an executor needs for one bitmask.
#[derive(Clone, Debug)]
pub struct StatementPlan {
    flags: Flags,
    sql: String,
    bindings: Vec<BindStep>,
    columns: Vec<ColumnRead>,
    fingerprint: u64,
}

impl StatementPlan {
    /// Bitmask the plan was synthesized for.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bind steps in placeholder order.
    pub fn bindings(&self) -> &[BindStep] {
        &self.bindings
    }

    /// Column reads in projection order.
    pub fn columns(&self) -> &[ColumnRead] {
        &self.columns
    }

    /// Deterministic hash of the statement text.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Multi-line rendering of the plan for diagnostics.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "flags {:#x} fingerprint {:016x}", self.flags, self.fingerprint);
        let _ = writeln!(out, "  sql: {}", self.sql);
        for step in &self.bindings {
            let _ = writeln!(
                out,
                "  bind ?{} {:?} `{}`: {}",
                step.index,
                step.op,
                step.program.directive(),
                step.program
            );
        }
        for read in &self.columns {
            let _ = writeln!(out, "  read #{} {:?}", read.column, read.op);
        }
        out
    }
}

/// Synthesizes plans for one descriptor.
#[derive(Clone)]
pub struct Planner {
    descriptor: Arc<QueryDescriptor>,
    schema: Arc<Schema>,
    record: TypeRef,
    side: Option<TypeRef>,
}

impl Planner {
    /// Creates a planner. `record` is the type directives start from and
    /// `side` the type `^` dereferences to, if a side provider exists.
    pub fn new(
        descriptor: Arc<QueryDescriptor>,
        schema: Arc<Schema>,
        record: TypeRef,
        side: Option<TypeRef>,
    ) -> Self {
        Self {
            descriptor,
            schema,
            record,
            side,
        }
    }

    /// Descriptor being planned.
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Synthesizes the plan for `flags`.
    pub fn plan(&self, flags: Flags) -> Result<StatementPlan> {
        let timer = profile_timer();
        let descriptor = &*self.descriptor;
        let mut sql = String::from("select ");
        let mut columns = Vec::with_capacity(descriptor.projections().len());
        for (column, projection) in descriptor.projections().iter().enumerate() {
            if column > 0 {
                sql.push_str(", ");
            }
            projection.path.render_into(&mut sql);
            let info = projection.kind.kind().info();
            columns.push(ColumnRead {
                column,
                op: info.hinted_read_op(&projection.kind.hint()),
                kind: projection.kind.clone(),
            });
        }

        sql.push_str(" from ");
        sql.push_str(&descriptor.primary().name);
        for table in &descriptor.tables()[1..] {
            let (Some(letter), Some(join)) = (alias(table.id), table.join.as_ref()) else {
                return Err(Error::fatal(format!(
                    "validated descriptor '{}' has unjoinable table {}",
                    descriptor.name(),
                    table.id
                )));
            };
            sql.push_str(" left outer join ");
            sql.push_str(&table.name);
            sql.push(' ');
            sql.push(letter);
            sql.push_str(" on (");
            if let Some(qualifier) = alias(join.table) {
                sql.push(qualifier);
                sql.push('.');
            }
            sql.push_str(&join.primary);
            sql.push_str(" = ");
            sql.push(letter);
            sql.push('.');
            sql.push_str(&join.secondary);
            sql.push(')');
        }

        let mut pass = CompilePass::new(&self.schema, self.record.clone(), self.side.clone());
        let mut bindings = Vec::new();
        let mut joiner = " where ";
        for fragment in descriptor.filters().iter().filter(|f| f.applies(flags)) {
            sql.push_str(joiner);
            sql.push_str(&fragment.query);
            joiner = " and ";
            for directive in &fragment.values {
                compile_step(&mut pass, &mut bindings, flags, &sql, directive, || {
                    format!("fragment `{}` value `{directive}`", fragment.query)
                })?;
            }
        }

        let pagination = descriptor.pagination();
        if let Some(sort) = &pagination.sort {
            sql.push_str(" order by ");
            sort.render_into(&mut sql);
            sql.push_str(" desc");
        }
        if let Some(limit) = &pagination.limit {
            sql.push_str(" limit ?");
            compile_step(&mut pass, &mut bindings, flags, &sql, limit, || {
                format!("limit `{limit}`")
            })?;
        }
        if let Some(offset) = &pagination.offset {
            sql.push_str(" offset ?");
            compile_step(&mut pass, &mut bindings, flags, &sql, offset, || {
                format!("offset `{offset}`")
            })?;
        }

        let fingerprint = xxh64(sql.as_bytes(), 0);
        trace!(
            query = descriptor.name(),
            flags,
            fingerprint = format_args!("{fingerprint:016x}"),
            sql = %sql,
            "planner.plan"
        );
        record_profile_timer(ProfilePhase::Synthesize, timer);
        Ok(StatementPlan {
            flags,
            sql,
            bindings,
            columns,
            fingerprint,
        })
    }
}

fn compile_step(
    pass: &mut CompilePass<'_>,
    bindings: &mut Vec<BindStep>,
    flags: Flags,
    sql: &str,
    directive: &str,
    element: impl FnOnce() -> String,
) -> Result<()> {
    let program = pass.compile(directive).map_err(|source| Error::Synthesis {
        flags,
        sql: sql.to_owned(),
        element: element(),
        source,
    })?;
    bindings.push(BindStep {
        index: bindings.len() + 1,
        op: program.result().kind().info().bind_op,
        program,
    });
    Ok(())
}
