use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of statement profiling metrics.
///
/// Profiling is enabled via the `MASKQL_PROFILE` environment variable and
/// tracks the time spent in each phase of handling a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementProfileSnapshot {
    /// Total nanoseconds spent synthesizing statement plans.
    pub synthesize_ns: u64,
    /// Number of syntheses.
    pub synthesize_count: u64,
    /// Total nanoseconds spent preparing statements.
    pub prepare_ns: u64,
    /// Number of prepares.
    pub prepare_count: u64,
    /// Total nanoseconds spent evaluating binding programs and binding values.
    pub bind_ns: u64,
    /// Number of bind passes.
    pub bind_count: u64,
    /// Total nanoseconds spent executing statements and reading rows.
    pub execute_ns: u64,
    /// Number of executions.
    pub execute_count: u64,
    /// Total nanoseconds spent projecting rows and completing records.
    pub materialize_ns: u64,
    /// Number of completed records.
    pub materialize_count: u64,
}

#[derive(Default)]
struct PhaseCounters {
    synthesize_ns: AtomicU64,
    synthesize_count: AtomicU64,
    prepare_ns: AtomicU64,
    prepare_count: AtomicU64,
    bind_ns: AtomicU64,
    bind_count: AtomicU64,
    execute_ns: AtomicU64,
    execute_count: AtomicU64,
    materialize_ns: AtomicU64,
    materialize_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<PhaseCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("MASKQL_PROFILE").is_some())
}

fn counters() -> Option<&'static PhaseCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(PhaseCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum ProfilePhase {
    Synthesize,
    Prepare,
    Bind,
    Execute,
    Materialize,
}

pub(crate) fn record_profile_timer(kind: ProfilePhase, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        ProfilePhase::Synthesize => (&counters.synthesize_ns, &counters.synthesize_count),
        ProfilePhase::Prepare => (&counters.prepare_ns, &counters.prepare_count),
        ProfilePhase::Bind => (&counters.bind_ns, &counters.bind_count),
        ProfilePhase::Execute => (&counters.execute_ns, &counters.execute_count),
        ProfilePhase::Materialize => (&counters.materialize_ns, &counters.materialize_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current profiling metrics.
///
/// Returns `None` when `MASKQL_PROFILE` is unset. With `reset`, counters are
/// zeroed as they are read.
///
/// ```no_run
/// use maskql::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(false) {
///     println!("prepared {} statement(s)", snapshot.prepare_count);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<StatementProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(StatementProfileSnapshot {
        synthesize_ns: load(&counters.synthesize_ns),
        synthesize_count: load(&counters.synthesize_count),
        prepare_ns: load(&counters.prepare_ns),
        prepare_count: load(&counters.prepare_count),
        bind_ns: load(&counters.bind_ns),
        bind_count: load(&counters.bind_count),
        execute_ns: load(&counters.execute_ns),
        execute_count: load(&counters.execute_count),
        materialize_ns: load(&counters.materialize_ns),
        materialize_count: load(&counters.materialize_count),
    })
}
