#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use maskql::{CacheConfig, Error, FilterFragment, QueryDescriptor, StatementCache, TypeRef};

fn recording(config: CacheConfig) -> (StatementCache<EventQuery, RecordingProvider>, Arc<Counters>) {
    init_tracing();
    let provider = RecordingProvider::new(seeded_sqlite());
    let counters = Arc::clone(&provider.counters);
    let cache = event_cache(Arc::new(provider), Directory::new(10), config);
    (cache, counters)
}

#[test]
fn repeated_flags_synthesize_once() {
    let (mut cache, counters) = recording(CacheConfig::default());
    for _ in 0..5 {
        let record = EventQuery::new(BY_TARGET);
        cache.handle(Arc::clone(&record)).expect("handle");
        assert_eq!(record.ids(), vec![3, 1]);
        assert_eq!(record.completions(), 1);
    }
    let stats = cache.stats();
    assert_eq!(stats.syntheses, 1);
    assert_eq!(stats.hits, 4);
    assert_eq!(counters.prepares(), 1);
    assert_eq!(counters.closes(), 0);
}

#[test]
fn colliding_flags_double_capacity_until_distinct() {
    let (mut cache, _) = recording(config(16, 1 << 10, 8));
    let pinned: Vec<_> = [0, 16, 32, 48]
        .into_iter()
        .map(|flags| cache.executor(flags).expect("executor"))
        .collect();
    let stats = cache.stats();
    assert_eq!(stats.capacity, 64);
    assert_eq!(stats.occupied, 4);
    assert_eq!(stats.resizes, 2);
    for executor in &pinned {
        let again = cache.executor(executor.flags()).expect("hit");
        assert!(Arc::ptr_eq(executor, &again));
    }
    assert_eq!(cache.stats().syntheses, 4);
}

#[test]
fn dropped_executor_is_closed_once_then_resynthesized() {
    let (mut cache, counters) = recording(config(16, 16, 0));
    let executor = cache.executor(BY_TARGET).expect("executor");
    assert!(executor.is_prepared());
    assert_eq!(counters.prepares(), 1);
    drop(executor);
    assert_eq!(counters.closes(), 0, "closing waits for the next drain");

    let executor = cache.executor(BY_TARGET).expect("resynthesized");
    assert_eq!(counters.closes(), 1);
    assert_eq!(counters.prepares(), 2);
    let stats = cache.stats();
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.syntheses, 2);
    assert_eq!(stats.occupied, 1);

    drop(executor);
    drop(cache);
    assert_eq!(counters.open(), 0);
    assert_eq!(counters.double_closes.load(Ordering::SeqCst), 0);
}

#[test]
fn retention_keeps_most_recent_executors() {
    let (mut cache, counters) = recording(config(16, 16, 1));
    drop(cache.executor(BY_TARGET).expect("target"));
    drop(cache.executor(BY_KIND).expect("kind"));
    assert_eq!(counters.closes(), 0);

    drop(cache.executor(BY_KIND).expect("still retained"));
    assert_eq!(cache.stats().hits, 1);

    drop(cache.executor(BY_TARGET).expect("target again"));
    let stats = cache.stats();
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.syntheses, 3);
    assert_eq!(counters.closes(), 1);
}

#[test]
fn reload_closes_everything_and_reports_failures() {
    let (mut cache, counters) = recording(CacheConfig::default());
    let target = cache.executor(BY_TARGET).expect("target");
    let kind = cache.executor(BY_KIND).expect("kind");

    cache.reload().expect("clean reload");
    assert_eq!(counters.closes(), 2);
    assert!(!target.is_prepared());

    let record = EventQuery::new(BY_TARGET);
    cache.handle(Arc::clone(&record)).expect("prepares again");
    assert_eq!(record.ids(), vec![3, 1]);
    kind.prepare().expect("prepare");
    assert_eq!(counters.prepares(), 4);

    counters.fail_close.store(true, Ordering::SeqCst);
    let err = cache.reload().expect_err("close failures");
    assert_eq!(err.code(), "Aggregate");
    match err {
        Error::Aggregate { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().all(|f| f.code() == "Resource"));
        }
        other => panic!("unexpected {other:?}"),
    }
    counters.fail_close.store(false, Ordering::SeqCst);
    assert_eq!(counters.open(), 0);
    assert!(cache.reload().is_ok(), "nothing left to close");
    assert_eq!(cache.stats().occupied, 2);
}

#[test]
fn cap_evicts_resident_and_closes_its_statement() {
    let (mut cache, counters) = recording(config(16, 16, 4));
    let resident = cache.executor(3).expect("resident");
    let newcomer = cache.executor(19).expect("newcomer");
    let stats = cache.stats();
    assert_eq!(stats.capacity, 16);
    assert_eq!(stats.evictions, 1);
    assert_eq!(counters.closes(), 1);
    assert!(!resident.is_prepared());
    assert!(newcomer.is_prepared());

    let record = EventQuery::new(3);
    resident.query(&record).expect("evicted executor still runs");
    assert_eq!(record.ids(), vec![3, 1]);
    assert_eq!(counters.prepares(), 3);

    drop(resident);
    drop(newcomer);
    drop(cache);
    assert_eq!(counters.open(), 0);
    assert_eq!(counters.double_closes.load(Ordering::SeqCst), 0);
}

#[test]
fn reload_and_drop_close_evicted_executors_still_held() {
    let (mut cache, counters) = recording(config(16, 16, 0));
    let resident = cache.executor(3).expect("resident");
    let newcomer = cache.executor(19).expect("newcomer");
    resident.prepare().expect("prepares again after eviction");
    assert_eq!(counters.open(), 2);

    cache.reload().expect("reload");
    assert_eq!(counters.open(), 0);
    assert!(!resident.is_prepared());
    assert!(!newcomer.is_prepared());

    let record = EventQuery::new(3);
    resident.query(&record).expect("evicted executor still runs");
    assert_eq!(counters.open(), 1);
    drop(cache);
    assert_eq!(counters.open(), 0, "dropping the cache closes evicted statements");
    assert!(!resident.is_prepared());

    drop(resident);
    drop(newcomer);
    assert_eq!(counters.double_closes.load(Ordering::SeqCst), 0);
}

#[test]
fn executor_outliving_cache_closes_itself() {
    let (mut cache, counters) = recording(CacheConfig::default());
    let executor = cache.executor(BY_KIND).expect("executor");
    drop(cache);
    assert_eq!(counters.open(), 0);
    assert!(!executor.is_prepared());

    let record = EventQuery::new(BY_KIND);
    executor.query(&record).expect("re-prepares");
    assert_eq!(record.ids(), vec![5, 4, 3, 1]);
    assert_eq!(counters.open(), 1);
    drop(executor);
    assert_eq!(counters.open(), 0);
}

#[test]
fn lazy_preparation_waits_for_first_query() {
    let mut lazy = CacheConfig::compact();
    lazy.prepare_eagerly = false;
    let (mut cache, counters) = recording(lazy);
    let executor = cache.executor(BY_TARGET).expect("executor");
    assert!(!executor.is_prepared());
    assert_eq!(counters.prepares(), 0);
    cache.handle(EventQuery::new(BY_TARGET)).expect("handle");
    assert_eq!(counters.prepares(), 1);
}

#[test]
fn failed_synthesis_leaves_no_slot() {
    init_tracing();
    let provider = RecordingProvider::new(seeded_sqlite());
    let counters = Arc::clone(&provider.counters);
    let descriptor = QueryDescriptor::builder("events")
        .from("events")
        .select(0, "id", TypeRef::LONG)
        .filter(FilterFragment::new(1, "ts > ?", ["since"]))
        .build()
        .expect("descriptor");
    let mut cache = StatementCache::<EventQuery, RecordingProvider>::builder(provider, descriptor)
        .schema(schema())
        .record_type("EventQuery")
        .project(project_event_id)
        .build()
        .expect("cache");

    let err = cache.executor(1).expect_err("unknown field");
    assert_eq!(err.code(), "UnresolvedIdentifier");
    assert!(matches!(err, Error::Synthesis { flags: 1, .. }));
    assert_eq!(cache.stats().occupied, 0);
    assert_eq!(counters.prepares(), 0);

    cache.executor(0).expect("unfiltered plan compiles");
    assert_eq!(cache.stats().occupied, 1);
}

fn project_event_id(values: &[maskql::Value]) -> Result<EventRow, maskql::BoxError> {
    Ok(EventRow {
        id: values[0].as_i64().ok_or("id is not an integer")?,
        user: None,
        team: None,
    })
}
