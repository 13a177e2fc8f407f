#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use common::*;
use maskql::driver::sqlite::{query_scalar, SqliteProvider};
use maskql::{
    CacheConfig, Error, FilterFragment, QueryDescriptor, SharedStatementCache, StatementCache,
    TypeDef, TypeRef, Value,
};

fn cache(target: i64) -> (StatementCache<EventQuery, SqliteProvider>, Arc<Directory>) {
    init_tracing();
    let directory = Directory::new(target);
    let cache = event_cache(
        Arc::new(seeded_sqlite()),
        Arc::clone(&directory),
        CacheConfig::default(),
    );
    (cache, directory)
}

#[test]
fn unfiltered_query_returns_joined_rows_newest_first() {
    let (mut cache, _) = cache(10);
    let record = EventQuery::new(0);
    cache.handle(Arc::clone(&record)).expect("handle");
    assert_eq!(record.completions(), 1);
    let rows = record.rows.lock().clone().expect("rows");
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![6, 5, 4, 3, 2, 1]);
    assert_eq!(
        rows[0],
        EventRow {
            id: 6,
            user: None,
            team: None
        }
    );
    assert_eq!(rows[2].user.as_deref(), Some("kim"));
    assert_eq!(rows[2].team, None);
    assert_eq!(rows[3].team.as_deref(), Some("core"));
}

#[test]
fn bitmask_selects_filters() {
    let (mut cache, _) = cache(10);
    let by_target = EventQuery::new(BY_TARGET);
    cache.handle(Arc::clone(&by_target)).expect("target");
    assert_eq!(by_target.ids(), vec![3, 1]);

    let by_kind = EventQuery::new(BY_KIND);
    cache.handle(Arc::clone(&by_kind)).expect("kind");
    assert_eq!(by_kind.ids(), vec![5, 4, 3, 1]);

    let both = EventQuery::new(BY_TARGET | BY_KIND);
    cache.handle(Arc::clone(&both)).expect("both");
    assert_eq!(both.ids(), vec![3, 1]);
    assert_eq!(cache.stats().syntheses, 3);
}

#[test]
fn paging_binds_limit_then_offset() {
    let (mut cache, _) = cache(10);
    let page = EventQuery::paged(0, 2, 1);
    cache.handle(Arc::clone(&page)).expect("page");
    assert_eq!(page.ids(), vec![5, 4]);
    let executor = cache.executor(0).expect("executor");
    assert!(executor
        .sql()
        .ends_with(" order by ts desc limit ? offset ?"));
}

#[test]
fn reused_local_calls_side_provider_once_per_query() {
    let (mut cache, directory) = cache(10);
    let record = EventQuery::new(BY_KIND_LOOKUP);
    cache.handle(Arc::clone(&record)).expect("lookup");
    assert_eq!(record.ids(), vec![3, 1]);
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);

    let again = EventQuery::new(BY_KIND_LOOKUP);
    cache.handle(Arc::clone(&again)).expect("lookup again");
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);

    let executor = cache.executor(BY_KIND_LOOKUP).expect("executor");
    let programs: Vec<String> = executor
        .plan()
        .bindings()
        .iter()
        .map(|step| step.program.to_string())
        .collect();
    assert_eq!(programs[1], "load_local 0");
}

#[test]
fn generated_sql_matches_descriptor() {
    let (mut cache, _) = cache(10);
    let executor = cache.executor(BY_TARGET).expect("executor");
    assert_eq!(
        executor.sql(),
        "select id, a.name, b.label from events \
         left outer join users a on (user_id = a.uid) \
         left outer join teams b on (a.team_id = b.tid) \
         where user_id = ? order by ts desc limit ? offset ?"
    );
}

#[test]
fn failing_method_reports_evaluation_error() {
    init_tracing();
    let failing_directory = TypeDef::of::<Directory>("Directory")
        .method("lookup", [TypeRef::STRING], TypeRef::LONG, |_: &Directory, _| {
            Err("directory offline".into())
        })
        .build();
    let descriptor = QueryDescriptor::builder("broken")
        .from("events")
        .select(0, "id", TypeRef::LONG)
        .filter(FilterFragment::new(1, "user_id = ?", ["^.lookup(kind)"]))
        .build()
        .expect("descriptor");
    let mut cache = StatementCache::<EventQuery, SqliteProvider>::builder(
        Arc::new(seeded_sqlite()),
        descriptor,
    )
    .schema(schema().with_type(failing_directory))
    .record_type("EventQuery")
    .side_provider("Directory", Directory::new(1))
    .project(|values: &[Value]| {
        Ok(EventRow {
            id: values[0].as_i64().unwrap_or_default(),
            user: None,
            team: None,
        })
    })
    .build()
    .expect("cache");

    let record = EventQuery::new(1);
    match cache.handle(Arc::clone(&record)).expect_err("lookup fails") {
        Error::Evaluation {
            flags,
            directive,
            reason,
        } => {
            assert_eq!(flags, 1);
            assert_eq!(directive, "^.lookup(kind)");
            assert!(reason.contains("directory offline"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(record.completions(), 0);

    let unfiltered = EventQuery::new(0);
    cache.handle(Arc::clone(&unfiltered)).expect("no binding needed");
    let mut ids = unfiltered.ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn shared_cache_serves_threads() {
    init_tracing();
    let sqlite = seeded_sqlite();
    let shared = SharedStatementCache::new(event_cache(
        Arc::new(sqlite.clone()),
        Directory::new(11),
        CacheConfig::compact(),
    ));
    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let shared = shared.clone();
            thread::spawn(move || {
                let flags = if i % 2 == 0 { BY_TARGET } else { BY_KIND };
                let record = EventQuery::new(flags);
                shared.handle(Arc::clone(&record)).expect("handle");
                (flags, record.ids())
            })
        })
        .collect();
    for handle in handles {
        let (flags, ids) = handle.join().expect("thread");
        match flags {
            BY_TARGET => assert_eq!(ids, vec![5, 2]),
            _ => assert_eq!(ids, vec![5, 4, 3, 1]),
        }
    }
    let stats = shared.stats();
    assert_eq!(stats.syntheses, 2);
    assert_eq!(stats.hits, 2);
    assert_eq!(
        query_scalar(&sqlite, "select count(*) from events").expect("count"),
        Some(6)
    );
}
