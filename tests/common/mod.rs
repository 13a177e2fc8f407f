#![allow(dead_code, missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use maskql::driver::sqlite::{SqliteConnection, SqliteProvider, SqliteStatement};
use maskql::driver::{Connection, ConnectionProvider, PreparedStatement, ResultRow};
use maskql::query::BindOp;
use maskql::{
    CacheConfig, DriverError, FilterFragment, Flags, QueryDescriptor, QueryRecord, Schema,
    StatementCache, TypeDef, TypeRef, Value,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("maskql=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// Prepare/close bookkeeping shared by a [`RecordingProvider`] and every
/// statement it hands out.
#[derive(Default)]
pub struct Counters {
    pub prepares: AtomicUsize,
    pub closes: AtomicUsize,
    pub double_closes: AtomicUsize,
    pub fail_close: AtomicBool,
}

impl Counters {
    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.prepares() - self.closes()
    }
}

/// SQLite provider that counts statement preparation and release.
pub struct RecordingProvider {
    inner: SqliteProvider,
    pub counters: Arc<Counters>,
}

impl RecordingProvider {
    pub fn new(inner: SqliteProvider) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl ConnectionProvider for RecordingProvider {
    type Connection = RecordingConnection;

    fn acquire(&self) -> Result<RecordingConnection, DriverError> {
        Ok(RecordingConnection {
            inner: self.inner.acquire()?,
            counters: Arc::clone(&self.counters),
        })
    }
}

pub struct RecordingConnection {
    inner: SqliteConnection,
    counters: Arc<Counters>,
}

impl Connection for RecordingConnection {
    type Statement = RecordingStatement;

    fn prepare(&self, sql: &str) -> Result<RecordingStatement, DriverError> {
        let inner = self.inner.prepare(sql)?;
        self.counters.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingStatement {
            inner,
            counters: Arc::clone(&self.counters),
        })
    }
}

pub struct RecordingStatement {
    inner: SqliteStatement,
    counters: Arc<Counters>,
}

impl PreparedStatement for RecordingStatement {
    fn bind(&mut self, index: usize, op: BindOp, value: &Value) -> Result<(), DriverError> {
        self.inner.bind(index, op, value)
    }

    fn execute(
        &mut self,
        visit: &mut dyn FnMut(&dyn ResultRow) -> Result<(), DriverError>,
    ) -> Result<(), DriverError> {
        self.inner.execute(visit)
    }

    fn fetch_size(&self) -> usize {
        self.inner.fetch_size()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.inner.is_closed() {
            self.counters.double_closes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.close()?;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_close.load(Ordering::SeqCst) {
            return Err(DriverError::other("injected close failure"));
        }
        Ok(())
    }
}

pub fn seeded_sqlite() -> SqliteProvider {
    let provider = SqliteProvider::open_in_memory()
        .expect("open")
        .with_fetch_size(16);
    provider
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE teams (tid INTEGER PRIMARY KEY, label TEXT);
                 CREATE TABLE users (uid INTEGER PRIMARY KEY, name TEXT, team_id INTEGER);
                 CREATE TABLE events (id INTEGER PRIMARY KEY, ts INTEGER, user_id INTEGER, kind TEXT);
                 INSERT INTO teams VALUES (1, 'core'), (2, 'edge');
                 INSERT INTO users VALUES (10, 'ada', 1), (11, 'lin', 2), (12, 'kim', NULL);
                 INSERT INTO events VALUES
                    (1, 100, 10, 'open'),
                    (2, 200, 11, 'close'),
                    (3, 300, 10, 'open'),
                    (4, 400, 12, 'open'),
                    (5, 500, 11, 'open'),
                    (6, 600, NULL, 'close');",
            )
        })
        .expect("seed");
    provider
}

/// Side provider reached through `^`.
pub struct Directory {
    pub target: i64,
    pub lookups: AtomicUsize,
}

impl Directory {
    pub fn new(target: i64) -> Arc<Self> {
        Arc::new(Self {
            target,
            lookups: AtomicUsize::new(0),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRow {
    pub id: i64,
    pub user: Option<String>,
    pub team: Option<String>,
}

pub struct EventQuery {
    pub flags: Flags,
    pub page_size: i32,
    pub skip: i64,
    pub kind: String,
    pub rows: Mutex<Option<Vec<EventRow>>>,
    pub completions: AtomicUsize,
}

impl EventQuery {
    pub fn new(flags: Flags) -> Arc<Self> {
        Self::paged(flags, 100, 0)
    }

    pub fn paged(flags: Flags, page_size: i32, skip: i64) -> Arc<Self> {
        Arc::new(Self {
            flags,
            page_size,
            skip,
            kind: "open".into(),
            rows: Mutex::new(None),
            completions: AtomicUsize::new(0),
        })
    }

    pub fn ids(&self) -> Vec<i64> {
        self.rows
            .lock()
            .as_ref()
            .map(|rows| rows.iter().map(|row| row.id).collect())
            .unwrap_or_default()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

impl QueryRecord for EventQuery {
    type Output = EventRow;

    fn flags(&self) -> Flags {
        self.flags
    }

    fn complete(&self, rows: Vec<EventRow>) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        *self.rows.lock() = Some(rows);
    }
}

pub const BY_TARGET: Flags = 0b001;
pub const BY_KIND: Flags = 0b010;
pub const BY_KIND_LOOKUP: Flags = 0b100;

pub fn schema() -> Schema {
    Schema::new()
        .with_type(
            TypeDef::of::<EventQuery>("EventQuery")
                .field("pageSize", TypeRef::INT, |q: &EventQuery| Value::Int(q.page_size))
                .field("skip", TypeRef::LONG, |q: &EventQuery| Value::Long(q.skip))
                .field("kind", TypeRef::STRING, |q: &EventQuery| {
                    Value::String(q.kind.clone())
                })
                .build(),
        )
        .with_type(
            TypeDef::of::<Directory>("Directory")
                .method("targetId", [], TypeRef::LONG, |d: &Directory, _| {
                    Ok(Value::Long(d.target))
                })
                .method("lookup", [TypeRef::STRING], TypeRef::LONG, |d: &Directory, args| {
                    d.lookups.fetch_add(1, Ordering::SeqCst);
                    match args[0].as_str() {
                        Some("open") => Ok(Value::Long(10)),
                        Some(_) => Ok(Value::Long(11)),
                        None => Err("lookup needs a name".into()),
                    }
                })
                .build(),
        )
}

/// `events` joined to users and teams, with three optional filters and
/// paging driven by the record.
pub fn events_descriptor() -> QueryDescriptor {
    QueryDescriptor::builder("events")
        .from("events")
        .join(1, "users", "user_id", "uid")
        .join_on(
            2,
            "teams",
            maskql::query::JoinOn {
                table: 1,
                primary: "team_id".into(),
                secondary: "tid".into(),
            },
        )
        .select(0, "id", TypeRef::LONG)
        .select(1, "name", TypeRef::STRING)
        .select(2, "label", TypeRef::STRING)
        .filter(FilterFragment::new(BY_TARGET, "user_id = ?", ["^.targetId()"]))
        .filter(FilterFragment::new(BY_KIND, "kind = ?", ["kind"]))
        .filter(FilterFragment::new(
            BY_KIND_LOOKUP,
            "(user_id = ? or user_id = ?)",
            ["<0?^.lookup(kind)>0", "<0?"],
        ))
        .sort(0, "ts")
        .limit("pageSize")
        .offset("skip")
        .build()
        .expect("valid descriptor")
}

pub fn project_event(values: &[Value]) -> Result<EventRow, maskql::BoxError> {
    let id = values[0].as_i64().ok_or("id is not an integer")?;
    Ok(EventRow {
        id,
        user: values[1].as_str().map(str::to_owned),
        team: values[2].as_str().map(str::to_owned),
    })
}

pub fn event_cache<P: ConnectionProvider>(
    provider: Arc<P>,
    directory: Arc<Directory>,
    config: CacheConfig,
) -> StatementCache<EventQuery, P> {
    StatementCache::builder(provider, events_descriptor())
        .schema(schema())
        .record_type("EventQuery")
        .side_provider("Directory", directory)
        .project(project_event)
        .config(config)
        .build()
        .expect("cache")
}

pub fn config(initial: usize, max: usize, retained: usize) -> CacheConfig {
    CacheConfig {
        initial_capacity: initial,
        max_capacity: max,
        retained_executors: retained,
        prepare_eagerly: true,
    }
}
