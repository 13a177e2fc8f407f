//! Bitmask-keyed executor cache.
//!
//! One [`StatementCache`] serves one [`QueryDescriptor`]. Executors are
//! synthesized on first use of a bitmask, held weakly in an open-addressing
//! table and reclaimed through a channel once their last owner drops them.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, ConfigError};
use crate::driver::ConnectionProvider;
use crate::error::{BoxError, Error, Result};
use crate::query::descriptor::QueryDescriptor;
use crate::query::executor::{Executor, QueryRecord, Reclaimed, RowProjection, StatementHandle};
use crate::query::planner::Planner;
use crate::query::schema::Schema;
use crate::query::value::{TypeRef, Value};
use crate::query::Flags;

/// Counters describing cache activity since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Plans synthesized (first use, stale slot or eviction).
    pub syntheses: u64,
    /// Lookups served by a live executor.
    pub hits: u64,
    /// Table doublings.
    pub resizes: u64,
    /// Reclamation notices drained.
    pub reclaimed: u64,
    /// Live executors displaced at the capacity cap.
    pub evictions: u64,
    /// Current slot count.
    pub capacity: usize,
    /// Occupied slots, live or awaiting reclamation.
    pub occupied: usize,
}

struct Slot<R: QueryRecord, P: ConnectionProvider> {
    flags: Flags,
    generation: u64,
    executor: Weak<Executor<R, P>>,
    handle: Arc<StatementHandle<P>>,
}

impl<R: QueryRecord, P: ConnectionProvider> Slot<R, P> {
    fn is_live(&self) -> bool {
        self.executor.strong_count() > 0
    }
}

/// Maps bitmasks to lazily synthesized executors for one descriptor.
///
/// The table holds executors weakly. A bounded least-recently-used set and any
/// executor a caller pinned through [`StatementCache::executor`] keep them
/// alive; once the last strong reference drops, the executor's statement is
/// closed at the next lookup.
pub struct StatementCache<R: QueryRecord, P: ConnectionProvider> {
    planner: Planner,
    provider: Arc<P>,
    projection: RowProjection<R::Output>,
    side: Option<Value>,
    config: CacheConfig,
    slots: Vec<Option<Slot<R, P>>>,
    /// Residents displaced at the capacity cap while a caller still held them.
    evicted: Vec<Slot<R, P>>,
    retained: Option<LruCache<Flags, Arc<Executor<R, P>>>>,
    reclaim_tx: Sender<Reclaimed<P>>,
    reclaim_rx: Receiver<Reclaimed<P>>,
    next_generation: u64,
    stats: CacheStats,
}

impl<R: QueryRecord, P: ConnectionProvider> StatementCache<R, P> {
    /// Starts a cache for `descriptor` over `provider`.
    pub fn builder(
        provider: impl Into<Arc<P>>,
        descriptor: impl Into<Arc<QueryDescriptor>>,
    ) -> StatementCacheBuilder<R, P> {
        StatementCacheBuilder {
            provider: provider.into(),
            descriptor: descriptor.into(),
            schema: Schema::new(),
            record: None,
            side: None,
            projection: None,
            config: CacheConfig::default(),
        }
    }

    /// Runs the query for `record` and hands the rows to its completion
    /// callback.
    pub fn handle(&mut self, record: Arc<R>) -> Result<()> {
        let executor = self.executor(record.flags())?;
        executor.query(&record)
    }

    /// Looks up or synthesizes the executor for `flags`.
    ///
    /// The returned `Arc` pins the executor until it is dropped.
    pub fn executor(&mut self, flags: Flags) -> Result<Arc<Executor<R, P>>> {
        self.drain();
        let index = self.index(flags);
        if let Some(slot) = &self.slots[index] {
            if slot.flags == flags {
                if let Some(executor) = slot.executor.upgrade() {
                    self.stats.hits = self.stats.hits.saturating_add(1);
                    self.retain(&executor);
                    return Ok(executor);
                }
            }
        }
        let executor = self.synthesize(flags)?;
        self.place(&executor);
        self.retain(&executor);
        Ok(executor)
    }

    /// Closes every open statement, including those of evicted executors a
    /// caller still holds. Entries stay in place and prepare again on their
    /// next use. Close failures are collected into [`Error::Aggregate`].
    pub fn reload(&mut self) -> Result<()> {
        self.drain();
        let mut closed = 0usize;
        let mut failures = Vec::new();
        for slot in self.slots.iter().flatten().chain(&self.evicted) {
            match slot.handle.close() {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(flags = slot.flags, error = %err, "statement_cache.reload");
                    failures.push(err);
                }
            }
        }
        if failures.is_empty() {
            info!(
                query = self.planner.descriptor().name(),
                closed,
                "statement_cache.reload"
            );
            return Ok(());
        }
        let err = Error::Aggregate { failures };
        error!(
            query = self.planner.descriptor().name(),
            closed,
            error = %err,
            "statement_cache.reload"
        );
        Err(err)
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.slots.len(),
            occupied: self.slots.iter().flatten().count(),
            ..self.stats
        }
    }

    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Planner used for synthesis.
    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    fn index(&self, flags: Flags) -> usize {
        flags as usize & (self.slots.len() - 1)
    }

    fn synthesize(&mut self, flags: Flags) -> Result<Arc<Executor<R, P>>> {
        let plan = self.planner.plan(flags)?;
        self.next_generation += 1;
        let executor = Arc::new(Executor::new(
            self.next_generation,
            plan,
            Arc::clone(&self.provider),
            Arc::clone(&self.projection),
            self.side.clone(),
            self.reclaim_tx.clone(),
        ));
        if self.config.prepare_eagerly {
            executor.prepare()?;
        }
        self.stats.syntheses = self.stats.syntheses.saturating_add(1);
        debug!(
            query = self.planner.descriptor().name(),
            flags,
            generation = executor.generation(),
            fingerprint = %format_args!("{:016x}", executor.plan().fingerprint()),
            "statement_cache.synthesize"
        );
        Ok(executor)
    }

    fn place(&mut self, executor: &Arc<Executor<R, P>>) {
        let flags = executor.flags();
        let index = loop {
            let index = self.index(flags);
            let Some(slot) = &self.slots[index] else {
                break index;
            };
            if slot.flags == flags || !slot.is_live() {
                close_quietly(&slot.handle, "statement_cache.stale");
                break index;
            }
            if self.slots.len() < self.config.max_capacity {
                self.grow();
                continue;
            }
            let resident = slot.flags;
            close_quietly(&slot.handle, "statement_cache.evict");
            if let Some(retained) = self.retained.as_mut() {
                retained.pop(&resident);
            }
            if let Some(slot) = self.slots[index].take() {
                if slot.is_live() {
                    self.evicted.push(slot);
                }
            }
            self.stats.evictions = self.stats.evictions.saturating_add(1);
            debug!(flags, resident, index, "statement_cache.evict");
            break index;
        };
        self.slots[index] = Some(Slot {
            flags,
            generation: executor.generation(),
            executor: Arc::downgrade(executor),
            handle: Arc::clone(executor.handle()),
        });
    }

    /// Doubles the table, rehashing live entries and closing dead ones.
    fn grow(&mut self) {
        let capacity = self.slots.len() * 2;
        let mask = capacity - 1;
        let mut slots: Vec<Option<Slot<R, P>>> = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        for slot in std::mem::take(&mut self.slots).into_iter().flatten() {
            if !slot.is_live() {
                close_quietly(&slot.handle, "statement_cache.resize");
                continue;
            }
            // Live entries had distinct indices under the narrower mask.
            let index = slot.flags as usize & mask;
            debug_assert!(slots[index].is_none(), "rehash collision at {index}");
            slots[index] = Some(slot);
        }
        self.slots = slots;
        self.stats.resizes = self.stats.resizes.saturating_add(1);
        debug!(
            query = self.planner.descriptor().name(),
            capacity,
            "statement_cache.resize"
        );
    }

    fn retain(&mut self, executor: &Arc<Executor<R, P>>) {
        if let Some(retained) = self.retained.as_mut() {
            retained.put(executor.flags(), Arc::clone(executor));
        }
    }

    /// Applies pending reclamation notices.
    fn drain(&mut self) {
        while let Ok(notice) = self.reclaim_rx.try_recv() {
            close_quietly(&notice.handle, "statement_cache.reclaim");
            let index = self.index(notice.flags);
            if matches!(&self.slots[index], Some(slot) if slot.generation == notice.generation) {
                self.slots[index] = None;
            }
            self.stats.reclaimed = self.stats.reclaimed.saturating_add(1);
            debug!(
                flags = notice.flags,
                generation = notice.generation,
                "statement_cache.reclaim"
            );
        }
        self.evicted.retain(Slot::is_live);
    }
}

fn close_quietly<P: ConnectionProvider>(handle: &StatementHandle<P>, event: &'static str) {
    if let Err(err) = handle.close() {
        warn!(event, error = %err, "statement_cache.close_failed");
    }
}

impl<R: QueryRecord, P: ConnectionProvider> Drop for StatementCache<R, P> {
    fn drop(&mut self) {
        self.retained = None;
        self.drain();
        for slot in self.slots.drain(..).flatten().chain(self.evicted.drain(..)) {
            close_quietly(&slot.handle, "statement_cache.drop");
        }
    }
}

/// Fluent construction of a [`StatementCache`].
pub struct StatementCacheBuilder<R: QueryRecord, P: ConnectionProvider> {
    provider: Arc<P>,
    descriptor: Arc<QueryDescriptor>,
    schema: Schema,
    record: Option<TypeRef>,
    side: Option<(TypeRef, Value)>,
    projection: Option<RowProjection<R::Output>>,
    config: CacheConfig,
}

impl<R: QueryRecord, P: ConnectionProvider> StatementCacheBuilder<R, P> {
    /// Member registry directives resolve against.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Schema name of the record type.
    pub fn record_type(mut self, name: &str) -> Self {
        self.record = Some(TypeRef::object(name));
        self
    }

    /// Side provider reachable through `^`, registered in the schema as `name`.
    pub fn side_provider<T: Any + Send + Sync>(mut self, name: &str, provider: Arc<T>) -> Self {
        let value = Value::Object(provider as Arc<dyn Any + Send + Sync>);
        self.side = Some((TypeRef::object(name), value));
        self
    }

    /// Row projection, called once per fetched row.
    pub fn project<F>(mut self, projection: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<R::Output, BoxError> + Send + Sync + 'static,
    {
        self.projection = Some(Arc::new(projection));
        self
    }

    /// Table sizing, retention and preparation policy.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and builds an empty cache.
    pub fn build(self) -> Result<StatementCache<R, P>> {
        self.config.validate()?;
        let projection = self.projection.ok_or_else(|| ConfigError::Invalid {
            field: "projection",
            reason: "no row projection configured".to_owned(),
        })?;
        let record = self.record.ok_or_else(|| ConfigError::Invalid {
            field: "record_type",
            reason: "no record type configured".to_owned(),
        })?;
        let (side_type, side) = self.side.unzip();
        for (field, ty) in [("record_type", Some(&record)), ("side_provider", side_type.as_ref())] {
            if let Some(ty) = ty {
                if self.schema.resolve(ty).is_none() {
                    return Err(ConfigError::Invalid {
                        field,
                        reason: format!("type '{}' is not registered in the schema", ty.hint()),
                    }
                    .into());
                }
            }
        }
        let (reclaim_tx, reclaim_rx) = mpsc::channel();
        let mut slots = Vec::with_capacity(self.config.initial_capacity);
        slots.resize_with(self.config.initial_capacity, || None);
        Ok(StatementCache {
            planner: Planner::new(self.descriptor, Arc::new(self.schema), record, side_type),
            provider: self.provider,
            projection,
            side,
            retained: NonZeroUsize::new(self.config.retained_executors).map(LruCache::new),
            config: self.config,
            slots,
            evicted: Vec::new(),
            reclaim_tx,
            reclaim_rx,
            next_generation: 0,
            stats: CacheStats::default(),
        })
    }
}

/// A [`StatementCache`] behind one lock, shareable across threads.
///
/// Lookups hold the lock; query execution runs outside it.
pub struct SharedStatementCache<R: QueryRecord, P: ConnectionProvider> {
    inner: Arc<Mutex<StatementCache<R, P>>>,
}

impl<R: QueryRecord, P: ConnectionProvider> Clone for SharedStatementCache<R, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: QueryRecord, P: ConnectionProvider> SharedStatementCache<R, P> {
    /// Wraps a cache.
    pub fn new(cache: StatementCache<R, P>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    /// See [`StatementCache::handle`].
    pub fn handle(&self, record: Arc<R>) -> Result<()> {
        let executor = self.inner.lock().executor(record.flags())?;
        executor.query(&record)
    }

    /// See [`StatementCache::executor`].
    pub fn executor(&self, flags: Flags) -> Result<Arc<Executor<R, P>>> {
        self.inner.lock().executor(flags)
    }

    /// See [`StatementCache::reload`].
    pub fn reload(&self) -> Result<()> {
        self.inner.lock().reload()
    }

    /// See [`StatementCache::stats`].
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sqlite::SqliteProvider;
    use crate::query::descriptor::FilterFragment;
    use crate::query::schema::TypeDef;

    struct Sample {
        flags: Flags,
    }

    impl QueryRecord for Sample {
        type Output = i64;

        fn flags(&self) -> Flags {
            self.flags
        }

        fn complete(&self, _rows: Vec<i64>) {}
    }

    fn cache(config: CacheConfig) -> StatementCache<Sample, SqliteProvider> {
        let provider = SqliteProvider::open_in_memory().expect("open");
        provider
            .with_connection(|conn| conn.execute_batch("CREATE TABLE t (a INTEGER, b INTEGER);"))
            .expect("schema");
        let mut builder = QueryDescriptor::builder("t")
            .from("t")
            .select(0, "a", TypeRef::LONG);
        for bit in 0..8 {
            builder = builder.filter(FilterFragment::new(
                1 << bit,
                format!("b <> {bit}"),
                Vec::<&str>::new(),
            ));
        }
        StatementCache::builder(provider, builder.build().expect("descriptor"))
            .schema(Schema::new().with_type(TypeDef::of::<Sample>("Sample").build()))
            .record_type("Sample")
            .project(|values: &[Value]| Ok(values[0].as_i64().unwrap_or_default()))
            .config(config)
            .build()
            .expect("cache")
    }

    fn config(initial: usize, max: usize, retained: usize) -> CacheConfig {
        CacheConfig {
            initial_capacity: initial,
            max_capacity: max,
            retained_executors: retained,
            prepare_eagerly: true,
        }
    }

    #[test]
    fn colliding_masks_grow_into_distinct_slots() {
        let mut cache = cache(config(16, 1 << 10, 8));
        let pinned: Vec<_> = [0, 16, 32, 48]
            .into_iter()
            .map(|flags| cache.executor(flags).expect("executor"))
            .collect();
        let stats = cache.stats();
        assert_eq!(stats.capacity, 64);
        assert_eq!(stats.occupied, 4);
        assert_eq!(stats.resizes, 2);
        for executor in &pinned {
            let index = cache.index(executor.flags());
            let slot = cache.slots[index].as_ref().expect("slot");
            assert_eq!(slot.flags, executor.flags());
        }
    }

    #[test]
    fn drain_only_clears_matching_generation() {
        let mut cache = cache(config(16, 16, 0));
        let first = cache.executor(1).expect("executor");
        let first_generation = first.generation();
        drop(first);
        let second = cache.executor(1).expect("resynthesized");
        assert_ne!(second.generation(), first_generation);
        assert_eq!(cache.stats().reclaimed, 1);
        assert_eq!(cache.stats().syntheses, 2);
        assert!(second.is_prepared());
        let index = cache.index(1);
        assert_eq!(
            cache.slots[index].as_ref().map(|slot| slot.generation),
            Some(second.generation())
        );
    }

    #[test]
    fn cap_evicts_resident() {
        let mut cache = cache(config(16, 16, 4));
        let resident = cache.executor(3).expect("executor");
        let newcomer = cache.executor(19).expect("executor");
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().capacity, 16);
        assert!(!resident.is_prepared());
        assert!(newcomer.is_prepared());
        assert_eq!(cache.evicted.len(), 1);
    }

    #[test]
    fn reload_reaches_evicted_executors() {
        let mut cache = cache(config(16, 16, 0));
        let resident = cache.executor(3).expect("executor");
        let _newcomer = cache.executor(19).expect("executor");
        resident.prepare().expect("prepare again");
        assert!(resident.is_prepared());

        cache.reload().expect("reload");
        assert!(!resident.is_prepared());

        drop(resident);
        cache.executor(19).expect("hit");
        assert!(cache.evicted.is_empty());
    }

    #[test]
    fn builder_requires_projection_and_known_types() {
        let provider = SqliteProvider::open_in_memory().expect("open");
        let descriptor = QueryDescriptor::builder("t")
            .from("t")
            .select(0, "a", TypeRef::LONG)
            .build()
            .expect("descriptor");
        let missing = StatementCache::<Sample, SqliteProvider>::builder(
            provider.clone(),
            descriptor.clone(),
        )
            .record_type("Sample")
            .build();
        assert!(matches!(
            missing,
            Err(Error::Config(ConfigError::Invalid { field: "projection", .. }))
        ));
        let unknown = StatementCache::<Sample, SqliteProvider>::builder(provider, descriptor)
            .record_type("Sample")
            .project(|_: &[Value]| Ok(0))
            .build();
        assert!(matches!(
            unknown,
            Err(Error::Config(ConfigError::Invalid { field: "record_type", .. }))
        ));
    }
}
