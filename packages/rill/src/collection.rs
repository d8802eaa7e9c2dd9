//! Live collections: a compiled query materialized as a key→value map.
//!
//! A live collection wires a compiled graph to its base collections,
//! owns the materialized result exclusively, and runs the lifecycle
//! state machine: `Idle → Loading → Ready`, `Error` on a failed run, and
//! the terminal `CleanedUp` once the last subscriber is gone and the GC
//! grace period has passed. A finalized graph is never reused; a later
//! subscriber gets a freshly compiled one, transparently.

use crate::compiler::{compile_query, CompileError, CompiledQuery, LazyLoader};
use crate::engine::eval::{hash_value, resolve_path};
use crate::engine::graph::{DataflowGraph, NodeId};
use crate::engine::operators::unwrap_ordered;
use crate::engine::types::{
    DeltaBatch, FastMap, FastSet, MultisetEntry, RillValue, RowKey, Weight,
};
use crate::engine::EngineError;
use crate::source::{ChangeRecord, CollectionRegistry, SourceCollection, SourceEvent};
use crate::subscription::{Change, ChangeCallback, ChangeSet, SubscriptionId, SubscriptionManager};
use indexmap::IndexMap;
use rill_protocol::{ChangeOp, QueryIr, Window};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionStatus {
    Idle,
    Loading,
    Ready,
    Error,
    CleanedUp,
}

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("collection has been cleaned up")]
    CleanedUp,
    #[error("collection failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Time source for garbage collection. The engine never spawns threads or
/// timers; hosts drive `poll_gc` and may inject their own clock.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Controllable clock for tests.
pub struct MockClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

#[derive(Clone)]
pub struct CollectionOptions {
    pub id: SmolStr,
    /// Grace period between the last unsubscribe and graph teardown.
    pub gc_time: Duration,
    pub clock: Rc<dyn Clock>,
    pub compile: crate::compiler::CompileOptions,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            id: SmolStr::new("query"),
            gc_time: Duration::from_secs(5),
            clock: Rc::new(SystemClock),
            compile: Default::default(),
        }
    }
}

/// One materialized row. The weight tracks multiset multiplicity so a
/// partial retraction does not evict a row that is still present.
#[derive(Clone, Debug)]
struct LiveRow {
    value: RillValue,
    index: Option<SmolStr>,
    weight: Weight,
}

/// Distinct join-key values already requested from a lazy source.
#[derive(Default)]
struct ValueSet {
    buckets: FastMap<u64, SmallVec<[RillValue; 1]>>,
}

impl ValueSet {
    fn contains(&self, value: &RillValue) -> bool {
        self.buckets
            .get(&hash_value(value))
            .map(|vals| vals.iter().any(|v| v == value))
            .unwrap_or(false)
    }

    fn insert(&mut self, value: RillValue) {
        let bucket = self.buckets.entry(hash_value(&value)).or_default();
        if !bucket.iter().any(|v| *v == value) {
            bucket.push(value);
        }
    }
}

struct LoaderState {
    spec: LazyLoader,
    seen: ValueSet,
    /// Row keys of the lazy source currently materialized in the graph;
    /// guards snapshot loads against double insertion.
    loaded_rows: FastSet<RowKey>,
    full: bool,
}

struct SourceHandle {
    collection: Rc<dyn SourceCollection>,
    token: Option<usize>,
    lazy: bool,
    ready: bool,
}

struct Runtime {
    graph: DataflowGraph,
    inputs: FastMap<SmolStr, NodeId>,
    sources: FastMap<SmolStr, SourceHandle>,
    loaders: Vec<LoaderState>,
    order_node: Option<NodeId>,
    output_node: NodeId,
    ordered: bool,
}

impl Runtime {
    fn build(compiled: CompiledQuery) -> Result<Runtime, CompileError> {
        let CompiledQuery {
            graph,
            inputs,
            sources,
            lazy_aliases,
            loaders,
            order_node,
            output_node,
        } = compiled;
        for loader in &loaders {
            if !sources.contains_key(&loader.lazy_alias) {
                return Err(CompileError::MissingSubscription(loader.lazy_alias.clone()));
            }
        }
        let sources = sources
            .into_iter()
            .map(|(alias, collection)| {
                let lazy = lazy_aliases.contains(&alias);
                (
                    alias,
                    SourceHandle {
                        collection,
                        token: None,
                        lazy,
                        ready: false,
                    },
                )
            })
            .collect();
        Ok(Runtime {
            graph,
            inputs,
            sources,
            loaders: loaders
                .into_iter()
                .map(|spec| LoaderState {
                    spec,
                    seen: ValueSet::default(),
                    loaded_rows: FastSet::default(),
                    full: false,
                })
                .collect(),
            ordered: order_node.is_some(),
            order_node,
            output_node,
        })
    }
}

/// Effects of one internal step, delivered after every borrow is released.
#[derive(Default)]
struct Outcome {
    changes: ChangeSet,
    became_ready: bool,
    wake: bool,
}

struct LiveInner {
    query: QueryIr,
    registry: CollectionRegistry,
    options: CollectionOptions,
    status: CollectionStatus,
    failure: Option<String>,
    entries: IndexMap<RowKey, LiveRow>,
    runtime: Option<Runtime>,
    subs: SubscriptionManager,
    gc_deadline: Option<Instant>,
    ready_waiters: Vec<Box<dyn FnOnce()>>,
    wakers: Vec<Waker>,
    self_weak: Weak<RefCell<LiveInner>>,
}

/// A continuously maintained query result. Handles are cheap clones of
/// one shared state.
#[derive(Clone)]
pub struct LiveCollection {
    inner: Rc<RefCell<LiveInner>>,
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("status", &self.inner.borrow().status)
            .finish_non_exhaustive()
    }
}

/// Undo handle returned by `subscribe_changes`.
pub struct Subscription {
    inner: Weak<RefCell<LiveInner>>,
    id: SubscriptionId,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().unsubscribe(self.id);
        }
    }
}

impl LiveCollection {
    pub fn new(
        query: QueryIr,
        registry: CollectionRegistry,
        options: CollectionOptions,
    ) -> Result<Self, CompileError> {
        let compiled = compile_query(&query, &registry, options.compile)?;
        let runtime = Runtime::build(compiled)?;
        let inner = Rc::new(RefCell::new(LiveInner {
            query,
            registry,
            options,
            status: CollectionStatus::Idle,
            failure: None,
            entries: IndexMap::new(),
            runtime: Some(runtime),
            subs: SubscriptionManager::new(),
            gc_deadline: None,
            ready_waiters: Vec::new(),
            wakers: Vec::new(),
            self_weak: Weak::new(),
        }));
        inner.borrow_mut().self_weak = Rc::downgrade(&inner);
        Ok(Self { inner })
    }

    pub fn status(&self) -> CollectionStatus {
        self.inner.borrow().status
    }

    pub fn get(&self, key: &str) -> Option<RillValue> {
        self.inner.borrow().entries.get(key).map(|row| row.value.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The materialized rows; for ordered queries, in fractional-index
    /// order.
    pub fn entries(&self) -> Vec<(RowKey, RillValue)> {
        let inner = self.inner.borrow();
        let ordered = inner
            .runtime
            .as_ref()
            .map(|rt| rt.ordered)
            .unwrap_or(false);
        let mut rows: Vec<(Option<SmolStr>, RowKey, RillValue)> = inner
            .entries
            .iter()
            .map(|(k, row)| (row.index.clone(), k.clone(), row.value.clone()))
            .collect();
        if ordered {
            rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        }
        rows.into_iter().map(|(_, k, v)| (k, v)).collect()
    }

    /// Row keys in window order; only meaningful for ordered queries.
    pub fn keys(&self) -> Vec<RowKey> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// Register a change callback. Subscribing counts as a reference:
    /// it cancels any pending garbage collection and, on a finalized
    /// collection, transparently rebuilds the graph.
    pub fn subscribe_changes(&self, callback: ChangeCallback) -> Subscription {
        let (id, outcome) = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == CollectionStatus::CleanedUp {
                inner.rebuild();
            }
            inner.gc_deadline = None;
            let id = inner.subs.subscribe(callback);
            let outcome = inner.start_if_idle();
            (id, outcome)
        };
        dispatch(&self.inner, outcome);
        Subscription {
            inner: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Begin syncing without waiting for a subscriber.
    pub fn start_sync_immediate(&self) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == CollectionStatus::CleanedUp {
                inner.rebuild();
            }
            inner.start_if_idle()
        };
        dispatch(&self.inner, outcome);
    }

    /// Kick off syncing and resolve once status first reaches `Ready`.
    pub fn preload(&self) -> PreloadFuture {
        self.start_sync_immediate();
        PreloadFuture {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Run `callback` when the collection first becomes ready (now, if it
    /// already is).
    pub fn on_ready(&self, callback: impl FnOnce() + 'static) {
        let immediate: Option<Box<dyn FnOnce()>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == CollectionStatus::Ready {
                Some(Box::new(callback))
            } else {
                inner.ready_waiters.push(Box::new(callback));
                None
            }
        };
        if let Some(cb) = immediate {
            cb();
        }
    }

    /// Move the window of an ordered query and emit the delta, without
    /// upstream resends.
    pub fn set_window(&self, window: Window) -> Result<(), CollectionError> {
        let (outcome, result) = {
            let mut inner = self.inner.borrow_mut();
            let Some(rt) = inner.runtime.as_mut() else {
                return Err(CollectionError::CleanedUp);
            };
            let Some(order_node) = rt.order_node else {
                return Ok(());
            };
            match rt.graph.set_window(order_node, window) {
                Err(e) => {
                    let outcome = inner.fail(e.clone());
                    (outcome, Err(CollectionError::from(e)))
                }
                Ok(()) => {
                    let changes = inner.apply_sink();
                    (
                        Outcome {
                            changes,
                            ..Default::default()
                        },
                        Ok(()),
                    )
                }
            }
        };
        dispatch(&self.inner, outcome);
        result
    }

    /// Tear the graph down if the GC grace period has elapsed with no
    /// subscribers. Hosts call this from their idle loop; tests drive it
    /// with a mock clock.
    pub fn poll_gc(&self) {
        self.inner.borrow_mut().poll_gc();
    }

    #[doc(hidden)]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subs.len()
    }
}

fn dispatch(inner: &Rc<RefCell<LiveInner>>, outcome: Outcome) {
    if outcome.became_ready || outcome.wake {
        let (waiters, wakers) = {
            let mut i = inner.borrow_mut();
            let waiters = if outcome.became_ready {
                std::mem::take(&mut i.ready_waiters)
            } else {
                Vec::new()
            };
            (waiters, std::mem::take(&mut i.wakers))
        };
        for waiter in waiters {
            waiter();
        }
        for waker in wakers {
            waker.wake();
        }
    }
    if !outcome.changes.is_empty() {
        let callbacks = inner.borrow().subs.callbacks();
        for cb in callbacks {
            cb(&outcome.changes);
        }
    }
}

fn source_callback(weak: Weak<RefCell<LiveInner>>, alias: SmolStr) -> crate::source::SourceCallback {
    Rc::new(move |event| {
        let Some(inner) = weak.upgrade() else { return };
        let outcome = inner.borrow_mut().on_source_event(&alias, event);
        dispatch(&inner, outcome);
    })
}

impl LiveInner {
    fn start_if_idle(&mut self) -> Outcome {
        if self.status != CollectionStatus::Idle {
            return Outcome::default();
        }
        self.status = CollectionStatus::Loading;
        debug!(id = %self.options.id, "sync start");

        let weak = self.self_weak.clone();
        let Some(rt) = self.runtime.as_mut() else {
            return Outcome::default();
        };

        for (alias, handle) in rt.sources.iter_mut() {
            handle.collection.start_sync();
            handle.token = Some(
                handle
                    .collection
                    .subscribe(source_callback(weak.clone(), alias.clone())),
            );
        }

        // Hydrate active sides from the current snapshots; lazy sides wait
        // for join keys.
        let hydration: Vec<(SmolStr, Vec<(RowKey, RillValue)>)> = rt
            .sources
            .iter()
            .filter(|(_, handle)| !handle.lazy)
            .map(|(alias, handle)| (alias.clone(), handle.collection.entries()))
            .collect();
        let result = (|| -> Result<(), EngineError> {
            for (alias, rows) in hydration {
                let records: Vec<ChangeRecord> = rows
                    .into_iter()
                    .map(|(key, value)| ChangeRecord {
                        op: ChangeOp::Insert,
                        key,
                        value,
                        previous: None,
                    })
                    .collect();
                pump_into(rt, &alias, records, false)?;
            }
            rt.graph.run()
        })();
        if let Err(e) = result {
            return self.fail(e);
        }

        for handle in rt.sources.values_mut() {
            handle.ready = handle.collection.ready();
        }

        let changes = self.apply_sink();
        let became_ready = self.check_ready();
        Outcome {
            changes,
            became_ready,
            wake: became_ready,
        }
    }

    fn on_source_event(&mut self, alias: &SmolStr, event: &SourceEvent) -> Outcome {
        if matches!(
            self.status,
            CollectionStatus::Error | CollectionStatus::CleanedUp
        ) {
            return Outcome::default();
        }
        match event {
            SourceEvent::Batch(records) => {
                let Some(rt) = self.runtime.as_mut() else {
                    return Outcome::default();
                };
                let result = pump_into(rt, alias, records.clone(), false)
                    .and_then(|_| rt.graph.run());
                match result {
                    Ok(()) => Outcome {
                        changes: self.apply_sink(),
                        ..Default::default()
                    },
                    Err(e) => self.fail(e),
                }
            }
            SourceEvent::Ready => {
                let Some(rt) = self.runtime.as_mut() else {
                    return Outcome::default();
                };
                if let Some(handle) = rt.sources.get_mut(alias) {
                    handle.ready = true;
                }
                let became_ready = self.check_ready();
                Outcome {
                    changes: ChangeSet::default(),
                    became_ready,
                    wake: became_ready,
                }
            }
        }
    }

    /// Ready once every upstream alias has signalled readiness and all
    /// pending batches have propagated. Zero rows is a valid ready state.
    fn check_ready(&mut self) -> bool {
        if self.status != CollectionStatus::Loading {
            return false;
        }
        let all_ready = self
            .runtime
            .as_ref()
            .map(|rt| rt.sources.values().all(|h| h.ready))
            .unwrap_or(false);
        if all_ready {
            self.status = CollectionStatus::Ready;
            debug!(id = %self.options.id, rows = self.entries.len(), "ready");
            true
        } else {
            false
        }
    }

    /// Drain the sink and fold the run's batches into the materialized
    /// map, producing subscriber-facing changes.
    fn apply_sink(&mut self) -> ChangeSet {
        let (batches, ordered) = match self.runtime.as_mut() {
            Some(rt) => (rt.graph.take_output(rt.output_node), rt.ordered),
            None => return ChangeSet::default(),
        };
        let mut merged = DeltaBatch::new();
        for batch in batches {
            merged.concat(batch);
        }
        let merged = merged.consolidate();
        if merged.is_empty() {
            return ChangeSet::default();
        }

        let mut key_order: Vec<RowKey> = Vec::new();
        let mut per_key: FastMap<RowKey, Vec<MultisetEntry>> = FastMap::default();
        for entry in merged {
            if !per_key.contains_key(&entry.key) {
                key_order.push(entry.key.clone());
            }
            per_key.entry(entry.key.clone()).or_default().push(entry);
        }

        let decode = |v: &RillValue| -> (RillValue, Option<SmolStr>) {
            if ordered {
                if let Some((value, index)) = unwrap_ordered(v) {
                    return (value.clone(), Some(SmolStr::new(index)));
                }
            }
            (v.clone(), None)
        };

        let mut changes = Vec::new();
        for key in key_order {
            let entries = match per_key.remove(&key) {
                Some(entries) => entries,
                None => continue,
            };
            let net: Weight = entries.iter().map(|e| e.weight).sum();
            let old_weight = self.entries.get(&key).map(|r| r.weight).unwrap_or(0);
            let new_weight = old_weight + net;

            if new_weight > 0 {
                let positive = entries.iter().rev().find(|e| e.weight > 0);
                match positive {
                    Some(e) => {
                        let (value, index) = decode(&e.value);
                        let previous = self.entries.get(&key).map(|r| r.value.clone());
                        let unchanged = previous.as_ref() == Some(&value)
                            && self.entries.get(&key).and_then(|r| r.index.clone()) == index;
                        self.entries.insert(
                            key.clone(),
                            LiveRow {
                                value: value.clone(),
                                index: index.clone(),
                                weight: new_weight,
                            },
                        );
                        if !unchanged {
                            changes.push(Change {
                                op: if previous.is_some() {
                                    ChangeOp::Update
                                } else {
                                    ChangeOp::Insert
                                },
                                key,
                                value,
                                index,
                                previous,
                            });
                        }
                    }
                    None => {
                        if let Some(row) = self.entries.get_mut(&key) {
                            row.weight = new_weight;
                        }
                    }
                }
            } else if let Some(row) = self.entries.shift_remove(&key) {
                changes.push(Change {
                    op: ChangeOp::Delete,
                    key,
                    value: row.value,
                    index: row.index,
                    previous: None,
                });
            }
        }
        ChangeSet { changes }
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        if !self.subs.unsubscribe(id) {
            return;
        }
        if self.subs.is_empty() && self.status != CollectionStatus::CleanedUp {
            let deadline = self.options.clock.now() + self.options.gc_time;
            debug!(id = %self.options.id, gc_time = ?self.options.gc_time, "last subscriber gone, gc armed");
            self.gc_deadline = Some(deadline);
        }
    }

    fn poll_gc(&mut self) {
        let Some(deadline) = self.gc_deadline else {
            return;
        };
        if !self.subs.is_empty() || self.status == CollectionStatus::CleanedUp {
            self.gc_deadline = None;
            return;
        }
        if self.options.clock.now() < deadline {
            return;
        }
        debug!(id = %self.options.id, "gc: tearing down graph");
        if let Some(rt) = self.runtime.take() {
            for handle in rt.sources.values() {
                if let Some(token) = handle.token {
                    handle.collection.unsubscribe(token);
                }
            }
        }
        self.entries.clear();
        self.gc_deadline = None;
        self.status = CollectionStatus::CleanedUp;
    }

    /// Recompile the query into a fresh graph after a cleanup. The query
    /// compiled before, so this cannot reasonably fail; if it somehow
    /// does, the collection lands in `Error` instead of panicking.
    fn rebuild(&mut self) {
        match compile_query(&self.query, &self.registry, self.options.compile)
            .and_then(Runtime::build)
        {
            Ok(runtime) => {
                self.runtime = Some(runtime);
                self.entries.clear();
                self.failure = None;
                self.status = CollectionStatus::Idle;
                debug!(id = %self.options.id, "graph rebuilt after cleanup");
            }
            Err(e) => {
                error!(id = %self.options.id, error = %e, "rebuild failed");
                self.failure = Some(e.to_string());
                self.status = CollectionStatus::Error;
            }
        }
    }

    fn fail(&mut self, e: EngineError) -> Outcome {
        error!(id = %self.options.id, error = %e, "run aborted");
        self.failure = Some(e.to_string());
        self.status = CollectionStatus::Error;
        Outcome {
            changes: ChangeSet::default(),
            became_ready: false,
            wake: true,
        }
    }
}

/// Convert records to a delta batch, apply lazy-side membership rules,
/// feed loaders whose active alias just streamed keys, and queue the
/// batch on the alias's input node. `snapshot` marks rows arriving from a
/// lazy load rather than a subscription delta.
fn pump_into(
    rt: &mut Runtime,
    alias: &SmolStr,
    records: Vec<ChangeRecord>,
    snapshot: bool,
) -> Result<(), EngineError> {
    let Some(&input) = rt.inputs.get(alias) else {
        warn!(%alias, "batch for unknown alias dropped");
        return Ok(());
    };

    let mut batch = DeltaBatch::new();
    for record in records {
        match record.op {
            ChangeOp::Insert => batch.push(record.key, record.value, 1),
            ChangeOp::Update => {
                if let Some(previous) = record.previous {
                    batch.push(record.key.clone(), previous, -1);
                }
                batch.push(record.key, record.value, 1);
            }
            ChangeOp::Delete => batch.push(record.key, record.value, -1),
        }
    }

    // Lazy membership: only rows whose join-key field has been requested
    // (or everything, after a full-snapshot fallback) may enter the graph.
    let lazy = rt
        .sources
        .get(alias)
        .map(|handle| handle.lazy)
        .unwrap_or(false);
    if lazy {
        if let Some(loader) = rt
            .loaders
            .iter_mut()
            .find(|l| l.spec.lazy_alias == *alias)
        {
            batch = batch.filter(|key, value| {
                if snapshot && loader.loaded_rows.contains(key) {
                    return Ok::<_, EngineError>(false);
                }
                if loader.full {
                    return Ok(true);
                }
                let field = resolve_path(Some(value), &loader.spec.lazy_field);
                Ok(field.map(|v| loader.seen.contains(v)).unwrap_or(false))
            })?;
            let mut gained: FastSet<RowKey> = FastSet::default();
            let mut lost: FastSet<RowKey> = FastSet::default();
            for entry in batch.iter() {
                if entry.weight > 0 {
                    gained.insert(entry.key.clone());
                } else {
                    lost.insert(entry.key.clone());
                }
            }
            for key in lost {
                if !gained.contains(&key) {
                    loader.loaded_rows.remove(&key);
                }
            }
            for key in gained {
                loader.loaded_rows.insert(key);
            }
        }
    }

    // Feed loaders listening to this alias: request lazy rows for join
    // keys not seen before, at most one request per distinct key.
    let mut to_load: Vec<(SmolStr, Vec<ChangeRecord>)> = Vec::new();
    for loader in rt.loaders.iter_mut() {
        if loader.spec.active_alias != *alias || loader.full {
            continue;
        }
        let mut missing: Vec<RillValue> = Vec::new();
        for entry in batch.iter().filter(|e| e.weight > 0) {
            let namespaced = RillValue::object_of([(alias.clone(), entry.value.clone())]);
            let key = loader.spec.active_key.eval(&namespaced)?;
            if key.is_null() || loader.seen.contains(&key) {
                continue;
            }
            loader.seen.insert(key.clone());
            missing.push(key);
        }
        if missing.is_empty() {
            continue;
        }
        let source = match rt.sources.get(&loader.spec.lazy_alias) {
            Some(handle) => handle.collection.clone(),
            None => continue,
        };
        let rows = match source.load_keys(&loader.spec.lazy_field, &missing) {
            Some(rows) => {
                debug!(lazy = %loader.spec.lazy_alias, keys = missing.len(), "partial load");
                rows
            }
            None => {
                // No index-backed load: one-shot full snapshot fallback.
                debug!(lazy = %loader.spec.lazy_alias, "full snapshot fallback");
                loader.full = true;
                source.entries()
            }
        };
        let records: Vec<ChangeRecord> = rows
            .into_iter()
            .map(|(key, value)| ChangeRecord {
                op: ChangeOp::Insert,
                key,
                value,
                previous: None,
            })
            .collect();
        to_load.push((loader.spec.lazy_alias.clone(), records));
    }
    for (lazy_alias, records) in to_load {
        pump_into(rt, &lazy_alias, records, true)?;
    }

    rt.graph.send_data(input, batch);
    Ok(())
}

/// Resolves when the collection first reaches `Ready`; fails if it lands
/// in `Error` or is cleaned up (or dropped) first.
pub struct PreloadFuture {
    inner: Weak<RefCell<LiveInner>>,
}

impl Future for PreloadFuture {
    type Output = Result<(), CollectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(inner) = self.inner.upgrade() else {
            return Poll::Ready(Err(CollectionError::CleanedUp));
        };
        let mut inner = inner.borrow_mut();
        match inner.status {
            CollectionStatus::Ready => Poll::Ready(Ok(())),
            CollectionStatus::Error => Poll::Ready(Err(CollectionError::Failed(
                inner.failure.clone().unwrap_or_default(),
            ))),
            CollectionStatus::CleanedUp => Poll::Ready(Err(CollectionError::CleanedUp)),
            CollectionStatus::Idle | CollectionStatus::Loading => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod collection_tests {
    use super::*;
    use crate::source::MemoryCollection;
    use rill_protocol::{ChangeMessage, Expr};
    use serde_json::json;

    fn users_registry() -> (CollectionRegistry, MemoryCollection) {
        let users = MemoryCollection::new("users");
        let mut registry = CollectionRegistry::new();
        registry.register(Rc::new(users.clone()));
        (registry, users)
    }

    fn options(clock: Rc<dyn Clock>) -> CollectionOptions {
        CollectionOptions {
            id: SmolStr::new("test"),
            gc_time: Duration::from_millis(100),
            clock,
            compile: Default::default(),
        }
    }

    fn filtered_query() -> QueryIr {
        let mut ir = QueryIr::from_collection("u", "users");
        ir.where_clause = Some(Expr::func(
            "gte",
            vec![Expr::field("u", "age"), Expr::val(json!(18))],
        ));
        ir
    }

    #[test]
    fn test_materializes_and_streams_changes() {
        let (registry, users) = users_registry();
        let live = LiveCollection::new(
            filtered_query(),
            registry,
            options(Rc::new(MockClock::new())),
        )
        .unwrap();

        let seen: Rc<RefCell<Vec<(ChangeOp, RowKey)>>> = Rc::default();
        let log = seen.clone();
        let _sub = live.subscribe_changes(Rc::new(move |set: &ChangeSet| {
            for c in set.iter() {
                log.borrow_mut().push((c.op, c.key.clone()));
            }
        }));

        let mut tx = users.begin();
        tx.write(ChangeMessage::insert("1", json!({"id": 1, "age": 30})));
        tx.write(ChangeMessage::insert("2", json!({"id": 2, "age": 10})));
        users.commit(tx);
        users.mark_ready();

        assert_eq!(live.status(), CollectionStatus::Ready);
        assert_eq!(live.len(), 1);
        let row = live.get("1").unwrap();
        assert_eq!(
            row.get("u").and_then(|u| u.get("age")).and_then(|v| v.as_f64()),
            Some(30.0)
        );
        assert_eq!(seen.borrow().as_slice(), &[(ChangeOp::Insert, RowKey::new("1"))]);

        // Update crossing the predicate boundary deletes from the view.
        let mut tx = users.begin();
        tx.write(ChangeMessage::update("1", json!({"id": 1, "age": 5})));
        users.commit(tx);
        assert_eq!(live.len(), 0);
        assert_eq!(seen.borrow().last().unwrap().0, ChangeOp::Delete);
    }

    #[test]
    fn test_ready_with_zero_rows() {
        let (registry, users) = users_registry();
        let live = LiveCollection::new(
            filtered_query(),
            registry,
            options(Rc::new(MockClock::new())),
        )
        .unwrap();
        assert_eq!(live.status(), CollectionStatus::Idle);

        live.start_sync_immediate();
        assert_eq!(live.status(), CollectionStatus::Loading);

        // Only mark_ready, no begin/write/commit: valid, not a hang.
        users.mark_ready();
        assert_eq!(live.status(), CollectionStatus::Ready);
        assert!(live.is_empty());
    }

    #[test]
    fn test_on_ready_fires_once_ready() {
        let (registry, users) = users_registry();
        let live = LiveCollection::new(
            filtered_query(),
            registry,
            options(Rc::new(MockClock::new())),
        )
        .unwrap();
        let fired: Rc<RefCell<bool>> = Rc::default();
        let flag = fired.clone();
        live.on_ready(move || *flag.borrow_mut() = true);
        live.start_sync_immediate();
        assert!(!*fired.borrow());
        users.mark_ready();
        assert!(*fired.borrow());

        // Already ready: fires immediately.
        let fired2: Rc<RefCell<bool>> = Rc::default();
        let flag2 = fired2.clone();
        live.on_ready(move || *flag2.borrow_mut() = true);
        assert!(*fired2.borrow());
    }

    #[test]
    fn test_gc_lifecycle_and_resubscribe() {
        let clock = Rc::new(MockClock::new());
        let (registry, users) = users_registry();
        let live = LiveCollection::new(filtered_query(), registry, options(clock.clone())).unwrap();

        let sub = live.subscribe_changes(Rc::new(|_| {}));
        let mut tx = users.begin();
        tx.write(ChangeMessage::insert("1", json!({"id": 1, "age": 30})));
        users.commit(tx);
        users.mark_ready();
        assert_eq!(live.status(), CollectionStatus::Ready);
        assert_eq!(live.len(), 1);

        sub.unsubscribe();
        // Before the grace period: still alive.
        clock.advance(Duration::from_millis(50));
        live.poll_gc();
        assert_eq!(live.status(), CollectionStatus::Ready);

        clock.advance(Duration::from_millis(100));
        live.poll_gc();
        assert_eq!(live.status(), CollectionStatus::CleanedUp);
        assert_eq!(live.len(), 0);

        // Re-subscribe must not throw and must reach ready again.
        let _sub = live.subscribe_changes(Rc::new(|_| {}));
        assert_eq!(live.status(), CollectionStatus::Ready);
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_new_subscriber_cancels_gc() {
        let clock = Rc::new(MockClock::new());
        let (registry, users) = users_registry();
        let live = LiveCollection::new(filtered_query(), registry, options(clock.clone())).unwrap();
        users.mark_ready();

        let sub = live.subscribe_changes(Rc::new(|_| {}));
        sub.unsubscribe();
        let _again = live.subscribe_changes(Rc::new(|_| {}));
        clock.advance(Duration::from_secs(10));
        live.poll_gc();
        assert_ne!(live.status(), CollectionStatus::CleanedUp);
    }

    #[test]
    fn test_preload_future_resolves_on_ready() {
        let (registry, users) = users_registry();
        let live = LiveCollection::new(
            filtered_query(),
            registry,
            options(Rc::new(MockClock::new())),
        )
        .unwrap();

        let mut fut = live.preload();
        assert_eq!(live.status(), CollectionStatus::Loading);
        let mut cx = Context::from_waker(Waker::noop());
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending));

        users.mark_ready();
        assert!(matches!(
            Pin::new(&mut fut).poll(&mut cx),
            Poll::Ready(Ok(()))
        ));
    }

    #[test]
    fn test_runtime_error_puts_collection_in_error_state() {
        let (registry, users) = users_registry();
        let mut ir = QueryIr::from_collection("u", "users");
        // Arithmetic over a string fails at runtime, not at compile time.
        ir.where_clause = Some(Expr::func(
            "gt",
            vec![
                Expr::func("add", vec![Expr::field("u", "age"), Expr::val(json!(1))]),
                Expr::val(json!(0)),
            ],
        ));
        let live =
            LiveCollection::new(ir, registry, options(Rc::new(MockClock::new()))).unwrap();
        live.start_sync_immediate();

        let mut tx = users.begin();
        tx.write(ChangeMessage::insert("1", json!({"id": 1, "age": "nan"})));
        users.commit(tx);

        assert_eq!(live.status(), CollectionStatus::Error);
        // The failed batch committed nothing.
        assert_eq!(live.len(), 0);
    }
}
