//! Base-collection boundary.
//!
//! Storage and sync live outside the engine; this module defines the
//! interface the engine consumes: committed change batches, a readiness
//! signal, snapshots, and optional index-backed partial loads. It also
//! ships an in-memory reference implementation speaking the
//! sync-transaction protocol (`begin` / `write` / `commit` / `mark_ready`).

use crate::engine::eval::{compare_values, resolve_path};
use crate::engine::types::{FastMap, Path, RillValue, RowKey};
use indexmap::IndexMap;
use rill_protocol::{ChangeMessage, ChangeOp};
use smol_str::SmolStr;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use tracing::debug;

/// A change typed for the engine. Updates carry the prior value so the
/// graph can retract it; deletes carry the removed value in `value`.
#[derive(Clone, Debug)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    pub key: RowKey,
    pub value: RillValue,
    pub previous: Option<RillValue>,
}

#[derive(Clone, Debug)]
pub enum SourceEvent {
    /// One committed sync transaction, applied atomically.
    Batch(Vec<ChangeRecord>),
    /// Initial sync finished. May arrive with zero preceding writes;
    /// "ready with zero rows" is a valid state.
    Ready,
}

pub type SourceCallback = Rc<dyn Fn(&SourceEvent)>;

/// What the engine needs from a base collection.
pub trait SourceCollection {
    fn id(&self) -> &str;
    fn ready(&self) -> bool;
    fn len(&self) -> usize;
    /// Current snapshot.
    fn entries(&self) -> Vec<(RowKey, RillValue)>;
    /// Register for committed batches and the ready signal. Returns a
    /// token for `unsubscribe`.
    fn subscribe(&self, cb: SourceCallback) -> usize;
    fn unsubscribe(&self, token: usize);
    /// Kick the underlying sync. Idempotent; local sources may ignore it.
    fn start_sync(&self);
    /// Rows whose `field` value equals one of `keys`, or `None` when no
    /// index-backed partial load is available and the caller must fall
    /// back to a full snapshot.
    fn load_keys(&self, field: &Path, keys: &[RillValue]) -> Option<Vec<(RowKey, RillValue)>>;
}

/// Collections known to the compiler, by id.
#[derive(Clone, Default)]
pub struct CollectionRegistry {
    sources: FastMap<SmolStr, Rc<dyn SourceCollection>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Rc<dyn SourceCollection>) {
        self.sources.insert(SmolStr::new(source.id()), source);
    }

    pub fn get(&self, id: &str) -> Option<Rc<dyn SourceCollection>> {
        self.sources.get(id).cloned()
    }
}

// --- In-memory reference implementation ---

struct MemoryInner {
    rows: IndexMap<RowKey, RillValue>,
    ready: bool,
    subscribers: FastMap<usize, SourceCallback>,
    next_token: usize,
    indexed: Vec<Path>,
}

/// An in-memory base collection. Writers drive it through the sync
/// protocol; the engine sees it as any other [`SourceCollection`].
#[derive(Clone)]
pub struct MemoryCollection {
    id: SmolStr,
    inner: Rc<RefCell<MemoryInner>>,
}

/// An open sync transaction. Writes are staged until `commit`.
#[derive(Default)]
pub struct SyncTransaction {
    writes: Vec<ChangeMessage>,
}

impl SyncTransaction {
    pub fn write(&mut self, message: ChangeMessage) {
        self.writes.push(message);
    }
}

impl MemoryCollection {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self {
            id: id.into(),
            inner: Rc::new(RefCell::new(MemoryInner {
                rows: IndexMap::new(),
                ready: false,
                subscribers: FastMap::default(),
                next_token: 1,
                indexed: Vec::new(),
            })),
        }
    }

    /// Declare `field` as indexed, enabling partial loads for it.
    pub fn with_index(self, field: &str) -> Self {
        self.inner.borrow_mut().indexed.push(Path::new(field));
        self
    }

    pub fn begin(&self) -> SyncTransaction {
        SyncTransaction::default()
    }

    /// Apply a transaction atomically and notify subscribers once.
    pub fn commit(&self, tx: SyncTransaction) {
        let records = {
            let mut inner = self.inner.borrow_mut();
            let mut records = Vec::with_capacity(tx.writes.len());
            for message in tx.writes {
                let value = RillValue::from(message.value);
                match message.op {
                    ChangeOp::Insert => {
                        let previous = inner.rows.insert(message.key.clone(), value.clone());
                        records.push(ChangeRecord {
                            // An insert over an existing row behaves as an
                            // update; the old value must be retracted.
                            op: if previous.is_some() {
                                ChangeOp::Update
                            } else {
                                ChangeOp::Insert
                            },
                            key: message.key,
                            value,
                            previous,
                        });
                    }
                    ChangeOp::Update => {
                        let previous = inner.rows.insert(message.key.clone(), value.clone());
                        records.push(ChangeRecord {
                            op: if previous.is_some() {
                                ChangeOp::Update
                            } else {
                                ChangeOp::Insert
                            },
                            key: message.key,
                            value,
                            previous,
                        });
                    }
                    ChangeOp::Delete => {
                        if let Some(removed) = inner.rows.shift_remove(&message.key) {
                            records.push(ChangeRecord {
                                op: ChangeOp::Delete,
                                key: message.key,
                                value: removed,
                                previous: None,
                            });
                        }
                    }
                }
            }
            records
        };
        if !records.is_empty() {
            debug!(collection = %self.id, changes = records.len(), "commit");
            self.notify(&SourceEvent::Batch(records));
        }
    }

    /// Signal that the initial sync is complete.
    pub fn mark_ready(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.ready {
                return;
            }
            inner.ready = true;
        }
        self.notify(&SourceEvent::Ready);
    }

    fn notify(&self, event: &SourceEvent) {
        let callbacks: Vec<SourceCallback> =
            self.inner.borrow().subscribers.values().cloned().collect();
        for cb in callbacks {
            cb(event);
        }
    }
}

impl SourceCollection for MemoryCollection {
    fn id(&self) -> &str {
        &self.id
    }

    fn ready(&self) -> bool {
        self.inner.borrow().ready
    }

    fn len(&self) -> usize {
        self.inner.borrow().rows.len()
    }

    fn entries(&self) -> Vec<(RowKey, RillValue)> {
        self.inner
            .borrow()
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn subscribe(&self, cb: SourceCallback) -> usize {
        let mut inner = self.inner.borrow_mut();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.subscribers.insert(token, cb);
        token
    }

    fn unsubscribe(&self, token: usize) {
        self.inner.borrow_mut().subscribers.remove(&token);
    }

    fn start_sync(&self) {
        // Data is local; readiness is the writer's call via mark_ready.
    }

    fn load_keys(&self, field: &Path, keys: &[RillValue]) -> Option<Vec<(RowKey, RillValue)>> {
        let inner = self.inner.borrow();
        if !inner.indexed.contains(field) {
            return None;
        }
        let mut out = Vec::new();
        for (key, value) in &inner.rows {
            if let Some(field_value) = resolve_path(Some(value), field) {
                let matched = keys
                    .iter()
                    .any(|k| compare_values(Some(field_value), Some(k)) == Ordering::Equal);
                if matched {
                    out.push((key.clone(), value.clone()));
                }
            }
        }
        Some(out)
    }
}
