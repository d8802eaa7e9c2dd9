//! rill: an in-process incremental view-maintenance engine for live
//! queries over reactive collections.
//!
//! Base collections push change batches through the sync protocol; a
//! compiled dataflow graph of streaming operators folds those deltas into
//! continuously maintained query results (filters, projections, joins
//! and ordered/limited windows) without rescanning anything.

pub mod collection;
pub mod compiler;
pub mod engine;
pub mod service;
pub mod source;
pub mod subscription;

pub use collection::{
    Clock, CollectionError, CollectionOptions, CollectionStatus, LiveCollection, MockClock,
    PreloadFuture, Subscription, SystemClock,
};
pub use compiler::{compile_query, CompileError, CompileOptions, CompiledQuery};
pub use engine::eval::{AliasScope, CompiledExpr, EvalError, Truth};
pub use engine::graph::DataflowGraph;
pub use engine::operators::IndexKind;
pub use engine::types::{DeltaBatch, FastMap, MultisetEntry, Path, RillValue, RowKey, Weight};
pub use engine::EngineError;
pub use service::{prepare_registration, register_query, Registration};
pub use source::{
    ChangeRecord, CollectionRegistry, MemoryCollection, SourceCollection, SourceEvent,
    SyncTransaction,
};
pub use subscription::{Change, ChangeCallback, ChangeSet, SubscriptionManager};
