//! Microbenchmarks for the incremental pipeline: raw delta ingestion and
//! windowed order-by maintenance with both index engines.

use rill::{
    register_query, CollectionRegistry, IndexKind, LiveCollection, MemoryCollection,
};
use rill_protocol::ChangeMessage;
use serde_json::json;
use std::rc::Rc;

fn main() {
    divan::main();
}

fn setup(limit: usize, index_kind: Option<IndexKind>) -> (MemoryCollection, LiveCollection) {
    let rows = MemoryCollection::new("rows");
    let mut registry = CollectionRegistry::new();
    registry.register(Rc::new(rows.clone()));
    rows.mark_ready();

    let query = json!({
        "from": {"alias": "r", "source": {"type": "collection", "id": "rows"}},
        "orderBy": [{"expr": {"type": "ref", "path": ["r", "rank"]}}],
        "limit": limit
    });
    let live = match index_kind {
        Some(kind) => {
            let ir = serde_json::from_value(query).unwrap();
            let options = rill::CollectionOptions {
                compile: rill::CompileOptions {
                    index_kind: Some(kind),
                },
                ..Default::default()
            };
            LiveCollection::new(ir, registry, options).unwrap()
        }
        None => register_query(&registry, json!({"id": "bench", "query": query})).unwrap(),
    };
    live.start_sync_immediate();

    let mut tx = rows.begin();
    for i in 0..2_000u32 {
        tx.write(ChangeMessage::insert(
            format!("{i}"),
            json!({"id": i, "rank": (i * 37) % 1999}),
        ));
    }
    rows.commit(tx);
    (rows, live)
}

#[divan::bench]
fn unordered_ingest(bencher: divan::Bencher) {
    let rows = MemoryCollection::new("rows");
    let mut registry = CollectionRegistry::new();
    registry.register(Rc::new(rows.clone()));
    rows.mark_ready();
    let query = json!({
        "from": {"alias": "r", "source": {"type": "collection", "id": "rows"}},
        "where": {
            "type": "func", "name": "gte",
            "args": [
                {"type": "ref", "path": ["r", "rank"]},
                {"type": "val", "value": 500}
            ]
        }
    });
    let live = register_query(&registry, json!({"id": "bench", "query": query})).unwrap();
    live.start_sync_immediate();

    let mut i = 0u32;
    bencher.bench_local(move || {
        i += 1;
        let mut tx = rows.begin();
        tx.write(ChangeMessage::insert(
            format!("{}", i % 4096),
            json!({"id": i, "rank": i % 1000}),
        ));
        rows.commit(tx);
        divan::black_box(live.len())
    });
}

#[divan::bench(args = [IndexKind::Flat, IndexKind::Tree])]
fn ordered_window_churn(bencher: divan::Bencher, kind: IndexKind) {
    let (rows, live) = setup(64, Some(kind));
    let mut i = 0u32;
    bencher.bench_local(move || {
        i += 1;
        let mut tx = rows.begin();
        tx.write(ChangeMessage::update(
            format!("{}", i % 2_000),
            json!({"id": i % 2_000, "rank": (i * 13) % 1999}),
        ));
        rows.commit(tx);
        divan::black_box(live.len())
    });
}
