//! Multiset conservation: any sequence of incremental delta batches must
//! land the materialized map in the same state as one non-incremental
//! recomputation over the net inserts and deletes.

use proptest::prelude::*;
use rill::{
    register_query, CollectionRegistry, LiveCollection, MemoryCollection, RillValue,
};
use rill_protocol::ChangeMessage;
use serde_json::json;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8, i64),
    Update(u8, i64),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, 0i64..100).prop_map(|(k, v)| Op::Insert(k, v)),
        (0u8..8, 0i64..100).prop_map(|(k, v)| Op::Update(k, v)),
        (0u8..8).prop_map(Op::Delete),
    ]
}

fn filtered_live(registry: &CollectionRegistry) -> LiveCollection {
    let query = json!({
        "from": {"alias": "u", "source": {"type": "collection", "id": "rows"}},
        "where": {
            "type": "func", "name": "gte",
            "args": [
                {"type": "ref", "path": ["u", "v"]},
                {"type": "val", "value": 50}
            ]
        }
    });
    let live = register_query(registry, json!({"id": "conserve", "query": query})).unwrap();
    live.start_sync_immediate();
    live
}

fn materialized(live: &LiveCollection) -> BTreeMap<String, i64> {
    live.entries()
        .into_iter()
        .map(|(k, row)| {
            let v = row
                .get("u")
                .and_then(|u| u.get("v"))
                .and_then(RillValue::as_f64)
                .unwrap_or(f64::NAN);
            (k.to_string(), v as i64)
        })
        .collect()
}

proptest! {
    #[test]
    fn incremental_equals_recomputation(ops in prop::collection::vec(op_strategy(), 0..48)) {
        let rows = MemoryCollection::new("rows");
        let mut registry = CollectionRegistry::new();
        registry.register(Rc::new(rows.clone()));
        rows.mark_ready();

        let live = filtered_live(&registry);

        // Reference model: the net state, recomputed from scratch.
        let mut model: BTreeMap<String, i64> = BTreeMap::new();

        for op in ops {
            let mut tx = rows.begin();
            match op {
                Op::Insert(k, v) | Op::Update(k, v) => {
                    let key = format!("{k}");
                    tx.write(ChangeMessage::insert(key.clone(), json!({"id": k, "v": v})));
                    model.insert(key, v);
                }
                Op::Delete(k) => {
                    let key = format!("{k}");
                    tx.write(ChangeMessage::delete(key.clone()));
                    model.remove(&key);
                }
            }
            rows.commit(tx);
        }

        let expected: BTreeMap<String, i64> = model
            .into_iter()
            .filter(|(_, v)| *v >= 50)
            .collect();

        prop_assert_eq!(materialized(&live), expected);
    }

    #[test]
    fn batched_commits_match_singleton_commits(ops in prop::collection::vec(op_strategy(), 0..32)) {
        // The same ops, committed one-per-transaction against one
        // collection and all-in-one against another, converge.
        let single = MemoryCollection::new("rows");
        let mut registry_a = CollectionRegistry::new();
        registry_a.register(Rc::new(single.clone()));
        single.mark_ready();
        let live_a = filtered_live(&registry_a);

        let batched = MemoryCollection::new("rows");
        let mut registry_b = CollectionRegistry::new();
        registry_b.register(Rc::new(batched.clone()));
        batched.mark_ready();
        let live_b = filtered_live(&registry_b);

        for op in &ops {
            let mut tx = single.begin();
            write_op(&mut tx, op);
            single.commit(tx);
        }

        let mut tx = batched.begin();
        for op in &ops {
            write_op(&mut tx, op);
        }
        batched.commit(tx);

        prop_assert_eq!(materialized(&live_a), materialized(&live_b));
    }
}

fn write_op(tx: &mut rill::SyncTransaction, op: &Op) {
    match op {
        Op::Insert(k, v) | Op::Update(k, v) => {
            tx.write(ChangeMessage::insert(format!("{k}"), json!({"id": k, "v": v})));
        }
        Op::Delete(k) => tx.write(ChangeMessage::delete(format!("{k}"))),
    }
}
