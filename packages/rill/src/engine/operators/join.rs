//! Incremental hash join.
//!
//! Both sides keep a hash index of the rows they have seen, keyed by the
//! join key extracted through a pre-compiled expression. A delta on one
//! side probes the other side's index and emits joined pairs whose weight
//! is the product of the two weights. Outer variants additionally maintain
//! `Null`-padded compensation rows for elements with no match.

use crate::engine::eval::{compare_values, hash_value, EvalError};
use crate::engine::types::{DeltaBatch, FastMap, FastSet, MultisetEntry, RillValue, RowKey, Weight};
use crate::engine::EngineError;
use rill_protocol::JoinType;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::cmp::Ordering;

pub type KeyFn = Box<dyn FnMut(&RillValue) -> Result<RillValue, EvalError>>;

/// One `(row key, value)` element currently held by a side.
#[derive(Clone, Debug)]
struct Slot {
    value: RillValue,
    key: RillValue,
    hash: u64,
    weight: Weight,
}

/// Per-side state: elements by row key plus a join-key bucket index.
/// Null join keys are tracked (they matter for padding) but never enter
/// the buckets; null matches nothing, not even null.
#[derive(Default)]
struct SideIndex {
    rows: FastMap<RowKey, SmallVec<[Slot; 1]>>,
    buckets: FastMap<u64, FastSet<RowKey>>,
}

impl SideIndex {
    fn apply(&mut self, row_key: &RowKey, value: &RillValue, key: RillValue, hash: u64, weight: Weight) {
        let slots = self.rows.entry(row_key.clone()).or_default();
        match slots.iter().position(|s| s.value == *value) {
            Some(i) => {
                slots[i].weight += weight;
                if slots[i].weight == 0 {
                    let old = slots.remove(i);
                    let bucket_still_used = !old.key.is_null()
                        && slots.iter().any(|s| s.hash == old.hash && !s.key.is_null());
                    if !old.key.is_null() && !bucket_still_used {
                        if let Some(bucket) = self.buckets.get_mut(&old.hash) {
                            bucket.remove(row_key);
                            if bucket.is_empty() {
                                self.buckets.remove(&old.hash);
                            }
                        }
                    }
                }
            }
            None => {
                if !key.is_null() {
                    self.buckets.entry(hash).or_default().insert(row_key.clone());
                }
                slots.push(Slot {
                    value: value.clone(),
                    key,
                    hash,
                    weight,
                });
            }
        }
        if self.rows.get(row_key).map(|s| s.is_empty()).unwrap_or(false) {
            self.rows.remove(row_key);
        }
    }

    /// Matching elements for a join key, sorted by row key for
    /// deterministic output.
    fn probe(&self, key: &RillValue, hash: u64) -> Vec<(RowKey, RillValue, Weight)> {
        if key.is_null() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(bucket) = self.buckets.get(&hash) {
            for row_key in bucket {
                if let Some(slots) = self.rows.get(row_key) {
                    for slot in slots {
                        if slot.hash == hash
                            && slot.weight != 0
                            && compare_values(Some(&slot.key), Some(key)) == Ordering::Equal
                        {
                            out.push((row_key.clone(), slot.value.clone(), slot.weight));
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Total weight of elements matching a join key.
    fn match_weight(&self, key: &RillValue, hash: u64) -> Weight {
        if key.is_null() {
            return 0;
        }
        let mut total = 0;
        if let Some(bucket) = self.buckets.get(&hash) {
            for row_key in bucket {
                if let Some(slots) = self.rows.get(row_key) {
                    for slot in slots {
                        if slot.hash == hash
                            && compare_values(Some(&slot.key), Some(key)) == Ordering::Equal
                        {
                            total += slot.weight;
                        }
                    }
                }
            }
        }
        total
    }

    fn slot_weight(&self, row_key: &RowKey, value: &RillValue) -> Weight {
        self.rows
            .get(row_key)
            .and_then(|slots| slots.iter().find(|s| s.value == *value))
            .map(|s| s.weight)
            .unwrap_or(0)
    }

    /// Elements currently holding the given join key.
    fn elements_with_key(&self, key: &RillValue, hash: u64) -> Vec<(RowKey, RillValue)> {
        if key.is_null() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(bucket) = self.buckets.get(&hash) {
            for row_key in bucket {
                if let Some(slots) = self.rows.get(row_key) {
                    for slot in slots {
                        if slot.hash == hash
                            && compare_values(Some(&slot.key), Some(key)) == Ordering::Equal
                        {
                            out.push((row_key.clone(), slot.value.clone()));
                        }
                    }
                }
            }
        }
        out
    }
}

/// A delta entry with its extracted join key.
struct KeyedEntry {
    row_key: RowKey,
    value: RillValue,
    weight: Weight,
    key: RillValue,
    hash: u64,
}

/// Snapshot of one element's state before the batch was applied, used to
/// emit compensation-row deltas afterwards.
struct Touched {
    row_key: RowKey,
    value: RillValue,
    key: RillValue,
    hash: u64,
    old_weight: Weight,
    old_match: Weight,
}

pub struct JoinOperator {
    join_type: JoinType,
    left_key: KeyFn,
    right_key: KeyFn,
    left: SideIndex,
    right: SideIndex,
    /// Aliases of the left side, nulled when padding a right element.
    left_aliases: SmallVec<[SmolStr; 2]>,
    /// Aliases of the right side, nulled when padding a left element.
    right_aliases: SmallVec<[SmolStr; 2]>,
}

impl JoinOperator {
    pub fn new(
        join_type: JoinType,
        left_key: KeyFn,
        right_key: KeyFn,
        left_aliases: impl IntoIterator<Item = SmolStr>,
        right_aliases: impl IntoIterator<Item = SmolStr>,
    ) -> Self {
        Self {
            join_type,
            left_key,
            right_key,
            left: SideIndex::default(),
            right: SideIndex::default(),
            left_aliases: left_aliases.into_iter().collect(),
            right_aliases: right_aliases.into_iter().collect(),
        }
    }

    fn pads_left(&self) -> bool {
        matches!(self.join_type, JoinType::Left | JoinType::Full)
    }

    fn pads_right(&self) -> bool {
        matches!(self.join_type, JoinType::Right | JoinType::Full)
    }

    pub fn process(
        &mut self,
        left_delta: DeltaBatch,
        right_delta: DeltaBatch,
    ) -> Result<DeltaBatch, EngineError> {
        let left_delta = keyed(left_delta.consolidate(), &mut self.left_key)?;
        let right_delta = keyed(right_delta.consolidate(), &mut self.right_key)?;

        // Snapshot the elements whose padding may change, before any index
        // is mutated.
        let touched_left = if self.pads_left() {
            collect_touched(&self.left, &self.right, &left_delta, &right_delta)
        } else {
            Vec::new()
        };
        let touched_right = if self.pads_right() {
            collect_touched(&self.right, &self.left, &right_delta, &left_delta)
        } else {
            Vec::new()
        };

        let mut out = DeltaBatch::new();

        // ΔL ⋈ R, against the right index before ΔR lands.
        for e in &left_delta {
            for (r_key, r_value, r_weight) in self.right.probe(&e.key, e.hash) {
                out.push(
                    composite_key(Some(&e.row_key), Some(&r_key)),
                    merge_rows(&e.value, &r_value)?,
                    e.weight * r_weight,
                );
            }
        }
        for e in &left_delta {
            self.left
                .apply(&e.row_key, &e.value, e.key.clone(), e.hash, e.weight);
        }

        // (L + ΔL) ⋈ ΔR, against the already-updated left index so the
        // ΔL×ΔR cross terms are counted exactly once.
        for e in &right_delta {
            for (l_key, l_value, l_weight) in self.left.probe(&e.key, e.hash) {
                out.push(
                    composite_key(Some(&l_key), Some(&e.row_key)),
                    merge_rows(&l_value, &e.value)?,
                    l_weight * e.weight,
                );
            }
        }
        for e in &right_delta {
            self.right
                .apply(&e.row_key, &e.value, e.key.clone(), e.hash, e.weight);
        }

        // Compensation rows for elements that gained or lost their match.
        for t in touched_left {
            let new_weight = self.left.slot_weight(&t.row_key, &t.value);
            let new_match = self.right.match_weight(&t.key, t.hash);
            let old_pad = pad_weight(t.old_weight, t.old_match);
            let new_pad = pad_weight(new_weight, new_match);
            if new_pad != old_pad {
                out.push(
                    composite_key(Some(&t.row_key), None),
                    pad_row(&t.value, &self.right_aliases)?,
                    new_pad - old_pad,
                );
            }
        }
        for t in touched_right {
            let new_weight = self.right.slot_weight(&t.row_key, &t.value);
            let new_match = self.left.match_weight(&t.key, t.hash);
            let old_pad = pad_weight(t.old_weight, t.old_match);
            let new_pad = pad_weight(new_weight, new_match);
            if new_pad != old_pad {
                out.push(
                    composite_key(None, Some(&t.row_key)),
                    pad_row(&t.value, &self.left_aliases)?,
                    new_pad - old_pad,
                );
            }
        }

        Ok(out.consolidate())
    }
}

fn keyed(batch: DeltaBatch, key_fn: &mut KeyFn) -> Result<Vec<KeyedEntry>, EngineError> {
    let mut out = Vec::with_capacity(batch.len());
    for MultisetEntry { key, value, weight } in batch {
        let join_key = key_fn(&value)?;
        let hash = hash_value(&join_key);
        out.push(KeyedEntry {
            row_key: key,
            value,
            weight,
            key: join_key,
            hash,
        });
    }
    Ok(out)
}

/// Elements of `side` whose pad state the batch can affect: the side's own
/// delta elements plus existing elements matching any join key of the
/// other side's delta.
fn collect_touched(
    side: &SideIndex,
    other: &SideIndex,
    own_delta: &[KeyedEntry],
    other_delta: &[KeyedEntry],
) -> Vec<Touched> {
    let mut touched: Vec<Touched> = Vec::new();
    let mut seen: FastMap<RowKey, SmallVec<[usize; 1]>> = FastMap::default();

    let mut add = |touched: &mut Vec<Touched>,
                   seen: &mut FastMap<RowKey, SmallVec<[usize; 1]>>,
                   row_key: RowKey,
                   value: RillValue,
                   key: RillValue,
                   hash: u64| {
        let indices = seen.entry(row_key.clone()).or_default();
        if indices.iter().any(|&i| touched[i].value == value) {
            return;
        }
        let old_weight = side.slot_weight(&row_key, &value);
        let old_match = other.match_weight(&key, hash);
        indices.push(touched.len());
        touched.push(Touched {
            row_key,
            value,
            key,
            hash,
            old_weight,
            old_match,
        });
    };

    for e in own_delta {
        add(
            &mut touched,
            &mut seen,
            e.row_key.clone(),
            e.value.clone(),
            e.key.clone(),
            e.hash,
        );
    }
    for e in other_delta {
        for (row_key, value) in side.elements_with_key(&e.key, e.hash) {
            add(&mut touched, &mut seen, row_key, value, e.key.clone(), e.hash);
        }
    }
    touched
}

#[inline]
fn pad_weight(weight: Weight, match_weight: Weight) -> Weight {
    if match_weight <= 0 {
        weight
    } else {
        0
    }
}

/// Composite key of a joined row; an absent side leaves its slot empty.
fn composite_key(left: Option<&str>, right: Option<&str>) -> RowKey {
    SmolStr::new(format!(
        "[{},{}]",
        left.unwrap_or(""),
        right.unwrap_or("")
    ))
}

/// Merge two namespaced rows. Aliases are unique per query, so the maps
/// are disjoint.
fn merge_rows(a: &RillValue, b: &RillValue) -> Result<RillValue, EngineError> {
    let a = a.as_object().ok_or(EvalError::NotAnObject)?;
    let b = b.as_object().ok_or(EvalError::NotAnObject)?;
    let mut out = a.clone();
    for (k, v) in b {
        out.insert(k.clone(), v.clone());
    }
    Ok(RillValue::Object(out))
}

/// A present row padded with explicit nulls for the absent side's aliases.
fn pad_row(present: &RillValue, absent_aliases: &[SmolStr]) -> Result<RillValue, EngineError> {
    let mut out = present.as_object().ok_or(EvalError::NotAnObject)?.clone();
    for alias in absent_aliases {
        out.insert(alias.clone(), RillValue::Null);
    }
    Ok(RillValue::Object(out))
}
