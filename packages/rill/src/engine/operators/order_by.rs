//! Windowed top-K maintenance with fractional indices.
//!
//! The operator keeps every candidate row ordered by its derived sort key
//! and emits only the rows inside the `{offset, limit}` window. Rows
//! crossing the window boundary produce retract/insert pairs; rows that
//! stay inside keep their fractional index, so a change never renumbers
//! its neighbors.

use super::ordered_index::{IndexKind, OrderedIndex, OrderedKey, SortComparator, SortValues};
use crate::engine::eval::{compare_values, EvalError};
use crate::engine::fractional::key_between;
use crate::engine::types::{DeltaBatch, FastMap, RillValue, RowKey, Weight};
use crate::engine::EngineError;
use rill_protocol::Window;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::cmp::Ordering;

pub type SortFn = Box<dyn FnMut(&RillValue) -> Result<SortValues, EvalError>>;

/// Field names of the wrapped entries emitted downstream.
pub const ORDERED_VALUE: &str = "value";
pub const ORDERED_INDEX: &str = "index";

pub fn wrap_ordered(value: RillValue, index: &str) -> RillValue {
    RillValue::object_of([
        (ORDERED_VALUE, value),
        (ORDERED_INDEX, RillValue::Str(SmolStr::new(index))),
    ])
}

/// Split a wrapped entry back into `(value, fractional index)`.
pub fn unwrap_ordered(wrapped: &RillValue) -> Option<(&RillValue, &str)> {
    let value = wrapped.get(ORDERED_VALUE)?;
    let index = wrapped.get(ORDERED_INDEX)?.as_str()?;
    Some((value, index))
}

struct Candidate {
    value: RillValue,
    sort: SortValues,
}

struct Emitted {
    value: RillValue,
    index: SmolStr,
}

pub struct OrderByOperator {
    sort_fn: SortFn,
    index: OrderedIndex,
    window: Window,
    /// Multiset bookkeeping per row key; a row is a candidate while it has
    /// a positively-weighted value.
    slots: FastMap<RowKey, SmallVec<[(RillValue, Weight); 2]>>,
    /// Rows currently in the ordered index.
    candidates: FastMap<RowKey, Candidate>,
    /// Rows currently emitted, with their fractional indices.
    emitted: FastMap<RowKey, Emitted>,
}

impl OrderByOperator {
    pub fn new(sort_fn: SortFn, comparator: SortComparator, kind: IndexKind, window: Window) -> Self {
        Self {
            sort_fn,
            index: OrderedIndex::new(kind, comparator),
            window,
            slots: FastMap::default(),
            candidates: FastMap::default(),
            emitted: FastMap::default(),
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Number of maintained candidates (not just the window).
    pub fn candidate_count(&self) -> usize {
        self.index.len()
    }

    pub fn process(&mut self, batch: DeltaBatch) -> Result<DeltaBatch, EngineError> {
        let batch = batch.consolidate();
        if batch.is_empty() {
            return Ok(DeltaBatch::new());
        }

        let mut changed: Vec<RowKey> = Vec::new();
        for entry in batch {
            if !changed.contains(&entry.key) {
                changed.push(entry.key.clone());
            }
            let slots = self.slots.entry(entry.key.clone()).or_default();
            match slots.iter().position(|(v, _)| *v == entry.value) {
                Some(i) => {
                    slots[i].1 += entry.weight;
                    if slots[i].1 == 0 {
                        slots.remove(i);
                    }
                }
                None => slots.push((entry.value, entry.weight)),
            }
            if self.slots.get(&entry.key).map(|s| s.is_empty()).unwrap_or(false) {
                self.slots.remove(&entry.key);
            }
        }

        for key in changed {
            let new_value = self.present_value(&key);
            let unchanged = matches!(
                (self.candidates.get(&key), &new_value),
                (Some(c), Some(v)) if c.value == *v
            );
            if unchanged {
                continue;
            }
            if let Some(old) = self.candidates.remove(&key) {
                self.index.remove(&OrderedKey {
                    sort: old.sort,
                    row: key.clone(),
                });
            }
            if let Some(value) = new_value {
                let sort = (self.sort_fn)(&value)?;
                self.index.insert(OrderedKey {
                    sort: sort.clone(),
                    row: key.clone(),
                });
                self.candidates.insert(key, Candidate { value, sort });
            }
        }

        self.sync_window()
    }

    /// Move the window bounds and emit the membership delta, computed
    /// against the full maintained order; upstream sends nothing.
    pub fn set_window(&mut self, window: Window) -> Result<DeltaBatch, EngineError> {
        self.window = window;
        self.sync_window()
    }

    /// The value a row currently contributes: among its positive-weight
    /// slots, the heaviest wins; value order breaks ties.
    fn present_value(&self, key: &RowKey) -> Option<RillValue> {
        let slots = self.slots.get(key)?;
        slots
            .iter()
            .filter(|(_, w)| *w > 0)
            .max_by(|(va, wa), (vb, wb)| {
                wa.cmp(wb).then_with(|| compare_values(Some(va), Some(vb)))
            })
            .map(|(v, _)| v.clone())
    }

    /// Diff the emitted window against the desired one and assign
    /// fractional indices to entrants.
    fn sync_window(&mut self) -> Result<DeltaBatch, EngineError> {
        let (start, end) = self.window.bounds(self.index.len());

        let mut desired: Vec<(RowKey, RillValue)> = Vec::with_capacity(end - start);
        for rank in start..end {
            let ordered = self.index.get(rank).expect("rank within bounds");
            let candidate = self
                .candidates
                .get(&ordered.row)
                .expect("indexed row has a candidate");
            desired.push((ordered.row.clone(), candidate.value.clone()));
        }

        let mut out = DeltaBatch::new();

        // Rows that left the window.
        let mut removed: Vec<RowKey> = Vec::new();
        for key in self.emitted.keys() {
            if !desired.iter().any(|(k, _)| k == key) {
                removed.push(key.clone());
            }
        }
        removed.sort();
        for key in &removed {
            let em = self.emitted.remove(key).expect("key collected from emitted");
            out.push(key.clone(), wrap_ordered(em.value, &em.index), -1);
        }

        // For every position, the index of the nearest later row that is
        // certain to keep its fractional index.
        let mut next_stable: Vec<Option<SmolStr>> = vec![None; desired.len() + 1];
        for i in (0..desired.len()).rev() {
            let (key, value) = &desired[i];
            next_stable[i] = match self.emitted.get(key) {
                Some(em) if em.value == *value => Some(em.index.clone()),
                _ => next_stable[i + 1].clone(),
            };
        }

        let mut prev: Option<SmolStr> = None;
        for (i, (key, value)) in desired.into_iter().enumerate() {
            if let Some(em) = self.emitted.get(&key) {
                if em.value == value {
                    prev = Some(em.index.clone());
                    continue;
                }
            }

            let lo = prev.as_deref();
            let hi = next_stable[i + 1].as_deref();

            // A changed row that did not move keeps its old index.
            let reusable = self.emitted.get(&key).map(|em| em.index.clone()).filter(|old| {
                lo.map_or(true, |l| l < old.as_str()) && hi.map_or(true, |h| old.as_str() < h)
            });
            let index = match reusable {
                Some(old) => old,
                None => key_between(lo, hi)?,
            };

            if let Some(old) = self.emitted.remove(&key) {
                out.push(key.clone(), wrap_ordered(old.value, &old.index), -1);
            }
            out.push(key.clone(), wrap_ordered(value.clone(), &index), 1);
            self.emitted.insert(
                key,
                Emitted {
                    value,
                    index: index.clone(),
                },
            );
            prev = Some(index);
        }

        Ok(out.consolidate())
    }
}
