use super::value::RillValue;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

/// Signed multiplicity of a multiset entry. Negative weights are
/// retractions.
pub type Weight = i64;

/// Key identifying a row within one collection or derived stream.
pub type RowKey = SmolStr;

pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastSet<K> = std::collections::HashSet<K, BuildHasherDefault<FxHasher>>;

/// One keyed value with a multiplicity.
#[derive(Clone, Debug, PartialEq)]
pub struct MultisetEntry {
    pub key: RowKey,
    pub value: RillValue,
    pub weight: Weight,
}

impl MultisetEntry {
    pub fn new(key: impl Into<RowKey>, value: RillValue, weight: Weight) -> Self {
        Self {
            key: key.into(),
            value,
            weight,
        }
    }
}

/// An unordered bag of keyed values with integer multiplicities, the unit
/// of change flowing through the graph.
///
/// Entries with equal `(key, value)` may be combined by summing weights;
/// a weight of zero is a no-op and is elided by [`DeltaBatch::consolidate`].
/// An update is represented as a retraction of the old value plus an
/// insertion of the new one under the same key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeltaBatch {
    entries: Vec<MultisetEntry>,
}

impl DeltaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<MultisetEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, key: impl Into<RowKey>, value: RillValue, weight: Weight) {
        if weight != 0 {
            self.entries.push(MultisetEntry::new(key, value, weight));
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MultisetEntry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<MultisetEntry> {
        self.entries
    }

    /// Apply `f` to every entry, keeping weights.
    pub fn map<E>(
        self,
        mut f: impl FnMut(&RowKey, &RillValue) -> Result<(RowKey, RillValue), E>,
    ) -> Result<DeltaBatch, E> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let (key, value) = f(&entry.key, &entry.value)?;
            out.push(MultisetEntry::new(key, value, entry.weight));
        }
        Ok(DeltaBatch { entries: out })
    }

    /// Keep entries for which `pred` holds, with their weights.
    pub fn filter<E>(
        self,
        mut pred: impl FnMut(&RowKey, &RillValue) -> Result<bool, E>,
    ) -> Result<DeltaBatch, E> {
        let mut out = Vec::new();
        for entry in self.entries {
            if pred(&entry.key, &entry.value)? {
                out.push(entry);
            }
        }
        Ok(DeltaBatch { entries: out })
    }

    /// Append all entries of `other`.
    pub fn concat(&mut self, other: DeltaBatch) {
        self.entries.extend(other.entries);
    }

    /// Flip every weight; turns a batch into its retraction.
    pub fn negate(mut self) -> DeltaBatch {
        for entry in &mut self.entries {
            entry.weight = -entry.weight;
        }
        self
    }

    /// Sum weights of equal `(key, value)` pairs and drop zeros.
    ///
    /// Values under one key are compared structurally; a batch rarely holds
    /// more than two distinct values per key (old and new), so a linear
    /// scan per key beats hashing whole values.
    pub fn consolidate(self) -> DeltaBatch {
        let mut per_key: FastMap<RowKey, SmallVec<[(RillValue, Weight); 2]>> = FastMap::default();
        let mut key_order: Vec<RowKey> = Vec::new();

        for entry in self.entries {
            if !per_key.contains_key(&entry.key) {
                key_order.push(entry.key.clone());
            }
            let slots = per_key.entry(entry.key.clone()).or_default();
            match slots.iter_mut().find(|(v, _)| *v == entry.value) {
                Some((_, w)) => *w += entry.weight,
                None => slots.push((entry.value, entry.weight)),
            }
        }

        let mut out = Vec::new();
        for key in key_order {
            if let Some(slots) = per_key.remove(&key) {
                for (value, weight) in slots {
                    if weight != 0 {
                        out.push(MultisetEntry::new(key.clone(), value, weight));
                    }
                }
            }
        }
        DeltaBatch { entries: out }
    }

    /// Net weight per key, ignoring values. Used by tests and the join
    /// planner's cardinality probes.
    pub fn net_weights(&self) -> FastMap<RowKey, Weight> {
        let mut out: FastMap<RowKey, Weight> = FastMap::default();
        for entry in &self.entries {
            *out.entry(entry.key.clone()).or_insert(0) += entry.weight;
        }
        out.retain(|_, w| *w != 0);
        out
    }
}

impl IntoIterator for DeltaBatch {
    type Item = MultisetEntry;
    type IntoIter = std::vec::IntoIter<MultisetEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<MultisetEntry> for DeltaBatch {
    fn from_iter<T: IntoIterator<Item = MultisetEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
