//! Ordered candidate indexes for the windowed order-by operator.
//!
//! Two engines share one external contract: a flat sorted vector, cheap
//! for small windows, and a size-balanced binary tree with subtree counts
//! for O(log n) rank/select on large candidate sets.

use crate::engine::eval::compare_values;
use crate::engine::types::{RillValue, RowKey};
use rill_protocol::Direction;
use smallvec::SmallVec;
use std::cmp::Ordering;

pub type SortValues = SmallVec<[RillValue; 2]>;

/// Position of one candidate in the maintained order: its derived sort
/// values plus the row key as the final tiebreak.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedKey {
    pub sort: SortValues,
    pub row: RowKey,
}

/// Comparator over [`OrderedKey`]s; one direction per sort term.
#[derive(Clone, Debug)]
pub struct SortComparator {
    directions: SmallVec<[Direction; 2]>,
}

impl SortComparator {
    pub fn new(directions: impl IntoIterator<Item = Direction>) -> Self {
        Self {
            directions: directions.into_iter().collect(),
        }
    }

    pub fn cmp(&self, a: &OrderedKey, b: &OrderedKey) -> Ordering {
        for (i, dir) in self.directions.iter().enumerate() {
            let ord = compare_values(a.sort.get(i), b.sort.get(i));
            let ord = match dir {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.row.cmp(&b.row)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Flat,
    Tree,
}

/// The two engines behind one exhaustive dispatch.
pub enum OrderedIndex {
    Flat(FlatOrderedIndex),
    Tree(TreeOrderedIndex),
}

impl OrderedIndex {
    pub fn new(kind: IndexKind, cmp: SortComparator) -> Self {
        match kind {
            IndexKind::Flat => OrderedIndex::Flat(FlatOrderedIndex::new(cmp)),
            IndexKind::Tree => OrderedIndex::Tree(TreeOrderedIndex::new(cmp)),
        }
    }

    pub fn insert(&mut self, key: OrderedKey) {
        match self {
            OrderedIndex::Flat(ix) => ix.insert(key),
            OrderedIndex::Tree(ix) => ix.insert(key),
        }
    }

    pub fn remove(&mut self, key: &OrderedKey) -> bool {
        match self {
            OrderedIndex::Flat(ix) => ix.remove(key),
            OrderedIndex::Tree(ix) => ix.remove(key),
        }
    }

    pub fn rank(&self, key: &OrderedKey) -> Option<usize> {
        match self {
            OrderedIndex::Flat(ix) => ix.rank(key),
            OrderedIndex::Tree(ix) => ix.rank(key),
        }
    }

    pub fn get(&self, rank: usize) -> Option<&OrderedKey> {
        match self {
            OrderedIndex::Flat(ix) => ix.get(rank),
            OrderedIndex::Tree(ix) => ix.get(rank),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OrderedIndex::Flat(ix) => ix.len(),
            OrderedIndex::Tree(ix) => ix.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// --- Flat engine ---

pub struct FlatOrderedIndex {
    cmp: SortComparator,
    items: Vec<OrderedKey>,
}

impl FlatOrderedIndex {
    pub fn new(cmp: SortComparator) -> Self {
        Self {
            cmp,
            items: Vec::new(),
        }
    }

    fn position(&self, key: &OrderedKey) -> Result<usize, usize> {
        self.items.binary_search_by(|probe| self.cmp.cmp(probe, key))
    }

    pub fn insert(&mut self, key: OrderedKey) {
        match self.position(&key) {
            // Duplicate (sort, row) pairs cannot occur: the row key breaks
            // every tie and a row is removed before it is reinserted.
            Ok(i) | Err(i) => self.items.insert(i, key),
        }
    }

    pub fn remove(&mut self, key: &OrderedKey) -> bool {
        match self.position(key) {
            Ok(i) => {
                self.items.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn rank(&self, key: &OrderedKey) -> Option<usize> {
        self.position(key).ok()
    }

    pub fn get(&self, rank: usize) -> Option<&OrderedKey> {
        self.items.get(rank)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

// --- Tree engine ---

struct Node {
    key: OrderedKey,
    left: Link,
    right: Link,
    size: usize,
}

type Link = Option<Box<Node>>;

impl Node {
    fn new(key: OrderedKey) -> Box<Node> {
        Box::new(Node {
            key,
            left: None,
            right: None,
            size: 1,
        })
    }

    fn update_size(&mut self) {
        self.size = 1 + size(&self.left) + size(&self.right);
    }
}

#[inline]
fn size(link: &Link) -> usize {
    link.as_ref().map(|n| n.size).unwrap_or(0)
}

fn rotate_left(link: &mut Link) {
    if let Some(mut t) = link.take() {
        match t.right.take() {
            Some(mut r) => {
                t.right = r.left.take();
                t.update_size();
                r.left = Some(t);
                r.update_size();
                *link = Some(r);
            }
            None => *link = Some(t),
        }
    }
}

fn rotate_right(link: &mut Link) {
    if let Some(mut t) = link.take() {
        match t.left.take() {
            Some(mut l) => {
                t.left = l.right.take();
                t.update_size();
                l.right = Some(t);
                l.update_size();
                *link = Some(l);
            }
            None => *link = Some(t),
        }
    }
}

/// Restore the size-balance invariant after an insert; `right_grew` says
/// which side the new key went down.
fn maintain(link: &mut Link, right_grew: bool) {
    let rotated = {
        let Some(t) = link.as_deref() else { return };
        if !right_grew {
            let left_left = t.left.as_ref().map(|l| size(&l.left)).unwrap_or(0);
            let left_right = t.left.as_ref().map(|l| size(&l.right)).unwrap_or(0);
            if left_left > size(&t.right) {
                rotate_right(link);
                true
            } else if left_right > size(&t.right) {
                if let Some(t) = link.as_deref_mut() {
                    rotate_left(&mut t.left);
                }
                rotate_right(link);
                true
            } else {
                false
            }
        } else {
            let right_right = t.right.as_ref().map(|r| size(&r.right)).unwrap_or(0);
            let right_left = t.right.as_ref().map(|r| size(&r.left)).unwrap_or(0);
            if right_right > size(&t.left) {
                rotate_left(link);
                true
            } else if right_left > size(&t.left) {
                if let Some(t) = link.as_deref_mut() {
                    rotate_right(&mut t.right);
                }
                rotate_left(link);
                true
            } else {
                false
            }
        }
    };

    if rotated {
        if let Some(t) = link.as_deref_mut() {
            maintain(&mut t.left, false);
            maintain(&mut t.right, true);
        }
        maintain(link, true);
        maintain(link, false);
    }
}

fn insert_at(link: &mut Link, key: OrderedKey, cmp: &SortComparator) {
    let right = match link.as_deref_mut() {
        None => {
            *link = Some(Node::new(key));
            return;
        }
        Some(node) => {
            let right = cmp.cmp(&key, &node.key) != Ordering::Less;
            if right {
                insert_at(&mut node.right, key, cmp);
            } else {
                insert_at(&mut node.left, key, cmp);
            }
            node.update_size();
            right
        }
    };
    maintain(link, right);
}

fn remove_at(link: &mut Link, key: &OrderedKey, cmp: &SortComparator) -> bool {
    let ord = match link.as_deref() {
        None => return false,
        Some(node) => cmp.cmp(key, &node.key),
    };
    match ord {
        Ordering::Equal => {
            let node = match link.take() {
                Some(node) => node,
                None => return false,
            };
            let Node { left, right, .. } = *node;
            *link = match (left, right) {
                (None, r) => r,
                (l, None) => l,
                (l, Some(r)) => {
                    let mut r = Some(r);
                    match take_min(&mut r) {
                        Some(mut successor) => {
                            successor.left = l;
                            successor.right = r;
                            successor.update_size();
                            Some(successor)
                        }
                        // The right subtree is non-empty; unreachable.
                        None => l,
                    }
                }
            };
            true
        }
        Ordering::Less | Ordering::Greater => {
            let removed = match link.as_deref_mut() {
                None => false,
                Some(node) => {
                    let removed = if ord == Ordering::Less {
                        remove_at(&mut node.left, key, cmp)
                    } else {
                        remove_at(&mut node.right, key, cmp)
                    };
                    if removed {
                        node.update_size();
                    }
                    removed
                }
            };
            removed
        }
    }
}

fn take_min(link: &mut Link) -> Option<Box<Node>> {
    let has_left = match link.as_deref() {
        None => return None,
        Some(node) => node.left.is_some(),
    };
    if has_left {
        let node = link.as_deref_mut()?;
        let min = take_min(&mut node.left);
        node.update_size();
        min
    } else {
        let mut node = link.take()?;
        *link = node.right.take();
        node.size = 1;
        Some(node)
    }
}

pub struct TreeOrderedIndex {
    cmp: SortComparator,
    root: Link,
}

impl TreeOrderedIndex {
    pub fn new(cmp: SortComparator) -> Self {
        Self { cmp, root: None }
    }

    pub fn insert(&mut self, key: OrderedKey) {
        insert_at(&mut self.root, key, &self.cmp);
    }

    pub fn remove(&mut self, key: &OrderedKey) -> bool {
        remove_at(&mut self.root, key, &self.cmp)
    }

    pub fn rank(&self, key: &OrderedKey) -> Option<usize> {
        let mut node = self.root.as_deref();
        let mut acc = 0;
        while let Some(n) = node {
            match self.cmp.cmp(key, &n.key) {
                Ordering::Less => node = n.left.as_deref(),
                Ordering::Greater => {
                    acc += size(&n.left) + 1;
                    node = n.right.as_deref();
                }
                Ordering::Equal => return Some(acc + size(&n.left)),
            }
        }
        None
    }

    pub fn get(&self, rank: usize) -> Option<&OrderedKey> {
        let mut node = self.root.as_deref();
        let mut rank = rank;
        while let Some(n) = node {
            let left = size(&n.left);
            match rank.cmp(&left) {
                Ordering::Less => node = n.left.as_deref(),
                Ordering::Equal => return Some(&n.key),
                Ordering::Greater => {
                    rank -= left + 1;
                    node = n.right.as_deref();
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }
}
