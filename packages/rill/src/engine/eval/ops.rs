use crate::engine::types::{Path, RillValue};
use rustc_hash::FxHasher;
use std::cmp::Ordering;
use std::hash::Hasher;

/// Resolve a dot path inside a value. Missing segments resolve to `None`.
#[inline(always)]
pub fn resolve_path<'a>(root: Option<&'a RillValue>, path: &Path) -> Option<&'a RillValue> {
    let mut current = root;
    for part in path.segments() {
        match current {
            Some(RillValue::Object(map)) => current = map.get(part),
            _ => return None,
        }
    }
    current
}

/// Total order over values, used for sort keys and range comparisons.
///
/// Values of different kinds order by kind rank (null first); numbers with
/// no defined order (NaN against NaN) compare equal.
pub fn compare_values(a: Option<&RillValue>, b: Option<&RillValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => match (va, vb) {
            (RillValue::Null, RillValue::Null) => Ordering::Equal,
            (RillValue::Bool(ba), RillValue::Bool(bb)) => ba.cmp(bb),
            (RillValue::Number(na), RillValue::Number(nb)) => {
                na.partial_cmp(nb).unwrap_or(Ordering::Equal)
            }
            (RillValue::Str(sa), RillValue::Str(sb)) => sa.cmp(sb),
            (RillValue::Array(aa), RillValue::Array(ab)) => {
                for (ia, ib) in aa.iter().zip(ab.iter()) {
                    let cmp = compare_values(Some(ia), Some(ib));
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                aa.len().cmp(&ab.len())
            }
            (RillValue::Object(oa), RillValue::Object(ob)) => oa.len().cmp(&ob.len()),
            _ => type_rank(va).cmp(&type_rank(vb)),
        },
    }
}

fn type_rank(v: &RillValue) -> u8 {
    match v {
        RillValue::Null => 0,
        RillValue::Bool(_) => 1,
        RillValue::Number(_) => 2,
        RillValue::Str(_) => 3,
        RillValue::Array(_) => 4,
        RillValue::Object(_) => 5,
    }
}

/// Structural hash for join-key bucketing. Equal values hash equal; the
/// join verifies candidates with a structural comparison, so collisions
/// only cost a probe.
#[inline(always)]
pub fn hash_value(v: &RillValue) -> u64 {
    let mut hasher = FxHasher::default();
    hash_value_recursive(v, &mut hasher);
    hasher.finish()
}

fn hash_value_recursive(v: &RillValue, hasher: &mut FxHasher) {
    match v {
        RillValue::Null => hasher.write_u8(0),
        RillValue::Bool(b) => {
            hasher.write_u8(1);
            hasher.write_u8(*b as u8);
        }
        RillValue::Number(n) => {
            hasher.write_u8(2);
            hasher.write_u64(n.to_bits());
        }
        RillValue::Str(s) => {
            hasher.write_u8(3);
            hasher.write(s.as_bytes());
        }
        RillValue::Array(arr) => {
            hasher.write_u8(4);
            for item in arr {
                hash_value_recursive(item, hasher);
            }
        }
        RillValue::Object(obj) => {
            // Object hashing is order-sensitive; objects as join keys are
            // rare and collisions are resolved by equality anyway.
            hasher.write_u8(5);
            for (k, v) in obj {
                hasher.write(k.as_bytes());
                hash_value_recursive(v, hasher);
            }
        }
    }
}
