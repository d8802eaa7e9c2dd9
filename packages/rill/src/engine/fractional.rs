//! Fractional index keys.
//!
//! The order-by operator tags every emitted row with a string key whose
//! lexicographic order matches the sort order. Keys are dense: a new key
//! can always be synthesized strictly between two neighbors without
//! touching any other key, so local reordering never renumbers the rest
//! of the window.

use smol_str::SmolStr;
use thiserror::Error;

/// Base-62 digit alphabet in ASCII order, so digit order and string order
/// agree.
const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const BASE: usize = DIGITS.len();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FractionalKeyError {
    #[error("lower bound {0:?} is not below upper bound {1:?}")]
    OutOfOrder(SmolStr, SmolStr),
    #[error("invalid fractional key {0:?}")]
    InvalidKey(SmolStr),
}

fn digit_index(d: u8) -> Option<usize> {
    DIGITS.iter().position(|&c| c == d)
}

fn validate(key: &str) -> Result<(), FractionalKeyError> {
    let bad = key.is_empty()
        || key.bytes().any(|b| digit_index(b).is_none())
        || key.as_bytes().last() == Some(&DIGITS[0]);
    if bad {
        Err(FractionalKeyError::InvalidKey(SmolStr::new(key)))
    } else {
        Ok(())
    }
}

/// Produce a key strictly between `lo` and `hi`.
///
/// `None` stands for the open end of the key space on either side. When
/// both bounds are given, `lo` must sort strictly below `hi`.
pub fn key_between(lo: Option<&str>, hi: Option<&str>) -> Result<SmolStr, FractionalKeyError> {
    if let Some(a) = lo {
        validate(a)?;
    }
    if let Some(b) = hi {
        validate(b)?;
    }
    if let (Some(a), Some(b)) = (lo, hi) {
        if a >= b {
            return Err(FractionalKeyError::OutOfOrder(SmolStr::new(a), SmolStr::new(b)));
        }
    }
    Ok(SmolStr::new(midpoint(lo.unwrap_or(""), hi)))
}

/// Midpoint of the open interval `(a, b)`, where an empty `a` is the low
/// end of the key space and `b == None` the high end.
///
/// Invariant maintained throughout: results never end in the minimum
/// digit, so a key below any existing key can always be formed.
fn midpoint(a: &str, b: Option<&str>) -> String {
    if let Some(b) = b {
        // Walk the common prefix, treating the exhausted part of `a` as
        // padded with minimum digits. `b` cannot run out first: it would
        // have to be a zero-padded prefix of `a`, which either sorts below
        // `a` or carries a trailing minimum digit, both excluded.
        let zero = DIGITS[0];
        let bb = b.as_bytes();
        let ab = a.as_bytes();
        let mut n = 0;
        while n < bb.len() && ab.get(n).copied().unwrap_or(zero) == bb[n] {
            n += 1;
        }
        if n > 0 {
            let a_rest = if n < ab.len() { &a[n..] } else { "" };
            return format!("{}{}", &b[..n], midpoint(a_rest, Some(&b[n..])));
        }
    }

    let digit_a = a
        .as_bytes()
        .first()
        .and_then(|&d| digit_index(d))
        .unwrap_or(0);
    let digit_b = b
        .and_then(|b| b.as_bytes().first())
        .and_then(|&d| digit_index(d))
        .unwrap_or(BASE);

    if digit_b - digit_a > 1 {
        // Room for a single interior digit.
        let mid = (digit_a + digit_b + 1) / 2;
        return (DIGITS[mid] as char).to_string();
    }

    // Consecutive first digits.
    if let Some(b) = b {
        if b.len() > 1 {
            return b[..1].to_string();
        }
    }
    let a_rest = if a.is_empty() { "" } else { &a[1..] };
    format!("{}{}", DIGITS[digit_a] as char, midpoint(a_rest, None))
}

#[cfg(test)]
mod fractional_tests {
    use super::*;

    fn between(lo: Option<&str>, hi: Option<&str>) -> String {
        key_between(lo, hi).unwrap().to_string()
    }

    #[test]
    fn test_first_key() {
        let k = between(None, None);
        assert_eq!(k, "V");
    }

    #[test]
    fn test_between_orders() {
        let k = between(Some("A"), Some("B"));
        assert!("A" < k.as_str() && k.as_str() < "B");
    }

    #[test]
    fn test_append_and_prepend() {
        let k = between(Some("V"), None);
        assert!(k.as_str() > "V");
        let k = between(None, Some("V"));
        assert!(k.as_str() < "V");
    }

    #[test]
    fn test_never_trailing_minimum_digit() {
        let mut keys = vec![between(None, None)];
        // Repeatedly squeeze keys below the smallest one.
        for _ in 0..40 {
            let lo = keys.last().unwrap().clone();
            let k = between(None, Some(&lo));
            assert!(k.as_str() < lo.as_str());
            assert!(!k.ends_with('0'));
            keys.push(k);
        }
    }

    #[test]
    fn test_dense_insertion_chain() {
        // Squeeze 100 keys into one gap; order must stay strict and no
        // existing key ever changes.
        let mut lo = between(None, None);
        let hi = between(Some(&lo), None);
        for _ in 0..100 {
            let mid = between(Some(&lo), Some(&hi));
            assert!(lo.as_str() < mid.as_str() && mid.as_str() < hi.as_str());
            lo = mid;
        }
    }

    #[test]
    fn test_interleaved_growth() {
        let mut keys: Vec<String> = vec![between(None, None)];
        for i in 0..50 {
            keys.sort();
            let k = if i % 2 == 0 {
                between(Some(keys.last().unwrap()), None)
            } else {
                between(None, Some(keys.first().unwrap()))
            };
            assert!(!keys.contains(&k));
            keys.push(k);
        }
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 51);
    }

    #[test]
    fn test_out_of_order_bounds() {
        assert!(matches!(
            key_between(Some("B"), Some("A")),
            Err(FractionalKeyError::OutOfOrder(_, _))
        ));
        assert!(matches!(
            key_between(Some("A"), Some("A")),
            Err(FractionalKeyError::OutOfOrder(_, _))
        ));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert!(key_between(Some(""), None).is_err());
        assert!(key_between(Some("A0"), None).is_err());
        assert!(key_between(Some("A!"), None).is_err());
    }

    #[test]
    fn test_zero_prefixed_neighbor() {
        // Regression shape: generating below a key that starts with the
        // minimum digit must not produce a trailing-zero key.
        let low = between(None, Some("1"));
        assert!(low.as_str() < "1");
        let lower = between(None, Some(&low));
        assert!(lower.as_str() < low.as_str());
        assert!(!lower.ends_with('0'));
    }
}
