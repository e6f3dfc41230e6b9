//! Fractional indexing over base-62 order keys.
//!
//! An order key sorts lexicographically as a plain byte string, and for
//! any two keys there is always a third that sorts strictly between them,
//! so siblings can be inserted at arbitrary positions without renumbering.
//!
//! A key is an integer part and an optional fraction. The integer part is
//! variable-length with the length encoded in its head digit (`a`..`z`
//! for positive lengths 2..27, `Z`..`A` for "negative" lengths 2..27), so
//! longer integers still compare correctly byte by byte. Fractions never
//! end in `0`, keeping each value's encoding unique.

use std::fmt;

/// Digits in ascending order. Base 62.
const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// The smallest representable integer part. No valid key may equal it,
/// so a key strictly before any existing key can always be produced.
const SMALLEST_INT: &str = "A00000000000000000000000000";

/// The key produced for the very first element.
const ZERO: &str = "a0";

/// Errors from order-key construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FracdexError {
    /// A key is structurally malformed.
    #[error("invalid order key {0:?}")]
    InvalidKey(String),

    /// The bounds are not in strictly ascending order.
    #[error("invalid order key range: {a:?} >= {b:?}")]
    InvalidRange { a: String, b: String },

    /// The integer key space ran out in the requested direction.
    #[error("order key space exhausted")]
    Exhausted,
}

type Result<T> = std::result::Result<T, FracdexError>;

/// Produce a key strictly between `a` and `b`.
///
/// An empty `a` means "before everything"; an empty `b` means "after
/// everything". Both empty yields the canonical first key.
///
/// # Errors
///
/// [`FracdexError`] when a bound is malformed or `a >= b`.
pub fn key_between(a: &str, b: &str) -> Result<String> {
    if !a.is_empty() {
        validate_order_key(a)?;
    }
    if !b.is_empty() {
        validate_order_key(b)?;
    }
    if !a.is_empty() && !b.is_empty() && a >= b {
        return Err(FracdexError::InvalidRange {
            a: a.to_owned(),
            b: b.to_owned(),
        });
    }

    if a.is_empty() {
        if b.is_empty() {
            return Ok(ZERO.to_owned());
        }
        let ib = int_part(b)?;
        let fb = &b[ib.len()..];
        if ib == SMALLEST_INT {
            return Ok(format!("{ib}{}", midpoint("", fb)));
        }
        if ib < b {
            return Ok(ib.to_owned());
        }
        return decrement_int(ib)?.ok_or(FracdexError::Exhausted);
    }

    if b.is_empty() {
        let ia = int_part(a)?;
        let fa = &a[ia.len()..];
        return match increment_int(ia)? {
            Some(next) => Ok(next),
            None => Ok(format!("{ia}{}", midpoint(fa, ""))),
        };
    }

    let ia = int_part(a)?;
    let fa = &a[ia.len()..];
    let ib = int_part(b)?;
    let fb = &b[ib.len()..];
    if ia == ib {
        return Ok(format!("{ia}{}", midpoint(fa, fb)));
    }
    match increment_int(ia)? {
        Some(next) if next.as_str() < b => Ok(next),
        _ => Ok(format!("{ia}{}", midpoint(fa, ""))),
    }
}

/// Check that `key` is well formed: correct integer length, fraction not
/// ending in `0`, and not the reserved smallest integer.
///
/// # Errors
///
/// [`FracdexError::InvalidKey`] otherwise.
pub fn validate_order_key(key: &str) -> Result<()> {
    if key == SMALLEST_INT {
        return Err(FracdexError::InvalidKey(key.to_owned()));
    }
    let ip = int_part(key)?;
    let fraction = &key[ip.len()..];
    if fraction.ends_with('0') {
        return Err(FracdexError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Integer-part arithmetic
// ---------------------------------------------------------------------------

fn digit_index(d: u8) -> Result<usize> {
    DIGITS
        .iter()
        .position(|&c| c == d)
        .ok_or_else(|| FracdexError::InvalidKey(String::from_utf8_lossy(&[d]).into_owned()))
}

/// Total integer-part length (head included) encoded by a head digit.
fn int_len(head: u8) -> Result<usize> {
    match head {
        b'a'..=b'z' => Ok((head - b'a') as usize + 2),
        b'A'..=b'Z' => Ok((b'Z' - head) as usize + 2),
        _ => Err(FracdexError::InvalidKey(
            String::from_utf8_lossy(&[head]).into_owned(),
        )),
    }
}

/// The integer-part prefix of a key.
fn int_part(key: &str) -> Result<&str> {
    let head = *key
        .as_bytes()
        .first()
        .ok_or_else(|| FracdexError::InvalidKey(key.to_owned()))?;
    let len = int_len(head)?;
    if len > key.len() {
        return Err(FracdexError::InvalidKey(key.to_owned()));
    }
    Ok(&key[..len])
}

/// The next larger integer part, or `None` when the space is exhausted.
fn increment_int(x: &str) -> Result<Option<String>> {
    validate_int(x)?;
    let head = x.as_bytes()[0];
    let mut digits: Vec<u8> = x.as_bytes()[1..].to_vec();
    let mut carry = true;
    for d in digits.iter_mut().rev() {
        let next = digit_index(*d)? + 1;
        if next == DIGITS.len() {
            *d = b'0';
        } else {
            *d = DIGITS[next];
            carry = false;
            break;
        }
    }
    if carry {
        if head == b'Z' {
            return Ok(Some("a0".to_owned()));
        }
        if head == b'z' {
            return Ok(None);
        }
        let h = head + 1;
        if h > b'a' {
            digits.push(b'0');
        } else {
            digits.pop();
        }
        digits.insert(0, h);
        return Ok(Some(ascii(digits)));
    }
    digits.insert(0, head);
    Ok(Some(ascii(digits)))
}

/// The next smaller integer part, or `None` when the space is exhausted.
fn decrement_int(x: &str) -> Result<Option<String>> {
    validate_int(x)?;
    let head = x.as_bytes()[0];
    let mut digits: Vec<u8> = x.as_bytes()[1..].to_vec();
    let mut borrow = true;
    for d in digits.iter_mut().rev() {
        match digit_index(*d)? {
            0 => *d = b'z',
            n => {
                *d = DIGITS[n - 1];
                borrow = false;
                break;
            }
        }
    }
    if borrow {
        if head == b'a' {
            return Ok(Some("Zz".to_owned()));
        }
        if head == b'A' {
            return Ok(None);
        }
        let h = head - 1;
        if h < b'Z' {
            digits.push(b'z');
        } else {
            digits.pop();
        }
        digits.insert(0, h);
        return Ok(Some(ascii(digits)));
    }
    digits.insert(0, head);
    Ok(Some(ascii(digits)))
}

fn validate_int(x: &str) -> Result<()> {
    let head = *x
        .as_bytes()
        .first()
        .ok_or_else(|| FracdexError::InvalidKey(x.to_owned()))?;
    if x.len() != int_len(head)? {
        return Err(FracdexError::InvalidKey(x.to_owned()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fraction midpoint
// ---------------------------------------------------------------------------

/// A fraction strictly between fractions `a` and `b`, where an empty `b`
/// stands for infinity. Requires `a < b` lexicographically (with the
/// infinity convention); both fractions are over [`DIGITS`].
fn midpoint(a: &str, b: &str) -> String {
    let ab = a.as_bytes();
    let bb = b.as_bytes();

    if !b.is_empty() {
        // Shared prefix passes through unchanged; `a` is padded with `0`.
        let mut i = 0;
        while i < bb.len() {
            let ca = ab.get(i).copied().unwrap_or(b'0');
            if ca != bb[i] {
                break;
            }
            i += 1;
        }
        if i > 0 {
            let rest_a = if i <= ab.len() { &a[i..] } else { "" };
            return format!("{}{}", &b[..i], midpoint(rest_a, &b[i..]));
        }
    }

    let digit_a = ab.first().map_or(0, |&d| position(d));
    let digit_b = bb.first().map_or(DIGITS.len(), |&d| position(d));
    if digit_b - digit_a > 1 {
        let mid = (digit_a + digit_b + 1) / 2;
        return ascii(vec![DIGITS[mid]]);
    }

    // First digits are consecutive.
    if b.len() > 1 {
        return b[..1].to_owned();
    }
    let rest_a = if a.is_empty() { "" } else { &a[1..] };
    format!("{}{}", ascii(vec![DIGITS[digit_a]]), midpoint(rest_a, ""))
}

/// Digit position, treating unknown bytes as the smallest digit. Only
/// reachable on input already validated by [`validate_order_key`].
fn position(d: u8) -> usize {
    DIGITS.iter().position(|&c| c == d).unwrap_or(0)
}

fn ascii(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn between(a: &str, b: &str) -> String {
        key_between(a, b).expect("key_between")
    }

    #[test]
    fn known_midpoints() {
        assert_eq!(between("", ""), "a0");
        assert_eq!(between("", "a0"), "Zz");
        assert_eq!(between("a0", ""), "a1");
        assert_eq!(between("a0", "a1"), "a0V");
        assert_eq!(between("a0V", "a1"), "a0l");
        assert_eq!(between("Zz", "a0"), "ZzV");
        assert_eq!(between("Zz", "a1"), "a0");
        assert_eq!(between("", "Y00"), "Xzzz");
        assert_eq!(between("a0z", "a1"), "a0zV");
    }

    #[test]
    fn result_sorts_strictly_between_bounds() {
        let cases = [
            ("", ""),
            ("", "a0"),
            ("a0", ""),
            ("a0", "a1"),
            ("a0V", "a1"),
            ("Zz", "a0"),
            ("a1", "a1V"),
            ("a00001", "a00002"),
        ];
        for (a, b) in cases {
            let mid = between(a, b);
            if !a.is_empty() {
                assert!(a < mid.as_str(), "{a:?} < {mid:?}");
            }
            if !b.is_empty() {
                assert!(mid.as_str() < b, "{mid:?} < {b:?}");
            }
            validate_order_key(&mid).expect("valid output");
        }
    }

    #[test]
    fn appending_stays_sorted() {
        let mut last = String::new();
        for _ in 0..1000 {
            let next = between(&last, "");
            assert!(last < next);
            last = next;
        }
    }

    #[test]
    fn prepending_stays_sorted() {
        let mut first = String::new();
        for _ in 0..1000 {
            let next = between("", &first);
            if !first.is_empty() {
                assert!(next < first, "{next:?} < {first:?}");
            }
            first = next;
        }
    }

    #[test]
    fn repeated_bisection_stays_sorted() {
        let mut lo = between("", "");
        let mut hi = between(&lo, "");
        for i in 0..500 {
            let mid = between(&lo, &hi);
            assert!(lo < mid && mid < hi, "{lo:?} < {mid:?} < {hi:?}");
            if i % 2 == 0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            key_between("a1", "a0"),
            Err(FracdexError::InvalidRange { .. })
        ));
        assert!(matches!(
            key_between("a0", "a0"),
            Err(FracdexError::InvalidRange { .. })
        ));
        assert!(key_between("!", "").is_err());
        assert!(key_between("a", "").is_err(), "truncated integer part");
        assert!(
            key_between("a00", "").is_err(),
            "fraction must not end in 0"
        );
        assert!(key_between(SMALLEST_INT, "").is_err());
    }

    #[test]
    fn integer_rollover_across_lengths() {
        // "az" is the largest two-digit integer; its successor is longer.
        assert_eq!(between("az", ""), "b00");
        // Decrementing below "a0" switches to the capital range.
        assert_eq!(between("", "Zz"), "Zy");
    }
}
