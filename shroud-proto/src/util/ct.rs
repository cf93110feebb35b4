//! Constant-time helpers used by the crypto pipeline.

use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// Try to find an item in a slice without leaking where and whether
/// the item was found.
///
/// If there is any item `x` in the `array` for which `matches(x)` is
/// true, this function will return a reference to one such item.
/// (We don't specify which.)
///
/// Note that this doesn't necessarily do a constant-time comparison,
/// and that it is not constant-time for the found/not-found case.
pub(crate) fn lookup<T, F>(array: &[T], matches: F) -> Option<&T>
where
    F: Fn(&T) -> Choice,
{
    // ConditionallySelectable isn't implemented for usize, so we need
    // to use u64.
    let mut idx: u64 = 0;
    let mut found: Choice = 0.into();

    for (i, x) in array.iter().enumerate() {
        let equal = matches(x);
        idx.conditional_assign(&(i as u64), equal);
        found.conditional_assign(&equal, equal);
    }

    if found.into() {
        Some(&array[idx as usize])
    } else {
        None
    }
}

/// Compare two byte slices for equality in constant time.
pub(crate) fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    let choice = a.ct_eq(b);
    choice.unwrap_u8() == 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bytes_eq() {
        assert!(bytes_eq(b"a fixed point", b"a fixed point"));
        assert!(!bytes_eq(b"a fixed point", b"a moving point"));
        assert!(!bytes_eq(b"a fixed point", b"a fixed poin"));
        assert!(bytes_eq(b"", b""));
    }

    #[test]
    fn test_lookup() {
        use subtle::ConstantTimeEq;
        let items = vec![50_u8, 30, 20, 77];
        let found = lookup(&items[..], |x| x.ct_eq(&20));
        assert_eq!(found, Some(&20));
        let missing = lookup(&items[..], |x| x.ct_eq(&99));
        assert_eq!(missing, None);
    }
}
