//! Wraparound-safe arithmetic on the 16-bit SOE sequence ring.

use std::cmp::Ordering;

/// Forward distances below this are "after"; anything else is "before".
pub const SEQUENCE_WINDOW: u16 = 30_000;

/// Number of steps from `from` forward to `to` on the ring.
pub fn forward_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Order two sequences by circular distance.
///
/// Returns [`Ordering::Less`] when `a` precedes `b`, i.e. when `b` lies less
/// than [`SEQUENCE_WINDOW`] steps ahead of `a`.
pub fn compare(a: u16, b: u16) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if forward_distance(a, b) < SEQUENCE_WINDOW {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// `true` when `candidate` comes strictly after `reference`.
pub fn is_after(candidate: u16, reference: u16) -> bool {
    compare(reference, candidate) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_order_within_window() {
        assert_eq!(compare(1, 2), Ordering::Less);
        assert_eq!(compare(2, 1), Ordering::Greater);
        assert_eq!(compare(100, 100), Ordering::Equal);
        assert_eq!(compare(0, 29_999), Ordering::Less);
    }

    #[test]
    fn test_order_flips_across_wrap() {
        assert_eq!(compare(65_530, 5), Ordering::Less);
        assert!(is_after(5, 65_530));
        assert!(!is_after(65_530, 5));
        assert!(is_after(0, 65_535));
    }

    #[test]
    fn test_distance_beyond_window_counts_as_before() {
        assert_eq!(compare(0, 30_000), Ordering::Greater);
        assert!(!is_after(30_000, 0));
    }

    #[test]
    fn test_forward_distance_wraps() {
        assert_eq!(forward_distance(65_535, 0), 1);
        assert_eq!(forward_distance(10, 5), 65_531);
        assert_eq!(forward_distance(7, 7), 0);
    }
}
