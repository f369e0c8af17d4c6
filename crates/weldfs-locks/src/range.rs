//! Byte-range interval arithmetic for POSIX record locks.
//!
//! Ranges are stored as inclusive `[start, end]` pairs, the same shape the
//! original fcntl path uses after converting `(l_start, l_len)`. A request
//! with `l_len == 0` covers everything from `l_start` to end-of-file; that
//! case carries a distinct to-EOF flag so GETLK can report the length back
//! as zero instead of a literal huge number.

use crate::types::LockError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive byte interval `[start, end]`, optionally unbounded to EOF.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    start: u64,
    end: u64,
    to_eof: bool,
}

impl ByteRange {
    /// Creates a bounded range covering `length` bytes from `start`.
    ///
    /// Rejects `length == 0` (an empty interval is never a valid lock
    /// target) and arithmetic overflow of `start + length - 1` with
    /// [`LockError::InvalidRange`] rather than wrapping.
    pub fn new(start: u64, length: u64) -> Result<Self, LockError> {
        if length == 0 {
            return Err(LockError::InvalidRange("zero length"));
        }
        let end = start
            .checked_add(length - 1)
            .ok_or(LockError::InvalidRange("start + length overflows"))?;
        Ok(ByteRange {
            start,
            end,
            to_eof: false,
        })
    }

    /// Creates the unbounded range `[start, EOF)`.
    ///
    /// The range is fixed at request time; it does not re-evaluate if the
    /// file later grows or shrinks. Callers needing EOF-tracking semantics
    /// must re-request after truncation or growth.
    pub fn to_eof(start: u64) -> Self {
        ByteRange {
            start,
            end: u64::MAX,
            to_eof: true,
        }
    }

    /// First byte covered by the range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte covered by the range (`u64::MAX` for to-EOF ranges).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Whether this range extends to end-of-file.
    pub fn is_to_eof(&self) -> bool {
        self.to_eof
    }

    /// Length in the fcntl convention: `0` for to-EOF ranges, the byte
    /// count otherwise.
    pub fn length(&self) -> u64 {
        if self.to_eof {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// True if the two intervals share at least one byte.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.end >= other.start && other.end >= self.start
    }

    /// True if the intervals overlap or sit immediately next to each
    /// other. Adjacent same-kind locks from one owner coalesce, per
    /// fcntl(2).
    pub fn touches(&self, other: &ByteRange) -> bool {
        if self.overlaps(other) {
            return true;
        }
        self.end.checked_add(1) == Some(other.start) || other.end.checked_add(1) == Some(self.start)
    }

    /// True if `other` lies entirely within this range.
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns the parts of `self` not covered by `other`: zero, one, or
    /// two ranges. Subtracting a strictly interior range punches a hole
    /// and yields both sides (the split case).
    pub fn subtract(&self, other: &ByteRange) -> Vec<ByteRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut parts = Vec::with_capacity(2);
        if other.start > self.start {
            parts.push(ByteRange {
                start: self.start,
                end: other.start - 1,
                to_eof: false,
            });
        }
        if other.end < self.end {
            // other.end < self.end <= u64::MAX, so the +1 cannot wrap.
            parts.push(ByteRange {
                start: other.end + 1,
                end: self.end,
                to_eof: self.to_eof,
            });
        }
        parts
    }

    /// Smallest range covering both inputs.
    pub fn span(&self, other: &ByteRange) -> ByteRange {
        ByteRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            to_eof: self.to_eof || other.to_eof,
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.to_eof {
            write!(f, "[{}, EOF)", self.start)
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(start: u64, len: u64) -> ByteRange {
        ByteRange::new(start, len).unwrap()
    }

    #[test]
    fn test_new_rejects_zero_length() {
        match ByteRange::new(10, 0) {
            Err(LockError::InvalidRange(_)) => {}
            other => panic!("expected InvalidRange, got {:?}", other),
        }
    }

    #[test]
    fn test_new_rejects_overflow() {
        match ByteRange::new(u64::MAX, 2) {
            Err(LockError::InvalidRange(_)) => {}
            other => panic!("expected InvalidRange, got {:?}", other),
        }
        // Exactly reaching u64::MAX is fine.
        assert!(ByteRange::new(u64::MAX, 1).is_ok());
    }

    #[test]
    fn test_bounds_inclusive() {
        let range = r(10, 5);
        assert_eq!(range.start(), 10);
        assert_eq!(range.end(), 14);
        assert_eq!(range.length(), 5);
        assert!(!range.is_to_eof());
    }

    #[test]
    fn test_to_eof_reports_zero_length() {
        let range = ByteRange::to_eof(100);
        assert_eq!(range.start(), 100);
        assert_eq!(range.end(), u64::MAX);
        assert_eq!(range.length(), 0);
        assert!(range.is_to_eof());
    }

    #[test]
    fn test_overlap_cases() {
        assert!(r(0, 100).overlaps(&r(50, 100)));
        assert!(r(50, 100).overlaps(&r(0, 100)));
        assert!(r(0, 100).overlaps(&r(0, 100)));
        assert!(r(0, 100).overlaps(&r(99, 1)));
        assert!(!r(0, 100).overlaps(&r(100, 10)));
        assert!(!r(100, 10).overlaps(&r(0, 100)));
    }

    #[test]
    fn test_to_eof_overlaps_everything_above_start() {
        let eof = ByteRange::to_eof(50);
        assert!(eof.overlaps(&r(60, 1)));
        assert!(eof.overlaps(&r(0, 51)));
        assert!(!eof.overlaps(&r(0, 50)));
    }

    #[test]
    fn test_touches_adjacent() {
        // [0,2] and [3,5] are adjacent, not overlapping.
        assert!(!r(0, 3).overlaps(&r(3, 3)));
        assert!(r(0, 3).touches(&r(3, 3)));
        assert!(r(3, 3).touches(&r(0, 3)));
        assert!(!r(0, 3).touches(&r(4, 3)));
    }

    #[test]
    fn test_touches_no_wrap_at_max() {
        let top = ByteRange::to_eof(10);
        assert!(!top.touches(&r(0, 5)));
        assert!(top.touches(&r(0, 10)));
    }

    #[test]
    fn test_contains() {
        assert!(r(0, 100).contains(&r(10, 10)));
        assert!(r(0, 100).contains(&r(0, 100)));
        assert!(!r(10, 10).contains(&r(0, 100)));
        assert!(ByteRange::to_eof(0).contains(&r(5, 500)));
    }

    #[test]
    fn test_subtract_disjoint() {
        let parts = r(0, 10).subtract(&r(20, 10));
        assert_eq!(parts, vec![r(0, 10)]);
    }

    #[test]
    fn test_subtract_full_cover() {
        let parts = r(10, 10).subtract(&r(0, 100));
        assert!(parts.is_empty());
    }

    #[test]
    fn test_subtract_left_edge() {
        let parts = r(0, 100).subtract(&r(0, 10));
        assert_eq!(parts, vec![r(10, 90)]);
    }

    #[test]
    fn test_subtract_right_edge() {
        let parts = r(0, 100).subtract(&r(90, 10));
        assert_eq!(parts, vec![r(0, 90)]);
    }

    #[test]
    fn test_subtract_hole_punch_splits() {
        let parts = r(0, 100).subtract(&r(40, 20));
        assert_eq!(parts, vec![r(0, 40), r(60, 40)]);
    }

    #[test]
    fn test_subtract_from_eof_keeps_tail_unbounded() {
        let eof = ByteRange::to_eof(0);
        let parts = eof.subtract(&r(10, 10));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], r(0, 10));
        assert_eq!(parts[1].start(), 20);
        assert!(parts[1].is_to_eof());
    }

    #[test]
    fn test_span() {
        assert_eq!(r(0, 10).span(&r(20, 10)), r(0, 30));
        let hull = r(5, 5).span(&ByteRange::to_eof(100));
        assert_eq!(hull.start(), 5);
        assert!(hull.is_to_eof());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", r(3, 4)), "[3, 6]");
        assert_eq!(format!("{}", ByteRange::to_eof(7)), "[7, EOF)");
    }

    proptest! {
        #[test]
        fn prop_subtract_parts_disjoint_from_other(
            a_start in 0u64..10_000, a_len in 1u64..10_000,
            b_start in 0u64..10_000, b_len in 1u64..10_000,
        ) {
            let a = r(a_start, a_len);
            let b = r(b_start, b_len);
            for part in a.subtract(&b) {
                prop_assert!(!part.overlaps(&b));
                prop_assert!(a.contains(&part));
            }
        }

        #[test]
        fn prop_subtract_preserves_uncovered_bytes(
            a_start in 0u64..2_000, a_len in 1u64..2_000,
            b_start in 0u64..2_000, b_len in 1u64..2_000,
            probe in 0u64..4_000,
        ) {
            let a = r(a_start, a_len);
            let b = r(b_start, b_len);
            let point = r(probe, 1);
            let in_parts = a.subtract(&b).iter().any(|p| p.overlaps(&point));
            let expected = a.overlaps(&point) && !b.overlaps(&point);
            prop_assert_eq!(in_parts, expected);
        }

        #[test]
        fn prop_span_contains_both(
            a_start in 0u64..10_000, a_len in 1u64..10_000,
            b_start in 0u64..10_000, b_len in 1u64..10_000,
        ) {
            let a = r(a_start, a_len);
            let b = r(b_start, b_len);
            let hull = a.span(&b);
            prop_assert!(hull.contains(&a));
            prop_assert!(hull.contains(&b));
        }
    }
}
