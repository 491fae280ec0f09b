use std::collections::BTreeMap;
use std::fmt;

use num_traits::{PrimInt, Unsigned};

/// Closed range `[lower, upper]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval<T> {
    lower: T,
    upper: T,
}

impl<T: PrimInt + Unsigned> Interval<T> {
    /// Constructs `[lower, upper]`, swapping the bounds if they are reversed.
    pub fn new(lower: T, upper: T) -> Self {
        if upper < lower {
            Self {
                lower: upper,
                upper: lower,
            }
        } else {
            Self { lower, upper }
        }
    }

    #[inline]
    pub fn lower(&self) -> T {
        self.lower
    }

    #[inline]
    pub fn upper(&self) -> T {
        self.upper
    }

    /// Number of values in the interval. Saturates for the full domain of `u64`.
    pub fn len(&self) -> u64 {
        (self.upper - self.lower)
            .to_u64()
            .map_or(u64::MAX, |width| width.saturating_add(1))
    }

    /// Always `false`, a closed interval holds at least one value.
    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn contains(&self, value: T) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }

    /// Returns `true` if the intervals are disjoint but touch.
    pub fn is_adjacent(&self, other: &Self) -> bool {
        let touches = |a: &Self, b: &Self| a.upper.checked_add(&T::one()) == Some(b.lower);
        touches(self, other) || touches(other, self)
    }
}

impl<T: fmt::LowerHex> fmt::Display for Interval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.lower, self.upper)
    }
}

/// Set of values stored as disjoint, non-adjacent, closed intervals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntervalSet<T> {
    intervals: BTreeMap<T, T>,
}

impl<T: PrimInt + Unsigned> Default for IntervalSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PrimInt + Unsigned> IntervalSet<T> {
    pub fn new() -> Self {
        Self {
            intervals: BTreeMap::new(),
        }
    }

    /// Adds `[lower, upper]`. When `upper < lower` the range wraps around the end of the domain
    /// and is stored as `[lower, MAX]` and `[0, upper]`.
    pub fn insert(&mut self, lower: T, upper: T) {
        if upper < lower {
            self.insert_ordered(lower, T::max_value());
            self.insert_ordered(T::zero(), upper);
        } else {
            self.insert_ordered(lower, upper);
        }
    }

    pub fn insert_point(&mut self, value: T) {
        self.insert_ordered(value, value);
    }

    fn insert_ordered(&mut self, mut lower: T, mut upper: T) {
        if let Some((&prev_lower, &prev_upper)) = self.intervals.range(..=lower).next_back() {
            if prev_upper >= upper {
                return;
            }
            // prev_upper < upper, so the increment cannot overflow.
            if prev_upper >= lower || prev_upper + T::one() == lower {
                lower = prev_lower;
            }
        }
        let next = upper.checked_add(&T::one());
        let absorbed: Vec<(T, T)> = self
            .intervals
            .range(lower..)
            .take_while(|&(&l, _)| l <= upper || Some(l) == next)
            .map(|(&l, &u)| (l, u))
            .collect();
        for (l, u) in absorbed {
            self.intervals.remove(&l);
            upper = upper.max(u);
        }
        self.intervals.insert(lower, upper);
    }

    pub fn contains(&self, value: T) -> bool {
        self.intervals
            .range(..=value)
            .next_back()
            .map_or(false, |(_, &upper)| value <= upper)
    }

    /// Returns the stored intervals in ascending order.
    pub fn intervals(&self) -> impl Iterator<Item = Interval<T>> + '_ {
        self.intervals
            .iter()
            .map(|(&lower, &upper)| Interval { lower, upper })
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }
}

impl<T: PrimInt + Unsigned> FromIterator<(T, T)> for IntervalSet<T> {
    fn from_iter<I: IntoIterator<Item = (T, T)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (lower, upper) in iter {
            set.insert(lower, upper);
        }
        set
    }
}

impl<T: PrimInt + Unsigned + fmt::LowerHex> fmt::Display for IntervalSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, interval) in self.intervals().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{interval}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs<T: PrimInt + Unsigned>(set: &IntervalSet<T>) -> Vec<(T, T)> {
        set.intervals().map(|i| (i.lower(), i.upper())).collect()
    }

    #[test]
    fn merges_overlapping_and_adjacent() {
        let mut set = IntervalSet::<u16>::new();
        set.insert(10, 20);
        set.insert(30, 40);
        assert_eq!(pairs(&set), [(10, 20), (30, 40)]);

        set.insert(21, 29);
        assert_eq!(pairs(&set), [(10, 40)]);

        set.insert(5, 9);
        set.insert(41, 41);
        assert_eq!(pairs(&set), [(5, 41)]);

        set.insert(12, 14);
        assert_eq!(pairs(&set), [(5, 41)]);
    }

    #[test]
    fn spanning_insert_absorbs_everything() {
        let mut set: IntervalSet<u8> = [(1, 2), (5, 6), (9, 10), (20, 30)].into_iter().collect();
        set.insert(0, 25);
        assert_eq!(pairs(&set), [(0, 30)]);
    }

    #[test]
    fn wraparound_fills_domain() {
        let mut set = IntervalSet::<u16>::new();
        set.insert(1, 0xffff);
        set.insert(0, 0);
        assert_eq!(pairs(&set), [(0, 0xffff)]);

        let mut wrapped = IntervalSet::<u16>::new();
        wrapped.insert(0xfffe, 1);
        assert_eq!(pairs(&wrapped), [(0, 1), (0xfffe, 0xffff)]);
    }

    #[test]
    fn points_at_domain_edges() {
        let mut set = IntervalSet::<u8>::new();
        set.insert_point(u8::MAX);
        set.insert_point(0);
        set.insert_point(u8::MAX - 1);
        assert_eq!(pairs(&set), [(0, 0), (0xfe, 0xff)]);
        assert!(set.contains(0xff) && set.contains(0));
        assert!(!set.contains(1));
    }

    #[test]
    fn matches_naive_membership() {
        // Deterministic pseudo-random ranges over a small domain.
        let mut state = 0x2545u32;
        let mut step = || {
            state ^= state << 7;
            state ^= state >> 9;
            state ^= state << 8;
            (state & 0xff) as u8
        };
        let mut set = IntervalSet::<u8>::new();
        let mut naive = [false; 256];
        for _ in 0..64 {
            let (a, b) = (step(), step());
            let (lower, upper) = (a.min(b), a.min(b).saturating_add(b % 8));
            set.insert(lower, upper);
            for value in lower..=upper {
                naive[value as usize] = true;
            }

            let stored = pairs(&set);
            for window in stored.windows(2) {
                let (left, right) = (window[0], window[1]);
                assert!(left.1 as u16 + 1 < right.0 as u16, "{left:?} touches {right:?}");
            }
            for value in 0..=u8::MAX {
                assert_eq!(set.contains(value), naive[value as usize], "value {value}");
            }
        }
    }

    #[test]
    fn interval_relations() {
        let a = Interval::new(10u32, 20);
        let b = Interval::new(21u32, 30);
        let c = Interval::new(15u32, 25);
        assert!(a.is_adjacent(&b) && b.is_adjacent(&a));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c) && c.intersects(&b));
        assert_eq!(a.len(), 11);
        assert_eq!(Interval::new(0u64, u64::MAX).len(), u64::MAX);
        assert_eq!(Interval::new(5u8, 1), Interval::new(1, 5));
    }

    #[test]
    fn display() {
        let set: IntervalSet<u16> = [(0, 0), (0x10, 0x1f)].into_iter().collect();
        assert_eq!(set.to_string(), "{[0x0, 0x0], [0x10, 0x1f]}");
    }
}
