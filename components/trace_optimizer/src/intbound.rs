//! Closed integer intervals used by the bounds stage.
//!
//! A bound tracks an optional lower and upper limit for an integer box.
//! `None` on a side means that side is unbounded. All arithmetic is
//! conservative: whenever a computed limit would overflow `i64`, the
//! corresponding side widens to unbounded rather than wrapping.

use std::fmt;

/// A conservative interval `[lower, upper]` over `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntBound {
    /// Inclusive lower limit, or `None` when unbounded below.
    pub lower: Option<i64>,
    /// Inclusive upper limit, or `None` when unbounded above.
    pub upper: Option<i64>,
}

impl Default for IntBound {
    fn default() -> Self {
        IntBound::unbounded()
    }
}

impl IntBound {
    /// The interval containing every `i64`.
    pub fn unbounded() -> Self {
        IntBound { lower: None, upper: None }
    }

    /// The interval containing exactly `value`.
    pub fn exact(value: i64) -> Self {
        IntBound { lower: Some(value), upper: Some(value) }
    }

    /// The interval `[lower, upper]`.
    pub fn range(lower: i64, upper: i64) -> Self {
        IntBound { lower: Some(lower), upper: Some(upper) }
    }

    /// True when both sides are unbounded.
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// True when no integer satisfies the bound. Empty bounds arise when a
    /// guard contradicts previously derived facts.
    pub fn is_empty(&self) -> bool {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) => lo > hi,
            _ => false,
        }
    }

    /// The single value of the interval, if it pins one down exactly.
    pub fn as_exact(&self) -> Option<i64> {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) if lo == hi => Some(lo),
            _ => None,
        }
    }

    /// Whether `value` lies inside the interval.
    pub fn contains(&self, value: i64) -> bool {
        self.lower.is_none_or(|lo| lo <= value) && self.upper.is_none_or(|hi| value <= hi)
    }

    /// Whether every value of `self` lies inside `other`.
    pub fn contained_in(&self, other: &IntBound) -> bool {
        let below_ok = match (other.lower, self.lower) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(olo), Some(lo)) => olo <= lo,
        };
        let above_ok = match (other.upper, self.upper) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(ohi), Some(hi)) => hi <= ohi,
        };
        below_ok && above_ok
    }

    /// Narrow `self` to the intersection with `other`. Returns true when the
    /// interval actually changed. The result may be empty.
    pub fn intersect(&mut self, other: &IntBound) -> bool {
        let mut changed = false;
        if let Some(olo) = other.lower {
            if self.lower.is_none_or(|lo| olo > lo) {
                self.lower = Some(olo);
                changed = true;
            }
        }
        if let Some(ohi) = other.upper {
            if self.upper.is_none_or(|hi| ohi < hi) {
                self.upper = Some(ohi);
                changed = true;
            }
        }
        changed
    }

    /// Whether every value of `self` is strictly below every value of `other`.
    pub fn known_lt(&self, other: &IntBound) -> bool {
        match (self.upper, other.lower) {
            (Some(hi), Some(olo)) => hi < olo,
            _ => false,
        }
    }

    /// Whether every value of `self` is below or equal to every value of
    /// `other`.
    pub fn known_le(&self, other: &IntBound) -> bool {
        match (self.upper, other.lower) {
            (Some(hi), Some(olo)) => hi <= olo,
            _ => false,
        }
    }

    /// Whether every value of `self` is strictly above every value of `other`.
    pub fn known_gt(&self, other: &IntBound) -> bool {
        other.known_lt(self)
    }

    /// Whether every value of `self` is above or equal to every value of
    /// `other`.
    pub fn known_ge(&self, other: &IntBound) -> bool {
        other.known_le(self)
    }

    /// Whether the two intervals are provably disjoint.
    pub fn known_ne(&self, other: &IntBound) -> bool {
        self.known_lt(other) || self.known_gt(other)
    }

    /// Interval of the wrapping sum. A wrapped result lands on the far side
    /// of the number line, so a partial interval would be a lie: the result
    /// is only bounded when both inputs are fully bounded and no endpoint
    /// sum overflows, and fully unbounded otherwise.
    pub fn add(&self, other: &IntBound) -> IntBound {
        match (
            checked(self.lower, other.lower, i64::checked_add),
            checked(self.upper, other.upper, i64::checked_add),
        ) {
            (Some(lo), Some(hi)) => IntBound::range(lo, hi),
            _ => IntBound::unbounded(),
        }
    }

    /// Interval of the wrapping difference `self - other`, with the same
    /// all-or-nothing widening as [`add`](IntBound::add).
    pub fn sub(&self, other: &IntBound) -> IntBound {
        match (
            checked(self.lower, other.upper, i64::checked_sub),
            checked(self.upper, other.lower, i64::checked_sub),
        ) {
            (Some(lo), Some(hi)) => IntBound::range(lo, hi),
            _ => IntBound::unbounded(),
        }
    }

    /// Interval of the sum when the operation provably does not wrap (a
    /// surviving overflow guard follows it). Each side is kept
    /// independently, saturated at the `i64` limits.
    pub fn add_nowrap(&self, other: &IntBound) -> IntBound {
        IntBound {
            lower: checked(self.lower, other.lower, |a, b| Some(a.saturating_add(b))),
            upper: checked(self.upper, other.upper, |a, b| Some(a.saturating_add(b))),
        }
    }

    /// Interval of the difference `self - other` when the operation
    /// provably does not wrap.
    pub fn sub_nowrap(&self, other: &IntBound) -> IntBound {
        IntBound {
            lower: checked(self.lower, other.upper, |a, b| Some(a.saturating_sub(b))),
            upper: checked(self.upper, other.lower, |a, b| Some(a.saturating_sub(b))),
        }
    }

    /// Interval of the product. Only computed when both inputs are fully
    /// bounded and no endpoint product overflows; otherwise unbounded.
    pub fn mul(&self, other: &IntBound) -> IntBound {
        let (Some(lo1), Some(hi1)) = (self.lower, self.upper) else {
            return IntBound::unbounded();
        };
        let (Some(lo2), Some(hi2)) = (other.lower, other.upper) else {
            return IntBound::unbounded();
        };
        let mut lo = i64::MAX;
        let mut hi = i64::MIN;
        for a in [lo1, hi1] {
            for b in [lo2, hi2] {
                match a.checked_mul(b) {
                    Some(p) => {
                        lo = lo.min(p);
                        hi = hi.max(p);
                    }
                    None => return IntBound::unbounded(),
                }
            }
        }
        IntBound::range(lo, hi)
    }

    /// Interval of the wrapping negation. `i64::MIN` negates to itself, so
    /// an interval touching it (or unbounded on either side) widens fully.
    pub fn neg(&self) -> IntBound {
        match (
            self.upper.and_then(i64::checked_neg),
            self.lower.and_then(i64::checked_neg),
        ) {
            (Some(lo), Some(hi)) => IntBound::range(lo, hi),
            _ => IntBound::unbounded(),
        }
    }

    /// Refine `self` assuming it is strictly below `other`.
    pub fn make_lt(&mut self, other: &IntBound) -> bool {
        match other.upper.and_then(|hi| hi.checked_sub(1)) {
            Some(limit) => self.intersect(&IntBound { lower: None, upper: Some(limit) }),
            None => false,
        }
    }

    /// Refine `self` assuming it is below or equal to `other`.
    pub fn make_le(&mut self, other: &IntBound) -> bool {
        match other.upper {
            Some(limit) => self.intersect(&IntBound { lower: None, upper: Some(limit) }),
            None => false,
        }
    }

    /// Refine `self` assuming it is strictly above `other`.
    pub fn make_gt(&mut self, other: &IntBound) -> bool {
        match other.lower.and_then(|lo| lo.checked_add(1)) {
            Some(limit) => self.intersect(&IntBound { lower: Some(limit), upper: None }),
            None => false,
        }
    }

    /// Refine `self` assuming it is above or equal to `other`.
    pub fn make_ge(&mut self, other: &IntBound) -> bool {
        match other.lower {
            Some(limit) => self.intersect(&IntBound { lower: Some(limit), upper: None }),
            None => false,
        }
    }
}

fn checked(a: Option<i64>, b: Option<i64>, f: fn(i64, i64) -> Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => f(a, b),
        _ => None,
    }
}

impl fmt::Display for IntBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            Some(lo) => write!(f, "[{lo}, ")?,
            None => write!(f, "(-inf, ")?,
        }
        match self.upper {
            Some(hi) => write!(f, "{hi}]"),
            None => write!(f, "+inf)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_widens_on_overflow() {
        let a = IntBound::range(i64::MAX - 1, i64::MAX);
        let b = IntBound::range(1, 2);
        let sum = a.add(&b);
        assert_eq!(sum.lower, None);
        assert_eq!(sum.upper, None);
    }

    #[test]
    fn test_add_of_half_bounded_interval_is_unbounded() {
        // [1, +inf) + [1, 1] wraps for i64::MAX, so not even the lower
        // side survives
        let a = IntBound { lower: Some(1), upper: None };
        let sum = a.add(&IntBound::exact(1));
        assert!(sum.is_unbounded());
    }

    #[test]
    fn test_add_nowrap_keeps_one_sided_bounds() {
        let a = IntBound { lower: Some(1), upper: None };
        let sum = a.add_nowrap(&IntBound::exact(1));
        assert_eq!(sum, IntBound { lower: Some(2), upper: None });
    }

    #[test]
    fn test_sub_nowrap_saturates() {
        let a = IntBound::range(i64::MIN, 0);
        let d = a.sub_nowrap(&IntBound::range(1, 2));
        assert_eq!(d, IntBound::range(i64::MIN, -1));
    }

    #[test]
    fn test_neg_widens_at_min() {
        assert!(IntBound::range(i64::MIN, 5).neg().is_unbounded());
        assert_eq!(IntBound::range(-3, 5).neg(), IntBound::range(-5, 3));
        assert!(IntBound { lower: Some(0), upper: None }.neg().is_unbounded());
    }

    #[test]
    fn test_sub_swaps_sides() {
        let a = IntBound::range(0, 10);
        let b = IntBound::range(3, 5);
        assert_eq!(a.sub(&b), IntBound::range(-5, 7));
    }

    #[test]
    fn test_mul_with_negative_endpoints() {
        let a = IntBound::range(-3, 2);
        let b = IntBound::range(-4, 5);
        assert_eq!(a.mul(&b), IntBound::range(-15, 12));
    }

    #[test]
    fn test_known_comparisons() {
        let a = IntBound::range(0, 4);
        let b = IntBound::range(5, 9);
        assert!(a.known_lt(&b));
        assert!(a.known_le(&b));
        assert!(b.known_gt(&a));
        assert!(a.known_ne(&b));
        assert!(!a.known_lt(&IntBound::range(4, 9)));
        assert!(a.known_le(&IntBound::range(4, 9)));
    }

    #[test]
    fn test_intersect_reports_change() {
        let mut a = IntBound::unbounded();
        assert!(a.intersect(&IntBound::range(0, 10)));
        assert!(!a.intersect(&IntBound::range(-5, 20)));
        assert!(a.intersect(&IntBound::range(3, 7)));
        assert_eq!(a, IntBound::range(3, 7));
    }

    #[test]
    fn test_make_lt_uses_open_endpoint() {
        let mut a = IntBound::unbounded();
        assert!(a.make_lt(&IntBound::exact(10)));
        assert_eq!(a.upper, Some(9));
        assert!(a.contains(9));
        assert!(!a.contains(10));
    }

    #[test]
    fn test_contained_in() {
        assert!(IntBound::range(2, 3).contained_in(&IntBound::range(0, 10)));
        assert!(IntBound::range(2, 3).contained_in(&IntBound::unbounded()));
        assert!(!IntBound::unbounded().contained_in(&IntBound::range(0, 10)));
        assert!(!IntBound::range(2, 30).contained_in(&IntBound::range(0, 10)));
    }
}
