//! Numeric interval used by site-quality and scheduling constraints.
//!
//! # Responsibility
//! - Represent closed, half-open, fully open and inverted intervals.
//! - Combine constraint ranges into the tightest expressible range.
//!
//! # Invariants
//! - A range is inverted when both bounds are set and `min > max`; membership
//!   is then `x <= max || x >= min`. Inversion is never an error state.
//! - `intersection` is commutative in the resulting bounds.
//! - A combination that cannot be expressed as one range is reported as
//!   [`RangeConflict`], never silently widened.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Closed/open/inverted numeric interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Lower bound. `None` means unbounded below.
    pub min: Option<f64>,
    /// Upper bound. `None` means unbounded above.
    pub max: Option<f64>,
}

/// Error returned when two ranges cannot be combined into a single range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeConflict {
    pub left: Range,
    pub right: Range,
    pub reason: &'static str,
}

impl Display for RangeConflict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot intersect range `{}` with `{}`: {}",
            self.left, self.right, self.reason
        )
    }
}

impl Error for RangeConflict {}

impl Range {
    /// Creates a range from optional bounds.
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// Creates a range with both bounds set.
    pub fn bounded(min: f64, max: f64) -> Self {
        Self::new(Some(min), Some(max))
    }

    /// Fully open range containing every value.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn at_least(min: f64) -> Self {
        Self::new(Some(min), None)
    }

    pub fn at_most(max: f64) -> Self {
        Self::new(None, Some(max))
    }

    /// Returns whether the range is inverted (`min > max`).
    pub fn is_inverted(&self) -> bool {
        matches!((self.min, self.max), (Some(min), Some(max)) if min > max)
    }

    /// Returns whether neither bound is set.
    pub fn is_open(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Returns `(min, max)` as stored.
    pub fn minmax(&self) -> (Option<f64>, Option<f64>) {
        (self.min, self.max)
    }

    /// Returns whether `value` lies within the range, honouring inversion.
    pub fn contains(&self, value: f64) -> bool {
        if self.is_inverted() {
            let above = self.min.is_some_and(|min| value >= min);
            let below = self.max.is_some_and(|max| value <= max);
            return above || below;
        }

        let above_min = self.min.map_or(true, |min| value >= min);
        let below_max = self.max.map_or(true, |max| value <= max);
        above_min && below_max
    }

    /// Returns whether the two ranges share at least one value.
    ///
    /// Unlike [`Range::intersection`], a normal range straddling an inverted
    /// gap overlaps on both sides.
    pub fn overlaps(&self, other: &Range) -> bool {
        match (self.is_inverted(), other.is_inverted()) {
            (true, true) => true,
            (false, false) => self.intersection(other).is_ok(),
            (true, false) => touches_allowed_side(self, other),
            (false, true) => touches_allowed_side(other, self),
        }
    }

    /// Returns the tightest range satisfying both `self` and `other`.
    ///
    /// # Errors
    /// - Two normal ranges with no common value.
    /// - A normal range lying entirely inside the gap of an inverted range.
    /// - A normal range straddling the gap of an inverted range, which would
    ///   leave two disjoint regions.
    pub fn intersection(&self, other: &Range) -> Result<Range, RangeConflict> {
        let conflict = |reason| RangeConflict {
            left: *self,
            right: *other,
            reason,
        };

        match (self.is_inverted(), other.is_inverted()) {
            (false, false) => {
                let min = tighter(self.min, other.min, f64::max);
                let max = tighter(self.max, other.max, f64::min);
                match (min, max) {
                    (Some(lo), Some(hi)) if lo > hi => Err(conflict("ranges do not overlap")),
                    _ => Ok(Range::new(min, max)),
                }
            }
            (true, true) => {
                // Both inverted: the larger lower-exclusion bound and the smaller
                // upper bound. Always yields another inverted range.
                Ok(Range::new(
                    tighter(self.min, other.min, f64::max),
                    tighter(self.max, other.max, f64::min),
                ))
            }
            (true, false) => clip_to_inverted(self, other)
                .ok_or_else(|| conflict(conflict_reason(self, other))),
            (false, true) => clip_to_inverted(other, self)
                .ok_or_else(|| conflict(conflict_reason(other, self))),
        }
    }

    /// In-place variant of [`Range::intersection`]; `self` is left untouched on
    /// error.
    pub fn intersect_with(&mut self, other: &Range) -> Result<(), RangeConflict> {
        *self = self.intersection(other)?;
        Ok(())
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) if min > max => write!(f, "<={max} or >={min}"),
            (Some(min), Some(max)) => write!(f, "{min}-{max}"),
            (Some(min), None) => write!(f, ">={min}"),
            (None, Some(max)) => write!(f, "<={max}"),
            (None, None) => write!(f, "any"),
        }
    }
}

/// Converts an airmass range into the equivalent elevation range in degrees.
///
/// Airmass is approximated as `1 / sin(elevation)`, so the bounds swap: the
/// lowest airmass gives the highest elevation. Airmass values below 1 are
/// clamped to the zenith.
pub fn airmass_to_elevation(airmass: &Range) -> Range {
    let to_elevation = |value: f64| {
        if value <= 1.0 {
            90.0
        } else {
            (1.0 / value).asin().to_degrees()
        }
    };

    Range::new(airmass.max.map(to_elevation), airmass.min.map(to_elevation))
}

fn tighter(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (Some(value), None) | (None, Some(value)) => Some(value),
        (None, None) => None,
    }
}

/// Clips a normal range against the allowed sides of an inverted range.
fn clip_to_inverted(inverted: &Range, normal: &Range) -> Option<Range> {
    let (gap_low, gap_high) = match (inverted.max, inverted.min) {
        (Some(low), Some(high)) => (low, high),
        _ => return None,
    };

    let touches_low = normal.min.map_or(true, |min| min <= gap_low);
    let touches_high = normal.max.map_or(true, |max| max >= gap_high);

    match (touches_low, touches_high) {
        (true, false) => Some(Range::new(
            normal.min,
            Some(normal.max.map_or(gap_low, |max| max.min(gap_low))),
        )),
        (false, true) => Some(Range::new(
            Some(normal.min.map_or(gap_high, |min| min.max(gap_high))),
            normal.max,
        )),
        _ => None,
    }
}

fn touches_allowed_side(inverted: &Range, normal: &Range) -> bool {
    let touches_low = match (normal.min, inverted.max) {
        (Some(min), Some(gap_low)) => min <= gap_low,
        _ => true,
    };
    let touches_high = match (normal.max, inverted.min) {
        (Some(max), Some(gap_high)) => max >= gap_high,
        _ => true,
    };
    touches_low || touches_high
}

fn conflict_reason(inverted: &Range, normal: &Range) -> &'static str {
    let gap_low = inverted.max.unwrap_or(f64::NEG_INFINITY);
    let gap_high = inverted.min.unwrap_or(f64::INFINITY);
    let touches_low = normal.min.map_or(true, |min| min <= gap_low);
    let touches_high = normal.max.map_or(true, |max| max >= gap_high);
    if touches_low && touches_high {
        "result would be two disjoint regions"
    } else {
        "range lies entirely inside the excluded band"
    }
}
