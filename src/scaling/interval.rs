//! Intervals and interval providers
//!
//! A shard is identified by a half-open interval `[lower, upper)` over the
//! sharding value's domain. The provider maps values to intervals and
//! round-trips intervals through the file names under the shard directory.

use std::fmt;

// ============================================================================
// Interval
// ============================================================================

/// A half-open interval `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval<T> {
    lower: T,
    upper: T,
}

impl<T: Copy + PartialOrd> Interval<T> {
    pub fn new(lower: T, upper: T) -> Self {
        Self { lower, upper }
    }

    pub fn lower(&self) -> T {
        self.lower
    }

    pub fn upper(&self) -> T {
        self.upper
    }

    pub fn contains(&self, value: T) -> bool {
        self.lower <= value && value < self.upper
    }
}

impl<T: fmt::Display> fmt::Display for Interval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)
    }
}

// ============================================================================
// Interval Provider
// ============================================================================

/// Maps sharding values to intervals and serialises interval names.
///
/// The name is the canonical key of a shard: `interval_named` must recover
/// exactly the interval that produced a name.
pub trait IntervalProvider<T>: Send + Sync {
    /// The interval containing `value`.
    fn interval_containing(&self, value: T) -> Interval<T>;

    /// The interval `factor` widths away from `current`.
    fn next_interval(&self, current: &Interval<T>, factor: i64) -> Interval<T>;

    /// Canonical name of an interval, used as the shard file name.
    fn name(&self, interval: &Interval<T>) -> String;

    /// Parse a name back to its interval, or `None` for foreign names.
    fn interval_named(&self, name: &str) -> Option<Interval<T>>;
}

// ============================================================================
// Fixed-width numeric provider
// ============================================================================

/// Fixed-width intervals offset by a base. For base 25 and width 100 the
/// intervals are `... [-175, -75) [-75, 25) [25, 125) [125, 225) ...`;
/// names are the decimal lower bounds.
#[derive(Debug, Clone, Copy)]
pub struct FixedWidthIntervalProvider<T> {
    base: T,
    width: T,
}

macro_rules! fixed_width_provider {
    ($t:ty) => {
        impl FixedWidthIntervalProvider<$t> {
            pub fn new(base: $t, width: $t) -> Self {
                assert!(width > 0, "interval width must be positive");
                Self { base, width }
            }
        }

        impl IntervalProvider<$t> for FixedWidthIntervalProvider<$t> {
            fn interval_containing(&self, value: $t) -> Interval<$t> {
                let diff = (value - self.base).abs() % self.width;

                let (lower, upper);
                if value < self.base {
                    // an exact multiple below base still closes upward by a
                    // full width, not zero
                    upper = value + if diff == 0 { self.width } else { diff };
                    lower = upper - self.width;
                } else {
                    lower = value - diff;
                    upper = lower + self.width;
                }

                Interval::new(lower, upper)
            }

            fn next_interval(&self, current: &Interval<$t>, factor: i64) -> Interval<$t> {
                let lower = current.lower() + self.width * (factor as $t);
                Interval::new(lower, lower + self.width)
            }

            fn name(&self, interval: &Interval<$t>) -> String {
                interval.lower().to_string()
            }

            fn interval_named(&self, name: &str) -> Option<Interval<$t>> {
                name.parse::<$t>()
                    .ok()
                    .map(|value| self.interval_containing(value))
            }
        }
    };
}

fixed_width_provider!(i32);
fixed_width_provider!(i64);

// ============================================================================
// Tests
// ============================================================================
