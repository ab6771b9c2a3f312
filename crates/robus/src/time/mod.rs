// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time values for the two clock domains of the runtime.
//!
//! Robotics nodes run against two kinds of time that must never be mixed:
//!
//! - [`Time`]/[`Duration`] — *node time*. Possibly driven by a simulation
//!   source, so it may pause or jump.
//! - [`WallTime`]/[`WallDuration`] — monotonic wall time, used for profiling
//!   and transport-level bookkeeping.
//!
//! Each value is a `(sec, nsec)` pair with the normalization invariant
//! `nsec ∈ [0, 10⁹)`; construction from any raw pair carries overflow (or
//! negative nanoseconds) into the seconds field. The domains are distinct
//! types with no conversions between them — comparing a simulated stamp with
//! a wall stamp is a compile error, not a runtime surprise.
//!
//! The [`TimePoint`]/[`TimeSpan`] traits capture the arithmetic the generic
//! scheduler code needs, so [`crate::timer::TimerManager`] and
//! [`crate::time::rate::Rate`] work in either domain.

pub mod clock;
pub mod rate;

use std::fmt;
use std::ops::{Add, Neg, Sub};

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Carry nanosecond overflow (or borrow) into the seconds field.
#[inline]
fn normalize(sec: i64, nsec: i64) -> (i64, u32) {
    let carry_sec = sec + nsec.div_euclid(NSEC_PER_SEC);
    let norm_nsec = nsec.rem_euclid(NSEC_PER_SEC);
    // rem_euclid of a positive modulus is always in [0, modulus)
    (carry_sec, norm_nsec as u32)
}

/// An instant in a clock domain.
///
/// Implemented by [`Time`] and [`WallTime`]. The bounds are exactly what the
/// clock-generic scheduler and rate helpers need: total order plus
/// point/span arithmetic within one domain.
pub trait TimePoint:
    Copy
    + Ord
    + Send
    + Sync
    + fmt::Debug
    + 'static
    + Add<Self::Span, Output = Self>
    + Sub<Self::Span, Output = Self>
    + Sub<Self, Output = Self::Span>
{
    /// The signed span type of the same clock domain.
    type Span: TimeSpan;

    /// The domain origin.
    fn zero() -> Self;
}

/// A signed span in a clock domain.
///
/// Implemented by [`Duration`] and [`WallDuration`].
pub trait TimeSpan:
    Copy
    + Ord
    + Send
    + Sync
    + fmt::Debug
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Neg<Output = Self>
{
    /// The zero-length span.
    fn zero() -> Self;

    /// Build a span from (possibly fractional, possibly negative) seconds.
    fn from_secs_f64(secs: f64) -> Self;

    /// The span in seconds as a float.
    fn as_secs_f64(&self) -> f64;

    /// Convert from a std duration (always non-negative).
    fn from_std(d: std::time::Duration) -> Self;

    /// Convert to a std duration; `None` for negative spans.
    fn to_std(&self) -> Option<std::time::Duration>;
}

macro_rules! point_type {
    ($(#[$doc:meta])* $point:ident, $span:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $point {
            sec: i64,
            nsec: u32,
        }

        impl $point {
            /// The domain origin.
            pub const ZERO: Self = Self { sec: 0, nsec: 0 };

            /// Build a stamp from a raw `(sec, nsec)` pair, normalizing
            /// nanosecond overflow into seconds.
            #[inline]
            pub fn new(sec: i64, nsec: i64) -> Self {
                let (sec, nsec) = normalize(sec, nsec);
                Self { sec, nsec }
            }

            /// Build a stamp from fractional seconds since the origin.
            pub fn from_secs_f64(secs: f64) -> Self {
                Self::from_nanos((secs * 1e9).round() as i64)
            }

            /// Build a stamp from nanoseconds since the origin.
            #[inline]
            pub fn from_nanos(nanos: i64) -> Self {
                Self::new(nanos.div_euclid(NSEC_PER_SEC), nanos.rem_euclid(NSEC_PER_SEC))
            }

            /// Seconds component.
            #[inline]
            #[must_use]
            pub fn sec(&self) -> i64 {
                self.sec
            }

            /// Nanoseconds component, always in `[0, 10⁹)`.
            #[inline]
            #[must_use]
            pub fn nsec(&self) -> u32 {
                self.nsec
            }

            /// Seconds since the origin as a float.
            #[must_use]
            pub fn as_secs_f64(&self) -> f64 {
                self.sec as f64 + f64::from(self.nsec) * 1e-9
            }

            /// Nanoseconds since the origin.
            #[must_use]
            pub fn as_nanos(&self) -> i128 {
                i128::from(self.sec) * i128::from(NSEC_PER_SEC) + i128::from(self.nsec)
            }

            /// Whether this is the domain origin.
            #[inline]
            #[must_use]
            pub fn is_zero(&self) -> bool {
                self.sec == 0 && self.nsec == 0
            }
        }

        impl Add<$span> for $point {
            type Output = $point;

            #[inline]
            fn add(self, rhs: $span) -> $point {
                $point::new(self.sec + rhs.sec, i64::from(self.nsec) + i64::from(rhs.nsec))
            }
        }

        impl Sub<$span> for $point {
            type Output = $point;

            #[inline]
            fn sub(self, rhs: $span) -> $point {
                $point::new(self.sec - rhs.sec, i64::from(self.nsec) - i64::from(rhs.nsec))
            }
        }

        impl Sub for $point {
            type Output = $span;

            #[inline]
            fn sub(self, rhs: $point) -> $span {
                $span::new(self.sec - rhs.sec, i64::from(self.nsec) - i64::from(rhs.nsec))
            }
        }

        impl fmt::Display for $point {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{:09}", self.sec, self.nsec)
            }
        }

        impl TimePoint for $point {
            type Span = $span;

            #[inline]
            fn zero() -> Self {
                Self::ZERO
            }
        }
    };
}

macro_rules! span_type {
    ($(#[$doc:meta])* $span:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $span {
            sec: i64,
            nsec: u32,
        }

        impl $span {
            /// The zero-length span.
            pub const ZERO: Self = Self { sec: 0, nsec: 0 };

            /// Build a span from a raw `(sec, nsec)` pair, normalizing so
            /// that `nsec ∈ [0, 10⁹)`; negative spans end up with a negative
            /// (or borrowed) seconds field, e.g. `new(0, -1)` is
            /// `(-1, 999_999_999)`.
            #[inline]
            pub fn new(sec: i64, nsec: i64) -> Self {
                let (sec, nsec) = normalize(sec, nsec);
                Self { sec, nsec }
            }

            /// Build a span from fractional (possibly negative) seconds.
            pub fn from_secs_f64(secs: f64) -> Self {
                Self::from_nanos((secs * 1e9).round() as i64)
            }

            /// Build a span from a nanosecond count.
            #[inline]
            pub fn from_nanos(nanos: i64) -> Self {
                Self::new(nanos.div_euclid(NSEC_PER_SEC), nanos.rem_euclid(NSEC_PER_SEC))
            }

            /// Seconds component (carries the sign).
            #[inline]
            #[must_use]
            pub fn sec(&self) -> i64 {
                self.sec
            }

            /// Nanoseconds component, always in `[0, 10⁹)`.
            #[inline]
            #[must_use]
            pub fn nsec(&self) -> u32 {
                self.nsec
            }

            /// The span in seconds as a float.
            #[must_use]
            pub fn as_secs_f64(&self) -> f64 {
                self.sec as f64 + f64::from(self.nsec) * 1e-9
            }

            /// The span in nanoseconds.
            #[must_use]
            pub fn as_nanos(&self) -> i128 {
                i128::from(self.sec) * i128::from(NSEC_PER_SEC) + i128::from(self.nsec)
            }

            /// Whether the span is exactly zero.
            #[inline]
            #[must_use]
            pub fn is_zero(&self) -> bool {
                self.sec == 0 && self.nsec == 0
            }
        }

        impl Add for $span {
            type Output = $span;

            #[inline]
            fn add(self, rhs: $span) -> $span {
                $span::new(self.sec + rhs.sec, i64::from(self.nsec) + i64::from(rhs.nsec))
            }
        }

        impl Sub for $span {
            type Output = $span;

            #[inline]
            fn sub(self, rhs: $span) -> $span {
                $span::new(self.sec - rhs.sec, i64::from(self.nsec) - i64::from(rhs.nsec))
            }
        }

        impl Neg for $span {
            type Output = $span;

            #[inline]
            fn neg(self) -> $span {
                $span::new(-self.sec, -i64::from(self.nsec))
            }
        }

        impl fmt::Display for $span {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{:09}", self.sec, self.nsec)
            }
        }

        impl TimeSpan for $span {
            #[inline]
            fn zero() -> Self {
                Self::ZERO
            }

            fn from_secs_f64(secs: f64) -> Self {
                $span::from_secs_f64(secs)
            }

            fn as_secs_f64(&self) -> f64 {
                $span::as_secs_f64(self)
            }

            fn from_std(d: std::time::Duration) -> Self {
                Self::new(d.as_secs() as i64, i64::from(d.subsec_nanos()))
            }

            fn to_std(&self) -> Option<std::time::Duration> {
                if self.sec < 0 {
                    None
                } else {
                    Some(std::time::Duration::new(self.sec as u64, self.nsec))
                }
            }
        }
    };
}

point_type!(
    /// An instant of node time (possibly simulated; may pause or jump).
    Time,
    Duration
);
point_type!(
    /// An instant of monotonic wall time.
    WallTime,
    WallDuration
);
span_type!(
    /// A signed span of node time.
    Duration
);
span_type!(
    /// A signed span of monotonic wall time.
    WallDuration
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_carries_overflow() {
        let t = Time::new(100, 2_000_003_000);
        assert_eq!(t.sec(), 102);
        assert_eq!(t.nsec(), 3000);
    }

    #[test]
    fn test_normalization_borrows_negative_nsec() {
        let d = Duration::new(0, -1);
        assert_eq!(d.sec(), -1);
        assert_eq!(d.nsec(), 999_999_999);
        assert_eq!(d.as_nanos(), -1);
    }

    #[test]
    fn test_point_plus_span() {
        assert_eq!(Time::new(100, 0) + Duration::new(100, 0), Time::new(200, 0));
        assert_eq!(
            Time::new(0, 100_000) + Duration::new(0, 100),
            Time::new(0, 100_100)
        );
        assert_eq!(
            Time::new(0, 0) + Duration::new(10, 2_000_003_000),
            Time::new(12, 3000)
        );
    }

    #[test]
    fn test_point_minus_span() {
        assert_eq!(
            Time::new(30, 0) - Duration::new(10, 2_000_003_000),
            Time::new(17, 999_997_000)
        );
    }

    #[test]
    fn test_point_difference_is_span() {
        let a = WallTime::new(5, 500_000_000);
        let b = WallTime::new(3, 750_000_000);
        assert_eq!(a - b, WallDuration::new(1, 750_000_000));
        assert_eq!(b - a, WallDuration::from_secs_f64(-1.75));
    }

    #[test]
    fn test_additive_identity_and_inverse() {
        let d = Duration::new(3, 141_592_653);
        assert_eq!(d + (-d), Duration::ZERO);

        let a = Duration::new(7, 999_999_999);
        let b = Duration::new(2, 1);
        assert_eq!((a + b) - b, a);
    }

    #[test]
    fn test_ordering_matches_nanosecond_count() {
        let stamps = [
            Time::new(-1, 999_999_999),
            Time::new(0, 0),
            Time::new(0, 1),
            Time::new(0, 999_999_999),
            Time::new(1, 0),
            Time::new(100, 2_000_003_000),
        ];
        for w in stamps.windows(2) {
            assert!(w[0] < w[1]);
            assert!(w[0].as_nanos() < w[1].as_nanos());
        }
    }

    #[test]
    fn test_secs_f64_round_trip_is_stable() {
        for &secs in &[0.0, 0.1, 1.0 / 3.0, 123.456_789, -2.5, 1e6 + 0.25] {
            let once = Duration::from_secs_f64(secs).as_secs_f64();
            let twice = Duration::from_secs_f64(once).as_secs_f64();
            assert_eq!(once, twice, "round-trip drifted for {}", secs);
        }
    }

    #[test]
    fn test_std_conversions() {
        let d = WallDuration::new(2, 500_000_000);
        assert_eq!(
            d.to_std(),
            Some(std::time::Duration::from_millis(2500))
        );
        assert_eq!(WallDuration::from_std(std::time::Duration::from_millis(2500)), d);
        assert_eq!((-d).to_std(), None);
    }

    #[test]
    fn test_display_format() {
        assert_eq!(Time::new(1, 5).to_string(), "1.000000005");
    }
}
