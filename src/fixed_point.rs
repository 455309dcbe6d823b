//! # 17.14 Fixed-Point Arithmetic
//!
//! Signed fixed-point numbers with 17 integer bits and 14 fractional bits,
//! used by the MLFQS policy for `load_avg` and `recent_cpu`. All operations
//! are integer-only so results are bit-identical on every target.
//!
//! Products and quotients are computed in 64 bits and narrowed back, so
//! intermediate values never overflow for in-range operands.

use core::fmt;
use core::ops::{Add, Div, Mul, Sub};

/// Number of fractional bits.
pub const FRACTION_BITS: u32 = 14;

const ONE_RAW: i32 = 1 << FRACTION_BITS;

/// A 17.14 fixed-point value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(ONE_RAW);

    /// Convert an integer to fixed point.
    #[inline]
    pub const fn from_int(n: i32) -> Self {
        Fixed(n.wrapping_mul(ONE_RAW))
    }

    /// Wrap a raw 17.14 bit pattern.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Fixed(raw)
    }

    /// The raw 17.14 bit pattern.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// `self * n` for an integer `n`.
    #[inline]
    pub const fn scale(self, n: i32) -> Self {
        Fixed(self.0.wrapping_mul(n))
    }

    /// `self / n` for an integer `n`. Division by zero saturates toward the
    /// sign of `self` instead of trapping.
    #[inline]
    pub const fn unscale(self, n: i32) -> Self {
        if n == 0 {
            return saturate(self.0 as i64);
        }
        Fixed(self.0.wrapping_div(n))
    }

    /// Integer part, rounding toward zero.
    #[inline]
    pub const fn trunc(self) -> i32 {
        self.0 / ONE_RAW
    }

    /// Nearest integer, halves rounded away from zero.
    #[inline]
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + ONE_RAW / 2) / ONE_RAW
        } else {
            (self.0 - ONE_RAW / 2) / ONE_RAW
        }
    }
}

const fn saturate(sign_source: i64) -> Fixed {
    if sign_source >= 0 {
        Fixed(i32::MAX)
    } else {
        Fixed(i32::MIN)
    }
}

impl Add for Fixed {
    type Output = Fixed;

    #[inline]
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    #[inline]
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.wrapping_sub(rhs.0))
    }
}

impl Mul for Fixed {
    type Output = Fixed;

    #[inline]
    fn mul(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64 * rhs.0 as i64) >> FRACTION_BITS) as i32)
    }
}

impl Div for Fixed {
    type Output = Fixed;

    #[inline]
    fn div(self, rhs: Fixed) -> Fixed {
        if rhs.0 == 0 {
            return saturate(self.0 as i64);
        }
        Fixed((((self.0 as i64) << FRACTION_BITS) / rhs.0 as i64) as i32)
    }
}

impl fmt::Display for Fixed {
    /// Two decimal places, the precision the kernel reports.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hundredths = self.scale(100).round();
        let sign = if hundredths < 0 { "-" } else { "" };
        let abs = hundredths.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}
