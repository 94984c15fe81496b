//! Rational time bases and timestamp rescaling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marker for a timestamp that is not set.
pub const NOPTS: i64 = i64::MIN;

/// Ticks per second of the pipeline-internal time base.
pub const TIME_BASE: i64 = 1_000_000;

/// A rational number `num/den`, used for time bases, frame rates and aspect ratios.
///
/// A zero denominator (or `0/0`) means "unknown" and is never used as a divisor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// The fixed microsecond time base shared by all trackers.
    pub const MICROS: Rational = Rational::new(1, TIME_BASE as i32);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// True when both terms are non-zero.
    pub fn is_known(self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Valid as a time base: strictly positive.
    pub fn is_time_base(self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Removes common factors and normalizes the sign onto the numerator.
    pub fn reduce(self) -> Self {
        if self.den == 0 {
            return self;
        }
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()).max(1) as i64;
        let mut num = self.num as i64 / g;
        let mut den = self.den as i64 / g;
        if den < 0 {
            num = -num;
            den = -den;
        }
        Self::new(num as i32, den as i32)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Rational {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (num, den) = match s.split_once(['/', ':']) {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (s, "1"),
        };
        let num = num
            .parse::<i32>()
            .map_err(|e| format!("invalid numerator in '{}': {}", s, e))?;
        let den = den
            .parse::<i32>()
            .map_err(|e| format!("invalid denominator in '{}': {}", s, e))?;
        if den == 0 {
            return Err(format!("zero denominator in '{}'", s));
        }
        Ok(Rational::new(num, den))
    }
}

impl TryFrom<String> for Rational {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rational> for String {
    fn from(value: Rational) -> Self {
        value.to_string()
    }
}

/// Converts `value` from time base `from` to time base `to`, rounding half away from zero.
///
/// `NOPTS` passes through unchanged, as does any value when `to` cannot be divided by.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if value == NOPTS {
        return NOPTS;
    }
    let mut b = from.num as i128 * to.den as i128;
    let mut c = from.den as i128 * to.num as i128;
    if c == 0 {
        return NOPTS;
    }
    if c < 0 {
        b = -b;
        c = -c;
    }
    let n = value as i128 * b;
    let r = c / 2;
    let q = if n >= 0 { (n + r) / c } else { -((-n + r) / c) };
    q.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
}

/// Length of one frame at `frame_rate`, expressed in `time_base`. Zero when the rate is unknown.
pub fn frame_interval(frame_rate: Rational, time_base: Rational) -> i64 {
    if !frame_rate.is_known() {
        return 0;
    }
    rescale(1, frame_rate.invert(), time_base)
}
