// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

use std::fmt;

/// A fixed decimal `Argument` for the [Wayland] wire protocol.
///
/// The wire representation is a signed 24.8 fixed point number: the high 24 bits
/// hold the integer part and the low 8 bits the fraction. Conversions into a
/// `Decimal` round half away from zero. Values outside of the representable range
/// (roughly ±8388608) are not clamped: the scaled value wraps modulo 2^32 once it
/// has been truncated to 32 bits.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal(i32);

const SCALE: f64 = 256.0;

impl Decimal {
    /// Create a `Decimal` from its raw wire value.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw wire value of this `Decimal`.
    pub const fn to_raw(self) -> i32 {
        self.0
    }

    /// Create a `Decimal` from an `f64`, rounding to the nearest 1/256.
    pub fn from_f64(value: f64) -> Self {
        // f64 -> i64 saturates, the i64 -> i32 step wraps.
        Self((value * SCALE).round() as i64 as i32)
    }

    /// Create a `Decimal` from an `i32`.
    pub const fn from_i32(value: i32) -> Self {
        Self(value.wrapping_mul(256))
    }

    /// The value of this `Decimal` as an `f64`. This conversion is exact.
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / SCALE
    }

    /// The integer part of this `Decimal`, truncated toward zero.
    pub const fn to_i32(self) -> i32 {
        self.0 / 256
    }
}

impl From<f64> for Decimal {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl From<i32> for Decimal {
    fn from(value: i32) -> Self {
        Self::from_i32(value)
    }
}

impl From<Decimal> for f64 {
    fn from(value: Decimal) -> Self {
        value.to_f64()
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_round_trips_representable_values() {
        let values = (-2048..=2048)
            .map(|n| f64::from(n) / 256.0)
            .chain([8_388_607.0, -8_388_608.0, 8_388_607.99609375, 0.00390625]);

        for value in values {
            assert_eq!(Decimal::from_f64(value).to_f64(), value, "for {}", value);
        }
    }

    #[test]
    fn decimal_to_i32_truncates_toward_zero() {
        assert_eq!(Decimal::from_f64(1.9).to_i32(), 1);
        assert_eq!(Decimal::from_f64(-1.9).to_i32(), -1);
        assert_eq!(Decimal::from_f64(-0.5).to_i32(), 0);
    }

    #[test]
    fn decimal_from_f64_rounds_half_away_from_zero() {
        // 1/512 is exactly half of the smallest step
        assert_eq!(Decimal::from_f64(1.0 / 512.0).to_raw(), 1);
        assert_eq!(Decimal::from_f64(-1.0 / 512.0).to_raw(), -1);
    }

    #[test]
    fn decimal_from_i32_scales_value() {
        let sut = Decimal::from(-3);

        assert_eq!(sut.to_raw(), -768);
        assert_eq!(sut.to_i32(), -3);
        assert_eq!(sut.to_f64(), -3.0);
    }

    #[test]
    fn decimal_wraps_out_of_range_values() {
        let sut = Decimal::from_f64(8_388_608.0);

        assert_eq!(sut.to_raw(), i32::MIN);
    }
}
