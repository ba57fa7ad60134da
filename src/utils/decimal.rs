//! Fixed-point arithmetic utilities for quantum calculations.
//!
//! Quantities are exact integers (`BigInt`). Prices arrive as `Decimal` and
//! are converted exactly through their mantissa and scale, so no step of a
//! collateral calculation ever goes through floating point.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, Zero};
use rust_decimal::Decimal;

/// Parts-per-million denominator used by funding indices and margin rates.
pub const ONE_MILLION: u32 = 1_000_000;

/// `10^exp` as a big integer.
pub fn pow10(exp: u32) -> BigInt {
    num_traits::pow(BigInt::from(10u8), exp as usize)
}

/// Split a decimal into `(mantissa, scale)` such that `value = mantissa * 10^-scale`.
pub fn decimal_parts(value: Decimal) -> (BigInt, u32) {
    (BigInt::from(value.mantissa()), value.scale())
}

/// Multiply by `10^exp`, flooring towards negative infinity when `exp` is negative.
pub fn mul_pow10_floor(value: &BigInt, exp: i32) -> BigInt {
    if exp >= 0 {
        value * pow10(exp as u32)
    } else {
        value.div_floor(&pow10(exp.unsigned_abs()))
    }
}

/// Multiply a value by `numerator / denominator`, rounding towards negative
/// infinity or positive infinity.
pub fn mul_ratio(value: &BigInt, numerator: u32, denominator: u32, round_up: bool) -> BigInt {
    let product = value * BigInt::from(numerator);
    let denominator = BigInt::from(denominator);
    if round_up {
        product.div_ceil(&denominator)
    } else {
        product.div_floor(&denominator)
    }
}

/// Multiply a value by a parts-per-million rate.
pub fn mul_ppm(value: &BigInt, ppm: u32, round_up: bool) -> BigInt {
    mul_ratio(value, ppm, ONE_MILLION, round_up)
}

/// Floor division by one million (Euclidean for a positive divisor).
pub fn div_ppm_floor(value: &BigInt) -> BigInt {
    value.div_floor(&BigInt::from(ONE_MILLION))
}

/// `max(0, value)`.
pub fn positive_part(value: &BigInt) -> BigInt {
    if value.is_positive() {
        value.clone()
    } else {
        BigInt::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_parts() {
        let (mantissa, scale) = decimal_parts(dec!(50000.25));
        assert_eq!(mantissa, BigInt::from(5_000_025));
        assert_eq!(scale, 2);
    }

    #[test]
    fn test_mul_pow10_floor() {
        assert_eq!(mul_pow10_floor(&BigInt::from(15), 2), BigInt::from(1500));
        assert_eq!(mul_pow10_floor(&BigInt::from(15), -1), BigInt::from(1));
        // Negative values round towards negative infinity.
        assert_eq!(mul_pow10_floor(&BigInt::from(-15), -1), BigInt::from(-2));
    }

    #[test]
    fn test_mul_ppm_rounding() {
        // 1001 * 0.05 = 50.05
        assert_eq!(mul_ppm(&BigInt::from(1001), 50_000, false), BigInt::from(50));
        assert_eq!(mul_ppm(&BigInt::from(1001), 50_000, true), BigInt::from(51));
        assert_eq!(mul_ppm(&BigInt::from(1000), 50_000, true), BigInt::from(50));
    }

    #[test]
    fn test_div_ppm_floor() {
        assert_eq!(div_ppm_floor(&BigInt::from(2_500_000)), BigInt::from(2));
        assert_eq!(div_ppm_floor(&BigInt::from(-2_500_000)), BigInt::from(-3));
    }

    #[test]
    fn test_positive_part() {
        assert_eq!(positive_part(&BigInt::from(-7)), BigInt::zero());
        assert_eq!(positive_part(&BigInt::from(7)), BigInt::from(7));
    }
}
