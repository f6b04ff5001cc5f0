use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub(crate) const BITCOIN_DIGITS: u8 = 8;
pub(crate) const USD_DIGITS: u8 = 2;
pub(crate) const RATE_DIGITS: u8 = 4;

#[derive(Debug, Error)]
pub enum ConvertAmountError {
    /// Unable to parse decimal string.
    #[error("Unable to parse decimal string")]
    Decimal(#[from] rust_decimal::Error),
}

/// Signed satoshi-precision Bitcoin amount. 8 fractional digits.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct BtcAmount(Decimal);

/// Signed USD amount. Accumulators hold 2 fractional digits; intermediate
/// sums are carried at full precision and rounded at every 2-digit boundary.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct UsdAmount(Decimal);

/// USD-per-BTC rate. 4 fractional digits for intermediate fee and price
/// computations.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PriceAmount(Decimal);

macro_rules! impl_math_ops {
    ($name:ident) => {
        impl ::std::ops::Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self::Output {
                Self(self.0 + rhs.0)
            }
        }

        impl ::std::ops::AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
            }
        }

        impl ::std::ops::Neg for $name {
            type Output = Self;

            fn neg(self) -> Self::Output {
                Self(-self.0)
            }
        }

        impl ::std::ops::Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self::Output {
                Self(self.0 - rhs.0)
            }
        }

        impl ::std::ops::SubAssign for $name {
            fn sub_assign(&mut self, rhs: Self) {
                self.0 -= rhs.0;
            }
        }

        impl ::std::iter::Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                iter.fold(Self::default(), |acc, x| acc + x)
            }
        }

        impl $name {
            pub fn is_zero(self) -> bool {
                self.0.is_zero()
            }

            pub fn is_positive(self) -> bool {
                self.0 > Decimal::ZERO
            }

            pub fn is_negative(self) -> bool {
                self.0 < Decimal::ZERO
            }

            pub fn abs(self) -> Self {
                Self(self.0.abs())
            }

            pub fn min(self, other: Self) -> Self {
                Self(self.0.min(other.0))
            }

            pub fn max(self, other: Self) -> Self {
                Self(self.0.max(other.0))
            }
        }
    };
}

impl_math_ops!(BtcAmount);
impl_math_ops!(UsdAmount);
impl_math_ops!(PriceAmount);

impl FromStr for BtcAmount {
    type Err = ConvertAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut amount: Decimal = s.parse()?;
        amount.rescale(BITCOIN_DIGITS as u32);

        Ok(Self(amount))
    }
}

impl FromStr for UsdAmount {
    type Err = ConvertAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl FromStr for PriceAmount {
    type Err = ConvertAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<i64> for BtcAmount {
    fn from(value: i64) -> Self {
        Self(Decimal::from(value))
    }
}

impl From<i64> for UsdAmount {
    fn from(value: i64) -> Self {
        Self(Decimal::from(value))
    }
}

impl From<i64> for PriceAmount {
    fn from(value: i64) -> Self {
        Self(Decimal::from(value))
    }
}

impl BtcAmount {
    pub(crate) fn from_decimal(mut amount: Decimal) -> Self {
        amount.rescale(BITCOIN_DIGITS as u32);

        Self(amount)
    }

    pub(crate) fn to_decimal(self) -> Decimal {
        self.0
    }
}

impl UsdAmount {
    /// Multiply a rate by a BTC amount, rounding at the USD boundary.
    pub fn from_rate(price: PriceAmount, btc: BtcAmount) -> Self {
        Self(price.0 * btc.0).round()
    }

    /// Like [`UsdAmount::from_rate`], but kept at the intermediate fee
    /// precision of 4 decimal places.
    pub fn from_rate_intermediate(price: PriceAmount, btc: BtcAmount) -> Self {
        Self((price.0 * btc.0).round_dp(RATE_DIGITS.into()))
    }

    /// Banker's rounding at 2 decimal places. Applied at every
    /// USD-denominated sum so results are deterministic and reproducible.
    ///
    /// SEE: https://docs.rs/rust_decimal/latest/rust_decimal/prelude/enum.RoundingStrategy.html
    pub fn round(self) -> Self {
        Self(self.0.round_dp(USD_DIGITS.into()))
    }
}

impl PriceAmount {
    /// Derive a rate from a USD total and a BTC amount.
    ///
    /// The divide is unavoidable; the quotient is kept at the intermediate
    /// rate precision.
    pub fn from_parts(usd: UsdAmount, btc: BtcAmount) -> Self {
        let mut rate = usd.0 / btc.0;
        rate.rescale(RATE_DIGITS as u32);

        Self(rate)
    }

    /// Round to the 2-decimal USD boundary. Quote sources publish prices at
    /// this precision.
    pub fn to_rounded(self) -> Self {
        Self(self.0.round_dp(USD_DIGITS.into()))
    }

    pub fn midpoint(a: Self, b: Self) -> Self {
        Self(((a.0 + b.0) / Decimal::TWO).round_dp(USD_DIGITS.into()))
    }
}

impl fmt::Display for BtcAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = self.0.round_dp(BITCOIN_DIGITS.into());

        write!(f, "{amount:.precision$}", precision = BITCOIN_DIGITS.into())
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = self.0.round_dp(USD_DIGITS.into());

        write!(f, "{amount:.precision$}", precision = USD_DIGITS.into())
    }
}

impl fmt::Display for PriceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = self.0.round_dp(RATE_DIGITS.into());

        write!(f, "{amount:.precision$}", precision = RATE_DIGITS.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbtest::arbitrary::{Result as ArbResult, Unstructured};
    use arbtest::arbtest;

    fn generate_amount_string(u: &mut Unstructured<'_>, precision: u8) -> ArbResult<String> {
        const DIGITS: [char; 10] = ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
        let mut amount = String::new();

        // `Decimal` supports up to 28 digits total, and `precision` tells us
        // where to put the decimal point.
        let leading_digits = 28 - precision;

        // Randomly positive or negative.
        amount.push_str(u.choose(&["-", ""])?);

        for _ in 1..=u.int_in_range(1..=leading_digits)? {
            amount.push(*u.choose(&DIGITS)?);
        }

        amount.push('.');

        for _ in 1..=u.int_in_range(1..=precision)? {
            amount.push(*u.choose(&DIGITS)?);
        }

        Ok(amount)
    }

    #[test]
    fn prop_test_parse_btc_amount() {
        arbtest(|u| {
            let arb_amount = generate_amount_string(u, BITCOIN_DIGITS)?;
            let amount: BtcAmount = arb_amount.parse().unwrap();
            assert_eq!(amount.to_decimal().scale(), u32::from(BITCOIN_DIGITS));
            Ok(())
        });
    }

    #[test]
    fn test_rounding_is_bankers() {
        // Half-even at the 2-decimal boundary.
        let down: UsdAmount = "1.125".parse().unwrap();
        assert_eq!(down.round().to_string(), "1.12");

        let up: UsdAmount = "1.135".parse().unwrap();
        assert_eq!(up.round().to_string(), "1.14");
    }

    #[test]
    fn test_rate_roundtrip() {
        let usd: UsdAmount = "250.00".parse().unwrap();
        let btc: BtcAmount = "2.00000000".parse().unwrap();
        let price = PriceAmount::from_parts(usd, btc);
        assert_eq!(price.to_string(), "125.0000");

        assert_eq!(UsdAmount::from_rate(price, btc), usd);
    }

    #[test]
    fn prop_test_display_precision() {
        arbtest(|u| {
            let arb_amount = generate_amount_string(u, USD_DIGITS)?;
            let amount: UsdAmount = arb_amount.parse().unwrap();
            let printed = amount.to_string();
            let digits = printed.split_once('.').unwrap().1;
            assert_eq!(digits.len(), usize::from(USD_DIGITS));
            Ok(())
        });
    }
}
