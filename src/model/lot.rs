use crate::model::amount::{BtcAmount, PriceAmount, UsdAmount};
use chrono::{DateTime, Utc};
use std::fmt;

/// A unit of holdings eligible to be sold, transferred, or gifted in whole or
/// in part.
///
/// `price` is fixed at construction and preserved across splits so that
/// proportional splitting is exact. `disallowed_loss` is the wash-sale loss
/// attached at creation; it augments the lot's cost basis and is split by the
/// same proportion as the amount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lot {
    pub timestamp: DateTime<Utc>,
    pub btc: BtcAmount,
    pub usd: UsdAmount,
    pub price: PriceAmount,
    pub tx_id: String,
    pub disallowed_loss: UsdAmount,
}

impl Lot {
    pub fn new(timestamp: DateTime<Utc>, btc: BtcAmount, usd: UsdAmount, tx_id: String) -> Self {
        let price = if btc.is_zero() {
            PriceAmount::default()
        } else {
            PriceAmount::from_parts(usd, btc)
        };

        Self {
            timestamp,
            btc,
            usd,
            price,
            tx_id,
            disallowed_loss: UsdAmount::default(),
        }
    }

    /// Split this lot in two, the head holding at most `btc` bitcoins and the
    /// tail holding the remainder. Either half may be empty: `split(0)` yields
    /// `(None, Some(self))` and splitting by the full amount yields
    /// `(Some(self), None)`.
    pub fn split(self, btc: BtcAmount) -> (Option<Lot>, Option<Lot>) {
        if !btc.is_positive() {
            (None, Some(self))
        } else if btc < self.btc {
            let usd = UsdAmount::from_rate(self.price, btc);
            let disallowed_loss = if self.disallowed_loss.is_zero() {
                UsdAmount::default()
            } else {
                UsdAmount::from_rate(
                    PriceAmount::from_parts(self.disallowed_loss, self.btc),
                    btc,
                )
            };

            let head = Lot {
                timestamp: self.timestamp,
                btc,
                usd,
                price: self.price,
                tx_id: self.tx_id.clone(),
                disallowed_loss,
            };
            let tail = Lot {
                timestamp: self.timestamp,
                btc: self.btc - btc,
                usd: self.usd - usd,
                price: self.price,
                tx_id: self.tx_id,
                disallowed_loss: self.disallowed_loss - disallowed_loss,
            };

            (Some(head), Some(tail))
        } else {
            (Some(self), None)
        }
    }
}

impl fmt::Display for Lot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lot({date}, {btc}, {price})",
            date = self.timestamp.format("%F"),
            btc = self.btc,
            price = self.price,
        )
    }
}
