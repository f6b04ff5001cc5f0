use crate::model::amount::{BtcAmount, PriceAmount, UsdAmount};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    /// An adapter produced a type it does not model.
    #[error("Unknown transaction type: {0}")]
    UnknownType(String),

    /// A trade must carry both legs with opposite signs.
    #[error("Trade with id `{0}` has mismatched BTC/USD signs")]
    MismatchedTrade(String),
}

/// Closed set of canonical event types.
///
/// `Transfer` is internal (both sides are the user's accounts).
/// `TransferOut` is a disposal to an external party whose cost basis is still
/// tracked. `Gift` is a charitable donation eligible for the long-term
/// exemption. `Fee` is a pure BTC-denominated cost with no USD leg.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum TxType {
    Deposit,
    Withdraw,
    Trade,
    Transfer,
    TransferOut,
    Gift,
    Fee,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Trade => "trade",
            Self::Transfer => "transfer",
            Self::TransferOut => "transfer_out",
            Self::Gift => "gift",
            Self::Fee => "fee",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TxType {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdraw" | "withdrawal" => Ok(Self::Withdraw),
            "trade" => Ok(Self::Trade),
            "transfer" => Ok(Self::Transfer),
            "transfer_out" => Ok(Self::TransferOut),
            "gift" => Ok(Self::Gift),
            "fee" => Ok(Self::Fee),
            _ => Err(TransactionError::UnknownType(s.to_string())),
        }
    }
}

/// Identifies the source adapter that produced an event. Only used for
/// grouping during per-source merge; the engine never dereferences it.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ParserId(pub usize);

/// The canonical unit of ingest and replay.
///
/// Sign convention: positive `btc` increases the user's holdings, negative
/// decreases. For trades, `usd` has the opposite sign of `btc` (buy: btc > 0,
/// usd < 0). `usd` is `None` for events awaiting classification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub timestamp: DateTime<Utc>,
    pub tx_type: TxType,
    pub btc: BtcAmount,
    pub usd: Option<UsdAmount>,
    pub price: Option<PriceAmount>,
    pub fee_btc: BtcAmount,
    pub fee_usd: UsdAmount,
    pub account: String,
    pub dest_account: Option<String>,
    pub id: String,
    pub txid: Option<String>,
    pub info: String,
    pub parser: ParserId,
}

impl Transaction {
    pub fn new(timestamp: DateTime<Utc>, tx_type: TxType, btc: BtcAmount) -> Self {
        Self {
            timestamp,
            tx_type,
            btc,
            usd: None,
            price: None,
            fee_btc: BtcAmount::default(),
            fee_usd: UsdAmount::default(),
            account: String::new(),
            dest_account: None,
            id: String::new(),
            txid: None,
            info: String::new(),
            parser: ParserId(usize::MAX),
        }
    }

    /// Fill in the rate when both legs are known and no explicit rate was
    /// given by the source.
    pub fn derive_price(&mut self) {
        if self.price.is_none() && !self.btc.is_zero() {
            if let Some(usd) = self.usd {
                self.price = Some(PriceAmount::from_parts(usd.abs(), self.btc.abs()));
            }
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{tx_type}({time}, {usd}, {btc}, {account})",
            tx_type = self.tx_type,
            time = self.timestamp.format("%F %T"),
            usd = self
                .usd
                .map(|usd| usd.to_string())
                .unwrap_or_else(|| "?".to_string()),
            btc = self.btc,
            account = self.account,
        )
    }
}

impl PartialOrd for Transaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Transaction {
    /// Total order on events.
    ///
    /// Primarily by timestamp. On ties, transfer departures are moved ahead of
    /// activity on their destination account so the arriving lots exist before
    /// anything draws on them; remaining ties apply incoming amounts before
    /// outgoing ones, then break on the stringified id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| {
                if self.tx_type == TxType::Transfer
                    && self.dest_account.as_deref() == Some(other.account.as_str())
                {
                    if self.btc.is_negative() {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                } else if other.tx_type == TxType::Transfer
                    && other.dest_account.as_deref() == Some(self.account.as_str())
                {
                    if other.btc.is_negative() {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                } else {
                    other.btc.cmp(&self.btc)
                }
            })
            .then_with(|| self.id.cmp(&other.id))
    }
}
