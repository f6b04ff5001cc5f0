use crate::imports::{first_line, ParseContext, ParseError, TransactionParser};
use crate::model::amount::{BtcAmount, UsdAmount};
use crate::model::transaction::{Transaction, TransactionError, TxType};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// The Kraken ledger CSV export.
///
/// A spot trade appears as two rows sharing a `refid`, one per asset leg;
/// they are recombined by the merge step. Only the BTC/USD pair is modeled;
/// fiat funding rows are skipped.
pub struct KrakenParser;

#[derive(Clone, Debug, Deserialize)]
struct LedgerCSVRow {
    txid: String,
    refid: String,
    time: String,
    #[serde(rename = "type")]
    lr_type: String,
    #[allow(dead_code)]
    subtype: String,
    #[allow(dead_code)]
    aclass: String, // Always "currency"
    asset: String, // ZUSD, XXBT
    amount: String,
    fee: String,
    #[allow(dead_code)]
    balance: String,
}

impl TransactionParser for KrakenParser {
    fn name(&self) -> &'static str {
        "Kraken"
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| {
            line.replace('"', "")
                .starts_with("txid,refid,time,type,subtype,aclass,asset,amount,fee,balance")
        })
    }

    fn parse(
        &mut self,
        path: &Path,
        ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut events = Vec::new();

        for (row, result) in reader.deserialize().enumerate() {
            let record: LedgerCSVRow = result?;
            if record.txid.is_empty() {
                // Unposted deposit/withdrawal requests repeat their fulfilled
                // row's refid.
                continue;
            }

            match parse_row(record, ctx).map_err(|err| ParseError::Row {
                row: row + 1,
                message: err.to_string(),
            })? {
                Some(event) => events.push(event),
                None => debug!("skipping fiat ledger row {row}"),
            }
        }

        Ok(events)
    }

    /// Recombine the asset legs of a trade into one canonical event.
    fn merge(&self, group: Vec<Transaction>) -> Result<Vec<Transaction>, ParseError> {
        let mut merged: Option<Transaction> = None;

        for event in group {
            match merged.as_mut() {
                None => merged = Some(event),
                Some(merged) => {
                    if !event.btc.is_zero() {
                        merged.btc = event.btc;
                        merged.fee_btc = event.fee_btc;
                    }
                    if let Some(usd) = event.usd {
                        merged.usd = Some(usd);
                        merged.fee_usd = event.fee_usd;
                    }
                    if merged.tx_type != event.tx_type {
                        merged.tx_type = TxType::Trade;
                    }
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    fn default_account(&self) -> String {
        "kraken".to_string()
    }
}

fn parse_row(
    record: LedgerCSVRow,
    ctx: &mut ParseContext,
) -> Result<Option<Transaction>, ParseError> {
    let is_btc = matches!(record.asset.as_str(), "XXBT" | "XBT" | "BTC");
    let is_usd = matches!(record.asset.as_str(), "ZUSD" | "USD");
    if !is_btc && !is_usd {
        return Ok(None);
    }

    let timestamp = NaiveDateTime::parse_from_str(&record.time, "%F %T")?.and_utc();

    let mut tx = match (record.lr_type.as_str(), is_btc) {
        ("trade" | "spend" | "receive", true) => {
            let mut tx = Transaction::new(timestamp, TxType::Trade, record.amount.parse()?);
            tx.fee_btc = record.fee.parse::<BtcAmount>()?.abs();
            tx
        }
        ("trade" | "spend" | "receive", false) => {
            let mut tx = Transaction::new(timestamp, TxType::Trade, BtcAmount::default());
            tx.usd = Some(record.amount.parse()?);
            tx.fee_usd = record.fee.parse::<UsdAmount>()?.abs();
            tx
        }
        ("deposit", true) => Transaction::new(timestamp, TxType::Deposit, record.amount.parse()?),
        ("withdrawal", true) => {
            let mut tx = Transaction::new(timestamp, TxType::Withdraw, record.amount.parse()?);
            tx.fee_btc = record.fee.parse::<BtcAmount>()?.abs();
            tx
        }
        // Fiat funding does not touch the BTC ledger.
        ("deposit" | "withdrawal", false) => return Ok(None),
        (other, _) => {
            return Err(TransactionError::UnknownType(other.to_string()).into());
        }
    };

    tx.info = record.txid.clone();
    tx.id = if record.refid.is_empty() {
        ctx.unique()
    } else {
        record.refid
    };

    Ok(Some(tx))
}
