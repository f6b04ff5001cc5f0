use crate::imports::{first_line, ParseContext, ParseError, TransactionParser};
use crate::model::amount::{BtcAmount, UsdAmount};
use crate::model::transaction::{Transaction, TransactionError, TxType};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::Path;

const HEADER: &str = "Index,Date,Type,Info,Value,Balance";

/// Mt. Gox account history, exported as separate BTC and USD files that must
/// arrive in matched pairs. The two legs of a trade (and its fee) share a
/// `tid:` marker in the info column and are recombined by merge.
#[derive(Debug, Default)]
pub struct MtGoxParser {
    seen_btc: usize,
    seen_usd: usize,
    seen_first_btc: bool,
    seen_first_usd: bool,
    gaps: Vec<String>,

    // Per-file state.
    is_btc: bool,
    expected_index: u64,
}

#[derive(Clone, Debug, Deserialize)]
struct MtGoxCSVRow {
    #[serde(rename = "Index")]
    index: u64,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Type")]
    row_type: String,
    #[serde(rename = "Info")]
    info: String,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Balance")]
    #[allow(dead_code)]
    balance: String,
}

impl TransactionParser for MtGoxParser {
    fn name(&self) -> &'static str {
        "MtGox"
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| line == HEADER)
    }

    fn parse(
        &mut self,
        path: &Path,
        ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_uppercase())
            .unwrap_or_default();
        if basename.contains("BTC") {
            self.is_btc = true;
            self.seen_btc += 1;
        } else if basename.contains("USD") {
            self.is_btc = false;
            self.seen_usd += 1;
        } else {
            return Err(ParseError::Incomplete(format!(
                "Mt. Gox file name must contain BTC or USD: {basename}"
            )));
        }

        let mut reader = csv::Reader::from_path(path)?;
        let mut events = Vec::new();

        for (row, result) in reader.deserialize().enumerate() {
            let record: MtGoxCSVRow = result?;

            if record.index == 1 {
                if self.is_btc {
                    self.seen_first_btc = true;
                } else {
                    self.seen_first_usd = true;
                }
            }
            self.expected_index += 1;
            if record.index != self.expected_index {
                self.gaps.push(format!(
                    "{basename}: expected index {expected}, found {found}",
                    expected = self.expected_index,
                    found = record.index,
                ));
                self.expected_index = record.index;
            }

            let event = self
                .parse_row(record, ctx)
                .map_err(|err| ParseError::Row {
                    row: row + 1,
                    message: err.to_string(),
                })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Rows sharing a `tid:` are one trade split across files: combine the
    /// BTC leg, the USD leg, and the fee row into a single event.
    fn merge(&self, group: Vec<Transaction>) -> Result<Vec<Transaction>, ParseError> {
        if group.len() == 1 {
            return Ok(group);
        }

        let tx_type = group
            .iter()
            .map(|event| event.tx_type)
            .find(|tx_type| *tx_type != TxType::Fee)
            .unwrap_or(TxType::Fee);

        let mut merged = Transaction::new(group[0].timestamp, tx_type, BtcAmount::default());
        merged.id = group[0].id.clone();
        merged.parser = group[0].parser;

        for event in &group {
            if !event.btc.is_zero() {
                merged.btc = event.btc;
            }
            if let Some(usd) = event.usd {
                if !usd.is_zero() {
                    merged.usd = Some(usd);
                }
            }
            if !event.fee_btc.is_zero() {
                merged.fee_btc = event.fee_btc;
            }
            if !event.fee_usd.is_zero() {
                merged.fee_usd = event.fee_usd;
            }
            if event.price.is_some() {
                merged.price = event.price;
            }
            if !event.account.is_empty() {
                merged.account = event.account.clone();
            }
            if merged.info.is_empty() {
                merged.info = event.info.clone();
            }
        }

        merged.derive_price();
        if merged.fee_usd.is_zero() && !merged.fee_btc.is_zero() {
            match merged.price {
                Some(price) => merged.fee_usd = UsdAmount::from_rate_intermediate(price, merged.fee_btc),
                // No rate to value the fee with; fold it into the BTC leg
                // instead.
                None => merged.btc += merged.fee_btc,
            }
        }

        Ok(vec![merged])
    }

    fn check_complete(&self) -> Result<(), ParseError> {
        if self.seen_btc != self.seen_usd {
            return Err(ParseError::Incomplete(format!(
                "Mismatched number of Mt. Gox BTC and USD files ({btc} vs {usd})",
                btc = self.seen_btc,
                usd = self.seen_usd,
            )));
        }
        if (self.seen_btc > 0 && !self.seen_first_btc) || (self.seen_usd > 0 && !self.seen_first_usd)
        {
            return Err(ParseError::Incomplete(
                "Missing first Mt. Gox transaction. (Did you download the > 3 month csv?)"
                    .to_string(),
            ));
        }
        if let Some(gap) = self.gaps.first() {
            return Err(ParseError::Incomplete(format!(
                "Gap in Mt. Gox index sequence: {gap}"
            )));
        }

        Ok(())
    }

    fn default_account(&self) -> String {
        "mtgox".to_string()
    }

    fn reset(&mut self) {
        self.is_btc = false;
        self.expected_index = 0;
    }
}

impl MtGoxParser {
    fn parse_row(
        &self,
        record: MtGoxCSVRow,
        ctx: &mut ParseContext,
    ) -> Result<Transaction, ParseError> {
        let timestamp = NaiveDateTime::parse_from_str(&record.date, "%F %T")?.and_utc();
        let id = tid(&record.info).unwrap_or_else(|| ctx.unique());

        let mut tx = match (record.row_type.as_str(), self.is_btc) {
            ("out", true) => {
                let value: BtcAmount = record.value.parse()?;
                Transaction::new(timestamp, TxType::Trade, -value)
            }
            ("in", true) => Transaction::new(timestamp, TxType::Trade, record.value.parse()?),
            ("earned", false) => {
                let mut tx = Transaction::new(timestamp, TxType::Trade, BtcAmount::default());
                tx.usd = Some(record.value.parse()?);
                tx
            }
            ("spent", false) => {
                let value: UsdAmount = record.value.parse()?;
                let mut tx = Transaction::new(timestamp, TxType::Trade, BtcAmount::default());
                tx.usd = Some(-value);
                tx
            }
            ("fee", is_btc) => {
                let mut tx = Transaction::new(timestamp, TxType::Fee, BtcAmount::default());
                if is_btc {
                    tx.fee_btc = record.value.parse()?;
                } else {
                    tx.fee_usd = record.value.parse()?;
                }
                tx
            }
            ("withdraw", true) => {
                let value: BtcAmount = record.value.parse()?;
                Transaction::new(timestamp, TxType::Withdraw, -value)
            }
            ("deposit", true) => {
                Transaction::new(timestamp, TxType::Deposit, record.value.parse()?)
            }
            (other, _) => return Err(TransactionError::UnknownType(other.to_string()).into()),
        };

        tx.info = record.info;
        tx.id = id;

        Ok(tx)
    }
}

/// Extract the `tid:<digits>` trade marker from the info column.
fn tid(info: &str) -> Option<String> {
    let start = info.find("tid:")?;
    let digits: String = info[start + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();

    (!digits.is_empty()).then(|| format!("tid:{digits}"))
}
