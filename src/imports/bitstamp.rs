use crate::imports::{first_line, ParseContext, ParseError, TransactionParser};
use crate::model::transaction::{Transaction, TxType};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::Path;

const HEADER: &str = "Type,Datetime,BTC,USD,BTC Price,FEE";

/// Bitstamp's transaction export.
///
/// Row types: `0` deposit, `1` withdrawal, `2` market trade. The fee column
/// is USD-denominated.
pub struct BitstampParser;

#[derive(Clone, Debug, Deserialize)]
struct BitstampCSVRow {
    #[serde(rename = "Type")]
    row_type: String,
    #[serde(rename = "Datetime")]
    datetime: String,
    #[serde(rename = "BTC")]
    btc: String,
    #[serde(rename = "USD")]
    usd: String,
    #[serde(rename = "BTC Price")]
    price: String,
    #[serde(rename = "FEE")]
    fee: String,
}

impl TransactionParser for BitstampParser {
    fn name(&self) -> &'static str {
        "Bitstamp"
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| line == HEADER)
    }

    fn parse(
        &mut self,
        path: &Path,
        _ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut events = Vec::new();

        for (row, result) in reader.deserialize().enumerate() {
            let record: BitstampCSVRow = result?;
            events.push(parse_row(record).map_err(|err| ParseError::Row {
                row: row + 1,
                message: err.to_string(),
            })?);
        }

        Ok(events)
    }
}

fn parse_row(record: BitstampCSVRow) -> Result<Transaction, ParseError> {
    let timestamp = NaiveDateTime::parse_from_str(&record.datetime, "%F %T")?.and_utc();
    let btc = record.btc.parse::<crate::model::amount::BtcAmount>()?;

    match record.row_type.as_str() {
        "0" => Ok(Transaction::new(timestamp, TxType::Deposit, btc.abs())),
        "1" => Ok(Transaction::new(timestamp, TxType::Withdraw, -btc.abs())),
        "2" => {
            let mut tx = Transaction::new(timestamp, TxType::Trade, btc);
            tx.usd = Some(record.usd.parse()?);
            if !record.price.is_empty() {
                tx.price = Some(record.price.parse()?);
            }
            if !record.fee.is_empty() {
                tx.fee_usd = record.fee.parse()?;
            }
            Ok(tx)
        }
        other => Err(ParseError::Row {
            row: 0,
            message: format!("unknown row type `{other}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::IngestOptions;
    use std::io::Write as _;

    #[test]
    fn test_parse_export() {
        let path = std::env::temp_dir().join(format!(
            "gaincount-bitstamp-{}.csv",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{HEADER}").unwrap();
        writeln!(file, "0,2013-05-01 10:00:00,2.00000000,0.00,,0.00").unwrap();
        writeln!(file, "2,2013-05-02 10:00:00,-1.00000000,110.00,110.00,0.55").unwrap();
        writeln!(file, "1,2013-05-03 10:00:00,1.00000000,0.00,,0.00").unwrap();
        drop(file);

        let mut parser = BitstampParser;
        assert!(parser.can_parse(&path));

        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].tx_type, TxType::Deposit);
        assert_eq!(events[0].btc.to_string(), "2.00000000");

        assert_eq!(events[1].tx_type, TxType::Trade);
        assert_eq!(events[1].usd.unwrap().to_string(), "110.00");
        assert_eq!(events[1].fee_usd.to_string(), "0.55");

        // Withdrawals are normalized to negative amounts.
        assert_eq!(events[2].tx_type, TxType::Withdraw);
        assert_eq!(events[2].btc.to_string(), "-1.00000000");
    }
}
