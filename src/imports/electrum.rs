use crate::imports::{first_line, ParseContext, ParseError, TransactionParser};
use crate::model::amount::BtcAmount;
use crate::model::transaction::{Transaction, TxType};
use chrono::NaiveDateTime;
use std::path::Path;

const HEADER_V2: &str = "transaction_hash,label,confirmations,value,timestamp";
const HEADER_V3: &str = "transaction_hash,label,confirmations,value,fiat_value,fee,fiat_fee,timestamp";

/// Electrum wallet history exports, v2 and v3 (the v3 shape adds fiat and
/// fee columns).
pub struct ElectrumParser;

impl TransactionParser for ElectrumParser {
    fn name(&self) -> &'static str {
        "Electrum"
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| line == HEADER_V2 || line == HEADER_V3)
    }

    fn parse(
        &mut self,
        path: &Path,
        _ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|header| header == name);

        let hash_col = column("transaction_hash");
        let label_col = column("label");
        let value_col = column("value");
        let fee_col = column("fee");
        let time_col = column("timestamp");

        let mut events = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let record = result?;
            let field = |col: Option<usize>| {
                col.and_then(|col| record.get(col)).unwrap_or_default()
            };

            let event = (|| -> Result<Transaction, ParseError> {
                let timestamp = parse_time(field(time_col))?;
                let value: BtcAmount = field(value_col).parse()?;
                let fee = field(fee_col);
                let fee: BtcAmount = if fee.is_empty() { Default::default() } else { fee.parse()? };

                let mut tx = if value.is_negative() {
                    // The exported value is net of the fee the wallet paid;
                    // the canonical amount excludes it.
                    let mut tx = Transaction::new(timestamp, TxType::Withdraw, value + fee);
                    tx.fee_btc = fee;
                    tx
                } else {
                    Transaction::new(timestamp, TxType::Deposit, value)
                };
                tx.info = field(label_col).to_string();

                let hash = field(hash_col);
                if !hash.is_empty() {
                    tx.txid = Some(hash.to_string());
                    tx.id = hash.to_string();
                }

                Ok(tx)
            })()
            .map_err(|err| ParseError::Row {
                row: row + 1,
                message: err.to_string(),
            })?;

            events.push(event);
        }

        Ok(events)
    }

    fn default_account(&self) -> String {
        "electrum".to_string()
    }
}

/// Electrum writes minute precision in some versions and full seconds in
/// others.
fn parse_time(s: &str) -> Result<chrono::DateTime<chrono::Utc>, ParseError> {
    let parsed = NaiveDateTime::parse_from_str(s, "%F %T")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%F %R"))?;

    Ok(parsed.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::IngestOptions;
    use std::io::Write as _;

    #[test]
    fn test_parse_v3_history() {
        let path = std::env::temp_dir().join(format!(
            "gaincount-electrum-{}.csv",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{HEADER_V3}").unwrap();
        writeln!(
            file,
            "aa11,salary,120,1.00000000,29000.00,,,2021-01-05 14:30"
        )
        .unwrap();
        writeln!(
            file,
            "bb22,rent,80,-0.50100000,-16000.00,0.00100000,32.00,2021-02-05 09:15"
        )
        .unwrap();
        drop(file);

        let mut parser = ElectrumParser;
        assert!(parser.can_parse(&path));

        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tx_type, TxType::Deposit);
        assert_eq!(events[0].btc.to_string(), "1.00000000");
        assert_eq!(events[0].txid.as_deref(), Some("aa11"));

        // The withdrawal's amount excludes the fee, which rides separately.
        assert_eq!(events[1].tx_type, TxType::Withdraw);
        assert_eq!(events[1].btc.to_string(), "-0.50000000");
        assert_eq!(events[1].fee_btc.to_string(), "0.00100000");
    }
}
