use crate::imports::{first_line, ParseContext, ParseError, TransactionParser};
use crate::model::transaction::{Transaction, TxType};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::Path;

const HEADER: &str = "timestamp,account,type,btc,usd,fee_btc,fee_usd,info";

/// The canonical CSV shape, as produced by `write_flat` round trips and hand
/// curation.
pub struct GenericParser;

#[derive(Clone, Debug, Deserialize)]
struct GenericCSVRow {
    timestamp: String,
    account: String,
    #[serde(rename = "type")]
    tx_type: String,
    btc: String,
    usd: String,
    fee_btc: String,
    fee_usd: String,
    info: String,
}

impl TransactionParser for GenericParser {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| line == HEADER)
    }

    fn parse(
        &mut self,
        path: &Path,
        _ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_path(path)?;
        let mut events = Vec::new();

        for (row, result) in reader.deserialize().enumerate() {
            let record: GenericCSVRow = result?;
            events.push(parse_row(record).map_err(|err| ParseError::Row {
                row: row + 1,
                message: err.to_string(),
            })?);
        }

        Ok(events)
    }
}

fn parse_row(record: GenericCSVRow) -> Result<Transaction, ParseError> {
    let timestamp = NaiveDateTime::parse_from_str(&record.timestamp, "%F %T")?.and_utc();
    let tx_type: TxType = record.tx_type.parse()?;

    let mut tx = Transaction::new(timestamp, tx_type, parse_or_zero(&record.btc)?);
    if !record.usd.is_empty() {
        tx.usd = Some(record.usd.parse()?);
    }
    tx.fee_btc = parse_or_zero(&record.fee_btc)?;
    tx.fee_usd = parse_or_zero(&record.fee_usd)?;
    tx.account = record.account;
    tx.info = record.info;

    Ok(tx)
}

fn parse_or_zero<T>(s: &str) -> Result<T, <T as std::str::FromStr>::Err>
where
    T: std::str::FromStr + Default,
{
    if s.is_empty() {
        Ok(T::default())
    } else {
        s.parse()
    }
}

/// Write the final ledger as the flat canonical CSV.
///
/// One row per event after merge and transfer matching; newlines in `info`
/// are replaced by spaces.
pub fn write_flat<W: std::io::Write>(
    writer: W,
    events: &[Transaction],
) -> Result<(), ParseError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record([
        "time", "type", "usd", "btc", "price", "fee_usd", "fee_btc", "account", "id", "info",
    ])?;

    for event in events {
        writer.write_record([
            event.timestamp.format("%F %T").to_string(),
            event.tx_type.to_string(),
            event.usd.map(|usd| usd.to_string()).unwrap_or_default(),
            event.btc.to_string(),
            event.price.map(|price| price.to_string()).unwrap_or_default(),
            event.fee_usd.to_string(),
            event.fee_btc.to_string(),
            event.account.clone(),
            event.id.clone(),
            event.info.replace('\n', " "),
        ])?;
    }
    writer.flush().map_err(ParseError::from)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::IngestOptions;
    use std::io::Write as _;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gaincount-generic-{}.csv",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_canonical_rows() {
        let path = write_temp(
            "timestamp,account,type,btc,usd,fee_btc,fee_usd,info\n\
             2017-01-01 10:00:00,ex,trade,1.0,-100.00,,0.50,first buy\n\
             2018-06-01 10:00:00,ex,withdraw,-1.0,,0.0001,,to cold storage\n",
        );

        let mut parser = GenericParser;
        assert!(parser.can_parse(&path));

        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tx_type, TxType::Trade);
        assert_eq!(events[0].usd.unwrap().to_string(), "-100.00");
        assert_eq!(events[0].fee_usd.to_string(), "0.50");
        assert_eq!(events[1].tx_type, TxType::Withdraw);
        assert!(events[1].usd.is_none());
        assert_eq!(events[1].fee_btc.to_string(), "0.00010000");
    }

    #[test]
    fn test_flat_output_shape() {
        let mut tx = Transaction::new(
            "2017-01-01 10:00:00+0000".parse().unwrap(),
            TxType::Trade,
            "1.0".parse().unwrap(),
        );
        tx.usd = Some("-100.00".parse().unwrap());
        tx.account = "ex".to_string();
        tx.id = "t1".to_string();
        tx.info = "line one\nline two".to_string();
        tx.derive_price();

        let mut buffer = Vec::new();
        write_flat(&mut buffer, &[tx]).unwrap();
        let output = String::from_utf8(buffer).unwrap();

        let mut lines = output.lines();
        assert_eq!(
            lines.next().unwrap(),
            "time,type,usd,btc,price,fee_usd,fee_btc,account,id,info"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2017-01-01 10:00:00,trade,-100.00,1.00000000,100.0000,0.00,0.00000000,ex,t1,line one line two"
        );
    }
}
