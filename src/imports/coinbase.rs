use crate::imports::{first_line, ParseContext, ParseError, TransactionParser};
use crate::model::amount::{BtcAmount, PriceAmount, UsdAmount};
use crate::model::transaction::{Transaction, TxType};
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub(crate) const OLD_NAME: &str = "Coinbase";
pub(crate) const DOWNLOAD_NAME: &str = "CoinbaseDownload";

/// The old Coinbase CSV export. Recognized by its `User,<email>,<hex>` first
/// line; the real column header is the second line.
pub struct CoinbaseParser;

impl TransactionParser for CoinbaseParser {
    fn name(&self) -> &'static str {
        OLD_NAME
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| {
            let mut cols = line.split(',');
            let user = cols.next() == Some("User");
            let hex = cols
                .last()
                .is_some_and(|col| !col.is_empty() && col.bytes().all(|b| b.is_ascii_hexdigit()));

            user && hex
        })
    }

    fn parse(
        &mut self,
        path: &Path,
        ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true) // the User line
            .flexible(true)
            .from_path(path)?;
        let mut events = Vec::new();

        for (row, result) in reader.records().enumerate() {
            let record = result?;
            if record
                .get(0)
                .is_some_and(|col| col.starts_with("Timestamp"))
            {
                // Coinbase has two header lines.
                continue;
            }
            if record.iter().all(|col| col.is_empty()) {
                continue;
            }

            let event = parse_old_row(&record, ctx).map_err(|err| ParseError::Row {
                row: row + 1,
                message: err.to_string(),
            })?;
            events.push(event);
        }

        Ok(events)
    }

    fn default_account(&self) -> String {
        "coinbase".to_string()
    }
}

fn parse_old_row(
    record: &csv::StringRecord,
    ctx: &mut ParseContext,
) -> Result<Transaction, ParseError> {
    let field = |index: usize| record.get(index).unwrap_or_default();
    let (timestamp, btc, to, note, total, total_currency) = (
        field(0),
        field(2),
        field(3),
        field(4),
        field(5),
        field(6),
    );

    let timestamp = DateTime::parse_from_str(timestamp, "%F %T %z")?.to_utc();
    let btc: BtcAmount = btc.parse()?;

    let mut tx = if note.contains('$') {
        // It's a buy/sell.
        let usd: UsdAmount = if !total.is_empty() {
            if total_currency != "USD" {
                return Err(ParseError::Row {
                    row: 0,
                    message: format!("unexpected total currency `{total_currency}`"),
                });
            }
            total.parse()?
        } else {
            let amount = single_dollar_amount(note)
                .ok_or_else(|| ParseError::AmbiguousPrice(note.to_string()))?;
            let amount: UsdAmount = amount.parse()?;
            // The note carries no sign; a trade's USD leg always opposes its
            // BTC leg (payments dispose BTC for positive proceeds).
            if btc.is_positive() {
                -amount
            } else {
                amount
            }
        };

        let mut tx = Transaction::new(timestamp, TxType::Trade, btc);
        tx.usd = Some(usd);
        tx
    } else {
        let tx_type = if btc.is_positive() {
            TxType::Deposit
        } else {
            TxType::Withdraw
        };
        Transaction::new(timestamp, tx_type, btc)
    };

    tx.info = format!("{note} {to}").trim().to_string();
    tx.id = ctx.unique();

    Ok(tx)
}

/// Extract `$<digits>.<digits>` from free text; `None` unless there is
/// exactly one.
fn single_dollar_amount(note: &str) -> Option<&str> {
    let mut found = None;

    for (index, _) in note.match_indices('$') {
        if let Some(candidate) = dollar_amount_at(&note[index + 1..]) {
            if found.is_some() {
                return None; // ambiguous
            }
            found = Some(candidate);
        }
    }

    found
}

fn dollar_amount_at(rest: &str) -> Option<&str> {
    let int_len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if int_len == 0 || !rest[int_len..].starts_with('.') {
        return None;
    }

    let frac = &rest[int_len + 1..];
    let frac_len = frac
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(frac.len());
    if frac_len == 0 {
        return None;
    }

    Some(&rest[..int_len + 1 + frac_len])
}

/// Coinbase transactions downloaded through the v2 API: a `#`-commented
/// header line followed by a JSON object of `{account, transactions}`.
pub struct CoinbaseDownloadParser;

impl TransactionParser for CoinbaseDownloadParser {
    fn name(&self) -> &'static str {
        DOWNLOAD_NAME
    }

    fn can_parse(&self, path: &Path) -> bool {
        first_line(path).is_some_and(|line| line.starts_with("# Coinbase downloaded transactions"))
    }

    fn parse(
        &mut self,
        path: &Path,
        ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let data = std::fs::read_to_string(path)?;
        let json: String = data
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        let root: Value = serde_json::from_str(&json)?;

        let account = if ctx.options.consolidate_coinbase {
            "coinbase".to_string()
        } else {
            let name = root
                .pointer("/account/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("coinbase-{name}").trim_end_matches('-').to_string()
        };

        // Keys are `<created_at>-<id>`, so the BTreeMap is chronological.
        let transactions: BTreeMap<String, Value> = root
            .get("transactions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        let mut events = Vec::new();
        for item in transactions.values() {
            if let Some(event) = parse_download_item(item, &account)? {
                events.push(event);
            } else {
                debug!("skipping incomplete coinbase transaction");
            }
        }

        Ok(events)
    }

    fn default_account(&self) -> String {
        "coinbase".to_string()
    }
}

fn parse_download_item(item: &Value, account: &str) -> Result<Option<Transaction>, ParseError> {
    let status = item.get("status").and_then(Value::as_str).unwrap_or("");
    if status != "completed" {
        return Ok(None);
    }

    let amount = match item.pointer("/amount/amount").and_then(Value::as_str) {
        Some(amount) => amount.parse::<BtcAmount>()?,
        None => return Ok(None),
    };
    let native: Option<UsdAmount> = item
        .pointer("/native_amount/amount")
        .and_then(Value::as_str)
        .map(str::parse)
        .transpose()?;
    let created_at = item
        .get("created_at")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let timestamp = NaiveDateTime::parse_from_str(created_at, "%Y-%m-%dT%H:%M:%SZ")
        .or_else(|_| {
            DateTime::parse_from_rfc3339(created_at).map(|timestamp| timestamp.naive_utc())
        })?
        .and_utc();
    let tx_type = item.get("type").and_then(Value::as_str).unwrap_or("");

    let mut tx = match tx_type {
        "buy" | "sell" | "trade" => {
            let mut tx = Transaction::new(timestamp, TxType::Trade, amount);
            tx.usd = native.map(|usd| -usd);
            tx
        }
        _ => {
            let tx_type = if amount.is_positive() {
                TxType::Deposit
            } else {
                TxType::Withdraw
            };
            let mut tx = Transaction::new(timestamp, tx_type, amount);
            // Keep the quoted rate around for classification, but leave the
            // USD leg open; meaning comes from the user.
            if let Some(native) = native {
                if !amount.is_zero() {
                    tx.price = Some(PriceAmount::from_parts(native.abs(), amount.abs()));
                }
            }
            tx
        }
    };

    tx.account = account.to_string();
    tx.id = item
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    tx.txid = item
        .pointer("/network/hash")
        .and_then(Value::as_str)
        .map(str::to_string);
    tx.info = [
        item.pointer("/details/title").and_then(Value::as_str),
        item.pointer("/details/subtitle").and_then(Value::as_str),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");

    Ok(Some(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::IngestOptions;
    use std::io::Write as _;

    fn write_temp(tag: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gaincount-coinbase-{tag}-{}.csv",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_single_dollar_amount() {
        assert_eq!(single_dollar_amount("Bought at $12.34 each"), Some("12.34"));
        assert_eq!(
            single_dollar_amount("Paid for Order for $210.00."),
            Some("210.00")
        );
        assert_eq!(single_dollar_amount("between $1.00 and $2.00"), None);
        assert_eq!(single_dollar_amount("no prices here"), None);
        assert_eq!(single_dollar_amount("bare $ sign"), None);
        assert_eq!(single_dollar_amount("round $5 number"), None);
    }

    #[test]
    fn test_parse_old_export() {
        let path = write_temp(
            "old",
            "User,someone@example.com,53e8dea2f1e7ed3b95a1c1a6\n\
             Timestamp,Balance,BTC Amount,To,Notes,Total,Total Currency\n\
             2015-02-04 13:05:07 -0800,1.0,1.0,,Bought 1.0 BTC for $210.00.,-210.00,USD\n\
             2015-03-01 09:00:00 -0800,0.5,-0.5,1BoatSLRHtKNngkdXEeobR76b53LETtpyT,Sent to address,,\n",
        );

        let mut parser = CoinbaseParser;
        assert!(parser.can_parse(&path));

        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tx_type, TxType::Trade);
        assert_eq!(events[0].usd.unwrap().to_string(), "-210.00");
        // The zone offset is normalized to UTC.
        assert_eq!(
            events[0].timestamp.format("%F %T").to_string(),
            "2015-02-04 21:05:07"
        );

        assert_eq!(events[1].tx_type, TxType::Withdraw);
        assert!(events[1].usd.is_none());
    }

    #[test]
    fn test_ambiguous_price_is_fatal() {
        let path = write_temp(
            "ambiguous",
            "User,someone@example.com,53e8dea2f1e7ed3b95a1c1a6\n\
             2015-02-04 13:05:07 -0800,1.0,1.0,,Paid for between $1.00 and $2.00,,\n",
        );

        let mut parser = CoinbaseParser;
        let mut ctx = ParseContext::new(IngestOptions::default());
        let err = parser.parse(&path, &mut ctx).unwrap_err();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(err, ParseError::Row { .. }));
    }

    #[test]
    fn test_parse_downloaded_transactions() {
        let path = write_temp(
            "download",
            r#"# Coinbase downloaded transactions (2021-06-01 10:00:00)
{
    "account": {"name": "My Wallet", "id": "abc123"},
    "transactions": {
        "2021-01-01T10:00:00Z-t1": {
            "id": "t1",
            "type": "buy",
            "status": "completed",
            "amount": {"amount": "0.10000000", "currency": "BTC"},
            "native_amount": {"amount": "2900.00", "currency": "USD"},
            "created_at": "2021-01-01T10:00:00Z",
            "details": {"title": "Bought Bitcoin", "subtitle": "using USD wallet"}
        },
        "2021-02-01T10:00:00Z-t2": {
            "id": "t2",
            "type": "send",
            "status": "completed",
            "amount": {"amount": "-0.05000000", "currency": "BTC"},
            "native_amount": {"amount": "-1600.00", "currency": "USD"},
            "created_at": "2021-02-01T10:00:00Z",
            "network": {"hash": "feedface"},
            "details": {"title": "Sent Bitcoin", "subtitle": "to external address"}
        },
        "2021-03-01T10:00:00Z-t3": {
            "id": "t3",
            "type": "buy",
            "status": "canceled",
            "amount": {"amount": "1.00000000", "currency": "BTC"},
            "native_amount": {"amount": "50000.00", "currency": "USD"},
            "created_at": "2021-03-01T10:00:00Z"
        }
    }
}
"#,
        );

        let mut parser = CoinbaseDownloadParser;
        assert!(parser.can_parse(&path));

        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        // The canceled buy is skipped.
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].tx_type, TxType::Trade);
        assert_eq!(events[0].btc.to_string(), "0.10000000");
        assert_eq!(events[0].usd.unwrap().to_string(), "-2900.00");
        assert_eq!(events[0].account, "coinbase-My Wallet");

        assert_eq!(events[1].tx_type, TxType::Withdraw);
        assert!(events[1].usd.is_none());
        assert_eq!(events[1].txid.as_deref(), Some("feedface"));
        assert_eq!(events[1].price.unwrap().to_string(), "32000.0000");
    }
}
