use crate::imports::{head_bytes, ParseContext, ParseError, TransactionParser};
use crate::model::amount::BtcAmount;
use crate::model::transaction::{Transaction, TxType};
use chrono::DateTime;
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::Path;
use std::str::FromStr as _;

/// A Bitcoin daemon `listtransactions` JSON dump: an array whose first object
/// carries an `account` or `address` key.
pub struct BitcoindParser;

impl TransactionParser for BitcoindParser {
    fn name(&self) -> &'static str {
        "Bitcoind"
    }

    fn can_parse(&self, path: &Path) -> bool {
        head_bytes(path, 100).is_some_and(|head| {
            head.starts_with(r#"[{"account":"#) || head.starts_with(r#"[{"address":"#)
        })
    }

    fn parse(
        &mut self,
        path: &Path,
        ctx: &mut ParseContext,
    ) -> Result<Vec<Transaction>, ParseError> {
        let data = std::fs::read_to_string(path)?;
        let items: Vec<Value> = serde_json::from_str(&data)?;
        let mut events = Vec::new();

        for (row, item) in items.iter().enumerate() {
            if let Some(event) = parse_item(item, ctx).map_err(|err| ParseError::Row {
                row: row + 1,
                message: err.to_string(),
            })? {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Multi-output sends repeat the txid, one row per recipient. They are
    /// legitimately distinct payments; keep them separate and attribute the
    /// network fee only to the first.
    fn merge(&self, mut group: Vec<Transaction>) -> Result<Vec<Transaction>, ParseError> {
        for event in group.iter_mut().skip(1) {
            event.fee_btc = BtcAmount::default();
        }

        Ok(group)
    }
}

fn parse_item(item: &Value, ctx: &mut ParseContext) -> Result<Option<Transaction>, ParseError> {
    let timestamp = item
        .get("time")
        .and_then(Value::as_i64)
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .ok_or_else(|| bad_field("time"))?;
    let amount = decimal_field(item, "amount")?.ok_or_else(|| bad_field("amount"))?;
    let fee = decimal_field(item, "fee")?.unwrap_or_default();
    let category = item
        .get("category")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_field("category"))?;

    let account = if ctx.options.consolidate_bitcoind {
        "bitcoind".to_string()
    } else {
        named_account(item.get("account"))
    };
    let info = ["to", "comment", "address"]
        .iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    let txid = item.get("txid").and_then(Value::as_str);

    let mut tx = match category {
        // Matured coinbase rewards land as deposits; classification decides
        // whether they are income.
        "receive" | "generate" => Transaction::new(timestamp, TxType::Deposit, amount),
        "send" => {
            let mut tx = Transaction::new(timestamp, TxType::Withdraw, amount);
            tx.fee_btc = fee.abs();
            tx
        }
        "move" => {
            // Internal account moves only matter when the sub-accounts are
            // kept separate; generate one transfer from the negative side.
            if amount.is_negative() && !ctx.options.consolidate_bitcoind {
                let mut tx = Transaction::new(timestamp, TxType::Transfer, amount);
                tx.usd = Some(Default::default());
                tx.dest_account = Some(named_account(item.get("otheraccount")));
                tx
            } else {
                return Ok(None);
            }
        }
        // Generated coins mature into `receive` entries; everything else is
        // unmodeled.
        "immature" | "orphan" => return Ok(None),
        _ => {
            return Err(ParseError::Row {
                row: 0,
                message: format!("unknown category `{category}`"),
            })
        }
    };

    tx.account = account;
    tx.info = info;
    tx.id = match txid {
        Some(txid) => {
            tx.txid = Some(txid.to_string());
            txid.to_string()
        }
        None => ctx.unique(),
    };

    Ok(Some(tx))
}

fn named_account(name: Option<&Value>) -> String {
    let name = name.and_then(Value::as_str).unwrap_or_default();

    format!("bitcoind-{name}")
        .trim_end_matches('-')
        .to_string()
}

/// Amounts appear as JSON numbers; take them through the shortest-roundtrip
/// string form rather than `f64` arithmetic.
fn decimal_field(item: &Value, key: &str) -> Result<Option<BtcAmount>, ParseError> {
    match item.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let amount = Decimal::from_str(&n.to_string())
                .map_err(crate::model::amount::ConvertAmountError::from)?;
            Ok(Some(BtcAmount::from_decimal(amount)))
        }
        Some(Value::String(s)) => Ok(Some(s.parse()?)),
        Some(_) => Err(bad_field(key)),
    }
}

fn bad_field(key: &str) -> ParseError {
    ParseError::Row {
        row: 0,
        message: format!("missing or malformed `{key}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::IngestOptions;
    use std::io::Write as _;

    const DUMP: &str = r#"[
        {"account": "", "category": "receive", "amount": 1.5, "time": 1483264800,
         "txid": "aa11", "address": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT"},
        {"account": "savings", "category": "send", "amount": -0.5, "fee": -0.0001,
         "time": 1483351200, "txid": "bb22", "comment": "rent"},
        {"account": "savings", "category": "move", "amount": -0.25, "time": 1483437600,
         "otheraccount": "spending"},
        {"account": "spending", "category": "move", "amount": 0.25, "time": 1483437600,
         "otheraccount": "savings"}
    ]"#;

    fn write_temp(tag: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gaincount-bitcoind-{tag}-{}.json",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_dump() {
        let path = write_temp("dump", DUMP);
        let mut parser = BitcoindParser;
        assert!(parser.can_parse(&path));

        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.len(), 3);

        assert_eq!(events[0].tx_type, TxType::Deposit);
        assert_eq!(events[0].btc.to_string(), "1.50000000");
        assert_eq!(events[0].account, "bitcoind");
        assert_eq!(events[0].txid.as_deref(), Some("aa11"));

        assert_eq!(events[1].tx_type, TxType::Withdraw);
        assert_eq!(events[1].fee_btc.to_string(), "0.00010000");
        assert_eq!(events[1].account, "bitcoind-savings");

        // Only the negative side of the move becomes a transfer.
        assert_eq!(events[2].tx_type, TxType::Transfer);
        assert_eq!(events[2].btc.to_string(), "-0.25000000");
        assert_eq!(events[2].dest_account.as_deref(), Some("bitcoind-spending"));
    }

    #[test]
    fn test_consolidated_moves_vanish() {
        let path = write_temp("consolidated", DUMP);
        let mut parser = BitcoindParser;
        let mut ctx = ParseContext::new(IngestOptions {
            consolidate_bitcoind: true,
            ..Default::default()
        });
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.account == "bitcoind"));
    }

    #[test]
    fn test_merge_masks_duplicate_fees() {
        let path = write_temp(
            "merge",
            r#"[
            {"account": "", "category": "send", "amount": -0.5, "fee": -0.0001,
             "time": 1483351200, "txid": "cc33"},
            {"account": "", "category": "send", "amount": -0.7, "fee": -0.0001,
             "time": 1483351200, "txid": "cc33"}
        ]"#,
        );
        let mut parser = BitcoindParser;
        let mut ctx = ParseContext::new(IngestOptions::default());
        let events = parser.parse(&path, &mut ctx).unwrap();
        std::fs::remove_file(&path).unwrap();

        let merged = parser.merge(events).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].fee_btc.to_string(), "0.00010000");
        assert_eq!(merged[1].fee_btc.to_string(), "0.00000000");
    }
}
