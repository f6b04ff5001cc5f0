pub mod bitcoind;
pub mod bitstamp;
pub mod coinbase;
pub mod electrum;
pub mod generic;
pub mod kraken;
pub mod mtgox;

use crate::model::amount::ConvertAmountError;
use crate::model::transaction::{ParserId, Transaction, TransactionError, TxType};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead as _, BufReader, Read as _};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No adapter recognizes {0:?}")]
    Unrecognized(PathBuf),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("CSV error")]
    Csv(#[from] csv::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("Malformed row {row}: {message}")]
    Row { row: usize, message: String },

    #[error("Ambiguous or missing price: {0}")]
    AmbiguousPrice(String),

    #[error("DateTime parsing error")]
    DateTime(#[from] chrono::ParseError),

    #[error("Amount parsing error")]
    Amount(#[from] ConvertAmountError),

    #[error("Completeness check failed: {0}")]
    Incomplete(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Whether old Coinbase CSV exports are dropped in favor of API-downloaded
/// data. `Auto` resolves true iff any downloaded file was ingested.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IgnoreOldCoinbase {
    #[default]
    Auto,
    True,
    False,
}

impl std::str::FromStr for IgnoreOldCoinbase {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "true" => Ok(Self::True),
            "false" => Ok(Self::False),
            _ => Err(ParseError::Incomplete(format!(
                "ignore_old_coinbase must be auto, true, or false; got `{s}`"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IngestOptions {
    pub consolidate_bitcoind: bool,
    pub consolidate_coinbase: bool,
    pub ignore_old_coinbase: IgnoreOldCoinbase,
}

/// Shared ingest state handed to every adapter.
#[derive(Debug, Default)]
pub struct ParseContext {
    pub options: IngestOptions,
    unique: u64,
}

impl ParseContext {
    pub fn new(options: IngestOptions) -> Self {
        Self { options, unique: 0 }
    }

    /// Synthesize an event id for rows that carry none.
    pub fn unique(&mut self) -> String {
        self.unique += 1;
        format!("unique:{}", self.unique)
    }
}

/// Contract every source adapter satisfies.
///
/// Adapters may read helper resources but never mutate shared engine state;
/// everything they need flows through the [`ParseContext`].
pub trait TransactionParser {
    fn name(&self) -> &'static str;

    /// Cheap shape sniff; `parse` may still fail on a file this accepted.
    fn can_parse(&self, path: &Path) -> bool;

    fn parse(&mut self, path: &Path, ctx: &mut ParseContext)
        -> Result<Vec<Transaction>, ParseError>;

    /// Combine raw rows sharing `(adapter, id)` into canonical events.
    ///
    /// The default treats repeated ids as an error; adapters that split one
    /// event across rows, or emit legitimately distinct payments under one
    /// on-chain txid, override this.
    fn merge(&self, mut group: Vec<Transaction>) -> Result<Vec<Transaction>, ParseError> {
        if group.len() == 1 {
            Ok(group)
        } else {
            let id = group.swap_remove(0).id;
            Err(ParseError::Incomplete(format!(
                "{name} produced {count} rows sharing id `{id}`",
                name = self.name(),
                count = group.len() + 1,
            )))
        }
    }

    fn default_account(&self) -> String {
        self.name().to_lowercase()
    }

    /// Cross-file consistency; run once per adapter after all files.
    fn check_complete(&self) -> Result<(), ParseError> {
        Ok(())
    }

    /// Clear per-file state between files.
    fn reset(&mut self) {}
}

/// Read the first line of a file for header sniffing.
pub(crate) fn first_line(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).ok()?;

    Some(line.trim_end().to_string())
}

/// Read the first `n` bytes of a file, whitespace stripped.
pub(crate) fn head_bytes(path: &Path, n: usize) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut buffer = vec![0; n];
    let count = file.read(&mut buffer).ok()?;
    buffer.truncate(count);

    let text = String::from_utf8_lossy(&buffer);
    Some(text.chars().filter(|c| !c.is_whitespace()).collect())
}

fn registry() -> Vec<Box<dyn TransactionParser>> {
    vec![
        Box::new(generic::GenericParser),
        Box::new(bitcoind::BitcoindParser),
        Box::new(coinbase::CoinbaseDownloadParser),
        Box::new(coinbase::CoinbaseParser),
        Box::new(bitstamp::BitstampParser),
        Box::new(kraken::KrakenParser),
        Box::new(electrum::ElectrumParser),
        Box::<mtgox::MtGoxParser>::default(),
    ]
}

/// Parse every history file with the first adapter that recognizes it, run
/// completeness checks, and merge rows sharing `(adapter, id)`.
///
/// The result is unsorted; callers sort before transfer matching.
pub fn ingest(paths: &[PathBuf], options: IngestOptions) -> Result<Vec<Transaction>, ParseError> {
    let mut adapters = registry();
    let mut ctx = ParseContext::new(options);
    let mut all = Vec::new();
    let mut saw_coinbase_download = false;

    for path in paths {
        let index = adapters
            .iter()
            .position(|adapter| adapter.can_parse(path))
            .ok_or_else(|| ParseError::Unrecognized(path.clone()))?;
        let adapter = &mut adapters[index];
        info!("{path:?} handled by {name}", name = adapter.name());

        let default_account = adapter.default_account();
        let mut events = adapter.parse(path, &mut ctx)?;
        adapter.reset();
        saw_coinbase_download |= adapter.name() == coinbase::DOWNLOAD_NAME;

        for event in &mut events {
            event.parser = ParserId(index);
            if event.account.is_empty() {
                event.account = default_account.clone();
            }
            if event.id.is_empty() {
                event.id = ctx.unique();
            }
            event.derive_price();
        }
        all.extend(events);
    }

    for adapter in &adapters {
        adapter.check_complete()?;
    }

    // The flag is authoritative; `auto` prefers downloaded Coinbase data over
    // old CSV exports whenever any was provided.
    let drop_old_coinbase = match ctx.options.ignore_old_coinbase {
        IgnoreOldCoinbase::True => true,
        IgnoreOldCoinbase::False => false,
        IgnoreOldCoinbase::Auto => saw_coinbase_download,
    };
    if drop_old_coinbase {
        let old = adapters
            .iter()
            .position(|adapter| adapter.name() == coinbase::OLD_NAME);
        if let Some(old) = old {
            let before = all.len();
            all.retain(|event| event.parser != ParserId(old));
            if before != all.len() {
                info!(
                    "Ignoring {count} events from old Coinbase exports",
                    count = before - all.len()
                );
            }
        }
    }

    merge_by_source(all, &adapters)
}

/// Group events by `(adapter, id)` preserving encounter order and apply each
/// adapter's merge policy.
fn merge_by_source(
    all: Vec<Transaction>,
    adapters: &[Box<dyn TransactionParser>],
) -> Result<Vec<Transaction>, ParseError> {
    let mut order = Vec::new();
    let mut groups: HashMap<(ParserId, String), Vec<Transaction>> = HashMap::new();

    for event in all {
        let key = (event.parser, event.id.clone());
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(event);
    }

    let mut output = Vec::new();
    for key in order {
        let group = groups.remove(&key).unwrap();
        let ParserId(index) = key.0;
        let mut merged = adapters[index].merge(group)?;
        debug!(
            "merged id `{id}` into {count} event(s)",
            id = key.1,
            count = merged.len()
        );
        for event in &mut merged {
            event.derive_price();

            if event.tx_type == TxType::Trade {
                if let Some(usd) = event.usd {
                    let same_sign = (event.btc.is_positive() && usd.is_positive())
                        || (event.btc.is_negative() && usd.is_negative());
                    if same_sign {
                        return Err(TransactionError::MismatchedTrade(event.id.clone()).into());
                    }
                }
            }
        }
        output.extend(merged);
    }

    Ok(output)
}
