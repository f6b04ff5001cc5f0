#![forbid(unsafe_code)]

use chrono::NaiveDate;
use directories::ProjectDirs;
use error_iter::ErrorIter as _;
use gaincount::engine::{match_transfers, replay, Method, ReplayConfig, ReplayOutcome};
use gaincount::errors::{ClassifyError, FmvError, MethodError, ParseError, ReplayError};
use gaincount::imports::{self, generic, IngestOptions};
use gaincount::model::classify::{Classification, ClassifyKind, Prompt, PromptOutcome};
use gaincount::model::{ClassificationDb, Quotes, Snapshot, Transaction};
use is_terminal::IsTerminal as _;
use onlyargs::CliError;
use onlyargs_derive::OnlyArgs;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;
use std::{env, fs::File, io, process::ExitCode};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

#[derive(Debug, OnlyArgs)]
#[footer = "Additional environment variables:"]
#[footer = "  - TERM_COLOR accepts \"always\" to override automatic terminal sensing"]
#[footer = "  - RUST_LOG selects log verbosity, e.g. RUST_LOG=debug"]
struct Args {
    /// History files to ingest (exchange CSVs, daemon JSON dumps, wallet
    ///   exports). Each file is handled by the first adapter that
    ///   recognizes its shape.
    #[positional]
    histories: Vec<PathBuf>,

    /// Fair market value price history, a URL or local path.
    #[default("./blockchain-market-price.csv")]
    fmv_url: String,

    /// External transaction classification store (JSON).
    #[long]
    data: Option<PathBuf>,

    /// Lot selection method: one of fifo, lifo, oldest, newest.
    #[default("fifo")]
    method: String,

    /// Maximum hours between a withdrawal and a deposit for amount-based
    ///   transfer matching.
    #[default(24)]
    transfer_window_hours: i64,

    /// Disable wash-sale processing.
    nowash: bool,

    /// Report cost basis in the disposal month rather than the acquisition
    ///   month.
    buy_in_sell_month: bool,

    /// Switch report columns to the cost-basis-oriented layout.
    cost_basis: bool,

    /// Stop the replay strictly after this date (YYYY-MM-DD).
    #[long]
    end_date: Option<String>,

    /// Never prompt for classification and never persist new entries;
    ///   unclassified events become fatal.
    #[short('y')]
    non_interactive: bool,

    /// Treat all bitcoind sub-accounts as one, erasing internal moves.
    #[long]
    consolidate_bitcoind: bool,

    /// Treat all Coinbase sub-accounts as one.
    #[long]
    consolidate_coinbase: bool,

    /// Prefer API-downloaded Coinbase data over old CSV exports:
    ///   one of auto, true, false.
    #[default("auto")]
    ignore_old_coinbase: String,

    /// List surviving lots per account after the replay.
    list_purchases: bool,

    /// List gifted lots and their recognized amounts.
    #[long]
    list_gifts: bool,

    /// Write the final merged, transfer-matched ledger as a flat
    ///   canonical CSV.
    #[long]
    flat_output: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum Error {
    #[error("Argument parsing error")]
    Args(#[from] CliError),

    #[error("Unable to ingest history files")]
    Ingest(#[source] ParseError),

    #[error("Unable to load price history")]
    Fmv(#[from] FmvError),

    #[error("Classification store error")]
    Classify(#[from] ClassifyError),

    #[error("Unknown lot selection method")]
    Method(#[from] MethodError),

    #[error("Date parsing error")]
    Date(#[from] chrono::ParseError),

    #[error("Unable to write flat ledger to {0:?}")]
    FlatOutput(PathBuf, #[source] ParseError),

    #[error("Replay failed")]
    Replay(#[source] ReplayError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Aborted at user request; classifications not saved")]
    Aborted,
}

fn main() -> ExitCode {
    // Initialize the tracing subscriber for instrumentation.
    // Uses the `RUST_LOG` environment var for configuration. E.g. `RUST_LOG=debug cargo run`
    // This is very useful to see the input row that caused a failure.
    //
    // See: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(onlyargs::parse()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for source in err.sources().skip(1) {
                eprintln!("  Caused by: {source}");
            }

            ExitCode::FAILURE
        }
    }
}

fn run(args: Result<Args, CliError>) -> Result<(), Error> {
    let args = args?;

    let method: Method = args.method.parse()?;
    let end_date = args
        .end_date
        .as_deref()
        .map(|date| NaiveDate::parse_from_str(date, "%F"))
        .transpose()?
        // Events on the end date itself are still included.
        .map(|date| date.and_hms_opt(23, 59, 59).unwrap().and_utc());
    let ignore_old_coinbase = args
        .ignore_old_coinbase
        .parse()
        .map_err(Error::Ingest)?;

    let options = IngestOptions {
        consolidate_bitcoind: args.consolidate_bitcoind,
        consolidate_coinbase: args.consolidate_coinbase,
        ignore_old_coinbase,
    };
    let mut events = imports::ingest(&args.histories, options).map_err(Error::Ingest)?;
    events.sort();
    info!("Ingested {count} events", count = events.len());

    let (events, stats) = match_transfers(events, args.transfer_window_hours);
    info!(
        "Transfer matching: {amount} by amount, {txid} by txid, {unmatched} unmatched",
        amount = stats.matched_by_amount,
        txid = stats.matched_by_txid,
        unmatched = stats.unmatched.len(),
    );

    if let Some(path) = args.flat_output.as_ref() {
        let file = BufWriter::new(File::create(path)?);
        generic::write_flat(file, &events)
            .map_err(|err| Error::FlatOutput(path.clone(), err))?;
        info!("Flat ledger written to {path:?}");
    }

    // Find the user's cache directory so price history survives across runs.
    let cache_path = ProjectDirs::from("design.contract", "DCD", "gaincount").and_then(|dirs| {
        let cache_dir = dirs.cache_dir();
        match std::fs::create_dir_all(cache_dir) {
            Ok(()) => Some(cache_dir.join("price-history.ron")),
            Err(err) => {
                warn!("Unable to create cache directory {cache_dir:?}: {err}");
                None
            }
        }
    });
    let mut quotes = Quotes::new(&args.fmv_url, cache_path)?;

    let data_path = args
        .data
        .clone()
        .unwrap_or_else(|| PathBuf::from("data.json"));
    let mut db = ClassificationDb::load(&data_path)?;

    let config = ReplayConfig {
        method,
        nowash: args.nowash,
        non_interactive: args.non_interactive,
        end_date,
        ..Default::default()
    };
    let mut prompt = TtyPrompt;
    let mut outcome = match replay(&events, &config, &mut quotes, &mut db, &mut prompt) {
        Ok(outcome) => outcome,
        Err(ReplayError::UserQuit) => {
            println!("Classifications saved to {data_path:?}. Re-run to continue.");
            return Ok(());
        }
        Err(ReplayError::UserAbort) => return Err(Error::Aborted),
        Err(err) => return Err(Error::Replay(err)),
    };
    db.flush()?;

    let layout = Layout {
        cost_basis: args.cost_basis,
        buy_in_sell_month: args.buy_in_sell_month,
    };
    print_reports(&outcome, layout, &quotes);

    if args.list_purchases {
        print_purchases(&mut outcome);
    }
    if args.list_gifts {
        print_gifts(&outcome);
    }
    print_transferred_out(&outcome);
    print_appraisal_notice(&outcome);

    Ok(())
}

#[derive(Copy, Clone, Debug)]
struct Layout {
    cost_basis: bool,
    buy_in_sell_month: bool,
}

fn print_reports(outcome: &ReplayOutcome, layout: Layout, quotes: &Quotes) {
    if outcome.running.is_empty() {
        println!("Nothing to report.");
        return;
    }

    let monthly = &outcome.running;
    print_table("Monthly (cumulative)", &cumulative_rows(monthly), layout);
    print_table("Monthly", &monthly.deltas(), layout);

    let annual = monthly.consolidate("%Y");
    print_table("Annual", &annual.deltas(), layout);

    let lifetime = annual.consolidate("lifetime");
    print_table("Lifetime", &lifetime.deltas(), layout);

    if let Some((date, price)) = quotes.latest() {
        let total_btc: gaincount::model::BtcAmount =
            outcome.account_btc.values().copied().sum();
        println!(
            "Holding {total_btc} BTC; latest quote {price} ({date}), unrealized {unrealized}",
            unrealized = gaincount::model::UsdAmount::from_rate(price, total_btc)
                - outcome.totals.total_cost
                - outcome.totals.disallowed_loss,
        );
        println!();
    }
}

fn cumulative_rows(report: &gaincount::model::RunningReport) -> Vec<(String, Snapshot)> {
    report
        .cumulative()
        .map(|(bucket, snapshot)| (bucket.to_string(), *snapshot))
        .collect()
}

fn print_table(title: &str, rows: &[(String, Snapshot)], layout: Layout) {
    let underline = "=".repeat(title.len());
    println!("{title}");
    println!("{underline}");
    println!();

    if layout.cost_basis {
        println!(
            "{:<10} {:>14} {:>14} {:>14} {:>14} {:>14}",
            "date", "buy", "sell", "basis", "gains", "long term"
        );
        for (date, row) in rows {
            let buy = if layout.buy_in_sell_month {
                row.total_cost_basis
            } else {
                row.total_buy
            };
            println!(
                "{date:<10} {:>14} {:>14} {:>14} {:>14} {:>14}",
                buy.to_string(),
                row.total_sell.to_string(),
                row.total_cost.to_string(),
                row.gains.to_string(),
                row.long_term_gains.to_string(),
            );
        }
    } else {
        println!(
            "{:<10} {:>14} {:>14} {:>14} {:>14} {:>14}",
            "date", "income", "gains", "long term", "unrealized", "total"
        );
        for (date, row) in rows {
            println!(
                "{date:<10} {:>14} {:>14} {:>14} {:>14} {:>14}",
                row.income.to_string(),
                row.gains.to_string(),
                row.long_term_gains.to_string(),
                row.unrealized_gains.to_string(),
                row.total.to_string(),
            );
        }
    }
    println!();
}

fn print_purchases(outcome: &mut ReplayOutcome) {
    println!("Surviving Lots");
    println!("========= ====");
    println!();

    let mut accounts: Vec<&String> = outcome.lots.keys().collect();
    accounts.sort();
    let accounts: Vec<String> = accounts.into_iter().cloned().collect();

    for account in accounts {
        let balance = outcome
            .account_btc
            .get(&account)
            .copied()
            .unwrap_or_default();
        println!("{account} ({balance})");

        let inventory = outcome.lots.get_mut(&account).unwrap();
        for lot in inventory.drain_selection_order() {
            println!(
                "  {lot}, basis {usd}, disallowed {disallowed}",
                usd = lot.usd,
                disallowed = lot.disallowed_loss,
            );
        }
    }
    println!();
}

fn print_gifts(outcome: &ReplayOutcome) {
    println!("Gifts");
    println!("=====");
    println!();

    for (event, lots) in &outcome.gift_txns {
        println!("{event}");
        for lot in lots {
            println!("  {lot}, basis {usd}", usd = lot.usd);
        }
    }
    println!();
}

fn print_transferred_out(outcome: &ReplayOutcome) {
    if outcome.transferred_out.is_empty() {
        return;
    }

    println!("Transferred Out (basis still tracked)");
    println!("=========== === ====== ===== ========");
    println!();

    for (event, lot) in &outcome.transferred_out {
        println!("{event}: {lot}, basis {usd}", usd = lot.usd);
    }
    println!();
}

fn print_appraisal_notice(outcome: &ReplayOutcome) {
    let annual = outcome.running.consolidate("%Y");
    let threshold: gaincount::model::UsdAmount = "5000".parse().unwrap();
    let years: Vec<String> = annual
        .deltas()
        .into_iter()
        .filter(|(_, row)| row.long_term_gifts >= threshold)
        .map(|(year, _)| year)
        .collect();

    if !years.is_empty() {
        println!(
            "NOTE: long-term gifts reached $5000 in {years}; a qualified appraisal is required.",
            years = years.join(", "),
        );
    }
}

/// Interactive classification over stdin.
struct TtyPrompt;

impl TtyPrompt {
    fn read_line(&self, prompt: &str) -> Result<String, ClassifyError> {
        print!("{prompt}");
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().read_line(&mut line)?;

        Ok(line.trim().to_string())
    }
}

impl Prompt for TtyPrompt {
    fn classify(&mut self, tx: &Transaction) -> Result<PromptOutcome, ClassifyError> {
        println!();
        println!("Needs classification: {tx}");
        if !tx.info.is_empty() {
            println!("  info: {info}", info = tx.info);
        }

        let kind = loop {
            let answer = self.read_line(
                "type {income, expense, transfer_in, transfer_out, gift, buy, sale, purchase}, quit, or abort: ",
            )?;
            match answer.as_str() {
                "quit" => return Ok(PromptOutcome::Quit),
                "abort" => return Ok(PromptOutcome::Abort),
                other => match ClassifyKind::from_name(other) {
                    Some(kind) => break kind,
                    None => println!("Unrecognized type `{other}`"),
                },
            }
        };

        let usd = loop {
            let answer = self.read_line("usd value (blank to price at fair market value): ")?;
            if answer.is_empty() {
                break None;
            }
            match answer.parse() {
                Ok(usd) => break Some(usd),
                Err(_) => println!("Unparseable amount `{answer}`"),
            }
        };

        let note = self.read_line("note: ")?;
        let remember = self.read_line("save for future runs? [Y/n]: ")?;
        let ephemeral = remember.eq_ignore_ascii_case("n") || remember.eq_ignore_ascii_case("no");

        let classification = Classification {
            usd,
            kind: Some(kind),
            note: (!note.is_empty()).then_some(note),
            timestamp: Some(tx.timestamp.format("%F %T").to_string()),
            ..Default::default()
        };

        Ok(PromptOutcome::Classified {
            classification,
            ephemeral,
        })
    }
}
