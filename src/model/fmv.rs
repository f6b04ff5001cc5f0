use crate::model::amount::PriceAmount;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FmvError {
    #[error("No fair market value available for {0}")]
    Missing(NaiveDate),

    #[error("Unknown price history format: {0}")]
    UnknownFormat(String),

    #[error("Unable to parse price history row: {0}")]
    Parse(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("HTTP error fetching price history")]
    Http(#[from] Box<ureq::Error>),

    #[error("Price cache error")]
    Cache(#[from] ron::Error),
}

/// A pure function from calendar date to USD-per-BTC price.
///
/// `price` takes `&mut self` because implementations may fault a missing date
/// in through their caching layer; callers treat it as a synchronous lookup.
pub trait FmvSource {
    fn price(&mut self, date: NaiveDate) -> Result<PriceAmount, FmvError>;
}

pub type QuoteMap = BTreeMap<NaiveDate, PriceAmount>;

/// Daily quotes loaded from a price-history CSV, in either of the two
/// recognized shapes:
///
/// - `datetime,high,low,average,volume` (bitcoinaverage; price is the
///   high/low midpoint)
/// - `DD/MM/YYYY HH:MM:SS,price` rows with no header (blockchain.info)
///
/// The parsed series is written through to a RON cache so later runs do not
/// touch the network. A date missing from the series triggers one forced
/// refetch (URL sources only); a second miss is reported as `Missing`.
#[derive(Debug)]
pub struct Quotes {
    source: String,
    cache_path: Option<PathBuf>,
    quotes: QuoteMap,
    refetched: bool,
}

impl Quotes {
    /// Create a quote source from a URL or local path, preferring the disk
    /// cache when one exists.
    pub fn new(source: &str, cache_path: Option<PathBuf>) -> Result<Self, FmvError> {
        let mut this = Self {
            source: source.to_string(),
            cache_path,
            quotes: QuoteMap::new(),
            refetched: false,
        };

        if let Some(cached) = this.read_cache() {
            debug!("Loaded {} cached quotes", cached.len());
            this.quotes = cached;
        } else {
            this.refresh()?;
        }

        Ok(this)
    }

    #[cfg(test)]
    pub(crate) fn from_raw(quotes: QuoteMap) -> Self {
        Self {
            source: String::new(),
            cache_path: None,
            quotes,
            refetched: true,
        }
    }

    /// The most recent quote, for the trailing current-price lookup. This is
    /// the only place a missing price is tolerated.
    pub fn latest(&self) -> Option<(NaiveDate, PriceAmount)> {
        self.quotes
            .iter()
            .next_back()
            .map(|(date, price)| (*date, *price))
    }

    fn refresh(&mut self) -> Result<(), FmvError> {
        info!("Fetching fair market values from {}", self.source);
        let body = if self.source.contains("://") {
            let mut response = ureq::get(self.source.as_str()).call().map_err(Box::new)?;
            response
                .body_mut()
                .read_to_string()
                .map_err(|err| FmvError::Http(Box::new(err)))?
        } else {
            fs::read_to_string(&self.source)?
        };

        self.quotes = parse_history(&body)?;
        self.write_cache();

        Ok(())
    }

    fn read_cache(&self) -> Option<QuoteMap> {
        let path = self.cache_path.as_ref()?;
        let data = fs::read_to_string(path).ok()?;
        match ron::from_str(&data) {
            Ok(quotes) => Some(quotes),
            Err(_) => {
                warn!("Corrupt price cache detected! A new one will be created.");
                None
            }
        }
    }

    fn write_cache(&self) {
        let Some(path) = self.cache_path.as_ref() else {
            return;
        };

        // Cache failures only cost a refetch next run.
        match ron::to_string(&self.quotes) {
            Ok(data) => {
                if let Err(err) = fs::write(path, data + "\n") {
                    warn!("Unable to write price cache {path:?}: {err}");
                }
            }
            Err(err) => warn!("Unable to serialize price cache: {err}"),
        }
    }
}

impl FmvSource for Quotes {
    fn price(&mut self, date: NaiveDate) -> Result<PriceAmount, FmvError> {
        if let Some(price) = self.quotes.get(&date) {
            return Ok(*price);
        }

        // Retry once with a forced refetch; the local series may simply be
        // stale. Still failing, the date is genuinely missing.
        if !self.refetched && self.source.contains("://") {
            self.refetched = true;
            if let Err(err) = self.refresh() {
                warn!("Price refetch failed: {err}");
            }
            if let Some(price) = self.quotes.get(&date) {
                return Ok(*price);
            }
        }

        Err(FmvError::Missing(date))
    }
}

fn parse_history(body: &str) -> Result<QuoteMap, FmvError> {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum Format {
        BitcoinAverage,
        Blockchain,
    }

    let mut format = None;
    let mut quotes = QuoteMap::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if format.is_none() {
            if line == "datetime,high,low,average,volume" {
                format = Some(Format::BitcoinAverage);
                continue;
            } else if looks_like_blockchain_row(line) {
                format = Some(Format::Blockchain);
            } else {
                return Err(FmvError::UnknownFormat(line.to_string()));
            }
        }

        let cols: Vec<&str> = line.split(',').collect();
        let parse = |s: &str| -> Result<PriceAmount, FmvError> {
            s.parse().map_err(|_| FmvError::Parse(line.to_string()))
        };

        match format.unwrap() {
            Format::BitcoinAverage => {
                if cols.len() < 3 {
                    return Err(FmvError::Parse(line.to_string()));
                }
                let date = parse_date(cols[0], "%F")?;
                let high = parse(cols[1])?;
                let low = parse(cols[2])?;
                quotes.insert(date, PriceAmount::midpoint(high, low));
            }
            Format::Blockchain => {
                if cols.len() < 2 {
                    return Err(FmvError::Parse(line.to_string()));
                }
                let date = parse_date(cols[0], "%d/%m/%Y")?;
                quotes.insert(date, parse(cols[1])?.to_rounded());
            }
        }
    }

    Ok(quotes)
}

fn parse_date(col: &str, format: &str) -> Result<NaiveDate, FmvError> {
    let date = col.split_whitespace().next().unwrap_or_default();

    NaiveDate::parse_from_str(date, format).map_err(|_| FmvError::Parse(col.to_string()))
}

fn looks_like_blockchain_row(line: &str) -> bool {
    let Some((date, price)) = line.split_once(',') else {
        return false;
    };

    parse_date(date, "%d/%m/%Y").is_ok() && price.parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bitcoinaverage() {
        let body = "datetime,high,low,average,volume\n\
                    2013-05-01 00:00:00,120.00,100.00,110.00,123\n\
                    2013-05-02 00:00:00,130.00,110.00,118.00,456\n";
        let quotes = parse_history(body).unwrap();

        let date = NaiveDate::from_ymd_opt(2013, 5, 1).unwrap();
        assert_eq!(quotes[&date].to_string(), "110.0000");
        assert_eq!(quotes.len(), 2);
    }

    #[test]
    fn test_parse_blockchain() {
        let body = "01/05/2013 00:00:00,105.10\n02/05/2013 00:00:00,117.25\n";
        let quotes = parse_history(body).unwrap();

        let date = NaiveDate::from_ymd_opt(2013, 5, 2).unwrap();
        assert_eq!(quotes[&date].to_string(), "117.2500");
    }

    #[test]
    fn test_unknown_format() {
        let err = parse_history("hello,world\n").unwrap_err();
        assert!(matches!(err, FmvError::UnknownFormat(_)));
    }

    #[test]
    fn test_missing_date_without_url_source() {
        let mut quotes = Quotes::from_raw(QuoteMap::new());
        let date = NaiveDate::from_ymd_opt(2017, 1, 1).unwrap();
        assert!(matches!(quotes.price(date), Err(FmvError::Missing(_))));
    }
}
