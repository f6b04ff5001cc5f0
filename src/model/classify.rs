use crate::model::amount::{BtcAmount, PriceAmount, UsdAmount};
use crate::model::transaction::Transaction;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::ser::{PrettyFormatter, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Classification JSON error")]
    Json(#[from] serde_json::Error),
}

/// User-supplied meaning for an event the sources alone cannot explain.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyKind {
    Income,
    Expense,
    TransferIn,
    TransferOut,
    Gift,
    Buy,
    Sale,
    Purchase,
}

impl ClassifyKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "income" => Some(Self::Income),
            "expense" => Some(Self::Expense),
            "transfer_in" => Some(Self::TransferIn),
            "transfer_out" => Some(Self::TransferOut),
            "gift" => Some(Self::Gift),
            "buy" => Some(Self::Buy),
            "sale" => Some(Self::Sale),
            "purchase" => Some(Self::Purchase),
            _ => None,
        }
    }
}

/// One record of the external classification store, keyed by event id.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Classification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usd: Option<UsdAmount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btc: Option<BtcAmount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<PriceAmount>,

    #[serde(rename = "type")]
    pub kind: Option<ClassifyKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Event timestamp at the time of classification, kept for the user's
    /// benefit when editing the store by hand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Overrides the acquisition date of lots created by a `transfer_in` of
    /// pre-existing holdings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_date: Option<NaiveDate>,
}

/// What the interactive prompt produced for an unclassified event.
#[derive(Clone, Debug)]
pub enum PromptOutcome {
    /// The user answered; `ephemeral` answers are used but never persisted.
    Classified {
        classification: Classification,
        ephemeral: bool,
    },

    /// Stop, flushing the classification store first.
    Quit,

    /// Stop without flushing.
    Abort,
}

/// Invoked by the replay engine only when an unclassified deposit, withdrawal,
/// or fee is encountered and the engine is interactive. Implementations supply
/// either a TTY reader or a scripted answer source for tests.
pub trait Prompt {
    fn classify(&mut self, tx: &Transaction) -> Result<PromptOutcome, ClassifyError>;
}

/// Persistent mapping from event id to user classification.
///
/// Backed by a JSON file with sorted keys and 4-space indentation so hand
/// edits diff cleanly. Writes happen once, on clean shutdown or explicit
/// `quit`.
#[derive(Debug)]
pub struct ClassificationDb {
    path: PathBuf,
    map: BTreeMap<String, Classification>,
    dirty: bool,
}

impl ClassificationDb {
    /// Load the store, treating a missing file as empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClassifyError> {
        let path = path.as_ref().to_path_buf();
        let map = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        debug!("Loaded {} classifications from {path:?}", map.len());

        Ok(Self {
            path,
            map,
            dirty: false,
        })
    }

    /// Look up a classification by event id.
    ///
    /// Falls back to the canonicalized short key on a miss; the short-key hit
    /// is returned only when it is unambiguous across all stored keys.
    pub fn get(&self, id: &str) -> Option<&Classification> {
        if let Some(classification) = self.map.get(id) {
            return Some(classification);
        }

        let short = short_id(id);
        let mut hits = self
            .map
            .iter()
            .filter(|(key, _)| short_id(key) == short)
            .map(|(_, classification)| classification);

        match (hits.next(), hits.next()) {
            (Some(classification), None) => Some(classification),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_raw(map: BTreeMap<String, Classification>) -> Self {
        Self {
            path: PathBuf::new(),
            map,
            dirty: false,
        }
    }

    pub fn insert(&mut self, id: String, classification: Classification) {
        self.map.insert(id, classification);
        self.dirty = true;
    }

    /// Write the store back to disk if anything changed.
    pub fn flush(&mut self) -> Result<(), ClassifyError> {
        if !self.dirty {
            return Ok(());
        }

        let mut buffer = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = Serializer::with_formatter(&mut buffer, formatter);
        self.map.serialize(&mut serializer)?;
        buffer.push(b'\n');

        fs::write(&self.path, buffer)?;
        self.dirty = false;
        debug!(
            "Flushed {} classifications to {:?}",
            self.map.len(),
            self.path
        );

        Ok(())
    }
}

/// Canonicalize an event id by stripping the trailing `:<counter>` segment.
///
/// Ids synthesized for multi-row events look like `<txid>:<n>`; the short form
/// lets a hand-written classification for `<txid>` apply to the whole event as
/// long as the mapping stays unambiguous.
fn short_id(id: &str) -> &str {
    match id.rsplit_once(':') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(keys: &[&str]) -> ClassificationDb {
        let mut map = BTreeMap::new();
        for key in keys {
            map.insert(
                key.to_string(),
                Classification {
                    note: Some(key.to_string()),
                    ..Default::default()
                },
            );
        }

        ClassificationDb::from_raw(map)
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abcdef:0"), "abcdef");
        assert_eq!(short_id("abcdef:12"), "abcdef");
        assert_eq!(short_id("abcdef"), "abcdef");
        assert_eq!(short_id("abc:def"), "abc:def");
        assert_eq!(short_id("abcdef:"), "abcdef:");
    }

    #[test]
    fn test_exact_lookup_wins() {
        let db = db(&["tx1:0", "tx1:1"]);
        let hit = db.get("tx1:1").unwrap();
        assert_eq!(hit.note.as_deref(), Some("tx1:1"));
    }

    #[test]
    fn test_fuzzy_lookup_unambiguous() {
        let db = db(&["tx1:0", "tx2:0"]);
        let hit = db.get("tx1:7").unwrap();
        assert_eq!(hit.note.as_deref(), Some("tx1:0"));
    }

    #[test]
    fn test_fuzzy_lookup_collision_fails() {
        // Two distinct original ids share the short key, so the short-key
        // lookup must fail rather than guess.
        let db = db(&["tx1:0", "tx1:1"]);
        assert!(db.get("tx1:7").is_none());
    }

    #[test]
    fn test_store_round_trip() {
        let record = Classification {
            usd: Some("12.50".parse().unwrap()),
            kind: Some(ClassifyKind::Income),
            note: Some("mining payout".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_string(&record).unwrap();
        let parsed: Classification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
