pub mod amount;
pub mod classify;
pub mod fmv;
pub mod lot;
pub mod report;
pub mod transaction;

pub use amount::{BtcAmount, PriceAmount, UsdAmount};
pub use classify::{Classification, ClassificationDb, ClassifyKind, Prompt, PromptOutcome};
pub use fmv::{FmvSource, Quotes};
pub use lot::Lot;
pub use report::{RunningReport, Snapshot};
pub use transaction::{ParserId, Transaction, TxType};
