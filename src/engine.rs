pub mod inventory;
pub mod replay;
pub mod transfer;

pub use inventory::{Inventory, Method};
pub use replay::{replay, ReplayConfig, ReplayOutcome};
pub use transfer::{match_transfers, MatchStats};
