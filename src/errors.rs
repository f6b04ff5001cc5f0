//! One import path for every public error type.

pub use crate::engine::inventory::MethodError;
pub use crate::engine::replay::ReplayError;
pub use crate::imports::ParseError;
pub use crate::model::amount::ConvertAmountError;
pub use crate::model::classify::ClassifyError;
pub use crate::model::fmv::FmvError;
pub use crate::model::transaction::TransactionError;
