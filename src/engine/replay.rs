use crate::engine::inventory::{Inventory, Method};
use crate::model::classify::{ClassificationDb, ClassifyError, ClassifyKind, Prompt, PromptOutcome};
use crate::model::fmv::{FmvError, FmvSource};
use crate::model::lot::Lot;
use crate::model::report::{RunningReport, Snapshot};
use crate::model::transaction::{Transaction, TxType};
use crate::model::amount::{BtcAmount, UsdAmount};
use crate::util::calendar::is_long_term;
use crate::util::fifo::FIFO;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Wash-sale lookback. A replacement buy within this window of a loss-making
/// sale disallows the loss.
const WASH_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Fair market value lookup failed")]
    Fmv(#[from] FmvError),

    #[error("Classification store error")]
    Classify(#[from] ClassifyError),

    #[error("Event `{0}` needs classification and prompting is disabled")]
    Unclassified(String),

    #[error("Balance went negative on account `{account}` at event `{id}`")]
    NegativeBalance { account: String, id: String },

    #[error("Internal transfer `{0}` has no destination account")]
    MissingDestination(String),

    #[error("Trade `{0}` is missing its USD leg")]
    MissingTradeLeg(String),

    #[error("User quit; classification store flushed")]
    UserQuit,

    #[error("User abort; classification store not flushed")]
    UserAbort,
}

/// Replay options, fixed for the whole run.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub method: Method,
    pub nowash: bool,
    pub non_interactive: bool,
    pub end_date: Option<DateTime<Utc>>,

    /// Accounts permitted to run a temporary short (sell with an empty
    /// inventory, covered by a later deposit). Matches the account name
    /// itself and its `-` suffixed sub-accounts.
    pub allow_short: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            nowash: false,
            non_interactive: false,
            end_date: None,
            allow_short: vec!["bitcoind".to_string()],
        }
    }
}

impl ReplayConfig {
    fn allows_short(&self, account: &str) -> bool {
        self.allow_short.iter().any(|name| {
            account
                .strip_prefix(name.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'))
        })
    }
}

/// Everything the replay produced.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub totals: Snapshot,
    pub running: RunningReport,
    pub account_btc: HashMap<String, BtcAmount>,
    pub lots: HashMap<String, Inventory>,
    pub short_debt: HashMap<String, BtcAmount>,
    pub transferred_out: Vec<(Transaction, Lot)>,
    pub gift_txns: Vec<(Transaction, Vec<Lot>)>,
}

struct State {
    method: Method,
    totals: Snapshot,
    account_btc: HashMap<String, BtcAmount>,
    short_debt: HashMap<String, BtcAmount>,
    lots: HashMap<String, Inventory>,
    recent_sells: FIFO<(Lot, Lot)>,
    transferred_out: Vec<(Transaction, Lot)>,
    gift_txns: Vec<(Transaction, Vec<Lot>)>,
    running: RunningReport,
}

impl State {
    fn new(method: Method) -> Self {
        Self {
            method,
            totals: Snapshot::default(),
            account_btc: HashMap::new(),
            short_debt: HashMap::new(),
            lots: HashMap::new(),
            recent_sells: FIFO::new(),
            transferred_out: Vec::new(),
            gift_txns: Vec::new(),
            running: RunningReport::new("%Y-%m"),
        }
    }

    fn inventory(&mut self, account: &str) -> &mut Inventory {
        let method = self.method;
        self.lots
            .entry(account.to_string())
            .or_insert_with(|| Inventory::new(method))
    }

    /// Deposit a lot into an account, first covering any outstanding short
    /// debt. The covering slice never reaches the inventory: its basis is the
    /// deferred short loss, returned as a (negative) gain and backed out of
    /// `total_cost` so callers can account for the full lot uniformly.
    fn push_lot(&mut self, account: &str, lot: Lot) -> UsdAmount {
        let debt = self
            .short_debt
            .get(account)
            .copied()
            .unwrap_or_default();
        let (covered, held) = lot.split(debt);
        let mut gain = UsdAmount::default();

        if let Some(covered) = covered {
            let remaining = debt - covered.btc;
            if remaining.is_positive() {
                self.short_debt.insert(account.to_string(), remaining);
            } else {
                self.short_debt.remove(account);
            }

            gain = -covered.usd;
            self.totals.total_cost -= covered.usd - covered.disallowed_loss;
            self.totals.disallowed_loss -= covered.disallowed_loss;
        }

        if let Some(held) = held {
            self.inventory(account).push(held);
        }

        gain
    }
}

/// Walk the final ordered ledger through the per-account lot inventories.
///
/// Events must already be merged, transfer-matched, and sorted. The oracle,
/// classification store, and prompt are the only collaborators consulted.
pub fn replay(
    events: &[Transaction],
    config: &ReplayConfig,
    fmv: &mut dyn FmvSource,
    db: &mut ClassificationDb,
    prompt: &mut dyn Prompt,
) -> Result<ReplayOutcome, ReplayError> {
    let mut state = State::new(config.method);

    for event in events {
        if let Some(end_date) = config.end_date {
            if event.timestamp > end_date {
                break;
            }
        }
        trace!("replaying {event}");

        let mut tx_type = event.tx_type;
        let mut acquired = event.timestamp;
        let mut btc = event.btc;
        let usd;

        match tx_type {
            TxType::Trade => {
                let legs = event
                    .usd
                    .ok_or_else(|| ReplayError::MissingTradeLeg(event.id.clone()))?;
                usd = legs - event.fee_usd;
            }
            // A transfer moves basis, not value; a fee has no USD leg at all.
            TxType::Transfer | TxType::Fee => usd = UsdAmount::default(),
            _ => {
                let classification = match db.get(&event.id) {
                    Some(classification) => classification.clone(),
                    None => {
                        if config.non_interactive {
                            return Err(ReplayError::Unclassified(event.id.clone()));
                        }
                        match prompt.classify(event)? {
                            PromptOutcome::Classified {
                                classification,
                                ephemeral,
                            } => {
                                if !ephemeral {
                                    db.insert(event.id.clone(), classification.clone());
                                }
                                classification
                            }
                            PromptOutcome::Quit => {
                                db.flush()?;
                                return Err(ReplayError::UserQuit);
                            }
                            PromptOutcome::Abort => return Err(ReplayError::UserAbort),
                        }
                    }
                };

                if let Some(amount) = classification.btc {
                    btc = amount;
                }
                usd = match classification.usd {
                    Some(amount) => amount,
                    None => {
                        let rate = match classification.price.or(event.price) {
                            Some(rate) => rate,
                            None => fmv.price(event.timestamp.date_naive())?,
                        };
                        -UsdAmount::from_rate(rate, btc)
                    }
                };

                match classification.kind {
                    Some(ClassifyKind::Buy | ClassifyKind::Sale | ClassifyKind::Purchase) => {
                        tx_type = TxType::Trade;
                    }
                    Some(ClassifyKind::TransferOut) => tx_type = TxType::TransferOut,
                    Some(ClassifyKind::Gift) => tx_type = TxType::Gift,
                    Some(ClassifyKind::Income) => {
                        state.totals.income += -usd;
                        state.totals.gross_receipts += -usd;
                    }
                    Some(ClassifyKind::Expense) => state.totals.income += -usd,
                    Some(ClassifyKind::TransferIn) => {
                        // Pre-existing holdings moved in keep their original
                        // acquisition date.
                        if let Some(date) = classification.purchase_date {
                            acquired = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
                        }
                    }
                    None => {}
                }
            }
        }

        // The inventory removal must include the network fee. Transfers are
        // exempt: the matcher already made their amount gross of the fee, and
        // the transfer branch below carves the fee out of the moved lots.
        if tx_type == TxType::Fee {
            btc -= event.fee_btc;
        } else if btc.is_negative() && tx_type != TxType::Transfer {
            btc -= event.fee_btc;
        }

        *state.account_btc.entry(event.account.clone()).or_default() += btc;

        if btc.is_positive() {
            let mut buy = Some(Lot::new(acquired, btc, -usd, event.id.clone()));

            if !config.nowash {
                while buy.is_some() && !state.recent_sells.is_empty() {
                    let current = buy.take().unwrap();
                    let (rs_sell, rs_buy) = state.recent_sells.pop_front().unwrap();

                    if rs_sell.timestamp < event.timestamp - Duration::days(WASH_WINDOW_DAYS) {
                        // Stale pair; evicted lazily.
                        buy = Some(current);
                        continue;
                    }
                    if rs_sell.usd >= rs_buy.usd {
                        // No loss to disallow.
                        buy = Some(current);
                        continue;
                    }

                    let amount = current.btc.min(rs_sell.btc);
                    let (sell_head, sell_tail) = rs_sell.split(amount);
                    let (buy_head, buy_tail) = rs_buy.split(amount);
                    let sell_head = sell_head.unwrap();
                    let buy_head = buy_head.unwrap();
                    if let (Some(sell_tail), Some(buy_tail)) = (sell_tail, buy_tail) {
                        state.recent_sells.push_front((sell_tail, buy_tail));
                    }

                    let (wash, rest) = current.split(amount);
                    let mut wash = wash.unwrap();

                    // The disallowed loss backs out of realized gains and
                    // carries forward as basis on the replacement lot.
                    let loss = buy_head.usd - sell_head.usd;
                    state.totals.gains += loss;
                    state.totals.disallowed_loss += loss;
                    wash.usd += loss;
                    wash.disallowed_loss += loss;

                    let basis = wash.usd;
                    let cover = state.push_lot(&event.account, wash);
                    state.totals.gains += cover;
                    state.totals.total_cost += basis - loss;

                    buy = rest;
                }
            }

            if let Some(buy) = buy {
                let basis = buy.usd;
                let cover = state.push_lot(&event.account, buy);
                state.totals.gains += cover;
                state.totals.total_cost += basis;
            }
            state.totals.total_buy += -usd;
        } else if btc.is_negative() {
            let mut to_sell = Some(Lot::new(event.timestamp, -btc, usd, event.id.clone()));
            let mut lost_in_transfer = event.fee_btc;
            let mut gain = UsdAmount::default();
            let mut long_term_gain = UsdAmount::default();
            let mut long_term_gift = UsdAmount::default();
            let mut sold_lots = Vec::new();

            while let Some(selling) = to_sell.take() {
                let lot = if state.inventory(&event.account).is_empty() {
                    if !config.allows_short(&event.account) {
                        return Err(ReplayError::NegativeBalance {
                            account: event.account.clone(),
                            id: event.id.clone(),
                        });
                    }

                    // Zero-cost synthetic lot; the offsetting loss lands when
                    // the short is covered by a later deposit.
                    *state
                        .short_debt
                        .entry(event.account.clone())
                        .or_default() += selling.btc;
                    Lot::new(
                        event.timestamp,
                        selling.btc,
                        UsdAmount::default(),
                        event.id.clone(),
                    )
                } else {
                    state.inventory(&event.account).pop().unwrap()
                };

                let (buy, remaining) = lot.split(selling.btc);
                let buy = buy.unwrap();
                if let Some(remaining) = remaining {
                    state.inventory(&event.account).unpop(remaining);
                }

                let (sell, rest) = selling.split(buy.btc);
                let sell = sell.unwrap();
                to_sell = rest;

                if tx_type == TxType::Transfer {
                    // The network fee comes out of the moved lots first; its
                    // basis is consumed with no gain recognized.
                    let (lost, moved) = buy.split(lost_in_transfer);
                    if let Some(lost) = lost {
                        lost_in_transfer -= lost.btc;
                        state.totals.total_cost -= lost.usd - lost.disallowed_loss;
                        state.totals.disallowed_loss -= lost.disallowed_loss;
                    }
                    if let Some(moved) = moved {
                        let dest = event
                            .dest_account
                            .clone()
                            .ok_or_else(|| ReplayError::MissingDestination(event.id.clone()))?;
                        *state.account_btc.entry(dest.clone()).or_default() += moved.btc;
                        let cover = state.push_lot(&dest, moved);
                        gain += cover;
                    }
                } else {
                    gain += sell.usd - buy.usd;
                    state.totals.total_sell += sell.usd;
                    state.totals.total_cost_basis += buy.usd;
                    let long_term = is_long_term(buy.timestamp, sell.timestamp);
                    if long_term {
                        long_term_gain += sell.usd - buy.usd;
                        state.totals.long_term_cost_basis += buy.usd;
                    }
                    state.totals.total_cost -= buy.usd - buy.disallowed_loss;

                    if tx_type == TxType::TransferOut {
                        // Gain is still recognized; the lot leaves the
                        // closed-book universe and is tracked for reporting.
                        state.transferred_out.push((event.clone(), buy.clone()));
                    } else if tx_type == TxType::Gift && long_term {
                        long_term_gift += sell.usd - buy.usd;
                        state.totals.long_term_gift_cost_basis += buy.usd;
                        // Gifted lots stay out of the wash-sale queue and the
                        // disallowed-loss reversal is skipped.
                    } else {
                        state.totals.disallowed_loss -= buy.disallowed_loss;
                        state.recent_sells.append_back((sell.clone(), buy.clone()));
                    }
                    sold_lots.push(buy);
                }
            }

            state.totals.gains += gain;
            state.totals.long_term_gains += long_term_gain;
            state.totals.long_term_gifts += long_term_gift;
            if tx_type == TxType::Gift {
                state.gift_txns.push((event.clone(), sold_lots));
            }
        }

        let market = fmv.price(event.timestamp.date_naive())?;
        let total_btc: BtcAmount = state.account_btc.values().copied().sum();
        let unrealized = UsdAmount::from_rate(market, total_btc)
            - state.totals.total_cost
            - state.totals.disallowed_loss;
        state.totals.unrealized_gains = unrealized;
        state.totals.total = state.totals.income + state.totals.gains + unrealized;
        state.running.record(event.timestamp, state.totals);
    }

    Ok(ReplayOutcome {
        totals: state.totals,
        running: state.running,
        account_btc: state.account_btc,
        lots: state.lots,
        short_debt: state.short_debt,
        transferred_out: state.transferred_out,
        gift_txns: state.gift_txns,
    })
}
