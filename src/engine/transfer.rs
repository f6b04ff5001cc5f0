use crate::model::amount::BtcAmount;
use crate::model::transaction::{Transaction, TxType};
use chrono::Duration;
use std::collections::HashMap;
use tracing::{debug, warn};

/// What transfer matching did, for the end-of-run summary.
#[derive(Debug, Default)]
pub struct MatchStats {
    pub matched_by_amount: usize,
    pub matched_by_txid: usize,

    /// Withdrawals that had same-amount deposit candidates, none of which
    /// satisfied the time/account predicate. Non-fatal.
    pub unmatched: Vec<String>,
}

/// Pair withdrawals with deposits across accounts and rewrite each matched
/// pair into a single internal transfer event.
///
/// Two passes. The first matches on exact amount within a time window; it
/// deliberately runs first because older datasets lack txids and one on-chain
/// send can pay multiple recipients. The second matches remaining withdrawals
/// to deposits sharing an on-chain txid, absorbing the implied network fee
/// into the transfer.
///
/// The result is re-sorted. Matching is idempotent: transfers are neither
/// deposits nor withdrawals, so a second run finds nothing to do.
pub fn match_transfers(
    mut events: Vec<Transaction>,
    transfer_window_hours: i64,
) -> (Vec<Transaction>, MatchStats) {
    let mut stats = MatchStats::default();
    let mut consumed = vec![false; events.len()];
    let mut transfers = Vec::new();

    // Pass 1: amount + time.
    let mut deposits_by_amount: HashMap<BtcAmount, Vec<usize>> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        if event.tx_type == TxType::Deposit && !event.btc.is_zero() {
            deposits_by_amount.entry(event.btc).or_default().push(index);
        }
    }

    let window = Duration::hours(transfer_window_hours);
    for index in 0..events.len() {
        let withdrawal = &events[index];
        if withdrawal.tx_type != TxType::Withdraw || withdrawal.btc.is_zero() {
            continue;
        }

        let Some(candidates) = deposits_by_amount.get_mut(&-withdrawal.btc) else {
            continue;
        };

        let mut had_candidates = false;
        let mut matched = None;
        for &candidate in candidates.iter() {
            if consumed[candidate] {
                continue;
            }
            had_candidates = true;

            let deposit = &events[candidate];
            let delta = (deposit.timestamp - withdrawal.timestamp).abs();
            if delta <= window && deposit.account != withdrawal.account {
                matched = Some(candidate);
                break;
            }
        }

        match matched {
            Some(candidate) => {
                candidates.retain(|&i| i != candidate);
                debug!("match {withdrawal} {deposit}", deposit = events[candidate]);

                transfers.push(make_transfer(
                    &events[index],
                    &events[candidate],
                    events[index].fee_btc,
                ));
                consumed[index] = true;
                consumed[candidate] = true;
                stats.matched_by_amount += 1;
            }
            None if had_candidates => {
                warn!("no match {withdrawal}", withdrawal = events[index]);
                stats.unmatched.push(events[index].id.clone());
            }
            None => {}
        }
    }

    // Pass 2: shared on-chain txid, for sends whose network fee breaks the
    // exact amount match.
    let mut deposits_by_txid: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        if consumed[index] {
            continue;
        }
        if event.tx_type == TxType::Deposit && !event.btc.is_zero() {
            if let Some(txid) = event.txid.as_deref() {
                deposits_by_txid.entry(txid).or_default().push(index);
            }
        }
    }

    let mut txid_matches = Vec::new();
    for index in 0..events.len() {
        let withdrawal = &events[index];
        if consumed[index] || withdrawal.tx_type != TxType::Withdraw || withdrawal.btc.is_zero() {
            continue;
        }
        let Some(txid) = withdrawal.txid.as_deref() else {
            continue;
        };

        let Some(candidates) = deposits_by_txid.get(txid) else {
            continue;
        };
        let live: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| !consumed[i])
            .collect();

        match live.as_slice() {
            [candidate] => txid_matches.push((index, *candidate)),
            [] => {}
            _ => warn!(
                "txid {txid} pairs one withdrawal with {count} deposits; not merged",
                count = live.len()
            ),
        }
    }

    for (index, candidate) in txid_matches {
        if consumed[index] || consumed[candidate] {
            // A second withdrawal sharing the txid already claimed this
            // deposit.
            continue;
        }
        let withdrawal = &events[index];
        let deposit = &events[candidate];

        // The implied network fee; on a real transfer the deposit is smaller
        // than the withdrawal.
        let fee_btc = -(withdrawal.btc + deposit.btc) + withdrawal.fee_btc;
        if fee_btc.is_negative() {
            warn!("txid match would imply a negative fee: {withdrawal} vs {deposit}");
            continue;
        }

        debug!("txid match {withdrawal} {deposit}");
        transfers.push(make_transfer(withdrawal, deposit, fee_btc));
        consumed[index] = true;
        consumed[candidate] = true;
        stats.matched_by_txid += 1;
    }

    let mut output: Vec<Transaction> = events
        .drain(..)
        .enumerate()
        .filter_map(|(index, event)| (!consumed[index]).then_some(event))
        .collect();
    output.extend(transfers);
    output.sort();

    (output, stats)
}

/// Build the transfer that replaces a matched withdrawal/deposit pair.
///
/// The transfer's `btc` is the signed gross amount on the originating side,
/// network fee included, so the replay's inventory removal needs no further
/// fee adjustment.
fn make_transfer(
    withdrawal: &Transaction,
    deposit: &Transaction,
    fee_btc: BtcAmount,
) -> Transaction {
    let mut transfer = Transaction::new(
        withdrawal.timestamp,
        TxType::Transfer,
        -(deposit.btc + fee_btc),
    );
    transfer.usd = Some(Default::default());
    transfer.fee_btc = fee_btc;
    transfer.fee_usd = withdrawal.fee_usd;
    transfer.account = withdrawal.account.clone();
    transfer.dest_account = Some(deposit.account.clone());
    transfer.id = withdrawal.id.clone();
    transfer.txid = withdrawal.txid.clone();
    transfer.info = withdrawal.info.clone();
    transfer.parser = withdrawal.parser;

    transfer
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(s: &str) -> DateTime<Utc> {
        format!("{s}+0000").parse().unwrap()
    }

    fn tx(tx_type: TxType, time: &str, btc: &str, account: &str, id: &str) -> Transaction {
        let mut tx = Transaction::new(at(time), tx_type, btc.parse().unwrap());
        tx.account = account.to_string();
        tx.id = id.to_string();
        tx
    }

    #[test]
    fn test_amount_and_time_match() {
        // Deposit to A, withdrawal from B an hour later.
        let events = vec![
            tx(TxType::Deposit, "2019-05-01 10:00:00", "1.0", "a", "d1"),
            tx(TxType::Withdraw, "2019-05-01 11:00:00", "-1.0", "b", "w1"),
        ];

        let (matched, stats) = match_transfers(events, 24);
        assert_eq!(stats.matched_by_amount, 1);
        assert_eq!(matched.len(), 1);

        let transfer = &matched[0];
        assert_eq!(transfer.tx_type, TxType::Transfer);
        assert_eq!(transfer.btc.to_string(), "-1.00000000");
        assert_eq!(transfer.account, "b");
        assert_eq!(transfer.dest_account.as_deref(), Some("a"));
    }

    #[test]
    fn test_same_account_is_not_a_transfer() {
        let events = vec![
            tx(TxType::Deposit, "2019-05-01 10:00:00", "1.0", "a", "d1"),
            tx(TxType::Withdraw, "2019-05-01 11:00:00", "-1.0", "a", "w1"),
        ];

        let (matched, stats) = match_transfers(events, 24);
        assert_eq!(stats.matched_by_amount, 0);
        assert_eq!(stats.unmatched, vec!["w1".to_string()]);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_outside_window_is_not_a_transfer() {
        let events = vec![
            tx(TxType::Deposit, "2019-05-01 10:00:00", "1.0", "a", "d1"),
            tx(TxType::Withdraw, "2019-05-03 11:00:00", "-1.0", "b", "w1"),
        ];

        let (matched, stats) = match_transfers(events, 24);
        assert_eq!(stats.matched_by_amount, 0);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_txid_match_absorbs_network_fee() {
        let mut withdrawal = tx(TxType::Withdraw, "2019-05-01 10:00:00", "-1.0", "a", "w1");
        withdrawal.txid = Some("deadbeef".to_string());
        let mut deposit = tx(TxType::Deposit, "2019-05-01 10:30:00", "0.999", "b", "d1");
        deposit.txid = Some("deadbeef".to_string());

        let (matched, stats) = match_transfers(vec![withdrawal, deposit], 24);
        assert_eq!(stats.matched_by_amount, 0);
        assert_eq!(stats.matched_by_txid, 1);
        assert_eq!(matched.len(), 1);

        let transfer = &matched[0];
        assert_eq!(transfer.tx_type, TxType::Transfer);
        assert_eq!(transfer.fee_btc.to_string(), "0.00100000");
        // Gross amount leaving the source, fee included.
        assert_eq!(transfer.btc.to_string(), "-1.00000000");
        assert_eq!(transfer.account, "a");
        assert_eq!(transfer.dest_account.as_deref(), Some("b"));
    }

    #[test]
    fn test_txid_with_multiple_deposits_is_reported_not_merged() {
        let mut withdrawal = tx(TxType::Withdraw, "2019-05-01 10:00:00", "-1.0", "a", "w1");
        withdrawal.txid = Some("deadbeef".to_string());
        let mut d1 = tx(TxType::Deposit, "2019-05-01 10:30:00", "0.4", "b", "d1");
        d1.txid = Some("deadbeef".to_string());
        let mut d2 = tx(TxType::Deposit, "2019-05-01 10:30:00", "0.5", "c", "d2");
        d2.txid = Some("deadbeef".to_string());

        let (matched, stats) = match_transfers(vec![withdrawal, d1, d2], 24);
        assert_eq!(stats.matched_by_txid, 0);
        assert_eq!(matched.len(), 3);
    }

    #[test]
    fn test_matching_is_idempotent() {
        let mut withdrawal = tx(TxType::Withdraw, "2019-05-01 10:00:00", "-1.0", "a", "w1");
        withdrawal.txid = Some("deadbeef".to_string());
        let mut deposit = tx(TxType::Deposit, "2019-05-01 10:30:00", "0.999", "b", "d1");
        deposit.txid = Some("deadbeef".to_string());
        let extra = tx(TxType::Deposit, "2019-06-01 10:00:00", "2.0", "a", "d2");

        let (once, _) = match_transfers(vec![withdrawal, deposit, extra], 24);
        let (twice, stats) = match_transfers(once.clone(), 24);
        assert_eq!(once, twice);
        assert_eq!(stats.matched_by_amount + stats.matched_by_txid, 0);
    }
}
