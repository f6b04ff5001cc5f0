use crate::model::amount::UsdAmount;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Sub;

/// One cumulative row of the running report.
///
/// Every field is a running total as of the row's bucket; per-bucket values
/// come out of [`RunningReport::deltas`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub income: UsdAmount,
    pub gross_receipts: UsdAmount,
    pub gains: UsdAmount,
    pub long_term_gains: UsdAmount,
    pub long_term_gifts: UsdAmount,
    pub unrealized_gains: UsdAmount,
    pub total_cost: UsdAmount,
    pub total_buy: UsdAmount,
    pub total_sell: UsdAmount,
    pub total_cost_basis: UsdAmount,
    pub long_term_cost_basis: UsdAmount,
    pub long_term_gift_cost_basis: UsdAmount,
    pub disallowed_loss: UsdAmount,
    pub total: UsdAmount,
}

impl Sub for Snapshot {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            income: self.income - rhs.income,
            gross_receipts: self.gross_receipts - rhs.gross_receipts,
            gains: self.gains - rhs.gains,
            long_term_gains: self.long_term_gains - rhs.long_term_gains,
            long_term_gifts: self.long_term_gifts - rhs.long_term_gifts,
            unrealized_gains: self.unrealized_gains - rhs.unrealized_gains,
            total_cost: self.total_cost - rhs.total_cost,
            total_buy: self.total_buy - rhs.total_buy,
            total_sell: self.total_sell - rhs.total_sell,
            total_cost_basis: self.total_cost_basis - rhs.total_cost_basis,
            long_term_cost_basis: self.long_term_cost_basis - rhs.long_term_cost_basis,
            long_term_gift_cost_basis: self.long_term_gift_cost_basis
                - rhs.long_term_gift_cost_basis,
            disallowed_loss: self.disallowed_loss - rhs.disallowed_loss,
            total: self.total - rhs.total,
        }
    }
}

/// Time-bucketed cumulative series.
///
/// Rows are keyed by a formatted date bucket (e.g. `%Y-%m`); recording twice
/// into the same bucket overwrites, so each bucket holds the totals as of its
/// last event. Bucket strings are zero-padded so the map's lexicographic order
/// is chronological.
#[derive(Debug)]
pub struct RunningReport {
    date_format: String,
    rows: BTreeMap<String, (DateTime<Utc>, Snapshot)>,
}

impl RunningReport {
    pub fn new(date_format: &str) -> Self {
        Self {
            date_format: date_format.to_string(),
            rows: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>, snapshot: Snapshot) {
        let bucket = timestamp.format(&self.date_format).to_string();
        self.rows.insert(bucket, (timestamp, snapshot));
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cumulative rows in bucket order.
    pub fn cumulative(&self) -> impl Iterator<Item = (&str, &Snapshot)> {
        self.rows
            .iter()
            .map(|(bucket, (_, snapshot))| (bucket.as_str(), snapshot))
    }

    /// Per-bucket rows, produced by successive subtraction in bucket order.
    pub fn deltas(&self) -> Vec<(String, Snapshot)> {
        let mut last = Snapshot::default();
        let mut output = Vec::with_capacity(self.rows.len());

        for (bucket, (_, snapshot)) in &self.rows {
            output.push((bucket.clone(), *snapshot - last));
            last = *snapshot;
        }

        output
    }

    /// Re-bucket under a coarser date format.
    ///
    /// Rows are replayed in bucket order into a fresh report; since stored
    /// values are cumulative, the last row per coarser bucket winning is
    /// exactly the right answer.
    pub fn consolidate(&self, date_format: &str) -> Self {
        let mut report = Self::new(date_format);
        for (_, (timestamp, snapshot)) in &self.rows {
            report.record(*timestamp, *snapshot);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        format!("{s}+0000").parse().unwrap()
    }

    fn snapshot(gains: &str, income: &str) -> Snapshot {
        Snapshot {
            gains: gains.parse().unwrap(),
            income: income.parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_overwrite_within_bucket() {
        let mut report = RunningReport::new("%Y-%m");
        report.record(at("2020-03-01 10:00:00"), snapshot("1.00", "0.00"));
        report.record(at("2020-03-20 10:00:00"), snapshot("5.00", "0.00"));

        let rows: Vec<_> = report.cumulative().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "2020-03");
        assert_eq!(rows[0].1.gains.to_string(), "5.00");
    }

    #[test]
    fn test_deltas_sum_to_last_cumulative() {
        let mut report = RunningReport::new("%Y-%m");
        report.record(at("2020-01-15 10:00:00"), snapshot("10.00", "3.00"));
        report.record(at("2020-02-15 10:00:00"), snapshot("4.00", "3.00"));
        report.record(at("2020-04-15 10:00:00"), snapshot("7.50", "8.00"));

        let deltas = report.deltas();
        let gains: UsdAmount = deltas.iter().map(|(_, row)| row.gains).sum();
        let income: UsdAmount = deltas.iter().map(|(_, row)| row.income).sum();

        let (_, last) = report.cumulative().last().unwrap();
        assert_eq!(gains, last.gains);
        assert_eq!(income, last.income);
    }

    #[test]
    fn test_consolidate_keeps_last_cumulative_row() {
        let mut report = RunningReport::new("%Y-%m");
        report.record(at("2020-01-15 10:00:00"), snapshot("10.00", "0.00"));
        report.record(at("2020-06-15 10:00:00"), snapshot("12.00", "0.00"));
        report.record(at("2021-01-10 10:00:00"), snapshot("20.00", "0.00"));

        let annual = report.consolidate("%Y");
        let rows: Vec<_> = annual.cumulative().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "2020");
        assert_eq!(rows[0].1.gains.to_string(), "12.00");
        assert_eq!(rows[1].0, "2021");
        assert_eq!(rows[1].1.gains.to_string(), "20.00");

        // A format with no specifiers folds everything into one lifetime row.
        let lifetime = annual.consolidate("lifetime");
        let rows: Vec<_> = lifetime.cumulative().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.gains.to_string(), "20.00");
    }
}
