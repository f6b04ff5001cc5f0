use chrono::{DateTime, Datelike as _, Timelike as _, Utc};

/// Calendar components of a timestamp, in comparison order.
type Parts = (i32, u32, u32, u32, u32, u32);

fn parts(t: DateTime<Utc>) -> Parts {
    (
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
    )
}

/// Determine whether a holding period is long-term: acquired more than one
/// calendar year before disposal.
///
/// The comparison is elementwise on `(Y, M, D, h, m, s)` with the acquisition
/// year incremented; the shifted tuple is never validated as a calendar date,
/// so a Feb 29 acquisition compares as Feb 29 of the next year even when that
/// date does not exist. Years vary in length, making any other rule messier
/// than it looks.
pub fn is_long_term(buy: DateTime<Utc>, sell: DateTime<Utc>) -> bool {
    let (year, month, day, hour, minute, second) = parts(buy);

    (year + 1, month, day, hour, minute, second) < parts(sell)
}
