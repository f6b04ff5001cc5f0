use crate::model::lot::Lot;
use crate::util::fifo::FIFO;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MethodError {
    #[error("Unknown lot selection method `{0}`, expected fifo, lifo, oldest, or newest")]
    Unknown(String),
}

/// Lot selection policy, fixed at engine construction.
///
/// `Oldest` and `Newest` select by acquisition timestamp, breaking ties on the
/// originating event id. They assume stable per-tick event ordering consistent
/// with their priorities.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Method {
    #[default]
    Fifo,
    Lifo,
    Oldest,
    Newest,
}

impl std::str::FromStr for Method {
    type Err = MethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "oldest" => Ok(Self::Oldest),
            "newest" => Ok(Self::Newest),
            _ => Err(MethodError::Unknown(s.to_string())),
        }
    }
}

/// Max-heap entry popping the oldest `(timestamp, tx_id)` first.
#[derive(Clone, Debug)]
struct OldestFirst(Lot);

/// Max-heap entry popping the newest timestamp first, oldest id on ties.
#[derive(Clone, Debug)]
struct NewestFirst(Lot);

impl Ord for OldestFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        (&other.0.timestamp, &other.0.tx_id).cmp(&(&self.0.timestamp, &self.0.tx_id))
    }
}

impl Ord for NewestFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .timestamp
            .cmp(&other.0.timestamp)
            .then_with(|| other.0.tx_id.cmp(&self.0.tx_id))
    }
}

impl PartialOrd for OldestFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialOrd for NewestFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OldestFirst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialEq for NewestFirst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OldestFirst {}
impl Eq for NewestFirst {}

/// Per-account container of lots, yielding them in policy order.
#[derive(Debug)]
pub struct Inventory(Repr);

#[derive(Debug)]
enum Repr {
    Fifo(FIFO<Lot>),
    Lifo(FIFO<Lot>),
    Oldest(BinaryHeap<OldestFirst>),
    Newest(BinaryHeap<NewestFirst>),
}

impl Inventory {
    pub fn new(method: Method) -> Self {
        Self(match method {
            Method::Fifo => Repr::Fifo(FIFO::new()),
            Method::Lifo => Repr::Lifo(FIFO::new()),
            Method::Oldest => Repr::Oldest(BinaryHeap::new()),
            Method::Newest => Repr::Newest(BinaryHeap::new()),
        })
    }

    pub fn push(&mut self, lot: Lot) {
        match &mut self.0 {
            Repr::Fifo(lots) | Repr::Lifo(lots) => lots.append_back(lot),
            Repr::Oldest(lots) => lots.push(OldestFirst(lot)),
            Repr::Newest(lots) => lots.push(NewestFirst(lot)),
        }
    }

    pub fn pop(&mut self) -> Option<Lot> {
        match &mut self.0 {
            Repr::Fifo(lots) => lots.pop_front(),
            Repr::Lifo(lots) => lots.pop_back(),
            Repr::Oldest(lots) => lots.pop().map(|entry| entry.0),
            Repr::Newest(lots) => lots.pop().map(|entry| entry.0),
        }
    }

    /// Return a split remainder so the next `pop` yields it again.
    pub fn unpop(&mut self, lot: Lot) {
        match &mut self.0 {
            Repr::Fifo(lots) => lots.push_front(lot),
            // The LIFO back is its head.
            Repr::Lifo(lots) => lots.append_back(lot),
            // Heaps restore priority order on their own; the remainder shares
            // its parent's key.
            Repr::Oldest(lots) => lots.push(OldestFirst(lot)),
            Repr::Newest(lots) => lots.push(NewestFirst(lot)),
        }
    }

    pub fn len(&self) -> usize {
        match &self.0 {
            Repr::Fifo(lots) | Repr::Lifo(lots) => lots.len(),
            Repr::Oldest(lots) => lots.len(),
            Repr::Newest(lots) => lots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All surviving lots, in no particular order. For sums and invariants.
    pub fn lots(&self) -> Vec<&Lot> {
        match &self.0 {
            Repr::Fifo(lots) | Repr::Lifo(lots) => lots.iter().collect(),
            Repr::Oldest(lots) => lots.iter().map(|entry| &entry.0).collect(),
            Repr::Newest(lots) => lots.iter().map(|entry| &entry.0).collect(),
        }
    }

    /// Drain the inventory in selection order, for the surviving-lot report.
    pub fn drain_selection_order(&mut self) -> Vec<Lot> {
        let mut output = Vec::with_capacity(self.len());
        while let Some(lot) = self.pop() {
            output.push(lot);
        }

        output
    }
}
