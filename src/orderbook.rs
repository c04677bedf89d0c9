//! Incremental trading book built from a snapshot followed by a stream of
//! nonce-tagged deltas.

use rust_decimal::prelude::*;
use log::{trace, warn};

use crate::core::{Level, Side};


/// Internally used type to differentiate between trading book sides:
/// within _ask_ sides the prices are ordered from lower to higher,
/// within _bid_ sides, it is the other way around.
#[derive(PartialEq, Clone, Copy, Debug)]
enum Ranking {
    /// Prices must be ordered with the lower first
    LessFirst,
    /// Prices must be ordered with the higher first
    GreaterFirst,
}

impl From<Side> for Ranking {
    fn from(side: Side) -> Self {
        match side {
            Side::Bids => Ranking::GreaterFirst,
            Side::Asks => Ranking::LessFirst,
        }
    }
}

/// How a delta changes the amount of a price level.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DeltaOperation {
    /// Add the amount to the existing level, creating it if needed.
    Add,
    /// Remove the level.
    Delete,
    /// Replace the amount of the level, creating it if needed.
    Absolute,
}

/// Full state of a book as delivered by an exchange snapshot.
#[derive(PartialEq, Clone, Debug, Default)]
pub struct OrderBookSnapshot {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
}

/// Several level changes sharing one nonce, as most exchanges batch them.
#[derive(PartialEq, Clone, Debug)]
pub struct BookDelta {
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
    /// [Add](DeltaOperation::Add) for diff feeds, [Absolute](DeltaOperation::Absolute)
    /// for feeds sending the new amount of each level.
    pub operation: DeltaOperation,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// One side of the book: levels kept sorted by ordered insertion.
#[derive(PartialEq, Clone, Debug)]
struct Ladder {
    ordering: Ranking,
    levels: Vec<Level>,
}

impl Ladder {
    fn new(ordering: Ranking) -> Self {
        Self { ordering, levels: vec![] }
    }

    /// Internal utility function to generalise price comparison based on the side's `ordering`.
    fn is_before(&self, price_a: Decimal, price_b: Decimal) -> bool {
        match self.ordering {
            Ranking::LessFirst => price_a < price_b,
            Ranking::GreaterFirst => price_a > price_b,
        }
    }

    /// Replace all levels. Snapshot levels are merged one by one, so an unsorted
    /// or duplicated snapshot still yields a well-formed ladder.
    fn reset(&mut self, levels: &[Level]) {
        self.levels.clear();
        self.levels.reserve(levels.len());
        for level in levels {
            self.update(DeltaOperation::Absolute, level.price, level.amount);
        }
    }

    /// Index of the level at `price`, or the position where it would be inserted.
    fn search(&self, price: Decimal) -> Result<usize, usize> {
        let index = self.levels.partition_point(|level| self.is_before(level.price, price));
        match self.levels.get(index) {
            Some(level) if level.price == price => Ok(index),
            _ => Err(index),
        }
    }

    fn update(&mut self, operation: DeltaOperation, price: Decimal, amount: Decimal) {
        match (operation, self.search(price)) {
            (DeltaOperation::Add, Ok(index)) => {
                match self.levels[index].amount.checked_add(amount) {
                    Some(total) => {
                        self.levels[index].amount = total;
                        self.prune(index);
                    }
                    None => warn!("Amount overflow at price {}, level left unchanged", price),
                }
            }
            (DeltaOperation::Absolute, Ok(index)) => {
                self.levels[index].amount = amount;
                self.prune(index);
            }
            (DeltaOperation::Add | DeltaOperation::Absolute, Err(index)) => {
                if !amount.is_zero() {
                    self.levels.insert(index, Level::new(price, amount));
                }
            }
            (DeltaOperation::Delete, Ok(index)) => {
                self.levels.remove(index);
            }
            (DeltaOperation::Delete, Err(_)) => (),
        }
    }

    fn prune(&mut self, index: usize) {
        if self.levels[index].amount.is_zero() {
            self.levels.remove(index);
        }
    }

    #[cfg(test)]
    fn check_integrity(&self) {
        for pair in self.levels.windows(2) {
            assert!(
                self.is_before(pair[0].price, pair[1].price),
                "Level price {} is not before {}", pair[0].price, pair[1].price
            );
        }
        assert!(self.levels.iter().all(|level| !level.amount.is_zero()));
    }
}

/// Trading book maintained from a snapshot and incremental updates.
///
/// Deltas must be delivered in nonce order; the book only detects and drops
/// the ones not newer than its state.
#[derive(PartialEq, Clone, Debug)]
pub struct OrderBook {
    bids: Ladder,
    asks: Ladder,
    nonce: Option<u64>,
    timestamp: Option<i64>,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: Ladder::new(Ranking::from(Side::Bids)),
            asks: Ladder::new(Ranking::from(Side::Asks)),
            nonce: None,
            timestamp: None,
        }
    }

    pub fn from_snapshot(snapshot: &OrderBookSnapshot) -> Self {
        let mut book = Self::new();
        book.seed(snapshot);
        book
    }

    /// Replace both sides with a snapshot and take its nonce.
    pub fn seed(&mut self, snapshot: &OrderBookSnapshot) {
        self.bids.reset(&snapshot.bids);
        self.asks.reset(&snapshot.asks);
        self.nonce = snapshot.nonce;
        self.timestamp = snapshot.timestamp;
    }

    /// Apply a single level change.
    ///
    /// # Arguments
    ///
    /// * `nonce` - Sequence number of the delta, if the exchange provides one.
    ///
    /// * `operation` - How the level amount changes.
    ///
    /// * `side` - Book side of the level.
    ///
    /// * `price` - Price of the level.
    ///
    /// * `amount` - Amount added or set. Ignored by [Delete](DeltaOperation::Delete).
    ///
    /// # Returns
    ///
    /// [false](false) if the delta was stale and has been dropped.
    pub fn apply_delta(
            &mut self,
            nonce: Option<u64>,
            operation: DeltaOperation,
            side: Side,
            price: Decimal,
            amount: Decimal) -> bool {
        if self.is_stale(nonce) {
            return false;
        }
        self.ladder_mut(side).update(operation, price, amount);
        if nonce.is_some() {
            self.nonce = nonce;
        }
        true
    }

    /// Apply all level changes of a batch under a single nonce.
    ///
    /// # Returns
    ///
    /// [false](false) if the batch was stale and has been dropped.
    pub fn apply_batch(&mut self, delta: &BookDelta) -> bool {
        if self.is_stale(delta.nonce) {
            return false;
        }
        for level in &delta.bids {
            self.bids.update(delta.operation, level.price, level.amount);
        }
        for level in &delta.asks {
            self.asks.update(delta.operation, level.price, level.amount);
        }
        if delta.nonce.is_some() {
            self.nonce = delta.nonce;
        }
        if delta.timestamp.is_some() {
            self.timestamp = delta.timestamp;
        }
        true
    }

    fn is_stale(&self, nonce: Option<u64>) -> bool {
        match (nonce, self.nonce) {
            (Some(delta_nonce), Some(current)) if delta_nonce <= current => {
                trace!("Dropping stale delta {} (book at {})", delta_nonce, current);
                true
            }
            _ => false,
        }
    }

    fn ladder_mut(&mut self, side: Side) -> &mut Ladder {
        match side {
            Side::Bids => &mut self.bids,
            Side::Asks => &mut self.asks,
        }
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.timestamp = timestamp;
    }

    pub fn bids(&self) -> &[Level] {
        &self.bids.levels
    }

    pub fn asks(&self) -> &[Level] {
        &self.asks.levels
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.levels.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.levels.first()
    }

    /// Difference between the best ask and the best bid, when both sides have levels.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Copy of the book truncated to the best `depth` levels of each side.
    pub fn limit(&self, depth: usize) -> OrderBookSnapshot {
        OrderBookSnapshot {
            bids: self.bids.levels.iter().take(depth).copied().collect(),
            asks: self.asks.levels.iter().take(depth).copied().collect(),
            nonce: self.nonce,
            timestamp: self.timestamp,
        }
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        self.limit(usize::MAX)
    }
}
