//! Sorted order-book state with sequence and crossed-book validation.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt::Write;

use crc32fast::Hasher;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Amount, BookDepth, BookKey, Price};

/// One price level. An amount of zero means "remove the level at this price".
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: Price,
    pub amount: Amount,
}

impl PriceLevel {
    pub fn new(price: Price, amount: Amount) -> Self {
        Self { price, amount }
    }
}

/// Outcome of an update that could not be applied cleanly.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BookUpdateError {
    /// Sequence at or below the current one; a harmless duplicate.
    #[error("stale sequence {seq} (book at {current})")]
    StaleSequence { seq: u64, current: u64 },
    /// Sequence jumped past `current + 1`; the book missed updates.
    #[error("sequence gap: got {seq}, book at {current}")]
    SequenceGap { seq: u64, current: u64 },
    /// Best bid crossed best ask after the merge. The levels were
    /// applied; the book stays flagged until a snapshot replaces it or
    /// a later delta uncrosses it.
    #[error("book crossed: best bid {bid} >= best ask {ask}")]
    Crossed { bid: Price, ask: Price },
}

/// Live view of one (venue, market, pair) book. Bids are held in
/// descending price order, asks ascending.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderBook {
    pub key: BookKey,
    pub depth: BookDepth,
    bids: BTreeMap<Reverse<Price>, Amount>,
    asks: BTreeMap<Price, Amount>,
    last_seq: u64,
    timestamp_ms: i64,
    crossed: bool,
}

impl OrderBook {
    #[must_use]
    pub fn new(key: BookKey, depth: BookDepth) -> Self {
        Self {
            key,
            depth,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_seq: 0,
            timestamp_ms: 0,
            crossed: false,
        }
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    #[must_use]
    pub fn is_crossed(&self) -> bool {
        self.crossed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Replace the whole book with a venue snapshot. Clears any crossed
    /// flag and resets the sequence.
    pub fn load_snapshot(
        &mut self,
        seq: u64,
        timestamp_ms: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
    ) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            if level.amount > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.amount);
            }
        }
        for level in asks {
            if level.amount > Decimal::ZERO {
                self.asks.insert(level.price, level.amount);
            }
        }
        self.last_seq = seq;
        self.timestamp_ms = timestamp_ms;
        self.crossed = self.detect_crossed().is_some();
    }

    /// Merge an incremental update: upsert on nonzero amounts, remove on
    /// zero. Duplicate and gapped sequences are rejected before any
    /// level is touched. When the venue links deltas explicitly,
    /// `prev_seq` must equal the book's current sequence; otherwise the
    /// sequence must be contiguous.
    pub fn apply_delta(
        &mut self,
        seq: u64,
        prev_seq: Option<u64>,
        timestamp_ms: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
    ) -> Result<(), BookUpdateError> {
        if seq <= self.last_seq {
            return Err(BookUpdateError::StaleSequence {
                seq,
                current: self.last_seq,
            });
        }
        if self.last_seq != 0 {
            let gapped = match prev_seq {
                Some(prev) => prev != self.last_seq,
                None => seq > self.last_seq + 1,
            };
            if gapped {
                return Err(BookUpdateError::SequenceGap {
                    seq,
                    current: self.last_seq,
                });
            }
        }

        for level in bids {
            if level.amount <= Decimal::ZERO {
                self.bids.remove(&Reverse(level.price));
            } else {
                self.bids.insert(Reverse(level.price), level.amount);
            }
        }
        for level in asks {
            if level.amount <= Decimal::ZERO {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.amount);
            }
        }
        self.last_seq = seq;
        self.timestamp_ms = timestamp_ms;

        if let Some((bid, ask)) = self.detect_crossed() {
            self.crossed = true;
            return Err(BookUpdateError::Crossed { bid, ask });
        }
        self.crossed = false;
        Ok(())
    }

    fn detect_crossed(&self) -> Option<(Price, Price)> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid.price >= ask.price => Some((bid.price, ask.price)),
            _ => None,
        }
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next()
            .map(|(price, amount)| PriceLevel::new(price.0, *amount))
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, amount)| PriceLevel::new(*price, *amount))
    }

    /// Bids in descending price order, up to `depth` levels (all when zero).
    #[must_use]
    pub fn bid_levels(&self, depth: usize) -> Vec<PriceLevel> {
        let take = if depth == 0 { self.bids.len() } else { depth };
        self.bids
            .iter()
            .take(take)
            .map(|(price, amount)| PriceLevel::new(price.0, *amount))
            .collect()
    }

    /// Asks in ascending price order, up to `depth` levels (all when zero).
    #[must_use]
    pub fn ask_levels(&self, depth: usize) -> Vec<PriceLevel> {
        let take = if depth == 0 { self.asks.len() } else { depth };
        self.asks
            .iter()
            .take(take)
            .map(|(price, amount)| PriceLevel::new(*price, *amount))
            .collect()
    }

    /// CRC32 over the top N levels, matching the form venues publish for
    /// integrity checks.
    #[must_use]
    pub fn checksum(&self, depth: usize) -> u32 {
        if depth == 0 {
            return 0;
        }
        let mut buffer = String::new();
        let mut first = true;
        for level in self.bid_levels(depth) {
            if !first {
                buffer.push(':');
            }
            first = false;
            write!(
                buffer,
                "{}:{}",
                level.price.normalize(),
                level.amount.normalize()
            )
            .ok();
        }
        for level in self.ask_levels(depth) {
            if !first {
                buffer.push(':');
            }
            first = false;
            write!(
                buffer,
                "{}:{}",
                level.price.normalize(),
                level.amount.normalize()
            )
            .ok();
        }
        let mut hasher = Hasher::new();
        hasher.update(buffer.as_bytes());
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MarketKind, VenueId};
    use rust_decimal_macros::dec;

    fn test_book() -> OrderBook {
        OrderBook::new(
            BookKey::new(VenueId::Binance, MarketKind::Spot, "BTC/USDT"),
            BookDepth::Twenty,
        )
    }

    fn levels(entries: &[(i64, i64)]) -> Vec<PriceLevel> {
        entries
            .iter()
            .map(|&(p, a)| PriceLevel::new(Decimal::from(p), Decimal::from(a)))
            .collect()
    }

    #[test]
    fn snapshot_then_delta_tracks_best_levels() {
        let mut book = test_book();
        book.load_snapshot(100, 1, &levels(&[(10, 2), (9, 1)]), &levels(&[(11, 3)]));
        assert_eq!(book.best_bid().unwrap().price, dec!(10));
        assert_eq!(book.best_ask().unwrap().price, dec!(11));

        book.apply_delta(101, None, 2, &levels(&[(10, 0)]), &levels(&[(12, 1)]))
            .unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(9));
        assert_eq!(book.last_seq(), 101);
    }

    #[test]
    fn stale_sequence_is_rejected_without_mutation() {
        let mut book = test_book();
        book.load_snapshot(100, 1, &levels(&[(10, 2)]), &levels(&[(11, 3)]));
        let err = book
            .apply_delta(100, None, 2, &levels(&[(10, 0)]), &[])
            .unwrap_err();
        assert_eq!(
            err,
            BookUpdateError::StaleSequence {
                seq: 100,
                current: 100
            }
        );
        assert_eq!(book.best_bid().unwrap().price, dec!(10));
    }

    #[test]
    fn gap_is_signalled_before_applying() {
        let mut book = test_book();
        book.load_snapshot(100, 1, &levels(&[(10, 2)]), &levels(&[(11, 3)]));
        let err = book
            .apply_delta(104, None, 2, &levels(&[(10, 0)]), &[])
            .unwrap_err();
        assert!(matches!(err, BookUpdateError::SequenceGap { seq: 104, .. }));
        assert_eq!(book.last_seq(), 100);
        assert_eq!(book.best_bid().unwrap().price, dec!(10));
    }

    #[test]
    fn explicit_predecessor_overrides_contiguity() {
        let mut book = test_book();
        book.load_snapshot(100, 1, &levels(&[(10, 2)]), &levels(&[(11, 3)]));
        // Non-contiguous sequence is fine when the predecessor matches.
        book.apply_delta(150, Some(100), 2, &levels(&[(9, 1)]), &[])
            .unwrap();
        // Matching the contiguity rule is not enough when the
        // predecessor link disagrees.
        let err = book
            .apply_delta(151, Some(149), 3, &levels(&[(8, 1)]), &[])
            .unwrap_err();
        assert!(matches!(err, BookUpdateError::SequenceGap { .. }));
    }

    #[test]
    fn crossed_book_is_flagged_and_resolvable() {
        let mut book = test_book();
        book.load_snapshot(100, 1, &levels(&[(10, 1)]), &levels(&[(11, 1)]));
        let err = book
            .apply_delta(101, None, 2, &levels(&[(12, 1)]), &[])
            .unwrap_err();
        assert!(matches!(err, BookUpdateError::Crossed { .. }));
        assert!(book.is_crossed());

        // A later delta removing the offending bid uncrosses the book.
        book.apply_delta(102, None, 3, &levels(&[(12, 0)]), &[]).unwrap();
        assert!(!book.is_crossed());
    }

    #[test]
    fn snapshot_clears_crossed_flag() {
        let mut book = test_book();
        book.load_snapshot(100, 1, &levels(&[(12, 1)]), &levels(&[(11, 1)]));
        assert!(book.is_crossed());
        book.load_snapshot(200, 2, &levels(&[(10, 1)]), &levels(&[(11, 1)]));
        assert!(!book.is_crossed());
        assert_eq!(book.last_seq(), 200);
    }

    #[test]
    fn checksum_reflects_depth() {
        let mut book = test_book();
        book.load_snapshot(1, 1, &levels(&[(10, 1), (9, 2)]), &levels(&[(11, 1), (12, 2)]));
        assert_ne!(book.checksum(2), book.checksum(1));
        assert_eq!(book.checksum(0), 0);
    }
}
