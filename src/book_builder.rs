//! Order book builder from incremental level deltas
//!
//! Maintains bid/ask ladders using BTreeMap for O(log n) price level operations.
//! Levels are aggregate size per price; a level whose size reaches zero is removed.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::protocol::{DeltaEvent, Price, PriceLevel, Side};
use crate::recovery::BookSnapshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// The delta would drive the level negative. The level has already been
    /// removed when this is returned.
    #[error("delta {delta} at {price} would drive size {current} below zero")]
    InvalidDelta { price: Price, current: u64, delta: i64 },

    #[error("malformed level at price {price}: {reason}")]
    MalformedLevel { price: Price, reason: &'static str },
}

/// Top of book with both sides present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bbo {
    pub bid: PriceLevel,
    pub ask: PriceLevel,
    pub mid: Price,
    pub spread: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookDepth {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Aggregated price ladder for one instrument
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    // price -> aggregate size at that price
    bids: BTreeMap<Price, u64>,
    asks: BTreeMap<Price, u64>,

    last_applied_sequence: u64,
    last_update_time: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        OrderBook::default()
    }

    fn ladder_mut(&mut self, side: Side) -> &mut BTreeMap<Price, u64> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn ladder(&self, side: Side) -> &BTreeMap<Price, u64> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Add `size_delta` to the level at `price`.
    ///
    /// A resulting size of zero removes the level. A negative result also
    /// removes it and reports `InvalidDelta` so the caller can flag the data
    /// quality problem; the book is left consistent either way.
    pub fn apply_delta(&mut self, side: Side, price: Price, size_delta: i64) -> Result<(), BookError> {
        if price.is_zero() {
            return Err(BookError::MalformedLevel {
                price,
                reason: "price must be positive",
            });
        }

        let ladder = self.ladder_mut(side);
        let current = ladder.get(&price).copied().unwrap_or(0);
        let new_size = current as i128 + size_delta as i128;

        if new_size <= 0 {
            ladder.remove(&price);
            if new_size < 0 {
                return Err(BookError::InvalidDelta {
                    price,
                    current,
                    delta: size_delta,
                });
            }
        } else {
            ladder.insert(price, new_size.min(u64::MAX as i128) as u64);
        }
        Ok(())
    }

    /// Apply a sequenced delta, recording its sequence and feed timestamp.
    /// Bookkeeping advances even when the delta was clamped.
    pub fn apply(&mut self, delta: &DeltaEvent) -> Result<(), BookError> {
        let result = self.apply_delta(delta.side, delta.price, delta.size_delta);
        if !matches!(result, Err(BookError::MalformedLevel { .. })) {
            self.last_applied_sequence = self.last_applied_sequence.max(delta.sequence);
            self.last_update_time = delta.timestamp_ms;
        }
        result
    }

    /// Replace both ladders with the snapshot contents.
    ///
    /// All levels are validated before anything is touched, so a rejected
    /// snapshot leaves the previous book intact.
    pub fn reset(&mut self, snapshot: &BookSnapshot) -> Result<(), BookError> {
        if let Some(bad) = snapshot
            .bids
            .iter()
            .chain(snapshot.asks.iter())
            .find(|l| l.price.is_zero())
        {
            return Err(BookError::MalformedLevel {
                price: bad.price,
                reason: "snapshot level price must be positive",
            });
        }

        let collect = |levels: &[PriceLevel]| {
            let mut ladder = BTreeMap::new();
            for level in levels.iter().filter(|l| l.size > 0) {
                let size: &mut u64 = ladder.entry(level.price).or_insert(0);
                *size = size.saturating_add(level.size);
            }
            ladder
        };

        self.bids = collect(&snapshot.bids);
        self.asks = collect(&snapshot.asks);
        self.last_applied_sequence = snapshot.sequence;
        self.last_update_time = snapshot.timestamp_ms;
        Ok(())
    }

    /// Drop all levels and bookkeeping
    pub fn clear(&mut self) {
        *self = OrderBook::default();
    }

    /// Best level on one side: highest bid or lowest ask
    pub fn best(&self, side: Side) -> Option<PriceLevel> {
        let entry = match side {
            Side::Bid => self.bids.iter().next_back(),
            Side::Ask => self.asks.iter().next(),
        };
        entry.map(|(&price, &size)| PriceLevel { price, size })
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.best(Side::Bid)
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.best(Side::Ask)
    }

    /// (best bid, best ask), each possibly absent
    pub fn top_of_book(&self) -> (Option<PriceLevel>, Option<PriceLevel>) {
        (self.best_bid(), self.best_ask())
    }

    pub fn bbo(&self) -> Option<Bbo> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some(Bbo {
            bid,
            ask,
            mid: mid_of(bid.price, ask.price),
            spread: spread_of(bid.price, ask.price),
        })
    }

    /// Best ask minus best bid in fixed-point units; negative when crossed
    pub fn spread(&self) -> Option<i64> {
        self.bbo().map(|b| b.spread)
    }

    pub fn mid(&self) -> Option<Price> {
        self.bbo().map(|b| b.mid)
    }

    /// True iff both sides are present and best bid >= best ask
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Get market depth: top n levels on each side, best first
    pub fn depth(&self, n: usize) -> BookDepth {
        let level = |(&price, &size): (&Price, &u64)| PriceLevel { price, size };
        BookDepth {
            bids: self.bids.iter().rev().take(n).map(level).collect(),
            asks: self.asks.iter().take(n).map(level).collect(),
        }
    }

    /// Size resting at one price, if the level exists
    pub fn level(&self, side: Side, price: Price) -> Option<u64> {
        self.ladder(side).get(&price).copied()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied_sequence
    }

    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }
}

pub(crate) fn mid_of(bid: Price, ask: Price) -> Price {
    Price(((bid.raw() as u128 + ask.raw() as u128) / 2) as u64)
}

pub(crate) fn spread_of(bid: Price, ask: Price) -> i64 {
    (ask.raw() as i128 - bid.raw() as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
