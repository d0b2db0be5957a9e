/// Property tests for book maintenance and resync

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use proptest::prelude::*;
use ticker_plant::{
    BookSnapshot, DeltaEvent, Disposition, FeedMessage, MemorySink, OrderBook, PlantConfig, Price, PriceLevel,
    PublisherSink, Side, TickerPlant,
};

const CENT: u64 = 1_000_000;

fn side_of(bid: bool) -> Side {
    if bid {
        Side::Bid
    } else {
        Side::Ask
    }
}

fn make_delta(seq: u64, (bid, cents, size_delta): (bool, u64, i64)) -> DeltaEvent {
    DeltaEvent {
        instrument: "P".into(),
        side: side_of(bid),
        price: Price(cents * CENT),
        size_delta,
        sequence: seq,
        timestamp_ms: seq,
    }
}

fn delta_strategy() -> impl Strategy<Value = (bool, u64, i64)> {
    (any::<bool>(), 1u64..20, -60i64..120)
}

fn full_depth(book: &OrderBook) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
    let depth = book.depth(usize::MAX);
    (depth.bids, depth.asks)
}

proptest! {
    #[test]
    fn level_sizes_follow_clamped_sums(steps in prop::collection::vec(delta_strategy(), 1..200)) {
        let mut book = OrderBook::new();
        let mut model: BTreeMap<(bool, u64), i64> = BTreeMap::new();

        for (i, step) in steps.iter().enumerate() {
            let _ = book.apply(&make_delta(i as u64 + 1, *step));
            let (bid, cents, size_delta) = *step;
            let entry = model.entry((bid, cents)).or_insert(0);
            *entry = (*entry + size_delta).max(0);
        }

        for ((bid, cents), size) in model {
            let expected = if size > 0 { Some(size as u64) } else { None };
            prop_assert_eq!(book.level(side_of(bid), Price(cents * CENT)), expected);
        }
    }

    #[test]
    fn crossed_iff_bid_at_or_above_ask(steps in prop::collection::vec(delta_strategy(), 1..100)) {
        let mut book = OrderBook::new();
        for (i, step) in steps.iter().enumerate() {
            let _ = book.apply(&make_delta(i as u64 + 1, *step));

            let expected = match (book.best_bid(), book.best_ask()) {
                (Some(b), Some(a)) => b.price >= a.price,
                _ => false,
            };
            prop_assert_eq!(book.is_crossed(), expected);
            if let Some(spread) = book.spread() {
                prop_assert_eq!(spread < 0, expected && book.best_bid().map(|b| b.price) != book.best_ask().map(|a| a.price));
            }
        }
    }

    #[test]
    fn bbo_published_iff_top_changes(steps in prop::collection::vec(delta_strategy(), 1..150)) {
        let sink = Arc::new(MemorySink::new("memory"));
        let mut plant = TickerPlant::new(PlantConfig::default(), vec![sink.clone() as Arc<dyn PublisherSink>]);
        let mut reference = OrderBook::new();
        let mut last_top = (None, None);
        let mut changes = 0;
        let now = Instant::now();

        for (i, step) in steps.iter().enumerate() {
            let delta = make_delta(i as u64 + 1, *step);
            let _ = reference.apply(&delta);
            let top = reference.top_of_book();
            let changed = top != last_top;
            if changed {
                changes += 1;
                last_top = top;
            }

            let disposition = plant.handle(FeedMessage::OrderbookDelta(delta), now).unwrap();
            prop_assert_eq!(disposition, Disposition::Applied { bbo_changed: changed });
        }
        prop_assert_eq!(sink.bbos().len(), changes);
    }

    /// Snapshot at `k` plus replay of the buffered tail ends in the same book
    /// as applying every delta in order.
    #[test]
    fn resync_matches_in_order_application(
        steps in prop::collection::vec(delta_strategy(), 4..120),
        cut in 0.0f64..1.0,
        gap_span in 0.0f64..1.0,
        snap_span in 0.0f64..1.0,
    ) {
        let n = steps.len() as u64;
        let deltas: Vec<DeltaEvent> = steps.iter().enumerate().map(|(i, s)| make_delta(i as u64 + 1, *s)).collect();

        // Last in-order sequence j, first post-gap arrival m (> j + 1), snapshot at k (>= m - 1)
        let j = 1 + ((n - 3) as f64 * cut) as u64;
        let m = j + 2 + ((n - j - 2) as f64 * gap_span) as u64;
        let k = (m - 1) + ((n - (m - 1)) as f64 * snap_span) as u64;

        let mut in_order = OrderBook::new();
        let mut at_k = OrderBook::new();
        for d in &deltas {
            let _ = in_order.apply(d);
            if d.sequence <= k {
                let _ = at_k.apply(d);
            }
        }
        let (bids, asks) = full_depth(&at_k);

        let mut plant = TickerPlant::new(PlantConfig::default(), vec![]);
        let now = Instant::now();
        for d in deltas.iter().filter(|d| d.sequence <= j) {
            plant.handle(FeedMessage::OrderbookDelta(d.clone()), now).unwrap();
        }

        let mut request = None;
        for d in deltas.iter().filter(|d| d.sequence >= m) {
            if let Disposition::ResyncRequired(r) = plant.handle(FeedMessage::OrderbookDelta(d.clone()), now).unwrap() {
                prop_assert!(request.is_none());
                request = Some(r);
            }
        }
        let request = request.expect("arrival past the hole must request a snapshot");

        let snapshot = BookSnapshot { instrument: "P".into(), sequence: k, bids, asks, timestamp_ms: 0 };
        let outcome = plant.apply_snapshot(snapshot, request.generation, now).unwrap();
        prop_assert!(outcome.regapped.is_none());
        prop_assert_eq!(outcome.replayed as u64, n - k);

        let depth = plant.depth("P", usize::MAX).unwrap();
        prop_assert_eq!((depth.bids, depth.asks), full_depth(&in_order));
    }
}
