/// Router behaviour: sequencing, resync and top-of-book publication

use std::sync::Arc;
use std::time::{Duration, Instant};

use ticker_plant::{
    BookSnapshot, ChannelSink, DeltaEvent, Disposition, FeedError, FeedMessage, MemorySink, OrderBook, PlantConfig,
    PlantEvent, Price, PriceLevel, PublisherSink, ResyncReason, SequencePhase, Side, TickerEvent, TickerPlant,
    TradeEvent,
};

const CENT: u64 = 1_000_000;

fn delta(side: Side, cents: u64, size_delta: i64, seq: u64) -> FeedMessage {
    FeedMessage::OrderbookDelta(DeltaEvent {
        instrument: "KXBTC".into(),
        side,
        price: Price(cents * CENT),
        size_delta,
        sequence: seq,
        timestamp_ms: 1_000 + seq,
    })
}

fn level(cents: u64, size: u64) -> PriceLevel {
    PriceLevel::new(Price(cents * CENT), size)
}

fn new_plant() -> (TickerPlant, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new("memory"));
    let plant = TickerPlant::new(PlantConfig::default(), vec![sink.clone() as Arc<dyn PublisherSink>]);
    (plant, sink)
}

fn resync_request(disposition: Disposition) -> ticker_plant::ResyncRequest {
    match disposition {
        Disposition::ResyncRequired(request) => request,
        other => panic!("expected resync, got {:?}", other),
    }
}

#[test]
fn test_add_then_remove_leaves_no_level() {
    let (mut plant, _sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 68, 500, 1), now).unwrap();
    plant.handle(delta(Side::Bid, 68, -500, 2), now).unwrap();

    let depth = plant.depth("KXBTC", 5).unwrap();
    assert!(depth.bids.is_empty());
}

#[test]
fn test_gap_buffers_until_snapshot() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    for seq in 1..=3 {
        plant.handle(delta(Side::Bid, 60, 10, seq), now).unwrap();
    }

    let request = resync_request(plant.handle(delta(Side::Bid, 61, 10, 7), now).unwrap());
    assert_eq!(request.reason, ResyncReason::Gap { expected: 4, received: 7 });
    assert_eq!(plant.phase("KXBTC"), Some(SequencePhase::Resyncing));
    // 7 is held, not applied
    assert_eq!(sink.deltas().len(), 3);

    let snapshot = BookSnapshot {
        instrument: "KXBTC".into(),
        sequence: 6,
        bids: vec![level(60, 30)],
        asks: vec![],
        timestamp_ms: 0,
    };
    let outcome = plant.apply_snapshot(snapshot, request.generation, now).unwrap();
    assert_eq!(outcome.replayed, 1);

    let seqs: Vec<u64> = sink.deltas().iter().map(|d| d.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3, 7]);
    assert_eq!(plant.depth("KXBTC", 5).unwrap().bids[0], level(61, 10));
}

#[test]
fn test_gap_triggers_one_request_per_range() {
    let (mut plant, _sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 60, 10, 1), now).unwrap();

    let mut requests = 0;
    for seq in [5, 6, 9, 12] {
        if let Disposition::ResyncRequired(_) = plant.handle(delta(Side::Bid, 60, 1, seq), now).unwrap() {
            requests += 1;
        }
    }
    assert_eq!(requests, 1);
    assert_eq!(plant.stats().gap_events(), 1);
}

#[test]
fn test_crossed_book_detected() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Ask, 68, 100, 1), now).unwrap();
    plant.handle(delta(Side::Bid, 70, 100, 2), now).unwrap();

    assert_eq!(plant.is_crossed("KXBTC"), Some(true));
    let bbo = sink.bbos().pop().unwrap();
    assert_eq!(bbo.spread, Some(-((2 * CENT) as i64)));
}

#[test]
fn test_snapshot_discards_old_and_replays_in_order() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 66, 100, 40), now).unwrap();

    let request = resync_request(plant.handle(delta(Side::Bid, 67, 10, 48), now).unwrap());
    assert_eq!(plant.handle(delta(Side::Bid, 66, 50, 51), now).unwrap(), Disposition::Buffered);
    assert_eq!(plant.handle(delta(Side::Ask, 70, 300, 52), now).unwrap(), Disposition::Buffered);
    sink.clear();

    let snapshot = BookSnapshot {
        instrument: "KXBTC".into(),
        sequence: 50,
        bids: vec![level(66, 1000)],
        asks: vec![],
        timestamp_ms: 0,
    };
    let outcome = plant.apply_snapshot(snapshot, request.generation, now).unwrap();
    assert_eq!(outcome.snapshot_sequence, 50);
    assert_eq!(outcome.discarded, 1);
    assert_eq!(outcome.replayed, 2);

    let seqs: Vec<u64> = sink.deltas().iter().map(|d| d.sequence).collect();
    assert_eq!(seqs, vec![51, 52]);

    let depth = plant.depth("KXBTC", 5).unwrap();
    assert_eq!(depth.bids, vec![level(66, 1050)]);
    assert_eq!(depth.asks, vec![level(70, 300)]);

    // One BBO for the whole replay, after the deltas
    let events = sink.events();
    assert_eq!(sink.bbos().len(), 1);
    assert!(matches!(events.last(), Some(PlantEvent::Bbo(_))));
}

#[test]
fn test_replay_ignores_buffered_duplicates() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 66, 100, 40), now).unwrap();

    let request = resync_request(plant.handle(delta(Side::Bid, 67, 10, 48), now).unwrap());
    for (side, cents, size, seq) in [
        (Side::Bid, 66, 50, 51),
        (Side::Bid, 66, 50, 51),
        (Side::Ask, 70, 300, 52),
        (Side::Bid, 66, 50, 51),
        (Side::Bid, 67, 5, 49),
    ] {
        assert_eq!(plant.handle(delta(side, cents, size, seq), now).unwrap(), Disposition::Buffered);
    }
    sink.clear();

    let snapshot = BookSnapshot {
        instrument: "KXBTC".into(),
        sequence: 50,
        bids: vec![level(66, 1000)],
        asks: vec![],
        timestamp_ms: 0,
    };
    let mut in_order = OrderBook::new();
    in_order.reset(&snapshot).unwrap();
    for msg in [delta(Side::Bid, 66, 50, 51), delta(Side::Ask, 70, 300, 52)] {
        if let FeedMessage::OrderbookDelta(d) = msg {
            in_order.apply(&d).unwrap();
        }
    }

    let outcome = plant.apply_snapshot(snapshot, request.generation, now).unwrap();
    assert_eq!(outcome.replayed, 2);
    assert_eq!(outcome.discarded, 2);
    assert_eq!(plant.stats().counters().duplicates, 2);

    // One forwarded delta per sequence
    let seqs: Vec<u64> = sink.deltas().iter().map(|d| d.sequence).collect();
    assert_eq!(seqs, vec![51, 52]);
    assert_eq!(plant.depth("KXBTC", 10).unwrap(), in_order.depth(10));
}

#[test]
fn test_typed_messages_are_validated() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();

    let trade = FeedMessage::Trade(TradeEvent {
        instrument: "KXBTC".into(),
        price: Price(0),
        quantity: 0,
        aggressor_side: Side::Bid,
        trade_id: String::new(),
        timestamp_ms: 1,
    });
    let err = plant.handle(trade, now).unwrap_err();
    assert_eq!(err.kind(), "malformed_message");

    let nameless = FeedMessage::OrderbookDelta(DeltaEvent {
        instrument: String::new(),
        side: Side::Bid,
        price: Price(60 * CENT),
        size_delta: 10,
        sequence: 1,
        timestamp_ms: 1,
    });
    assert!(matches!(plant.handle(nameless, now), Err(FeedError::MalformedMessage(_))));

    assert!(sink.is_empty());
    assert!(plant.instruments().is_empty());
    assert_eq!(plant.stats().counters().malformed, 2);
}

#[test]
fn test_unchanged_top_emits_once() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Ask, 70, 300, 1), now).unwrap();
    sink.clear();

    let first = plant.handle(delta(Side::Bid, 68, 500, 2), now).unwrap();
    // Deeper ask; top still (0.68/500, 0.70/300)
    let second = plant.handle(delta(Side::Ask, 72, 100, 3), now).unwrap();

    assert_eq!(first, Disposition::Applied { bbo_changed: true });
    assert_eq!(second, Disposition::Applied { bbo_changed: false });
    let bbos = sink.bbos();
    assert_eq!(bbos.len(), 1);
    assert_eq!(bbos[0].bid, Some(level(68, 500)));
    assert_eq!(bbos[0].ask, Some(level(70, 300)));
    assert_eq!(bbos[0].mid, Some(Price(69 * CENT)));
}

#[test]
fn test_size_change_at_top_is_a_change() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 68, 500, 1), now).unwrap();
    plant.handle(delta(Side::Bid, 68, 20, 2), now).unwrap();

    let bbos = sink.bbos();
    assert_eq!(bbos.len(), 2);
    assert_eq!(bbos[1].bid, Some(level(68, 520)));
}

#[test]
fn test_emptied_book_publishes_empty_top() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 68, 500, 1), now).unwrap();
    plant.handle(delta(Side::Bid, 68, -500, 2), now).unwrap();

    let last = sink.bbos().pop().unwrap();
    assert_eq!(last.bid, None);
    assert_eq!(last.ask, None);
}

#[test]
fn test_invalid_delta_is_clamped_and_forwarded() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Ask, 70, 300, 1), now).unwrap();
    let outcome = plant.handle(delta(Side::Ask, 70, -900, 2), now).unwrap();

    assert_eq!(outcome, Disposition::Applied { bbo_changed: true });
    assert!(plant.depth("KXBTC", 5).unwrap().asks.is_empty());
    assert_eq!(plant.stats().counters().invalid_deltas, 1);
    assert_eq!(sink.deltas().len(), 2);
}

#[test]
fn test_zero_price_delta_dropped() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    let err = plant.handle(delta(Side::Bid, 0, 10, 1), now).unwrap_err();

    assert!(matches!(err, FeedError::MalformedLevel { .. }));
    assert!(sink.is_empty());
    assert_eq!(plant.stats().counters().malformed_levels, 1);
}

#[test]
fn test_ticker_not_reconciled_with_book() {
    let (mut plant, sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 60, 100, 1), now).unwrap();

    let ticker = FeedMessage::Ticker(TickerEvent {
        instrument: "KXBTC".into(),
        last_price: Some(Price(65 * CENT)),
        best_bid: Some(Price(64 * CENT)),
        best_ask: Some(Price(66 * CENT)),
        volume: 10,
        open_interest: 0,
        timestamp_ms: 5,
    });
    assert_eq!(plant.handle(ticker, now).unwrap(), Disposition::Forwarded);
    assert_eq!(plant.bbo("KXBTC").unwrap().bid, Some(level(60, 100)));
    assert_eq!(sink.count("ticker"), 1);
    assert_eq!(sink.bbos().len(), 1);
}

#[test]
fn test_slow_sink_does_not_block_others() {
    let (slow, _rx) = ChannelSink::new("slow", 1);
    let slow = Arc::new(slow);
    let memory = Arc::new(MemorySink::new("memory"));
    let sinks: Vec<Arc<dyn PublisherSink>> = vec![slow.clone(), memory.clone()];
    let mut plant = TickerPlant::new(PlantConfig::default(), sinks);

    let now = Instant::now();
    for seq in 1..=5 {
        plant.handle(delta(Side::Bid, 50 + seq, 1, seq), now).unwrap();
    }

    assert_eq!(memory.deltas().len(), 5);
    assert!(slow.dropped() > 0);
    assert_eq!(plant.stats().counters().sink_errors, slow.dropped());
    assert_eq!(plant.depth("KXBTC", 10).unwrap().bids.len(), 5);
}

#[test]
fn test_unsubscribe_discards_pending_resync() {
    let (mut plant, _sink) = new_plant();
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 60, 10, 1), now).unwrap();
    let request = resync_request(plant.handle(delta(Side::Bid, 60, 10, 3), now).unwrap());

    assert!(plant.unsubscribe("KXBTC"));
    plant.subscribe(&["KXBTC".to_string()], now);
    assert_eq!(plant.phase("KXBTC"), Some(SequencePhase::Uninitialized));

    let snapshot = BookSnapshot {
        instrument: "KXBTC".into(),
        sequence: 2,
        bids: vec![],
        asks: vec![],
        timestamp_ms: 0,
    };
    let err = plant.apply_snapshot(snapshot, request.generation, now).unwrap_err();
    assert!(matches!(err, FeedError::StaleSnapshot { .. }));
}

#[test]
fn test_overflow_forces_fresh_request() {
    let config = PlantConfig {
        sequence_buffer_capacity: 2,
        ..PlantConfig::default()
    };
    let mut plant = TickerPlant::new(config, vec![]);
    let now = Instant::now();
    plant.handle(delta(Side::Bid, 60, 10, 1), now).unwrap();
    let first = resync_request(plant.handle(delta(Side::Bid, 60, 1, 5), now).unwrap());
    plant.handle(delta(Side::Bid, 60, 1, 6), now).unwrap();

    let second = resync_request(plant.handle(delta(Side::Bid, 60, 1, 7), now).unwrap());
    assert_eq!(second.reason, ResyncReason::Overflow { dropped: 2 });
    assert!(second.generation > first.generation);
    assert_eq!(plant.stats().counters().buffer_overflows, 1);
}

#[test]
fn test_liveness_report() {
    let (mut plant, _sink) = new_plant();
    let start = Instant::now();
    plant.subscribe(&["QUIET".to_string()], start);
    plant.handle(delta(Side::Bid, 60, 10, 1), start + Duration::from_secs(10)).unwrap();

    let reports = plant.check_liveness(start + Duration::from_secs(20));
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| !r.degraded));

    let reports = plant.check_liveness(start + Duration::from_secs(55));
    let busy = reports.iter().find(|r| r.instrument == "KXBTC").unwrap();
    assert!(busy.degraded);
    assert_eq!(busy.phase, SequencePhase::Live);
    assert_eq!(busy.idle, Duration::from_secs(45));

    // Never heard from: aged from the subscription
    let quiet = reports.iter().find(|r| r.instrument == "QUIET").unwrap();
    assert!(quiet.degraded);
    assert_eq!(quiet.phase, SequencePhase::Uninitialized);
    assert_eq!(quiet.idle, Duration::from_secs(55));
}
