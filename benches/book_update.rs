/// Order book update latency benchmarks

use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ticker_plant::{
    BookSnapshot, DeltaEvent, FeedMessage, MemorySink, OrderBook, PlantConfig, Price, PriceLevel, PublisherSink,
    Side, TickerPlant,
};

const CENT: u64 = 1_000_000;

fn populated_book(levels: u64) -> OrderBook {
    let mut book = OrderBook::new();
    for i in 0..levels {
        book.apply_delta(Side::Bid, Price((49 - i % 49) * CENT), 100).unwrap();
        book.apply_delta(Side::Ask, Price((51 + i % 49) * CENT), 100).unwrap();
    }
    book
}

fn bench_apply_delta(c: &mut Criterion) {
    c.bench_function("book_apply_delta", |b| {
        let mut book = populated_book(40);
        let mut i = 0u64;
        b.iter(|| {
            let price = Price((10 + i % 40) * CENT);
            let size_delta = if i % 2 == 0 { 25 } else { -25 };
            let _ = book.apply_delta(Side::Bid, black_box(price), size_delta);
            i += 1;
        });
    });
}

fn bench_best_bid(c: &mut Criterion) {
    let book = populated_book(100);
    c.bench_function("book_best_bid", |b| b.iter(|| black_box(book.best_bid())));
}

fn bench_top_of_book(c: &mut Criterion) {
    let book = populated_book(100);
    c.bench_function("book_top_of_book", |b| b.iter(|| black_box(book.top_of_book())));
}

fn bench_depth(c: &mut Criterion) {
    let book = populated_book(100);
    c.bench_function("book_depth_10", |b| b.iter(|| black_box(book.depth(10))));
}

fn bench_snapshot_reset(c: &mut Criterion) {
    let snapshot = BookSnapshot {
        instrument: "KXBTC".into(),
        sequence: 1,
        bids: (1..50).map(|c| PriceLevel::new(Price(c * CENT), 100 * c)).collect(),
        asks: (51..100).map(|c| PriceLevel::new(Price(c * CENT), 100 * c)).collect(),
        timestamp_ms: 0,
    };
    c.bench_function("book_reset_from_snapshot", |b| {
        let mut book = OrderBook::new();
        b.iter(|| book.reset(black_box(&snapshot)))
    });
}

fn bench_plant_handle(c: &mut Criterion) {
    c.bench_function("plant_handle_delta", |b| {
        let sink = Arc::new(MemorySink::new("memory"));
        let mut plant = TickerPlant::new(PlantConfig::default(), vec![sink.clone() as Arc<dyn PublisherSink>]);
        let now = Instant::now();
        let mut seq = 0u64;
        b.iter_batched(
            || {
                seq += 1;
                let (side, base) = if seq % 2 == 0 { (Side::Bid, 40) } else { (Side::Ask, 60) };
                FeedMessage::OrderbookDelta(DeltaEvent {
                    instrument: "KXBTC".into(),
                    side,
                    price: Price((base + seq % 5) * CENT),
                    size_delta: 10,
                    sequence: seq,
                    timestamp_ms: seq,
                })
            },
            |msg| {
                let _ = plant.handle(msg, now);
                if sink.len() > 100_000 {
                    sink.clear();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_apply_delta,
    bench_best_bid,
    bench_top_of_book,
    bench_depth,
    bench_snapshot_reset,
    bench_plant_handle
);
criterion_main!(benches);
