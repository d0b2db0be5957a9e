/// Synthetic market data feed generator
///
/// Creates order flow for a handful of instruments and writes binary frames
/// to a file, plus a `<file>.snapshots.json` sidecar holding each book's
/// final state for the replay demo's snapshot source.
///
/// Usage: feed_generator [output] [messages] [gap_every]
/// A non-zero `gap_every` drops roughly one delta in that many from the
/// output so the reader has to resync.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};

use rand::Rng;
use ticker_plant::{
    BookSnapshot, Decoder, DeltaEvent, FeedMessage, Price, PriceLevel, Side, TickerEvent, TradeEvent,
};

const INSTRUMENTS: [&str; 4] = ["KXBTC-25DEC31-B100000", "KXETH-25DEC31-B4000", "KXFED-26JAN", "KXCPI-26FEB"];
const CENT: u64 = 1_000_000;

#[derive(Default)]
struct SimBook {
    sequence: u64,
    bids: BTreeMap<u64, u64>, // cents -> size
    asks: BTreeMap<u64, u64>,
}

impl SimBook {
    fn ladder(&mut self, side: Side) -> &mut BTreeMap<u64, u64> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn snapshot(&self, instrument: &str) -> BookSnapshot {
        let levels = |ladder: &BTreeMap<u64, u64>| {
            ladder
                .iter()
                .map(|(&cents, &size)| PriceLevel::new(Price(cents * CENT), size))
                .collect()
        };
        BookSnapshot {
            instrument: instrument.to_string(),
            sequence: self.sequence,
            bids: levels(&self.bids),
            asks: levels(&self.asks),
            timestamp_ms: 0,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let output_path = if args.len() > 1 {
        args[1].clone()
    } else {
        "/tmp/ticker_feed.bin".to_string()
    };

    let message_count: usize = if args.len() > 2 {
        args[2].parse().unwrap_or(10000)
    } else {
        10000
    };

    let gap_every: u32 = if args.len() > 3 { args[3].parse().unwrap_or(0) } else { 0 };

    let mut output = BufWriter::new(File::create(&output_path)?);
    let mut rng = rand::thread_rng();
    let mut books: HashMap<&str, SimBook> = HashMap::new();
    let mut frame = Vec::with_capacity(128);
    let mut bytes = 0usize;
    let mut dropped = 0usize;
    let mut trade_id = 0u64;
    let start_ms = 1_700_000_000_000u64;

    println!("Generating {} messages to {}", message_count, output_path);

    for i in 0..message_count {
        let instrument = INSTRUMENTS[rng.gen_range(0..INSTRUMENTS.len())];
        let book = books.entry(instrument).or_default();
        let timestamp_ms = start_ms + i as u64;

        let msg = match rng.gen_range(0u8..10) {
            0 => {
                trade_id += 1;
                FeedMessage::Trade(TradeEvent {
                    instrument: instrument.to_string(),
                    price: Price(rng.gen_range(30u64..70) * CENT),
                    quantity: rng.gen_range(1u64..100),
                    aggressor_side: if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask },
                    trade_id: format!("t-{}", trade_id),
                    timestamp_ms,
                })
            }
            1 => FeedMessage::Ticker(TickerEvent {
                instrument: instrument.to_string(),
                last_price: Some(Price(rng.gen_range(30u64..70) * CENT)),
                best_bid: book.bids.keys().next_back().map(|c| Price(c * CENT)),
                best_ask: book.asks.keys().next().map(|c| Price(c * CENT)),
                volume: rng.gen_range(0u64..1_000_000),
                open_interest: rng.gen_range(0u64..100_000),
                timestamp_ms,
            }),
            _ => {
                // Bids rest below 50c, asks above, so the book stays uncrossed
                let side = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
                let cents = match side {
                    Side::Bid => rng.gen_range(30u64..50),
                    Side::Ask => rng.gen_range(51u64..71),
                };
                let ladder = book.ladder(side);
                let resting = ladder.get(&cents).copied().unwrap_or(0);
                let size_delta = if resting > 0 && rng.gen_bool(0.4) {
                    -(rng.gen_range(1..=resting) as i64)
                } else {
                    rng.gen_range(1i64..500)
                };
                let new_size = (resting as i64 + size_delta) as u64;
                if new_size == 0 {
                    ladder.remove(&cents);
                } else {
                    ladder.insert(cents, new_size);
                }
                book.sequence += 1;

                FeedMessage::OrderbookDelta(DeltaEvent {
                    instrument: instrument.to_string(),
                    side,
                    price: Price(cents * CENT),
                    size_delta,
                    sequence: book.sequence,
                    timestamp_ms,
                })
            }
        };

        if gap_every > 0 && msg.sequence().is_some() && rng.gen_ratio(1, gap_every) {
            dropped += 1;
            continue;
        }

        frame.clear();
        bytes += Decoder::encode(&msg, &mut frame)?;
        output.write_all(&frame)?;

        if i % 1000 == 0 && i > 0 {
            println!("Generated {} messages", i);
        }
    }
    output.flush()?;

    let snapshots: Vec<BookSnapshot> = books.iter().map(|(name, book)| book.snapshot(name)).collect();
    let snapshot_path = format!("{}.snapshots.json", output_path);
    serde_json::to_writer_pretty(File::create(&snapshot_path)?, &snapshots)?;

    println!("Feed generation complete: {} messages, {} deltas withheld", message_count - dropped, dropped);
    println!("File size: {} bytes", bytes);
    println!("Snapshots: {}", snapshot_path);

    Ok(())
}
