//! Ticker Plant - Market Data Normalization and Fan-out
//!
//! Consumes a venue's market-data stream and keeps a consistent local view
//! per instrument:
//! - JSON and binary frame decoding
//! - Price-level order books maintained from sequenced deltas
//! - Sequence gap detection with snapshot resync and backoff
//! - Top-of-book change detection
//! - Non-blocking fan-out to downstream sinks
//! - Per-instrument lanes, liveness checks and statistics

pub mod protocol;
pub mod decoder;
pub mod book_builder;
pub mod sequencer;
pub mod recovery;
pub mod plant;
pub mod sink;
pub mod runtime;
pub mod config;
pub mod error;
pub mod stats;

pub use protocol::{DeltaEvent, FeedMessage, MessageType, Price, PriceLevel, Side, TickerEvent, TradeEvent};
pub use decoder::{DecodeError, Decoder};
pub use book_builder::{Bbo, BookDepth, BookError, OrderBook};
pub use sequencer::{FeedSequencer, SequencePhase, Verdict};
pub use recovery::{
    fetch_with_backoff, BackoffPolicy, BookSnapshot, MemorySnapshotSource, ResyncOutcome, ResyncReason,
    ResyncRequest, SnapshotError, SnapshotSource,
};
pub use plant::{Disposition, LivenessReport, TickerPlant};
pub use sink::{BboEvent, ChannelSink, MemorySink, PlantEvent, PublisherSink, SinkError};
pub use runtime::{PlantHandle, PlantRuntime};
pub use config::{ConfigError, PlantConfig, ResyncConfig};
pub use error::FeedError;
pub use stats::{Counters, FeedStats, LatencyStats};
