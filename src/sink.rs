//! Downstream fan-out boundary
//!
//! `publish` must return promptly: a sink that cannot keep up drops or
//! reports `Full`, it never blocks the book-mutation path.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::book_builder::{mid_of, spread_of};
use crate::protocol::{DeltaEvent, Price, PriceLevel, TickerEvent, TradeEvent};

/// Locally derived top of book, emitted when it changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BboEvent {
    pub instrument: String,
    pub bid: Option<PriceLevel>,
    pub ask: Option<PriceLevel>,
    pub mid: Option<Price>,
    pub spread: Option<i64>,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

impl BboEvent {
    pub fn from_top(
        instrument: &str,
        top: (Option<PriceLevel>, Option<PriceLevel>),
        timestamp_ms: u64,
    ) -> Self {
        let (bid, ask) = top;
        let (mid, spread) = match (bid, ask) {
            (Some(b), Some(a)) => (Some(mid_of(b.price, a.price)), Some(spread_of(b.price, a.price))),
            _ => (None, None),
        };
        BboEvent {
            instrument: instrument.to_string(),
            bid,
            ask,
            mid,
            spread,
            timestamp_ms,
        }
    }

    /// The value compared for change detection
    pub fn top(&self) -> (Option<PriceLevel>, Option<PriceLevel>) {
        (self.bid, self.ask)
    }
}

/// Normalized event published to sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlantEvent {
    Trade(TradeEvent),
    Delta(DeltaEvent),
    Ticker(TickerEvent),
    Bbo(BboEvent),
}

impl PlantEvent {
    pub fn instrument(&self) -> &str {
        match self {
            PlantEvent::Trade(e) => &e.instrument,
            PlantEvent::Delta(e) => &e.instrument,
            PlantEvent::Ticker(e) => &e.instrument,
            PlantEvent::Bbo(e) => &e.instrument,
        }
    }

    /// Channel name, as subscribers see it
    pub fn channel(&self) -> &'static str {
        match self {
            PlantEvent::Trade(_) => "trade",
            PlantEvent::Delta(_) => "orderbook_delta",
            PlantEvent::Ticker(_) => "ticker",
            PlantEvent::Bbo(_) => "bbo",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("queue full, event dropped")]
    Full,

    #[error("sink closed")]
    Closed,
}

pub trait PublisherSink: Send + Sync {
    fn name(&self) -> &str;

    /// Hand one event to the sink without blocking
    fn publish(&self, event: &PlantEvent) -> Result<(), SinkError>;
}

/// Bounded queue in front of an asynchronous consumer (durable writer,
/// multicast publisher). Overflow drops the event and counts it.
#[derive(Debug)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<PlantEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Returns the sink and the receiving end for the consumer task
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<PlantEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = ChannelSink {
            name: name.into(),
            tx,
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PublisherSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: &PlantEvent) -> Result<(), SinkError> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

const MEMORY_SINK_CAPACITY: usize = 1 << 20;

/// Collects events in memory for tests and benches. Past its capacity it
/// drops like a full queue.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    capacity: usize,
    events: Mutex<Vec<PlantEvent>>,
    dropped: AtomicU64,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, MEMORY_SINK_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        MemorySink {
            name: name.into(),
            capacity,
            events: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<PlantEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn bbos(&self) -> Vec<BboEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlantEvent::Bbo(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deltas(&self) -> Vec<DeltaEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlantEvent::Delta(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.events.lock().iter().filter(|e| e.channel() == channel).count()
    }
}

impl PublisherSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: &PlantEvent) -> Result<(), SinkError> {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(SinkError::Full);
        }
        events.push(event.clone());
        Ok(())
    }
}
