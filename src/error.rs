//! Error taxonomy seen at the router boundary
//!
//! Nothing here stops other instruments from being processed. Only
//! `InstrumentUnknown` ends an instrument's subscription.

use thiserror::Error;

use crate::book_builder::BookError;
use crate::decoder::DecodeError;
use crate::protocol::Price;
use crate::recovery::SnapshotError;
use crate::sink::SinkError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] DecodeError),

    #[error("sequence gap on {instrument}: expected {expected}, received {received}")]
    SequenceGap {
        instrument: String,
        expected: u64,
        received: u64,
    },

    #[error("snapshot unavailable for {instrument}: {reason}")]
    SnapshotUnavailable { instrument: String, reason: String },

    #[error("invalid delta on {instrument}: {delta} at {price} with {current} resting")]
    InvalidDelta {
        instrument: String,
        price: Price,
        current: u64,
        delta: i64,
    },

    #[error("malformed level on {instrument} at {price}: {reason}")]
    MalformedLevel {
        instrument: String,
        price: Price,
        reason: &'static str,
    },

    #[error("sink {sink} unavailable: {reason}")]
    SinkUnavailable { sink: String, reason: String },

    #[error("instrument unknown: {0}")]
    InstrumentUnknown(String),

    #[error("stale snapshot for {instrument}: generation {received}, current {current}")]
    StaleSnapshot {
        instrument: String,
        received: u64,
        current: u64,
    },

    #[error("processing lane closed")]
    LaneClosed,
}

impl FeedError {
    pub fn from_book(instrument: &str, err: BookError) -> Self {
        match err {
            BookError::InvalidDelta { price, current, delta } => FeedError::InvalidDelta {
                instrument: instrument.to_string(),
                price,
                current,
                delta,
            },
            BookError::MalformedLevel { price, reason } => FeedError::MalformedLevel {
                instrument: instrument.to_string(),
                price,
                reason,
            },
        }
    }

    pub fn from_snapshot(instrument: &str, err: SnapshotError) -> Self {
        match err {
            SnapshotError::Unavailable(reason) => FeedError::SnapshotUnavailable {
                instrument: instrument.to_string(),
                reason,
            },
            SnapshotError::InstrumentUnknown(_) => FeedError::InstrumentUnknown(instrument.to_string()),
        }
    }

    pub fn from_sink(sink: &str, err: SinkError) -> Self {
        FeedError::SinkUnavailable {
            sink: sink.to_string(),
            reason: err.to_string(),
        }
    }

    /// True when the instrument's subscription cannot continue
    pub fn is_fatal_for_instrument(&self) -> bool {
        matches!(self, FeedError::InstrumentUnknown(_))
    }

    /// Short label for counters and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::MalformedMessage(_) => "malformed_message",
            FeedError::SequenceGap { .. } => "sequence_gap",
            FeedError::SnapshotUnavailable { .. } => "snapshot_unavailable",
            FeedError::InvalidDelta { .. } => "invalid_delta",
            FeedError::MalformedLevel { .. } => "malformed_level",
            FeedError::SinkUnavailable { .. } => "sink_unavailable",
            FeedError::InstrumentUnknown(_) => "instrument_unknown",
            FeedError::StaleSnapshot { .. } => "stale_snapshot",
            FeedError::LaneClosed => "lane_closed",
        }
    }
}
