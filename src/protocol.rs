//! Feed message model
//!
//! Prices are fixed-point `u64` scaled by 10^8, the same representation the
//! binary wire frames carry. JSON payloads carry decimal prices and are
//! converted on the way in.
//!
//! Binary frame header: 4 bytes
//!   - msg_type: u8 (1 byte)
//!   - length: u16 (2 bytes) - total frame length including header
//!   - instrument_len: u8 (1 byte) - followed by that many UTF-8 bytes

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const HEADER_SIZE: usize = 4;

/// Fixed-point scale: price * 10^8
pub const PRICE_SCALE: u64 = 100_000_000;

/// Trade body: price(8) quantity(8) timestamp(8) side(1) trade_id_len(1) + trade_id
pub const TRADE_BODY_SIZE: usize = 26;

/// Delta body: price(8) size_delta(8) sequence(8) timestamp(8) side(1)
pub const DELTA_BODY_SIZE: usize = 33;

/// Ticker body: last(8) bid(8) ask(8) volume(8) open_interest(8) timestamp(8)
/// A zero price means "not reported".
pub const TICKER_BODY_SIZE: usize = 48;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Trade = 1,
    OrderbookDelta = 2,
    Ticker = 3,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Trade),
            2 => Some(MessageType::OrderbookDelta),
            3 => Some(MessageType::Ticker),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Trade => "trade",
            MessageType::OrderbookDelta => "orderbook_delta",
            MessageType::Ticker => "ticker",
        }
    }
}

/// Book side. YES orders rest on the bid ladder and NO orders on the ask
/// ladder, so both spellings are accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "yes", alias = "buy")]
    Bid,
    #[serde(alias = "no", alias = "sell")]
    Ask,
}

impl Side {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Side::Bid),
            1 => Some(Side::Ask),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Side::Bid => 0,
            Side::Ask => 1,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Fixed-point price (value * 10^8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price(pub u64);

impl Price {
    pub const ZERO: Price = Price(0);

    /// Convert a decimal price to fixed-point, rejecting non-finite and
    /// negative values.
    pub fn from_f64(price: f64) -> Option<Self> {
        if !price.is_finite() || price < 0.0 {
            return None;
        }
        let scaled = (price * PRICE_SCALE as f64).round();
        if scaled > u64::MAX as f64 {
            return None;
        }
        Some(Price(scaled as u64))
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / PRICE_SCALE;
        let frac = self.0 % PRICE_SCALE;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:08}", frac);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

struct PriceVisitor;

impl<'de> Visitor<'de> for PriceVisitor {
    type Value = Price;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a finite, non-negative decimal price")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Price, E> {
        Price::from_f64(v).ok_or_else(|| E::custom(format!("invalid price {}", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Price, E> {
        v.checked_mul(PRICE_SCALE)
            .map(Price)
            .ok_or_else(|| E::custom(format!("price {} out of range", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Price, E> {
        if v < 0 {
            return Err(E::custom(format!("negative price {}", v)));
        }
        self.visit_u64(v as u64)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Price, E> {
        let parsed: f64 = v
            .trim()
            .parse()
            .map_err(|_| E::custom(format!("unparsable price {:?}", v)))?;
        self.visit_f64(parsed)
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PriceVisitor)
    }
}

/// One price level: aggregate resting size at a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub size: u64,
}

impl PriceLevel {
    pub fn new(price: Price, size: u64) -> Self {
        PriceLevel { price, size }
    }
}

/// Executed trade. Informational only, never touches the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(alias = "ticker", alias = "market_ticker")]
    pub instrument: String,
    #[serde(alias = "yes_price")]
    pub price: Price,
    #[serde(alias = "count")]
    pub quantity: u64,
    #[serde(alias = "taker_side")]
    pub aggressor_side: Side,
    pub trade_id: String,
    #[serde(rename = "timestamp", alias = "ts", default)]
    pub timestamp_ms: u64,
}

/// Signed size change at one price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEvent {
    #[serde(alias = "ticker", alias = "market_ticker")]
    pub instrument: String,
    pub side: Side,
    pub price: Price,
    #[serde(alias = "delta_size", alias = "delta")]
    pub size_delta: i64,
    #[serde(alias = "seq")]
    pub sequence: u64,
    #[serde(rename = "timestamp", alias = "ts")]
    pub timestamp_ms: u64,
}

/// Feed-published market summary. Its best bid/ask are the venue's view
/// and are never reconciled with the locally built book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    #[serde(alias = "ticker", alias = "market_ticker")]
    pub instrument: String,
    #[serde(default, alias = "price")]
    pub last_price: Option<Price>,
    #[serde(default, alias = "yes_bid")]
    pub best_bid: Option<Price>,
    #[serde(default, alias = "yes_ask")]
    pub best_ask: Option<Price>,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub open_interest: u64,
    #[serde(rename = "timestamp", alias = "ts", default)]
    pub timestamp_ms: u64,
}

/// Inbound feed message, discriminated by its declared `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Trade(TradeEvent),
    OrderbookDelta(DeltaEvent),
    Ticker(TickerEvent),
}

impl FeedMessage {
    pub fn instrument(&self) -> &str {
        match self {
            FeedMessage::Trade(m) => &m.instrument,
            FeedMessage::OrderbookDelta(m) => &m.instrument,
            FeedMessage::Ticker(m) => &m.instrument,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            FeedMessage::Trade(_) => MessageType::Trade,
            FeedMessage::OrderbookDelta(_) => MessageType::OrderbookDelta,
            FeedMessage::Ticker(_) => MessageType::Ticker,
        }
    }

    /// Sequence number, only carried by book deltas
    pub fn sequence(&self) -> Option<u64> {
        match self {
            FeedMessage::OrderbookDelta(m) => Some(m.sequence),
            _ => None,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            FeedMessage::Trade(m) => m.timestamp_ms,
            FeedMessage::OrderbookDelta(m) => m.timestamp_ms,
            FeedMessage::Ticker(m) => m.timestamp_ms,
        }
    }
}
