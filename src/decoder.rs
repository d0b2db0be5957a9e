//! Feed message decoder
//!
//! Two wire encodings land in the same `FeedMessage`:
//! - compact little-endian binary frames (see `protocol` for the layout)
//! - JSON objects discriminated by a `type` field, as the venue's
//!   WebSocket channel publishes them
//!
//! Every decoded message goes through `validate` so the router only ever
//! sees messages with their required fields present.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::protocol::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("truncated message: declared length {declared} exceeds buffer {actual}")]
    TruncatedMessage { declared: u16, actual: usize },

    #[error("invalid side: {0}")]
    InvalidSide(u8),

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field {field} too long for wire encoding: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed json payload: {0}")]
    Json(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e.to_string())
    }
}

/// Stateless feed decoder
pub struct Decoder;

impl Decoder {
    /// Declared length of the frame at the start of `buffer`, once its
    /// header is complete
    pub fn frame_length(buffer: &[u8]) -> Option<usize> {
        if buffer.len() < HEADER_SIZE {
            return None;
        }
        Some(LittleEndian::read_u16(&buffer[1..3]) as usize)
    }

    /// Parse a single binary frame from the start of `buffer`.
    /// Returns the message and the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> DecodeResult<(FeedMessage, usize)> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::BufferTooSmall {
                need: HEADER_SIZE,
                have: buffer.len(),
            });
        }

        let msg_type = buffer[0];
        let length = LittleEndian::read_u16(&buffer[1..3]) as usize;
        let instrument_len = buffer[3] as usize;

        let msg_type_enum =
            MessageType::from_u8(msg_type).ok_or(DecodeError::InvalidMessageType(msg_type))?;

        if length < HEADER_SIZE || length > buffer.len() {
            return Err(DecodeError::TruncatedMessage {
                declared: length as u16,
                actual: buffer.len(),
            });
        }

        let frame = &buffer[..length];
        let body_size = match msg_type_enum {
            MessageType::Trade => TRADE_BODY_SIZE,
            MessageType::OrderbookDelta => DELTA_BODY_SIZE,
            MessageType::Ticker => TICKER_BODY_SIZE,
        };
        let need = HEADER_SIZE + instrument_len + body_size;
        if frame.len() < need {
            return Err(DecodeError::BufferTooSmall {
                need,
                have: frame.len(),
            });
        }

        let instrument = read_str(&frame[HEADER_SIZE..HEADER_SIZE + instrument_len], "instrument")?;
        let body = &frame[HEADER_SIZE + instrument_len..];

        let msg = match msg_type_enum {
            MessageType::Trade => {
                let side = Side::from_u8(body[24]).ok_or(DecodeError::InvalidSide(body[24]))?;
                let id_len = body[25] as usize;
                if body.len() < TRADE_BODY_SIZE + id_len {
                    return Err(DecodeError::BufferTooSmall {
                        need: need + id_len,
                        have: frame.len(),
                    });
                }
                let trade_id = read_str(&body[TRADE_BODY_SIZE..TRADE_BODY_SIZE + id_len], "trade_id")?;
                FeedMessage::Trade(TradeEvent {
                    instrument,
                    price: Price(LittleEndian::read_u64(&body[0..8])),
                    quantity: LittleEndian::read_u64(&body[8..16]),
                    timestamp_ms: LittleEndian::read_u64(&body[16..24]),
                    aggressor_side: side,
                    trade_id,
                })
            }
            MessageType::OrderbookDelta => {
                let side = Side::from_u8(body[32]).ok_or(DecodeError::InvalidSide(body[32]))?;
                FeedMessage::OrderbookDelta(DeltaEvent {
                    instrument,
                    side,
                    price: Price(LittleEndian::read_u64(&body[0..8])),
                    size_delta: LittleEndian::read_i64(&body[8..16]),
                    sequence: LittleEndian::read_u64(&body[16..24]),
                    timestamp_ms: LittleEndian::read_u64(&body[24..32]),
                })
            }
            MessageType::Ticker => {
                let opt_price = |raw: u64| if raw == 0 { None } else { Some(Price(raw)) };
                FeedMessage::Ticker(TickerEvent {
                    instrument,
                    last_price: opt_price(LittleEndian::read_u64(&body[0..8])),
                    best_bid: opt_price(LittleEndian::read_u64(&body[8..16])),
                    best_ask: opt_price(LittleEndian::read_u64(&body[16..24])),
                    volume: LittleEndian::read_u64(&body[24..32]),
                    open_interest: LittleEndian::read_u64(&body[32..40]),
                    timestamp_ms: LittleEndian::read_u64(&body[40..48]),
                })
            }
        };

        Ok((validate(msg)?, length))
    }

    /// Decode a stream of frames from buffer.
    /// Calls callback for each message; stops on error or if callback returns false
    pub fn decode_stream<F>(buffer: &[u8], mut callback: F) -> DecodeResult<usize>
    where
        F: FnMut(FeedMessage) -> bool,
    {
        let mut offset = 0;
        let mut count = 0;

        while offset < buffer.len() {
            match Self::decode(&buffer[offset..]) {
                Ok((msg, consumed)) => {
                    offset += consumed;
                    count += 1;
                    if !callback(msg) {
                        break;
                    }
                }
                Err(DecodeError::BufferTooSmall { .. }) if buffer.len() - offset < HEADER_SIZE => {
                    break; // trailing partial header
                }
                Err(e) => return Err(e),
            }
        }

        Ok(count)
    }

    /// Decode one JSON payload, e.g. `{"type":"orderbook_delta","ticker":"X",...}`
    pub fn decode_json(payload: &[u8]) -> DecodeResult<FeedMessage> {
        let msg: FeedMessage = serde_json::from_slice(payload)?;
        validate(msg)
    }

    /// Append a binary frame for `msg` to `out`, returning the frame length
    pub fn encode(msg: &FeedMessage, out: &mut Vec<u8>) -> DecodeResult<usize> {
        let instrument = msg.instrument().as_bytes();
        if instrument.len() > u8::MAX as usize {
            return Err(DecodeError::FieldTooLong {
                field: "instrument",
                len: instrument.len(),
            });
        }

        let mut body = Vec::with_capacity(TICKER_BODY_SIZE);
        let mut scratch = [0u8; 8];
        let mut put_u64 = |body: &mut Vec<u8>, v: u64| {
            LittleEndian::write_u64(&mut scratch, v);
            body.extend_from_slice(&scratch);
        };

        match msg {
            FeedMessage::Trade(t) => {
                let id = t.trade_id.as_bytes();
                if id.len() > u8::MAX as usize {
                    return Err(DecodeError::FieldTooLong {
                        field: "trade_id",
                        len: id.len(),
                    });
                }
                put_u64(&mut body, t.price.raw());
                put_u64(&mut body, t.quantity);
                put_u64(&mut body, t.timestamp_ms);
                body.push(t.aggressor_side.as_u8());
                body.push(id.len() as u8);
                body.extend_from_slice(id);
            }
            FeedMessage::OrderbookDelta(d) => {
                put_u64(&mut body, d.price.raw());
                put_u64(&mut body, d.size_delta as u64);
                put_u64(&mut body, d.sequence);
                put_u64(&mut body, d.timestamp_ms);
                body.push(d.side.as_u8());
            }
            FeedMessage::Ticker(t) => {
                let raw = |p: Option<Price>| p.map(|p| p.raw()).unwrap_or(0);
                put_u64(&mut body, raw(t.last_price));
                put_u64(&mut body, raw(t.best_bid));
                put_u64(&mut body, raw(t.best_ask));
                put_u64(&mut body, t.volume);
                put_u64(&mut body, t.open_interest);
                put_u64(&mut body, t.timestamp_ms);
            }
        }

        let length = HEADER_SIZE + instrument.len() + body.len();
        if length > u16::MAX as usize {
            return Err(DecodeError::FieldTooLong { field: "frame", len: length });
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0] = msg.message_type() as u8;
        LittleEndian::write_u16(&mut header[1..3], length as u16);
        header[3] = instrument.len() as u8;

        out.extend_from_slice(&header);
        out.extend_from_slice(instrument);
        out.extend_from_slice(&body);
        Ok(length)
    }
}

fn read_str(bytes: &[u8], field: &'static str) -> DecodeResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8 { field })
}

/// Check required fields and normalise "not reported" ticker prices.
pub fn validate(msg: FeedMessage) -> DecodeResult<FeedMessage> {
    if msg.instrument().trim().is_empty() {
        return Err(DecodeError::MissingField("instrument"));
    }
    match msg {
        FeedMessage::Trade(t) => {
            if t.trade_id.is_empty() {
                return Err(DecodeError::MissingField("trade_id"));
            }
            if t.price.is_zero() {
                return Err(DecodeError::InvalidField {
                    field: "price",
                    reason: "trade price must be positive".into(),
                });
            }
            if t.quantity == 0 {
                return Err(DecodeError::InvalidField {
                    field: "quantity",
                    reason: "trade quantity must be positive".into(),
                });
            }
            Ok(FeedMessage::Trade(t))
        }
        FeedMessage::OrderbookDelta(d) => Ok(FeedMessage::OrderbookDelta(d)),
        FeedMessage::Ticker(mut t) => {
            let reported = |p: Option<Price>| p.filter(|p| !p.is_zero());
            t.last_price = reported(t.last_price);
            t.best_bid = reported(t.best_bid);
            t.best_ask = reported(t.best_ask);
            Ok(FeedMessage::Ticker(t))
        }
    }
}
