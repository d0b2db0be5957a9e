//! Ticker plant router
//!
//! Owns one order book and one sequencer per instrument. Deltas are
//! sequenced, applied, and compared against the last published top of book;
//! trades and tickers pass straight through. Everything accepted is fanned
//! out to every registered sink.
//!
//! The plant itself never waits: when a snapshot is needed it returns
//! `Disposition::ResyncRequired` and the caller fetches it, then hands it
//! back through `apply_snapshot`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::book_builder::{BookDepth, BookError, OrderBook};
use crate::config::PlantConfig;
use crate::decoder::{validate, Decoder};
use crate::error::FeedError;
use crate::protocol::{DeltaEvent, FeedMessage, PriceLevel, TickerEvent, TradeEvent};
use crate::recovery::{BookSnapshot, ResyncOutcome, ResyncReason, ResyncRequest, SnapshotError};
use crate::sequencer::{FeedSequencer, SequencePhase, Verdict};
use crate::sink::{BboEvent, PlantEvent, PublisherSink, SinkError};
use crate::stats::FeedStats;

type TopOfBook = (Option<PriceLevel>, Option<PriceLevel>);

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Delta applied to the book
    Applied { bbo_changed: bool },
    /// Delta already seen; dropped without touching the book
    Duplicate,
    /// Delta held while the instrument resyncs
    Buffered,
    /// A snapshot must be fetched for the instrument
    ResyncRequired(ResyncRequest),
    /// Trade or ticker passed through
    Forwarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub instrument: String,
    pub phase: SequencePhase,
    /// Time since the last message, or since tracking began if none arrived
    pub idle: Duration,
    pub degraded: bool,
    pub buffered: usize,
}

#[derive(Debug)]
struct InstrumentState {
    book: OrderBook,
    sequencer: FeedSequencer,
    last_bbo: Option<BboEvent>,
    last_message: Option<Instant>,
    tracked_since: Instant,
    // set by the liveness check; cleared only by resubscribing
    idle: bool,
    // set when a snapshot could not be obtained; cleared by the next resync
    snapshot_missing: bool,
    // generation of the snapshot request currently outstanding
    generation: u64,
}

impl InstrumentState {
    fn new(buffer_capacity: usize, tracked_since: Instant) -> Self {
        InstrumentState {
            book: OrderBook::new(),
            sequencer: FeedSequencer::new(buffer_capacity),
            last_bbo: None,
            last_message: None,
            tracked_since,
            idle: false,
            snapshot_missing: false,
            generation: 0,
        }
    }

    fn degraded(&self) -> bool {
        self.idle || self.snapshot_missing
    }

    fn last_top(&self) -> TopOfBook {
        self.last_bbo.as_ref().map(BboEvent::top).unwrap_or((None, None))
    }
}

pub struct TickerPlant {
    config: PlantConfig,
    instruments: HashMap<String, InstrumentState>,
    failed: HashSet<String>,
    sinks: Vec<Arc<dyn PublisherSink>>,
    stats: FeedStats,
    next_generation: u64,
}

impl TickerPlant {
    pub fn new(config: PlantConfig, sinks: Vec<Arc<dyn PublisherSink>>) -> Self {
        TickerPlant {
            config,
            instruments: HashMap::new(),
            failed: HashSet::new(),
            sinks,
            stats: FeedStats::new(),
            next_generation: 1,
        }
    }

    /// Decode a JSON payload and route it
    pub fn handle_json(&mut self, payload: &[u8], received_at: Instant) -> Result<Disposition, FeedError> {
        self.stats.record_message(payload.len());
        let started = Instant::now();
        let decoded = Decoder::decode_json(payload);
        self.stats.record_decode_latency(started.elapsed().as_micros() as u64);
        match decoded {
            Ok(msg) => self.route(msg, received_at),
            Err(e) => Err(self.malformed(e.into())),
        }
    }

    /// Decode one binary frame and route it
    pub fn handle_frame(&mut self, frame: &[u8], received_at: Instant) -> Result<Disposition, FeedError> {
        let started = Instant::now();
        let decoded = Decoder::decode(frame);
        self.stats.record_decode_latency(started.elapsed().as_micros() as u64);
        match decoded {
            Ok((msg, consumed)) => {
                self.stats.record_message(consumed);
                self.route(msg, received_at)
            }
            Err(e) => {
                self.stats.record_message(frame.len());
                Err(self.malformed(e.into()))
            }
        }
    }

    /// Route an already decoded message
    pub fn handle(&mut self, msg: FeedMessage, received_at: Instant) -> Result<Disposition, FeedError> {
        self.handle_sized(msg, 0, received_at)
    }

    /// Route a message decoded elsewhere, counting its wire size
    pub fn handle_sized(
        &mut self,
        msg: FeedMessage,
        wire_size: usize,
        received_at: Instant,
    ) -> Result<Disposition, FeedError> {
        self.stats.record_message(wire_size);
        self.route(msg, received_at)
    }

    fn malformed(&mut self, err: FeedError) -> FeedError {
        self.stats.counters_mut().malformed += 1;
        warn!(error = %err, "dropping malformed feed message");
        err
    }

    fn route(&mut self, msg: FeedMessage, received_at: Instant) -> Result<Disposition, FeedError> {
        let msg = match validate(msg) {
            Ok(msg) => msg,
            Err(e) => return Err(self.malformed(e.into())),
        };
        if self.failed.contains(msg.instrument()) {
            return Err(FeedError::InstrumentUnknown(msg.instrument().to_string()));
        }
        if !self.instruments.contains_key(msg.instrument()) {
            self.track(msg.instrument(), received_at);
        }
        match msg {
            FeedMessage::OrderbookDelta(delta) => self.handle_delta(delta, received_at),
            FeedMessage::Trade(trade) => Ok(self.forward_trade(trade, received_at)),
            FeedMessage::Ticker(ticker) => Ok(self.forward_ticker(ticker, received_at)),
        }
    }

    fn track(&mut self, instrument: &str, at: Instant) {
        debug!(instrument, "tracking new instrument");
        self.instruments.insert(
            instrument.to_string(),
            InstrumentState::new(self.config.sequence_buffer_capacity, at),
        );
    }

    fn forward_trade(&mut self, trade: TradeEvent, received_at: Instant) -> Disposition {
        if let Some(state) = self.instruments.get_mut(&trade.instrument) {
            state.last_message = Some(received_at);
        }
        self.stats.counters_mut().trades += 1;
        publish(&self.sinks, &mut self.stats, &PlantEvent::Trade(trade));
        Disposition::Forwarded
    }

    fn forward_ticker(&mut self, ticker: TickerEvent, received_at: Instant) -> Disposition {
        if let Some(state) = self.instruments.get_mut(&ticker.instrument) {
            state.last_message = Some(received_at);
        }
        self.stats.counters_mut().tickers += 1;
        publish(&self.sinks, &mut self.stats, &PlantEvent::Ticker(ticker));
        Disposition::Forwarded
    }

    fn handle_delta(&mut self, delta: DeltaEvent, received_at: Instant) -> Result<Disposition, FeedError> {
        let TickerPlant {
            instruments,
            sinks,
            stats,
            next_generation,
            ..
        } = self;
        let Some(state) = instruments.get_mut(&delta.instrument) else {
            return Err(FeedError::InstrumentUnknown(delta.instrument));
        };
        state.last_message = Some(received_at);
        let instrument = delta.instrument.clone();

        match state.sequencer.classify(delta) {
            Verdict::Accept(delta) => {
                apply_accepted(&instrument, state, delta, sinks, stats)?;
                let bbo_changed = publish_bbo_if_changed(&instrument, state, sinks, stats);
                Ok(Disposition::Applied { bbo_changed })
            }
            Verdict::Stale { expected, received } => {
                stats.counters_mut().duplicates += 1;
                debug!(instrument = %instrument, expected, received, "dropping stale delta");
                Ok(Disposition::Duplicate)
            }
            Verdict::Buffered => {
                stats.counters_mut().buffered += 1;
                Ok(Disposition::Buffered)
            }
            Verdict::Gap { expected, received } => {
                let reason = ResyncReason::Gap { expected, received };
                let request = open_resync(&instrument, state, reason, stats, next_generation);
                Ok(Disposition::ResyncRequired(request))
            }
            Verdict::Overflow { dropped } => {
                let reason = ResyncReason::Overflow { dropped };
                let request = open_resync(&instrument, state, reason, stats, next_generation);
                Ok(Disposition::ResyncRequired(request))
            }
        }
    }

    /// Rebase `snapshot.instrument` on a fetched snapshot and replay the
    /// buffered deltas newer than it.
    ///
    /// `generation` must match the outstanding request; answers to
    /// superseded or cancelled requests are rejected as stale.
    pub fn apply_snapshot(
        &mut self,
        snapshot: BookSnapshot,
        generation: u64,
        received_at: Instant,
    ) -> Result<ResyncOutcome, FeedError> {
        let TickerPlant {
            instruments,
            failed,
            sinks,
            stats,
            next_generation,
            ..
        } = self;
        let instrument = snapshot.instrument.clone();

        if failed.contains(&instrument) {
            return Err(FeedError::InstrumentUnknown(instrument));
        }
        let state = match instruments.get_mut(&instrument) {
            Some(state)
                if state.generation == generation
                    && state.sequencer.phase() == SequencePhase::Resyncing =>
            {
                state
            }
            other => {
                stats.counters_mut().stale_snapshots += 1;
                let current = other.map(|s| s.generation).unwrap_or(0);
                debug!(instrument = %instrument, generation, current, "ignoring stale snapshot");
                return Err(FeedError::StaleSnapshot {
                    instrument,
                    received: generation,
                    current,
                });
            }
        };

        if let Err(e) = state.book.reset(&snapshot) {
            state.snapshot_missing = true;
            stats.counters_mut().malformed_levels += 1;
            stats.counters_mut().snapshot_failures += 1;
            warn!(instrument = %instrument, error = %e, "rejecting malformed snapshot");
            return Err(FeedError::from_book(&instrument, e));
        }

        let held = state.sequencer.buffered_len();
        let pending = state.sequencer.rebase(snapshot.sequence);
        let discarded = held - pending.len();
        let mut replayed = 0;
        let mut regapped = None;

        for delta in pending {
            match state.sequencer.classify(delta) {
                Verdict::Accept(delta) => {
                    if apply_accepted(&instrument, state, delta, sinks, stats).is_ok() {
                        replayed += 1;
                    }
                }
                Verdict::Stale { .. } => stats.counters_mut().duplicates += 1,
                Verdict::Buffered => {}
                Verdict::Gap { expected, received } => {
                    let reason = ResyncReason::Gap { expected, received };
                    regapped = Some(open_resync(&instrument, state, reason, stats, next_generation));
                }
                Verdict::Overflow { dropped } => {
                    let reason = ResyncReason::Overflow { dropped };
                    regapped = Some(open_resync(&instrument, state, reason, stats, next_generation));
                }
            }
        }

        state.last_message = Some(received_at);
        if regapped.is_none() {
            state.snapshot_missing = false;
            stats.counters_mut().resyncs_completed += 1;
            publish_bbo_if_changed(&instrument, state, sinks, stats);
            info!(
                instrument = %instrument,
                snapshot_sequence = snapshot.sequence,
                discarded,
                replayed,
                "resync complete"
            );
        }

        Ok(ResyncOutcome {
            instrument,
            snapshot_sequence: snapshot.sequence,
            discarded,
            replayed,
            regapped,
        })
    }

    /// Record that the snapshot for `generation` could not be obtained.
    ///
    /// `InstrumentUnknown` ends the subscription; anything else leaves the
    /// instrument resyncing and degraded until it is retried or resubscribed.
    pub fn snapshot_failed(&mut self, instrument: &str, generation: u64, err: SnapshotError) -> FeedError {
        let feed_err = FeedError::from_snapshot(instrument, err);
        match self.instruments.get_mut(instrument) {
            Some(state) if state.generation == generation => {}
            _ => {
                self.stats.counters_mut().stale_snapshots += 1;
                return feed_err;
            }
        }

        self.stats.counters_mut().snapshot_failures += 1;
        if feed_err.is_fatal_for_instrument() {
            self.fail_instrument(instrument);
        } else if let Some(state) = self.instruments.get_mut(instrument) {
            state.snapshot_missing = true;
            warn!(instrument, error = %feed_err, "snapshot unavailable, book suppressed");
        }
        feed_err
    }

    /// Open a fresh snapshot request for an instrument, superseding any
    /// outstanding one. Deltas already buffered are kept.
    pub fn request_resync(&mut self, instrument: &str) -> Option<ResyncRequest> {
        let TickerPlant {
            instruments,
            stats,
            next_generation,
            ..
        } = self;
        let state = instruments.get_mut(instrument)?;
        Some(open_resync(instrument, state, ResyncReason::Requested, stats, next_generation))
    }

    /// Stop tracking an instrument the venue does not know. Later messages
    /// for it are rejected until it is subscribed again.
    pub fn fail_instrument(&mut self, instrument: &str) {
        self.instruments.remove(instrument);
        self.failed.insert(instrument.to_string());
        self.stats.counters_mut().instruments_failed += 1;
        error!(instrument, "instrument unknown, subscription dropped");
    }

    /// Start (or restart) tracking instruments from a clean state.
    /// Liveness ages a silent instrument from `at`.
    pub fn subscribe(&mut self, instruments: &[String], at: Instant) {
        for instrument in instruments {
            self.failed.remove(instrument);
            self.instruments.insert(
                instrument.clone(),
                InstrumentState::new(self.config.sequence_buffer_capacity, at),
            );
            info!(instrument = %instrument, "subscribed");
        }
    }

    /// Forget an instrument; buffered deltas and any pending resync are discarded
    pub fn unsubscribe(&mut self, instrument: &str) -> bool {
        self.failed.remove(instrument);
        let removed = self.instruments.remove(instrument).is_some();
        if removed {
            info!(instrument, "unsubscribed");
        }
        removed
    }

    /// Last published top of book. Never derived from a book that is
    /// still waiting for a snapshot.
    pub fn bbo(&self, instrument: &str) -> Option<BboEvent> {
        self.instruments.get(instrument)?.last_bbo.clone()
    }

    /// Current depth, best first. None while the instrument is resyncing.
    pub fn depth(&self, instrument: &str, levels: usize) -> Option<BookDepth> {
        let state = self.instruments.get(instrument)?;
        if state.sequencer.phase() == SequencePhase::Resyncing {
            return None;
        }
        Some(state.book.depth(levels))
    }

    pub fn default_depth(&self, instrument: &str) -> Option<BookDepth> {
        self.depth(instrument, self.config.default_depth)
    }

    pub fn phase(&self, instrument: &str) -> Option<SequencePhase> {
        self.instruments.get(instrument).map(|s| s.sequencer.phase())
    }

    pub fn is_crossed(&self, instrument: &str) -> Option<bool> {
        self.instruments.get(instrument).map(|s| s.book.is_crossed())
    }

    pub fn instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instruments.keys().cloned().collect();
        names.sort();
        names
    }

    /// Flag instruments idle for longer than the staleness threshold.
    ///
    /// The flag is sticky: it is reported, not cleared by later traffic.
    /// Recovery is driven by resubscribing.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<LivenessReport> {
        let threshold = self.config.staleness_threshold();
        let mut reports = Vec::with_capacity(self.instruments.len());

        for (instrument, state) in self.instruments.iter_mut() {
            let since = state.last_message.unwrap_or(state.tracked_since);
            let idle = now.saturating_duration_since(since);
            if idle > threshold && !state.idle {
                state.idle = true;
                self.stats.counters_mut().degraded += 1;
                warn!(
                    instrument = %instrument,
                    idle_ms = idle.as_millis() as u64,
                    silent = state.last_message.is_none(),
                    "instrument degraded: no updates within staleness threshold"
                );
            }
            reports.push(LivenessReport {
                instrument: instrument.clone(),
                phase: state.sequencer.phase(),
                idle,
                degraded: state.degraded(),
                buffered: state.sequencer.buffered_len(),
            });
        }

        reports.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        reports
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    pub fn config(&self) -> &PlantConfig {
        &self.config
    }
}

fn apply_accepted(
    instrument: &str,
    state: &mut InstrumentState,
    delta: DeltaEvent,
    sinks: &[Arc<dyn PublisherSink>],
    stats: &mut FeedStats,
) -> Result<(), FeedError> {
    let started = Instant::now();
    match state.book.apply(&delta) {
        Ok(()) => {}
        Err(BookError::InvalidDelta { price, current, delta: size_delta }) => {
            stats.counters_mut().invalid_deltas += 1;
            warn!(
                instrument,
                sequence = delta.sequence,
                %price,
                current,
                size_delta,
                "delta drove level negative, level removed"
            );
        }
        Err(e @ BookError::MalformedLevel { .. }) => {
            stats.counters_mut().malformed_levels += 1;
            warn!(instrument, sequence = delta.sequence, error = %e, "dropping malformed delta");
            return Err(FeedError::from_book(instrument, e));
        }
    }
    stats.record_book_update_latency(started.elapsed().as_micros() as u64);
    stats.counters_mut().deltas_applied += 1;
    publish(sinks, stats, &PlantEvent::Delta(delta));
    Ok(())
}

fn publish_bbo_if_changed(
    instrument: &str,
    state: &mut InstrumentState,
    sinks: &[Arc<dyn PublisherSink>],
    stats: &mut FeedStats,
) -> bool {
    let top = state.book.top_of_book();
    if top == state.last_top() {
        return false;
    }
    let event = BboEvent::from_top(instrument, top, state.book.last_update_time());
    debug!(instrument, bid = ?event.bid, ask = ?event.ask, "top of book changed");
    if state.book.is_crossed() {
        warn!(instrument, bid = ?event.bid, ask = ?event.ask, "book crossed");
    }
    stats.counters_mut().bbo_published += 1;
    publish(sinks, stats, &PlantEvent::Bbo(event.clone()));
    state.last_bbo = Some(event);
    true
}

fn open_resync(
    instrument: &str,
    state: &mut InstrumentState,
    reason: ResyncReason,
    stats: &mut FeedStats,
    next_generation: &mut u64,
) -> ResyncRequest {
    match reason {
        ResyncReason::Gap { expected, received } => {
            stats.record_gap(received - expected);
            let gap = FeedError::SequenceGap {
                instrument: instrument.to_string(),
                expected,
                received,
            };
            warn!(instrument, kind = gap.kind(), error = %gap, "requesting snapshot");
        }
        ResyncReason::Overflow { dropped } => {
            stats.counters_mut().buffer_overflows += 1;
            warn!(instrument, dropped, "resync buffer overflow, forcing fresh snapshot");
        }
        ResyncReason::Requested => {
            info!(instrument, "snapshot requested");
        }
    }
    state.sequencer.begin_resync();
    state.generation = *next_generation;
    *next_generation += 1;
    stats.counters_mut().resyncs_started += 1;
    ResyncRequest {
        instrument: instrument.to_string(),
        generation: state.generation,
        reason,
    }
}

fn publish(sinks: &[Arc<dyn PublisherSink>], stats: &mut FeedStats, event: &PlantEvent) {
    for sink in sinks {
        if let Err(e) = sink.publish(event) {
            stats.counters_mut().sink_errors += 1;
            match e {
                SinkError::Full => debug!(sink = sink.name(), channel = event.channel(), "sink full, event dropped"),
                SinkError::Closed => warn!(
                    sink = sink.name(),
                    error = %FeedError::from_sink(sink.name(), e),
                    "sink closed"
                ),
            }
        }
    }
}
