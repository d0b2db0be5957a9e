//! Feed statistics tracking
//!
//! Every recoverable error the plant absorbs is counted here so it can be
//! exported to counters and alerts. Latencies are kept in sliding windows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

const WINDOW_SIZE: usize = 10000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    fn from_window(window: &VecDeque<u64>) -> Option<Self> {
        if window.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();

        Some(LatencyStats {
            min_us: sorted[0],
            max_us: sorted[sorted.len() - 1],
            mean_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: sorted[sorted.len() / 2],
            p99_us: sorted[(sorted.len() * 99) / 100],
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub messages: u64,
    pub bytes: u64,
    pub malformed: u64,
    pub trades: u64,
    pub tickers: u64,
    pub deltas_applied: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub missing_sequences: u64,
    pub buffered: u64,
    pub buffer_overflows: u64,
    pub resyncs_started: u64,
    pub resyncs_completed: u64,
    pub stale_snapshots: u64,
    pub snapshot_failures: u64,
    pub invalid_deltas: u64,
    pub malformed_levels: u64,
    pub instruments_failed: u64,
    pub bbo_published: u64,
    pub sink_errors: u64,
    pub degraded: u64,
}

impl Counters {
    fn merge(&mut self, other: &Counters) {
        self.messages += other.messages;
        self.bytes += other.bytes;
        self.malformed += other.malformed;
        self.trades += other.trades;
        self.tickers += other.tickers;
        self.deltas_applied += other.deltas_applied;
        self.duplicates += other.duplicates;
        self.gaps += other.gaps;
        self.missing_sequences += other.missing_sequences;
        self.buffered += other.buffered;
        self.buffer_overflows += other.buffer_overflows;
        self.resyncs_started += other.resyncs_started;
        self.resyncs_completed += other.resyncs_completed;
        self.stale_snapshots += other.stale_snapshots;
        self.snapshot_failures += other.snapshot_failures;
        self.invalid_deltas += other.invalid_deltas;
        self.malformed_levels += other.malformed_levels;
        self.instruments_failed += other.instruments_failed;
        self.bbo_published += other.bbo_published;
        self.sink_errors += other.sink_errors;
        self.degraded += other.degraded;
    }
}

#[derive(Debug, Clone)]
pub struct FeedStats {
    start_time: Option<Instant>,
    counters: Counters,

    // Decode latencies (in microseconds)
    decode_latencies: VecDeque<u64>,

    // Book update latencies
    book_update_latencies: VecDeque<u64>,
}

impl FeedStats {
    pub fn new() -> Self {
        FeedStats {
            start_time: None,
            counters: Counters::default(),
            decode_latencies: VecDeque::with_capacity(WINDOW_SIZE),
            book_update_latencies: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    /// Record a message received
    pub fn record_message(&mut self, size: usize) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        self.counters.messages += 1;
        self.counters.bytes += size as u64;
    }

    /// Record decode latency in microseconds
    pub fn record_decode_latency(&mut self, micros: u64) {
        push_window(&mut self.decode_latencies, micros);
    }

    /// Record book update latency in microseconds
    pub fn record_book_update_latency(&mut self, micros: u64) {
        push_window(&mut self.book_update_latencies, micros);
    }

    /// Record a gap covering `missing` sequence numbers
    pub fn record_gap(&mut self, missing: u64) {
        self.counters.missing_sequences = self.counters.missing_sequences.saturating_add(missing);
        self.counters.gaps += 1;
    }

    /// Mutable access for the router's per-signal counters
    pub fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Get messages per second
    pub fn messages_per_sec(&self) -> f64 {
        self.per_sec(self.counters.messages)
    }

    /// Get bytes per second
    pub fn bytes_per_sec(&self) -> f64 {
        self.per_sec(self.counters.bytes)
    }

    fn per_sec(&self, total: u64) -> f64 {
        match self.start_time {
            None => 0.0,
            Some(start) => {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    total as f64 / elapsed
                } else {
                    0.0
                }
            }
        }
    }

    pub fn decode_latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_window(&self.decode_latencies)
    }

    pub fn book_update_latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_window(&self.book_update_latencies)
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|st| st.elapsed())
    }

    pub fn total_messages(&self) -> u64 {
        self.counters.messages
    }

    pub fn total_bytes(&self) -> u64 {
        self.counters.bytes
    }

    /// Get total missing sequence count
    pub fn total_gaps(&self) -> u64 {
        self.counters.missing_sequences
    }

    /// Get number of gap events
    pub fn gap_events(&self) -> u64 {
        self.counters.gaps
    }

    /// Fold another lane's statistics into this one
    pub fn merge(&mut self, other: &FeedStats) {
        self.start_time = match (self.start_time, other.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.counters.merge(&other.counters);
        for &v in &other.decode_latencies {
            push_window(&mut self.decode_latencies, v);
        }
        for &v in &other.book_update_latencies {
            push_window(&mut self.book_update_latencies, v);
        }
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = FeedStats::new();
    }

    /// Emit a statistics summary through `tracing`
    pub fn log_summary(&self) {
        let c = &self.counters;
        info!(
            messages = c.messages,
            bytes = c.bytes,
            elapsed_ms = self.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
            messages_per_sec = self.messages_per_sec(),
            "feed statistics"
        );
        info!(
            deltas = c.deltas_applied,
            trades = c.trades,
            tickers = c.tickers,
            bbo = c.bbo_published,
            duplicates = c.duplicates,
            malformed = c.malformed,
            "message breakdown"
        );
        info!(
            gaps = c.gaps,
            missing = c.missing_sequences,
            overflows = c.buffer_overflows,
            resyncs_started = c.resyncs_started,
            resyncs_completed = c.resyncs_completed,
            snapshot_failures = c.snapshot_failures,
            invalid_deltas = c.invalid_deltas,
            sink_errors = c.sink_errors,
            "consistency signals"
        );

        if let Some(stats) = self.decode_latency_stats() {
            info!(
                min_us = stats.min_us,
                max_us = stats.max_us,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                "decode latency"
            );
        }

        if let Some(stats) = self.book_update_latency_stats() {
            info!(
                min_us = stats.min_us,
                max_us = stats.max_us,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                "book update latency"
            );
        }
    }
}

fn push_window(window: &mut VecDeque<u64>, v: u64) {
    if window.len() >= WINDOW_SIZE {
        window.pop_front();
    }
    window.push_back(v);
}

impl Default for FeedStats {
    fn default() -> Self {
        Self::new()
    }
}
