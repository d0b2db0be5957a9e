//! Snapshot-based order book recovery
//!
//! When the sequencer reports a gap the instrument stops applying deltas,
//! a full depth snapshot is fetched out of band, the book is rebased on it
//! and the held deltas newer than the snapshot are replayed.
//!
//! The fetch side lives here; the rebase/replay runs inside
//! `TickerPlant::apply_snapshot` so it happens on the instrument's lane.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ResyncConfig;
use crate::protocol::PriceLevel;

/// Full depth of one instrument, tagged with the feed sequence it reflects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub instrument: String,
    pub sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl BookSnapshot {
    /// Why this snapshot cannot rebase `instrument`, if it cannot
    pub fn check(&self, instrument: &str) -> Result<(), String> {
        if self.instrument != instrument {
            return Err(format!("snapshot is for {}", self.instrument));
        }
        if let Some(level) = self.bids.iter().chain(&self.asks).find(|l| l.price.is_zero()) {
            return Err(format!("level with size {} has zero price", level.size));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Transient; retried with backoff.
    #[error("snapshot unavailable: {0}")]
    Unavailable(String),

    /// The venue does not know the instrument; retrying will not help.
    #[error("instrument unknown: {0}")]
    InstrumentUnknown(String),
}

/// Out-of-band source of full book snapshots (the venue's REST depth endpoint)
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, instrument: &str) -> Result<BookSnapshot, SnapshotError>;
}

/// Why a snapshot was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    Gap { expected: u64, received: u64 },
    Overflow { dropped: usize },
    /// Asked for explicitly
    Requested,
}

/// Ask for a snapshot of `instrument`. Only a snapshot answering the
/// latest generation is applied; older ones were superseded or cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub instrument: String,
    pub generation: u64,
    pub reason: ResyncReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncOutcome {
    pub instrument: String,
    pub snapshot_sequence: u64,
    /// Buffered deltas at or below the snapshot sequence
    pub discarded: usize,
    /// Buffered deltas applied on top of the snapshot
    pub replayed: usize,
    /// Set when the replay itself hit a new gap
    pub regapped: Option<ResyncRequest>,
}

/// Exponential retry schedule for snapshot fetches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// None retries until cancelled
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl From<&ResyncConfig> for BackoffPolicy {
    fn from(cfg: &ResyncConfig) -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(cfg.initial_backoff_ms),
            max: Duration::from_millis(cfg.max_backoff_ms),
            multiplier: cfg.multiplier,
            max_attempts: cfg.max_attempts,
        }
    }
}

/// Fetch a snapshot, retrying `Unavailable` on the backoff schedule.
///
/// A snapshot failing `BookSnapshot::check` counts as a failed attempt.
/// `InstrumentUnknown` is returned at once. Cancel by dropping the future.
pub async fn fetch_with_backoff(
    source: &dyn SnapshotSource,
    instrument: &str,
    policy: &BackoffPolicy,
) -> Result<BookSnapshot, SnapshotError> {
    let mut attempt: u32 = 0;
    loop {
        let reason = match source.fetch_snapshot(instrument).await {
            Ok(snapshot) => match snapshot.check(instrument) {
                Ok(()) => {
                    debug!(instrument, sequence = snapshot.sequence, attempt, "snapshot fetched");
                    return Ok(snapshot);
                }
                Err(reason) => format!("rejected: {}", reason),
            },
            Err(SnapshotError::InstrumentUnknown(reason)) => {
                return Err(SnapshotError::InstrumentUnknown(reason));
            }
            Err(SnapshotError::Unavailable(reason)) => reason,
        };

        attempt += 1;
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            warn!(instrument, attempt, %reason, "snapshot retries exhausted");
            return Err(SnapshotError::Unavailable(reason));
        }
        let delay = policy.delay(attempt - 1);
        warn!(
            instrument,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "snapshot fetch failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// In-memory snapshot source, keyed by instrument
#[derive(Debug, Default)]
pub struct MemorySnapshotSource {
    snapshots: Mutex<HashMap<String, BookSnapshot>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: BookSnapshot) {
        self.snapshots.lock().insert(snapshot.instrument.clone(), snapshot);
    }

    /// Make the next `count` fetches for `instrument` fail as unavailable
    pub fn fail_next(&self, instrument: &str, count: u32) {
        self.failures.lock().insert(instrument.to_string(), count);
    }

    /// Number of fetches issued for `instrument`
    pub fn calls(&self, instrument: &str) -> u32 {
        self.calls.lock().get(instrument).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn fetch_snapshot(&self, instrument: &str) -> Result<BookSnapshot, SnapshotError> {
        *self.calls.lock().entry(instrument.to_string()).or_insert(0) += 1;

        if let Some(remaining) = self.failures.lock().get_mut(instrument) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SnapshotError::Unavailable("injected failure".into()));
            }
        }

        self.snapshots
            .lock()
            .get(instrument)
            .cloned()
            .ok_or_else(|| SnapshotError::InstrumentUnknown(instrument.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Price;

    fn snapshot(instrument: &str, sequence: u64) -> BookSnapshot {
        BookSnapshot {
            instrument: instrument.into(),
            sequence,
            bids: vec![PriceLevel::new(Price(66_000_000), 1000)],
            asks: vec![],
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: None,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_retries_unavailable() {
        let source = MemorySnapshotSource::new();
        source.insert(snapshot("A", 50));
        source.fail_next("A", 2);

        let result = fetch_with_backoff(&source, "A", &BackoffPolicy::default()).await;
        assert_eq!(result.unwrap().sequence, 50);
        assert_eq!(source.calls("A"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_unknown_is_not_retried() {
        let source = MemorySnapshotSource::new();
        let result = fetch_with_backoff(&source, "NOPE", &BackoffPolicy::default()).await;
        assert!(matches!(result, Err(SnapshotError::InstrumentUnknown(_))));
        assert_eq!(source.calls("NOPE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_gives_up_after_max_attempts() {
        let source = MemorySnapshotSource::new();
        source.insert(snapshot("A", 1));
        source.fail_next("A", 10);
        let policy = BackoffPolicy {
            max_attempts: Some(3),
            ..BackoffPolicy::default()
        };

        let result = fetch_with_backoff(&source, "A", &policy).await;
        assert!(matches!(result, Err(SnapshotError::Unavailable(_))));
        assert_eq!(source.calls("A"), 3);
    }

    #[test]
    fn test_check_rejects_unusable_snapshots() {
        assert!(snapshot("A", 1).check("A").is_ok());
        assert!(snapshot("A", 1).check("B").is_err());

        let mut zero = snapshot("A", 1);
        zero.asks.push(PriceLevel::new(Price(0), 5));
        assert!(zero.check("A").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_snapshot_backs_off() {
        let source = MemorySnapshotSource::new();
        let mut bad = snapshot("A", 1);
        bad.bids = vec![PriceLevel::new(Price(0), 5)];
        source.insert(bad);
        let policy = BackoffPolicy {
            max_attempts: Some(4),
            ..BackoffPolicy::default()
        };

        let started = tokio::time::Instant::now();
        let result = fetch_with_backoff(&source, "A", &policy).await;
        assert!(matches!(result, Err(SnapshotError::Unavailable(_))));
        assert_eq!(source.calls("A"), 4);
        // 250 + 500 + 1000 ms between the four attempts
        assert!(started.elapsed() >= Duration::from_millis(1750));
    }
}
