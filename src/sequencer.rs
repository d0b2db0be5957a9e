//! Per-instrument sequence tracking
//!
//! Classifies each incoming delta as in-order, stale, or gapped, and holds
//! deltas back while the book is being rebuilt from a snapshot.

use std::collections::VecDeque;

use crate::protocol::DeltaEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    /// No delta seen yet; the first one establishes the baseline.
    Uninitialized,
    /// Applying deltas in order.
    Live,
    /// Waiting for a snapshot; deltas are buffered, not applied.
    Resyncing,
}

impl SequencePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequencePhase::Uninitialized => "uninitialized",
            SequencePhase::Live => "live",
            SequencePhase::Resyncing => "resyncing",
        }
    }
}

/// Outcome of sequencing one delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// In order: apply it to the book.
    Accept(DeltaEvent),
    /// Sequence already seen; discard.
    Stale { expected: u64, received: u64 },
    /// Sequence jumped ahead. The delta has been buffered and the
    /// sequencer is now resyncing.
    Gap { expected: u64, received: u64 },
    /// Held until the pending snapshot arrives.
    Buffered,
    /// The buffer was full: its contents were discarded and this delta kept.
    /// A fresh snapshot must be requested.
    Overflow { dropped: usize },
}

#[derive(Debug, Clone)]
pub struct FeedSequencer {
    phase: SequencePhase,
    expected_next: u64,
    buffered: VecDeque<DeltaEvent>,
    capacity: usize,
    gaps: Vec<(u64, u64)>, // (start, end) missing ranges, inclusive
    total_missing: u64,
}

impl FeedSequencer {
    pub fn new(capacity: usize) -> Self {
        FeedSequencer {
            phase: SequencePhase::Uninitialized,
            expected_next: 0,
            buffered: VecDeque::new(),
            capacity: capacity.max(1),
            gaps: Vec::new(),
            total_missing: 0,
        }
    }

    pub fn classify(&mut self, delta: DeltaEvent) -> Verdict {
        let seq = delta.sequence;
        match self.phase {
            SequencePhase::Uninitialized => {
                self.expected_next = seq.wrapping_add(1);
                self.phase = SequencePhase::Live;
                Verdict::Accept(delta)
            }
            SequencePhase::Live => {
                let expected = self.expected_next;
                if seq == expected {
                    self.expected_next = seq.wrapping_add(1);
                    Verdict::Accept(delta)
                } else if seq < expected {
                    Verdict::Stale {
                        expected,
                        received: seq,
                    }
                } else {
                    self.gaps.push((expected, seq - 1));
                    self.total_missing = self.total_missing.saturating_add(seq - expected);
                    self.phase = SequencePhase::Resyncing;
                    self.buffered.push_back(delta);
                    Verdict::Gap {
                        expected,
                        received: seq,
                    }
                }
            }
            SequencePhase::Resyncing => {
                if self.buffered.len() >= self.capacity {
                    let dropped = self.buffered.len();
                    self.buffered.clear();
                    self.buffered.push_back(delta);
                    return Verdict::Overflow { dropped };
                }
                self.buffered.push_back(delta);
                Verdict::Buffered
            }
        }
    }

    /// Enter resync without a gap (e.g. forced by the operator). Buffered
    /// deltas are kept.
    pub fn begin_resync(&mut self) {
        self.phase = SequencePhase::Resyncing;
    }

    /// Rebase on a snapshot: the next expected sequence becomes
    /// `snapshot_seq + 1` and the buffered deltas newer than the snapshot
    /// are returned in arrival order for replay through `classify`.
    pub fn rebase(&mut self, snapshot_seq: u64) -> Vec<DeltaEvent> {
        self.expected_next = snapshot_seq.wrapping_add(1);
        self.phase = SequencePhase::Live;
        self.buffered
            .drain(..)
            .filter(|d| d.sequence > snapshot_seq)
            .collect()
    }

    /// Back to `Uninitialized`, discarding buffered deltas and gap history
    pub fn reset(&mut self) {
        self.phase = SequencePhase::Uninitialized;
        self.expected_next = 0;
        self.buffered.clear();
        self.gaps.clear();
        self.total_missing = 0;
    }

    pub fn phase(&self) -> SequencePhase {
        self.phase
    }

    pub fn expected_next(&self) -> Option<u64> {
        match self.phase {
            SequencePhase::Uninitialized => None,
            _ => Some(self.expected_next),
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn buffered(&self) -> impl Iterator<Item = &DeltaEvent> {
        self.buffered.iter()
    }

    /// Get all detected gaps as (start, end) tuples (inclusive)
    pub fn gaps(&self) -> &[(u64, u64)] {
        &self.gaps
    }

    /// Get total number of missing sequence numbers
    pub fn total_missing(&self) -> u64 {
        self.total_missing
    }

    /// Get count of gap ranges detected
    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }
}
