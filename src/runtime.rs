//! Async runtime around the plant
//!
//! Instruments are hashed onto a fixed set of lanes. Each lane is a tokio
//! task owning its own `TickerPlant`, so per-instrument ordering holds
//! without locks and one slow instrument cannot stall another lane.
//! Snapshot fetches run as separate tasks and report back to the lane that
//! asked for them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::book_builder::BookDepth;
use crate::config::PlantConfig;
use crate::decoder::{validate, Decoder};
use crate::error::FeedError;
use crate::plant::{Disposition, LivenessReport, TickerPlant};
use crate::protocol::{FeedMessage, HEADER_SIZE};
use crate::recovery::{fetch_with_backoff, BackoffPolicy, BookSnapshot, ResyncRequest, SnapshotError, SnapshotSource};
use crate::sink::{BboEvent, PublisherSink};
use crate::stats::FeedStats;

enum LaneCommand {
    Message {
        msg: FeedMessage,
        wire_size: usize,
        received_at: Instant,
    },
    Subscribe(Vec<String>),
    Unsubscribe(String, oneshot::Sender<bool>),
    Resync(String, oneshot::Sender<bool>),
    Bbo(String, oneshot::Sender<Option<BboEvent>>),
    Depth(String, usize, oneshot::Sender<Option<BookDepth>>),
    Liveness(Instant, oneshot::Sender<Vec<LivenessReport>>),
    Stats(oneshot::Sender<FeedStats>),
    Shutdown,
}

struct SnapshotReady {
    instrument: String,
    generation: u64,
    result: Result<BookSnapshot, SnapshotError>,
}

/// Lane an instrument is pinned to
pub fn lane_for(instrument: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    instrument.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

// Timestamps come from tokio's clock so paused-time tests can drive liveness.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct PlantRuntime;

impl PlantRuntime {
    /// Start the lanes and the liveness monitor on the current tokio runtime
    pub fn spawn(
        config: PlantConfig,
        sinks: Vec<Arc<dyn PublisherSink>>,
        source: Arc<dyn SnapshotSource>,
    ) -> PlantHandle {
        let lanes = config.lanes.max(1);
        let policy = BackoffPolicy::from(&config.resync);
        let mut senders = Vec::with_capacity(lanes);
        let mut tasks = Vec::with_capacity(lanes);

        for index in 0..lanes {
            let (tx, rx) = mpsc::channel(config.lane_mailbox_capacity.max(1));
            let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
            let lane = Lane {
                index,
                plant: TickerPlant::new(config.clone(), sinks.clone()),
                source: source.clone(),
                policy,
                commands: rx,
                snapshot_tx,
                snapshot_rx,
                fetches: HashMap::new(),
            };
            senders.push(tx);
            tasks.push(tokio::spawn(lane.run()));
        }

        let monitor = tokio::spawn(liveness_monitor(senders.clone(), config.liveness_interval()));
        info!(lanes, sinks = sinks.len(), "ticker plant started");

        PlantHandle {
            lanes: senders,
            tasks,
            monitor,
            ingest_stats: Arc::new(Mutex::new(FeedStats::new())),
            default_depth: config.default_depth,
        }
    }
}

/// Control surface for a running plant
pub struct PlantHandle {
    lanes: Vec<mpsc::Sender<LaneCommand>>,
    tasks: Vec<JoinHandle<()>>,
    monitor: JoinHandle<()>,
    // messages rejected before they could be routed to a lane
    ingest_stats: Arc<Mutex<FeedStats>>,
    default_depth: usize,
}

impl PlantHandle {
    fn lane(&self, instrument: &str) -> &mpsc::Sender<LaneCommand> {
        &self.lanes[lane_for(instrument, self.lanes.len())]
    }

    async fn ask<T>(
        &self,
        instrument: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> LaneCommand,
    ) -> Result<T, FeedError> {
        let (tx, rx) = oneshot::channel();
        self.lane(instrument)
            .send(make(tx))
            .await
            .map_err(|_| FeedError::LaneClosed)?;
        rx.await.map_err(|_| FeedError::LaneClosed)
    }

    /// Route a decoded message to its lane. Waits when the lane mailbox is full.
    pub async fn ingest(&self, msg: FeedMessage) -> Result<(), FeedError> {
        match validate(msg) {
            Ok(msg) => self.ingest_sized(msg, 0).await,
            Err(e) => Err(self.reject(0, e.into())),
        }
    }

    async fn ingest_sized(&self, msg: FeedMessage, wire_size: usize) -> Result<(), FeedError> {
        let lane = self.lane(msg.instrument());
        let command = LaneCommand::Message {
            msg,
            wire_size,
            received_at: now(),
        };
        lane.send(command).await.map_err(|_| FeedError::LaneClosed)
    }

    pub async fn ingest_json(&self, payload: &[u8]) -> Result<(), FeedError> {
        let started = Instant::now();
        let decoded = Decoder::decode_json(payload);
        let micros = started.elapsed().as_micros() as u64;
        match decoded {
            Ok(msg) => {
                self.ingest_stats.lock().record_decode_latency(micros);
                self.ingest_sized(msg, payload.len()).await
            }
            Err(e) => Err(self.reject(payload.len(), e.into())),
        }
    }

    /// Route every complete binary frame in `buffer`, returning the bytes
    /// consumed. A trailing partial frame is left for the next read.
    ///
    /// Malformed frames are counted and skipped. When a frame's declared
    /// length is unusable the frame boundary is lost, and the rest of the
    /// buffer is dropped with it.
    pub async fn ingest_frames(&self, buffer: &[u8]) -> Result<usize, FeedError> {
        let mut offset = 0;
        while let Some(declared) = Decoder::frame_length(&buffer[offset..]) {
            let rest = &buffer[offset..];
            if declared > rest.len() {
                break;
            }
            let started = Instant::now();
            match Decoder::decode(rest) {
                Ok((msg, consumed)) => {
                    self.ingest_stats
                        .lock()
                        .record_decode_latency(started.elapsed().as_micros() as u64);
                    offset += consumed;
                    self.ingest_sized(msg, consumed).await?;
                }
                Err(e) => {
                    let skip = if declared >= HEADER_SIZE { declared } else { rest.len() };
                    offset += skip;
                    self.reject(skip, e.into());
                }
            }
        }
        Ok(offset)
    }

    fn reject(&self, size: usize, err: FeedError) -> FeedError {
        let mut stats = self.ingest_stats.lock();
        stats.record_message(size);
        stats.counters_mut().malformed += 1;
        warn!(error = %err, "dropping malformed feed message");
        err
    }

    /// (Re)subscribe instruments from a clean state, cancelling pending fetches
    pub async fn subscribe(&self, instruments: &[String]) -> Result<(), FeedError> {
        let mut by_lane: HashMap<usize, Vec<String>> = HashMap::new();
        for instrument in instruments {
            by_lane
                .entry(lane_for(instrument, self.lanes.len()))
                .or_default()
                .push(instrument.clone());
        }
        for (lane, names) in by_lane {
            self.lanes[lane]
                .send(LaneCommand::Subscribe(names))
                .await
                .map_err(|_| FeedError::LaneClosed)?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, instrument: &str) -> Result<bool, FeedError> {
        let name = instrument.to_string();
        self.ask(instrument, |tx| LaneCommand::Unsubscribe(name, tx)).await
    }

    /// Force a fresh snapshot for an instrument
    pub async fn resync(&self, instrument: &str) -> Result<bool, FeedError> {
        let name = instrument.to_string();
        self.ask(instrument, |tx| LaneCommand::Resync(name, tx)).await
    }

    pub async fn bbo(&self, instrument: &str) -> Result<Option<BboEvent>, FeedError> {
        let name = instrument.to_string();
        self.ask(instrument, |tx| LaneCommand::Bbo(name, tx)).await
    }

    /// Depth query; `None` levels uses the configured default depth
    pub async fn depth(&self, instrument: &str, levels: Option<usize>) -> Result<Option<BookDepth>, FeedError> {
        let name = instrument.to_string();
        let levels = levels.unwrap_or(self.default_depth);
        self.ask(instrument, |tx| LaneCommand::Depth(name, levels, tx)).await
    }

    /// Run a liveness check on every lane now
    pub async fn liveness(&self) -> Result<Vec<LivenessReport>, FeedError> {
        let mut reports = collect_liveness(&self.lanes, now()).await?;
        reports.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(reports)
    }

    /// Statistics merged across all lanes
    pub async fn stats(&self) -> Result<FeedStats, FeedError> {
        let mut merged = self.ingest_stats.lock().clone();
        for lane in &self.lanes {
            let (tx, rx) = oneshot::channel();
            lane.send(LaneCommand::Stats(tx))
                .await
                .map_err(|_| FeedError::LaneClosed)?;
            let stats = rx.await.map_err(|_| FeedError::LaneClosed)?;
            merged.merge(&stats);
        }
        Ok(merged)
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Stop the monitor and every lane, cancelling in-flight fetches
    pub async fn shutdown(self) {
        self.monitor.abort();
        for lane in &self.lanes {
            let _ = lane.send(LaneCommand::Shutdown).await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "lane task ended abnormally");
            }
        }
        info!("ticker plant stopped");
    }
}

async fn collect_liveness(
    lanes: &[mpsc::Sender<LaneCommand>],
    at: Instant,
) -> Result<Vec<LivenessReport>, FeedError> {
    let mut reports = Vec::new();
    for lane in lanes {
        let (tx, rx) = oneshot::channel();
        lane.send(LaneCommand::Liveness(at, tx))
            .await
            .map_err(|_| FeedError::LaneClosed)?;
        reports.extend(rx.await.map_err(|_| FeedError::LaneClosed)?);
    }
    Ok(reports)
}

async fn liveness_monitor(lanes: Vec<mpsc::Sender<LaneCommand>>, interval: std::time::Duration) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match collect_liveness(&lanes, now()).await {
            Ok(reports) => {
                let degraded = reports.iter().filter(|r| r.degraded).count();
                debug!(instruments = reports.len(), degraded, "liveness check");
            }
            Err(_) => break,
        }
    }
}

struct Lane {
    index: usize,
    plant: TickerPlant,
    source: Arc<dyn SnapshotSource>,
    policy: BackoffPolicy,
    commands: mpsc::Receiver<LaneCommand>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotReady>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotReady>,
    // one outstanding fetch per instrument, tagged with its generation
    fetches: HashMap<String, (u64, JoinHandle<()>)>,
}

impl Lane {
    async fn run(mut self) {
        debug!(lane = self.index, "lane started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(LaneCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(ready) = self.snapshot_rx.recv() => self.on_snapshot(ready),
            }
        }
        for (_, (_, fetch)) in self.fetches.drain() {
            fetch.abort();
        }
        debug!(lane = self.index, "lane stopped");
    }

    fn on_command(&mut self, cmd: LaneCommand) {
        match cmd {
            LaneCommand::Message {
                msg,
                wire_size,
                received_at,
            } => match self.plant.handle_sized(msg, wire_size, received_at) {
                Ok(Disposition::ResyncRequired(request)) => self.start_fetch(request),
                Ok(_) => {}
                Err(e) => debug!(lane = self.index, error = %e, kind = e.kind(), "message rejected"),
            },
            LaneCommand::Subscribe(instruments) => {
                for instrument in &instruments {
                    self.cancel_fetch(instrument);
                }
                self.plant.subscribe(&instruments, now());
            }
            LaneCommand::Unsubscribe(instrument, reply) => {
                self.cancel_fetch(&instrument);
                let _ = reply.send(self.plant.unsubscribe(&instrument));
            }
            LaneCommand::Resync(instrument, reply) => {
                let request = self.plant.request_resync(&instrument);
                let started = request.is_some();
                if let Some(request) = request {
                    self.start_fetch(request);
                }
                let _ = reply.send(started);
            }
            LaneCommand::Bbo(instrument, reply) => {
                let _ = reply.send(self.plant.bbo(&instrument));
            }
            LaneCommand::Depth(instrument, levels, reply) => {
                let _ = reply.send(self.plant.depth(&instrument, levels));
            }
            LaneCommand::Liveness(at, reply) => {
                let _ = reply.send(self.plant.check_liveness(at));
            }
            LaneCommand::Stats(reply) => {
                let _ = reply.send(self.plant.stats().clone());
            }
            LaneCommand::Shutdown => {}
        }
    }

    fn start_fetch(&mut self, request: ResyncRequest) {
        self.cancel_fetch(&request.instrument);
        let source = self.source.clone();
        let policy = self.policy;
        let tx = self.snapshot_tx.clone();
        let instrument = request.instrument.clone();
        let generation = request.generation;

        let fetch = tokio::spawn(async move {
            let result = fetch_with_backoff(source.as_ref(), &request.instrument, &policy).await;
            let _ = tx.send(SnapshotReady {
                instrument: request.instrument,
                generation: request.generation,
                result,
            });
        });
        debug!(lane = self.index, instrument = %instrument, generation, "snapshot fetch started");
        self.fetches.insert(instrument, (generation, fetch));
    }

    fn cancel_fetch(&mut self, instrument: &str) {
        if let Some((generation, fetch)) = self.fetches.remove(instrument) {
            fetch.abort();
            debug!(lane = self.index, instrument, generation, "snapshot fetch cancelled");
        }
    }

    fn on_snapshot(&mut self, ready: SnapshotReady) {
        let SnapshotReady {
            instrument,
            generation,
            result,
        } = ready;
        if self.fetches.get(&instrument).is_some_and(|(g, _)| *g == generation) {
            self.fetches.remove(&instrument);
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.plant.snapshot_failed(&instrument, generation, e);
                return;
            }
        };

        match self.plant.apply_snapshot(snapshot, generation, now()) {
            Ok(outcome) => {
                if let Some(request) = outcome.regapped {
                    self.start_fetch(request);
                }
            }
            Err(e) => debug!(lane = self.index, instrument = %instrument, error = %e, "snapshot not applied"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_assignment_is_stable() {
        let first = lane_for("KXBTC-25DEC31", 8);
        for _ in 0..10 {
            assert_eq!(lane_for("KXBTC-25DEC31", 8), first);
        }
        assert!(first < 8);
        assert_eq!(lane_for("anything", 1), 0);
        assert_eq!(lane_for("anything", 0), 0);
    }
}
