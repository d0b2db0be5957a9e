/// Replay a recorded binary feed through the plant
///
/// Usage: replay [feed] [config.toml]
/// Reads `<feed>.snapshots.json` (written by feed_generator) as the snapshot
/// source. Set RUST_LOG to override the configured log level.

use std::env;
use std::sync::Arc;

use ticker_plant::{
    BookSnapshot, ChannelSink, MemorySnapshotSource, PlantConfig, PlantEvent, PlantRuntime, PublisherSink,
    SnapshotSource,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHUNK: usize = 64 * 1024;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let feed_path = args.get(1).cloned().unwrap_or_else(|| "/tmp/ticker_feed.bin".to_string());
    let config = match args.get(2) {
        Some(path) => PlantConfig::load(path)?,
        None => PlantConfig::default(),
    };
    init_logging(&config.log_level);

    let source = Arc::new(MemorySnapshotSource::new());
    let snapshot_path = format!("{}.snapshots.json", feed_path);
    match std::fs::read(&snapshot_path) {
        Ok(raw) => {
            let snapshots: Vec<BookSnapshot> = serde_json::from_slice(&raw)?;
            info!(count = snapshots.len(), path = %snapshot_path, "loaded snapshots");
            for snapshot in snapshots {
                source.insert(snapshot);
            }
        }
        Err(e) => info!(path = %snapshot_path, error = %e, "no snapshots, gaps will fail their instruments"),
    }

    // A writer task draining a bounded queue stands in for a durable sink
    let (channel, mut rx) = ChannelSink::new("writer", config.sink_queue_capacity);
    let channel = Arc::new(channel);
    let writer = tokio::spawn(async move {
        let mut bbo = 0u64;
        let mut total = 0u64;
        while let Some(event) = rx.recv().await {
            total += 1;
            if let PlantEvent::Bbo(_) = event {
                bbo += 1;
            }
        }
        (total, bbo)
    });

    let sinks: Vec<Arc<dyn PublisherSink>> = vec![channel.clone()];
    let handle = PlantRuntime::spawn(config, sinks, source as Arc<dyn SnapshotSource>);

    let feed = std::fs::read(&feed_path)?;
    info!(path = %feed_path, bytes = feed.len(), "replaying feed");

    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK * 2);
    for chunk in feed.chunks(CHUNK) {
        pending.extend_from_slice(chunk);
        let consumed = handle.ingest_frames(&pending).await?;
        pending.drain(..consumed);
    }

    // Let in-flight resyncs land before reading the books
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    for report in handle.liveness().await? {
        let bbo = handle.bbo(&report.instrument).await?;
        info!(
            instrument = %report.instrument,
            phase = report.phase.as_str(),
            degraded = report.degraded,
            bid = ?bbo.as_ref().and_then(|b| b.bid),
            ask = ?bbo.as_ref().and_then(|b| b.ask),
            "final state"
        );
    }

    let stats = handle.stats().await?;
    stats.log_summary();
    info!(dropped = channel.dropped(), "writer queue");

    handle.shutdown().await;
    drop(channel);
    let (total, bbo) = writer.await?;
    info!(total, bbo, "writer drained");

    Ok(())
}
