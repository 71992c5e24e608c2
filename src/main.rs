//! telemcache demo
//!
//! Streams a handful of simulated channels into the cache for a few seconds,
//! then runs a read-through query that backfills history and logs what the
//! cache holds.
//!
//! Usage: `telemcache [config.toml]`

use anyhow::Context;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemcache::config::Config;
use telemcache::gpu::HostAllocator;
use telemcache::sim::{SignalPattern, SimulatedStore};
use telemcache::{ChannelDescriptor, ChannelKey, Connection, DataType, TimeRange, TimeStamp};
use tokio_util::sync::CancellationToken;

const RUN_FOR: Duration = Duration::from_secs(3);
const EMIT_EVERY: Duration = Duration::from_millis(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default(None),
    };
    let _log_guard = telemcache::logging::init(&config.logging)?;

    tracing::info!("Starting telemcache demo");

    let store = Arc::new(
        SimulatedStore::new()
            .with_frame_buffer(config.stream.frame_buffer)
            .with_channel(
                ChannelDescriptor::new(1, DataType::F32).with_name("pressure"),
                SignalPattern::Sine {
                    frequency: 0.5,
                    amplitude: 10.0,
                    offset: 100.0,
                },
            )
            .with_channel(
                ChannelDescriptor::new(2, DataType::U32).with_name("sequence"),
                SignalPattern::Counter {
                    step: 1.0,
                    min: 0.0,
                    max: 1_000_000.0,
                },
            )
            .with_channel(
                ChannelDescriptor::new(3, DataType::I16).with_name("valve"),
                SignalPattern::Square {
                    period: 1.0,
                    amplitude: 1.0,
                },
            ),
    );
    let allocator = HostAllocator::new();
    let conn = Arc::new(Connection::new(
        store.clone(),
        store.clone(),
        Arc::new(allocator.clone()),
        &config,
    ));

    let cancel = CancellationToken::new();
    let keys: Vec<ChannelKey> = store.channel_keys();
    let flushes = Arc::new(AtomicU64::new(0));
    let flush_counter = Arc::clone(&flushes);
    let listener = conn
        .stream_live(
            &keys,
            move |_, result| {
                if let Ok(write) = result {
                    flush_counter.fetch_add(write.flushed.len() as u64, Ordering::Relaxed);
                }
            },
            &cancel,
        )
        .await?;

    let started = TimeStamp::now();
    let emitter = {
        let (store, cancel) = (Arc::clone(&store), cancel.clone());
        tokio::spawn(async move { store.run(EMIT_EVERY, &cancel).await })
    };
    let pump = {
        let (conn, cancel) = (Arc::clone(&conn), cancel.clone());
        tokio::spawn(async move { conn.run(&cancel).await })
    };

    tokio::time::sleep(RUN_FOR).await;
    cancel.cancel();
    emitter.await?;
    pump.await?;

    tracing::info!(
        "streamed for {:?}, {} segments sealed",
        RUN_FOR,
        flushes.load(Ordering::Relaxed)
    );

    // ten seconds of history ending now: backfills what the stream did not see
    let window = TimeRange::new(started.offset(-10 * TimeStamp::NANOS_PER_SECOND), TimeStamp::now());
    for key in &keys {
        let result = conn.read(*key, window, &CancellationToken::new()).await?;
        tracing::info!(
            "channel {}: {} segments, {} samples, {} gaps",
            key,
            result.series.len(),
            result.sample_count(),
            result.gaps.len()
        );
    }

    for (key, stats) in conn.channel_stats() {
        tracing::info!("channel {} stats: {}", key, serde_json::to_string(&stats)?);
    }
    tracing::info!("stream stats: {:?}", conn.stream_stats());
    tracing::info!("simulated store stats: {:?}", store.stats());

    listener.remove().await?;
    conn.close();
    tracing::info!(
        "closed; {} device buffers still live",
        allocator.live_buffers()
    );
    Ok(())
}
