//! End-to-end tests for a connection: read-through, live streaming and config

mod common;

use common::builders::{frame_at, live_batch, SegmentBuilder};
use common::fakes::{FakeRetriever, FakeTransport, TransportCall};
use parking_lot::Mutex;
use std::sync::Arc;
use telemcache::config::Config;
use telemcache::gpu::HostAllocator;
use telemcache::{CacheError, ChannelKey, Connection, DataType, Frame, TimeRange};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    retriever: Arc<FakeRetriever>,
    transport: Arc<FakeTransport>,
    allocator: HostAllocator,
    conn: Connection,
}

/// Channel 1 has ten samples of history over [0, 1000); channel 2 has none
fn harness(config: &Config) -> Harness {
    let history = SegmentBuilder::new(DataType::F64)
        .start(0)
        .count(10)
        .step(100)
        .range(0, 1000)
        .build();
    let retriever = Arc::new(
        FakeRetriever::new()
            .with_channel(1, DataType::F64)
            .with_channel(2, DataType::F64)
            .with_history(1, vec![history]),
    );
    let transport = Arc::new(FakeTransport::new());
    let allocator = HostAllocator::new();
    let conn = Connection::new(
        retriever.clone(),
        transport.clone(),
        Arc::new(allocator.clone()),
        config,
    );
    Harness {
        retriever,
        transport,
        allocator,
        conn,
    }
}

fn small_config() -> Config {
    let mut config = Config::default();
    config.cache.dynamic_capacity = 4;
    config
}

// ============================================================================
// Read-through
// ============================================================================

#[tokio::test]
async fn test_read_fetches_then_serves_from_cache() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    let range = TimeRange::from_nanos(0, 1000);

    let first = h.conn.read(ChannelKey(1), range, &token).await.unwrap();
    assert!(first.is_complete());
    assert_eq!(first.sample_count(), 10);

    let second = h.conn.read(ChannelKey(1), range, &token).await.unwrap();
    assert_eq!(second.sample_count(), 10);
    assert_eq!(h.retriever.read_calls.lock().len(), 1);
    assert_eq!(h.retriever.retrieve_count(), 1);
}

#[tokio::test]
async fn test_read_fetches_only_missing_span() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();

    h.conn
        .read(ChannelKey(1), TimeRange::from_nanos(0, 500), &token)
        .await
        .unwrap();
    let wider = h
        .conn
        .read(ChannelKey(1), TimeRange::from_nanos(0, 1000), &token)
        .await
        .unwrap();

    assert!(wider.is_complete());
    assert_eq!(wider.sample_count(), 10);
    assert_eq!(
        *h.retriever.read_calls.lock(),
        vec![
            (ChannelKey(1), TimeRange::from_nanos(0, 500)),
            (ChannelKey(1), TimeRange::from_nanos(500, 1000)),
        ]
    );
}

#[tokio::test]
async fn test_empty_history_is_cached_as_covered() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    let range = TimeRange::from_nanos(0, 100);

    let read = h.conn.read(ChannelKey(2), range, &token).await.unwrap();
    assert!(read.is_complete());
    assert_eq!(read.sample_count(), 0);

    h.conn.read(ChannelKey(2), range, &token).await.unwrap();
    assert_eq!(h.retriever.read_calls.lock().len(), 1);
}

#[tokio::test]
async fn test_read_of_unknown_channel() {
    let h = harness(&Config::default());
    let err = h
        .conn
        .read(
            ChannelKey(99),
            TimeRange::from_nanos(0, 10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound(ChannelKey(99)));
}

#[tokio::test]
async fn test_failed_fetch_leaves_gap_for_retry() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    let range = TimeRange::from_nanos(0, 1000);

    h.retriever
        .fail_read
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = h.conn.read(ChannelKey(1), range, &token).await.unwrap_err();
    assert!(err.is_retryable());

    h.retriever
        .fail_read
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let read = h.conn.read(ChannelKey(1), range, &token).await.unwrap();
    assert!(read.is_complete());
    assert_eq!(read.sample_count(), 10);
}

#[tokio::test]
async fn test_cancelled_read() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    token.cancel();
    let err = h
        .conn
        .read(ChannelKey(1), TimeRange::from_nanos(0, 1000), &token)
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Cancelled);
    assert!(h.retriever.read_calls.lock().is_empty());
}

// ============================================================================
// Live streaming
// ============================================================================

#[tokio::test]
async fn test_stream_live_seals_into_static() {
    let h = harness(&small_config());
    let token = CancellationToken::new();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);

    let _guard = h
        .conn
        .stream_live(
            &[ChannelKey(1)],
            move |key, result| {
                let write = result.as_ref().unwrap();
                sink.lock().push((key, write.flushed.len()));
            },
            &token,
        )
        .await
        .unwrap();
    assert_eq!(h.transport.calls(), vec![TransportCall::Open(vec![1])]);

    for t in 2000..2010 {
        h.transport.send(frame_at(&[1], t));
    }
    assert_eq!(h.conn.pump(), 10);

    let updates = updates.lock();
    assert_eq!(updates.len(), 10);
    let flushed: usize = updates.iter().map(|(_, n)| n).sum();
    // ceil(10 / 4) - 1
    assert_eq!(flushed, 2);

    let stats = h.conn.channel_stats();
    assert_eq!(stats[0].1.open_samples, 2);
    assert_eq!(stats[0].1.flushes, 2);
}

#[tokio::test]
async fn test_backfill_stops_at_live_segment() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    let _guard = h
        .conn
        .stream_live(&[ChannelKey(1)], |_, _| {}, &token)
        .await
        .unwrap();

    h.transport.send(Frame::new().with(ChannelKey(1), live_batch(2000, 5)));
    h.conn.pump();

    let read = h
        .conn
        .read(ChannelKey(1), TimeRange::from_nanos(0, 3000), &token)
        .await
        .unwrap();
    assert_eq!(
        *h.retriever.read_calls.lock(),
        vec![(ChannelKey(1), TimeRange::from_nanos(0, 2000))]
    );
    assert_eq!(read.sample_count(), 15);
    assert_eq!(read.gaps, vec![TimeRange::from_nanos(2005, 3000)]);
}

#[tokio::test]
async fn test_two_listeners_on_one_channel_ingest_once() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    let seen = Arc::new(Mutex::new(0usize));

    let mut guards = Vec::new();
    for _ in 0..2 {
        let seen = Arc::clone(&seen);
        guards.push(
            h.conn
                .stream_live(
                    &[ChannelKey(1)],
                    move |_, result| {
                        assert!(result.is_ok());
                        *seen.lock() += 1;
                    },
                    &token,
                )
                .await
                .unwrap(),
        );
    }

    h.transport.send(frame_at(&[1], 100));
    h.transport.send(frame_at(&[1], 101));
    h.conn.pump();

    // the second listener finds each sample already ingested
    assert_eq!(*seen.lock(), 2);
    assert_eq!(h.conn.channel_stats()[0].1.samples_written, 2);
    assert_eq!(h.conn.stream_stats().frames_dispatched, 4);
}

#[tokio::test]
async fn test_listener_removal_narrows_subscription() {
    let h = harness(&Config::default());
    let token = CancellationToken::new();
    let a = h
        .conn
        .stream_live(&[ChannelKey(1)], |_, _| {}, &token)
        .await
        .unwrap();
    let b = h
        .conn
        .stream_live(&[ChannelKey(1), ChannelKey(2)], |_, _| {}, &token)
        .await
        .unwrap();

    b.remove().await.unwrap();
    assert_eq!(h.transport.updates_containing(2), 1);
    assert_eq!(
        h.transport.calls().last(),
        Some(&TransportCall::Update(vec![1]))
    );

    a.remove().await.unwrap();
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::Close));
}

#[tokio::test]
async fn test_run_pumps_until_cancelled() {
    let h = Arc::new(harness(&small_config()));
    let token = CancellationToken::new();
    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);
    let _guard = h
        .conn
        .stream_live(&[ChannelKey(2)], move |_, _| *sink.lock() += 1, &token)
        .await
        .unwrap();

    let runner = {
        let (h, token) = (Arc::clone(&h), token.clone());
        tokio::spawn(async move { h.conn.run(&token).await })
    };
    for t in 0..3 {
        h.transport.send(frame_at(&[2], t));
    }
    common::wait_until(|| *count.lock() == 3).await;
    token.cancel();
    runner.await.unwrap();
}

// ============================================================================
// Lifecycle and configuration
// ============================================================================

#[tokio::test]
async fn test_close_releases_everything() {
    let h = harness(&small_config());
    let token = CancellationToken::new();
    let _guard = h
        .conn
        .stream_live(&[ChannelKey(1), ChannelKey(2)], |_, _| {}, &token)
        .await
        .unwrap();
    assert_eq!(h.allocator.live_buffers(), 2);

    h.conn.close();
    assert_eq!(h.allocator.live_buffers(), 0);
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::Close));

    let err = h
        .conn
        .read(ChannelKey(1), TimeRange::from_nanos(0, 10), &token)
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Closed);
}

#[tokio::test]
async fn test_connection_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("telemcache.toml");
    std::fs::write(
        &path,
        "[cache]\ndynamic_capacity = 2\n\n[stream]\npump_interval_ms = 5\n",
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.cache.dynamic_capacity, 2);
    assert_eq!(config.stream.frame_buffer, 1024);

    let h = harness(&config);
    let token = CancellationToken::new();
    let _guard = h
        .conn
        .stream_live(&[ChannelKey(2)], |_, _| {}, &token)
        .await
        .unwrap();
    for t in 0..5 {
        h.transport.send(frame_at(&[2], t));
    }
    h.conn.pump();
    assert_eq!(h.conn.channel_stats()[0].1.flushes, 2);
}
