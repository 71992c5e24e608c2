//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod fakes;

use std::time::Duration;
use telemcache::Segment;

/// Upper bound for waiting on spawned tasks
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Yield until `cond` holds, panicking after [`test_timeout`]
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(test_timeout(), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not met before timeout");
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Assert that consecutive segments tile time without gaps or overlap
pub fn assert_contiguous(segments: &[Segment]) {
    for pair in segments.windows(2) {
        assert_eq!(
            pair[0].time_range().end,
            pair[1].time_range().start,
            "segments {:?} and {:?} are not contiguous",
            pair[0],
            pair[1]
        );
    }
}
