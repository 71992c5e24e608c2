//! Collaborator seams: historical retrieval and the live stream transport
//!
//! Both traits are implemented by whatever talks to the telemetry store. The
//! cache and the multiplexer only ever see these traits, so tests drive them
//! with in-memory fakes and the demo binary with [`crate::sim::SimulatedStore`].

use crate::error::Result;
use crate::segment::{Frame, Segment};
use crate::types::{ChannelDescriptor, ChannelKey, TimeRange};
use async_trait::async_trait;
use crossbeam_channel::Receiver;
use std::collections::BTreeSet;

/// Resolves channel metadata and serves historical data
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Resolve descriptors for `keys`. Keys the store does not know are
    /// omitted from the result.
    async fn retrieve(&self, keys: &[ChannelKey]) -> Result<Vec<ChannelDescriptor>>;

    /// Read stored samples of one channel within `range`. The returned segments
    /// need not cover the whole range.
    async fn read(&self, key: ChannelKey, range: TimeRange) -> Result<Vec<Segment>>;
}

/// Opaque identifier of an open transport stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

/// A freshly opened stream and the queue its frames arrive on
#[derive(Debug)]
pub struct OpenedStream {
    pub handle: StreamHandle,
    pub frames: Receiver<Frame>,
}

/// Live frame source with a mutable channel subscription
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a stream subscribed to `channels`
    async fn open(&self, channels: &BTreeSet<ChannelKey>) -> Result<OpenedStream>;

    /// Replace the subscription of an open stream
    async fn update(&self, handle: StreamHandle, channels: &BTreeSet<ChannelKey>) -> Result<()>;

    /// Close a stream. Frames already queued may still be drained.
    fn close(&self, handle: StreamHandle);
}
