//! In-memory collaborators that record how they were called

use async_trait::async_trait;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use telemcache::remote::{OpenedStream, Retriever, StreamHandle, StreamTransport};
use telemcache::{
    CacheError, ChannelDescriptor, ChannelKey, DataType, Frame, Result, Segment, TimeRange,
};
use tokio::sync::Semaphore;

/// Retriever with a fixed channel table, optional gating and failure injection
#[derive(Default)]
pub struct FakeRetriever {
    descriptors: Mutex<HashMap<ChannelKey, ChannelDescriptor>>,
    history: Mutex<HashMap<ChannelKey, Vec<Segment>>>,
    pub retrieve_calls: Mutex<Vec<Vec<ChannelKey>>>,
    pub read_calls: Mutex<Vec<(ChannelKey, TimeRange)>>,
    /// When set, `retrieve` waits for a permit before answering
    gate: Option<Semaphore>,
    pub fail_retrieve: AtomicBool,
    pub fail_read: AtomicBool,
}

impl FakeRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// `retrieve` blocks until [`FakeRetriever::release`] is called
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn with_channel(self, key: u32, data_type: DataType) -> Self {
        self.descriptors
            .lock()
            .insert(ChannelKey(key), ChannelDescriptor::new(key, data_type));
        self
    }

    /// Stored segments served by `read`, trimmed to each request
    pub fn with_history(self, key: u32, segments: Vec<Segment>) -> Self {
        self.history.lock().insert(ChannelKey(key), segments);
        self
    }

    /// Let `n` gated `retrieve` calls through
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn retrieve_count(&self) -> usize {
        self.retrieve_calls.lock().len()
    }
}

#[async_trait]
impl Retriever for FakeRetriever {
    async fn retrieve(&self, keys: &[ChannelKey]) -> Result<Vec<ChannelDescriptor>> {
        self.retrieve_calls.lock().push(keys.to_vec());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| CacheError::Transport(e.to_string()))?
                .forget();
        }
        if self.fail_retrieve.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("retrieval refused".to_string()));
        }
        let descriptors = self.descriptors.lock();
        Ok(keys.iter().filter_map(|k| descriptors.get(k).cloned()).collect())
    }

    async fn read(&self, key: ChannelKey, range: TimeRange) -> Result<Vec<Segment>> {
        self.read_calls.lock().push((key, range));
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("read refused".to_string()));
        }
        Ok(self
            .history
            .lock()
            .get(&key)
            .map(|segments| segments.iter().filter_map(|s| s.trim(&range)).collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open(Vec<u32>),
    Update(Vec<u32>),
    Close,
}

/// Transport that records every call and lets tests inject frames
#[derive(Default)]
pub struct FakeTransport {
    pub calls: Mutex<Vec<TransportCall>>,
    sender: Mutex<Option<Sender<Frame>>>,
    next: AtomicU64,
    pub fail: AtomicBool,
}

fn raw(channels: &BTreeSet<ChannelKey>) -> Vec<u32> {
    channels.iter().map(|k| k.0).collect()
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame on the open stream. Returns false if no stream is open.
    pub fn send(&self, frame: Frame) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Number of update calls whose channel set contains `key`
    pub fn updates_containing(&self, key: u32) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, TransportCall::Update(keys) if keys.contains(&key)))
            .count()
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn open(&self, channels: &BTreeSet<ChannelKey>) -> Result<OpenedStream> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("open refused".to_string()));
        }
        self.calls.lock().push(TransportCall::Open(raw(channels)));
        let (tx, rx) = crossbeam_channel::unbounded();
        *self.sender.lock() = Some(tx);
        Ok(OpenedStream {
            handle: StreamHandle(self.next.fetch_add(1, Ordering::SeqCst)),
            frames: rx,
        })
    }

    async fn update(&self, _handle: StreamHandle, channels: &BTreeSet<ChannelKey>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("update refused".to_string()));
        }
        self.calls.lock().push(TransportCall::Update(raw(channels)));
        Ok(())
    }

    fn close(&self, _handle: StreamHandle) {
        self.calls.lock().push(TransportCall::Close);
        *self.sender.lock() = None;
    }
}
