//! Device buffer seam for GPU-resident sample mirrors
//!
//! Each dynamic stage mirrors its open buffer into exactly one device buffer so
//! that render passes can draw live data without a CPU to GPU copy on the hot
//! path. The renderer supplies a [`DeviceAllocator`]; the stage owns the
//! returned [`DeviceBuffer`] exclusively and releases it synchronously on close.
//!
//! [`HostAllocator`] is a host-memory implementation that tracks how many
//! buffers and bytes are live. It is used by the demo binary and the tests to
//! verify that reconnect cycles do not leak device memory.

use crate::error::{CacheError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocates device buffers for dynamic stages
pub trait DeviceAllocator: Send + Sync + fmt::Debug {
    /// Allocate a buffer able to hold `bytes` bytes
    fn allocate(&self, bytes: usize) -> Result<Box<dyn DeviceBuffer>>;
}

/// A device-resident byte buffer with a single owner
pub trait DeviceBuffer: Send + fmt::Debug {
    /// Capacity in bytes
    fn capacity(&self) -> usize;

    /// Upload `bytes` at `offset`. Fails if the write would exceed capacity or
    /// the buffer was released.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Free the device memory. Idempotent.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

#[derive(Debug, Default)]
struct HostUsage {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
}

/// Host-memory allocator standing in for a GPU device
#[derive(Debug, Clone, Default)]
pub struct HostAllocator {
    usage: Arc<HostUsage>,
    /// Maximum live bytes before allocation fails
    limit: Option<usize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail allocations that would push live bytes above `limit`
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn live_buffers(&self) -> usize {
        self.usage.live_buffers.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.usage.live_bytes.load(Ordering::SeqCst)
    }

    pub fn total_allocations(&self) -> usize {
        self.usage.total_allocations.load(Ordering::SeqCst)
    }
}

impl DeviceAllocator for HostAllocator {
    fn allocate(&self, bytes: usize) -> Result<Box<dyn DeviceBuffer>> {
        if let Some(limit) = self.limit {
            let live = self.live_bytes();
            if live + bytes > limit {
                return Err(CacheError::Device(format!(
                    "out of device memory: {} bytes live, {} requested, limit {}",
                    live, bytes, limit
                )));
            }
        }
        self.usage.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.usage.live_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.usage.total_allocations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HostBuffer {
            bytes: vec![0; bytes],
            usage: Some(Arc::clone(&self.usage)),
        }))
    }
}

/// Buffer handed out by [`HostAllocator`]
pub struct HostBuffer {
    bytes: Vec<u8>,
    /// `None` once released
    usage: Option<Arc<HostUsage>>,
}

impl HostBuffer {
    /// Current contents, for inspection by tests and debug tooling
    pub fn contents(&self) -> &[u8] {
        &self.bytes
    }
}

impl DeviceBuffer for HostBuffer {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.usage.is_none() {
            return Err(CacheError::Device("write to released buffer".to_string()));
        }
        let end = offset + bytes.len();
        if end > self.bytes.len() {
            return Err(CacheError::Device(format!(
                "write of {} bytes at {} exceeds capacity {}",
                bytes.len(),
                offset,
                self.bytes.len()
            )));
        }
        self.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(usage) = self.usage.take() {
            usage.live_buffers.fetch_sub(1, Ordering::SeqCst);
            usage.live_bytes.fetch_sub(self.bytes.len(), Ordering::SeqCst);
            self.bytes = Vec::new();
        }
    }

    fn is_released(&self) -> bool {
        self.usage.is_none()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("capacity", &self.bytes.len())
            .field("released", &self.usage.is_none())
            .finish()
    }
}
