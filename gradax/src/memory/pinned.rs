use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

use crate::device::{DeviceAdapter, OwnedRegion};
use crate::error::Result;

/// A pool of page-locked host buffers tied to one device.
///
/// Every buffer has the pool's fixed capacity (the largest payload the
/// aggregator will stage), so any returned buffer satisfies any later
/// checkout. Buffers are allocated lazily on first checkout and recycled on
/// drop.
pub struct PinnedBufferPool {
    adapter: Arc<dyn DeviceAdapter>,
    capacity: usize,
    free: ArrayQueue<Box<dyn OwnedRegion>>,
}

impl PinnedBufferPool {
    /// `capacity` is the byte size of each pooled buffer; `max_buffers`
    /// bounds how many are kept for reuse.
    pub fn new(adapter: Arc<dyn DeviceAdapter>, capacity: usize, max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            capacity,
            free: ArrayQueue::new(max_buffers.max(1)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check out a buffer exposing `len` bytes.
    ///
    /// Requests up to the pool capacity reuse pooled memory; larger requests
    /// get a dedicated allocation that is dropped instead of recycled.
    pub fn checkout(self: &Arc<Self>, len: usize) -> Result<PinnedBuf> {
        let region = if len <= self.capacity {
            match self.free.pop() {
                Some(r) => r,
                None => self.adapter.alloc_pinned(self.capacity)?,
            }
        } else {
            self.adapter.alloc_pinned(len)?
        };
        Ok(PinnedBuf {
            region: Some(region),
            len,
            pool: Arc::clone(self),
        })
    }

    fn return_region(&self, region: Box<dyn OwnedRegion>) {
        if region.len() == self.capacity {
            let _ = self.free.push(region);
        }
    }
}

/// A page-locked buffer checked out from a [`PinnedBufferPool`].
///
/// The region is returned to the pool on drop.
pub struct PinnedBuf {
    region: Option<Box<dyn OwnedRegion>>,
    len: usize,
    pool: Arc<PinnedBufferPool>,
}

impl PinnedBuf {
    pub fn ptr(&self) -> u64 {
        self.region.as_ref().expect("PinnedBuf used after drop").ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.ptr() as *mut u8;
        unsafe { std::slice::from_raw_parts_mut(ptr, self.len) }
    }
}

impl Drop for PinnedBuf {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.pool.return_region(region);
        }
    }
}
