use crate::error::Result;
use crate::transfer::{ComputeStreamEvent, TransferEngine};
use crate::types::DeviceId;

/// An owned block of raw memory (device or pinned host), freed on drop.
pub trait OwnedRegion: Send + Sync {
    fn ptr(&self) -> u64;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bridges the aggregator with an accelerator runtime.
///
/// The aggregator operates on raw `u64` pointers + byte counts; the adapter
/// supplies copies, fills, allocation, and the stream/event factories for
/// one device.
///
/// - [`HostAdapter`](crate::HostAdapter) (built-in): direct pointer access
///   for host memory.
/// - GPU adapters: CUDA copies and page-locked allocation (implemented
///   externally, e.g. by the NCCL backend crate).
pub trait DeviceAdapter: Send + Sync {
    /// The device this adapter is tied to.
    fn device(&self) -> DeviceId;

    /// Bind the calling thread to this adapter's device. Called at the start
    /// of every background aggregation task. Host adapters do nothing.
    fn set_thread_device(&self) -> Result<()> {
        Ok(())
    }

    /// Synchronous device-to-host copy of `dst.len()` bytes.
    ///
    /// # Safety
    /// `src` must be a valid device pointer for at least `dst.len()` bytes.
    unsafe fn copy_device_to_host(&self, src: u64, dst: &mut [u8]) -> Result<()>;

    /// Synchronous host-to-device copy of `src.len()` bytes.
    ///
    /// # Safety
    /// `dst` must be a valid device pointer for at least `src.len()` bytes.
    unsafe fn copy_host_to_device(&self, src: &[u8], dst: u64) -> Result<()>;

    /// Device-to-device copy of `bytes` bytes (used for pack/unpack).
    ///
    /// # Safety
    /// `src` and `dst` must be valid, non-overlapping device pointers for at
    /// least `bytes` bytes each.
    unsafe fn copy_within_device(&self, src: u64, dst: u64, bytes: usize) -> Result<()>;

    /// Zero `bytes` bytes of device memory.
    ///
    /// # Safety
    /// `ptr` must be a valid device pointer for at least `bytes` bytes.
    unsafe fn fill_zero(&self, ptr: u64, bytes: usize) -> Result<()>;

    /// Allocate device memory (packed scratch, shadow gradients).
    fn alloc_device(&self, bytes: usize) -> Result<Box<dyn OwnedRegion>>;

    /// Allocate page-locked host memory for staging.
    fn alloc_pinned(&self, bytes: usize) -> Result<Box<dyn OwnedRegion>>;

    /// A transfer engine bound to a fresh stream pair on this device.
    fn create_transfer_engine(&self) -> Result<Box<dyn TransferEngine>>;

    /// An event recorded on the compute stream at the current point.
    fn create_compute_event(&self) -> Result<Box<dyn ComputeStreamEvent>>;
}
