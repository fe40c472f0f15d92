//! Stream/event primitives for overlapping device↔host copies with
//! host-side collective reductions.

use crate::error::Result;

/// Schedules asynchronous copies between device memory and pinned host
/// memory on a dedicated transfer stream.
///
/// One engine binds one device-to-host / host-to-device stream pair; the
/// aggregator keeps one engine per staging buffer so pipeline stages can be
/// waited on independently.
pub trait TransferEngine: Send + Sync {
    /// Enqueue a device-to-host copy. Returns once the copy is scheduled.
    ///
    /// # Safety
    /// `src` must be a valid device pointer and `dst` a valid pinned host
    /// pointer, each for at least `bytes` bytes, and both must stay valid
    /// until [`TransferEngine::wait_device_to_host`] returns.
    unsafe fn copy_device_to_host_async(&self, src: u64, dst: u64, bytes: usize) -> Result<()>;

    /// Enqueue a host-to-device copy. Returns once the copy is scheduled.
    ///
    /// # Safety
    /// `src` must be a valid pinned host pointer and `dst` a valid device
    /// pointer, each for at least `bytes` bytes, and both must stay valid
    /// until [`TransferEngine::wait_host_to_device`] returns.
    unsafe fn copy_host_to_device_async(&self, src: u64, dst: u64, bytes: usize) -> Result<()>;

    /// Block until the last enqueued device-to-host copy has completed.
    fn wait_device_to_host(&self) -> Result<()>;

    /// Block until the last enqueued host-to-device copy has completed.
    fn wait_host_to_device(&self) -> Result<()>;
}

/// A marker recorded on the compute stream at creation time.
///
/// Background aggregation begins by synchronizing the transfer stream
/// against the recorded point, so the compute stream's gradient writes are
/// visible before any device-to-host copy is issued.
pub trait ComputeStreamEvent: Send {
    /// Make the transfer stream wait for the recorded work. Does not block
    /// the calling thread.
    fn synchronize_transfer_stream(&self) -> Result<()>;

    /// Block the calling thread until the recorded work has completed.
    fn synchronize(&self) -> Result<()>;
}
