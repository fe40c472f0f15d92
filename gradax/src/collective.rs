//! Interface to a device-direct collective library (e.g. NCCL).

use futures::future::BoxFuture;

use crate::error::{AggError, Result};
use crate::types::{DataType, ReduceOp};

/// A contiguous span of device memory handed to the collective library.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpan {
    pub ptr: u64,
    pub count: usize,
    pub dtype: DataType,
}

/// A high-performance all-reduce/all-gather implementation operating
/// directly over device memory on its own streams.
///
/// Implementations may initialize lazily: `is_supported` is probed on every
/// aggregation and is allowed to turn `true` mid-run once the library comes
/// up. Operations enqueue onto the library's stream; [`DeviceCollective::sync`]
/// drains it.
pub trait DeviceCollective: Send + Sync {
    /// Whether the library is initialized and operable over this rank set.
    fn is_supported(&self) -> bool;

    /// In-place sum-reduce of every span, batched into one collective launch.
    ///
    /// # Safety
    /// Every span's `ptr` must be a valid device pointer for
    /// `count * dtype.size_in_bytes()` bytes until [`DeviceCollective::sync`]
    /// returns.
    unsafe fn all_reduce_batch<'a>(&'a self, spans: &'a [DeviceSpan]) -> BoxFuture<'a, Result<()>>;

    /// All-reduce with separate send/recv pointers and an explicit operator.
    ///
    /// # Safety
    /// Both pointers must be valid device pointers for
    /// `count * dtype.size_in_bytes()` bytes until [`DeviceCollective::sync`]
    /// returns. `send` and `recv` may be equal (in-place).
    unsafe fn all_reduce<'a>(
        &'a self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>>;

    /// All-gather: each rank contributes `count` elements.
    ///
    /// # Safety
    /// `send` must be valid for `count` elements and `recv` for
    /// `count * world_size` elements until [`DeviceCollective::sync`] returns.
    unsafe fn all_gather<'a>(
        &'a self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
    ) -> BoxFuture<'a, Result<()>>;

    /// Block until all enqueued collective work has completed.
    fn sync(&self) -> Result<()>;
}

/// The always-absent collective: capability probes report `false` and the
/// backend-selection logic never routes an operation here.
pub struct NullCollective;

impl DeviceCollective for NullCollective {
    fn is_supported(&self) -> bool {
        false
    }

    unsafe fn all_reduce_batch<'a>(&'a self, _spans: &'a [DeviceSpan]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(AggError::device("device collective library not available")) })
    }

    unsafe fn all_reduce<'a>(
        &'a self,
        _send: u64,
        _recv: u64,
        _count: usize,
        _dtype: DataType,
        _op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(AggError::device("device collective library not available")) })
    }

    unsafe fn all_gather<'a>(
        &'a self,
        _send: u64,
        _recv: u64,
        _count: usize,
        _dtype: DataType,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(AggError::device("device collective library not available")) })
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
