//! The message-passing layer the aggregator is built over.
//!
//! MPI-style non-blocking request/wait pairs collapse into futures here:
//! an `Isend`/`Wait` pair is a future held and awaited later, `Waitany` is
//! `select_all`, and blocking calls are awaited immediately.

mod local;

pub use local::{LoopbackCluster, LoopbackCollective, LoopbackMessaging};

use std::future::Future;

use crate::error::Result;
use crate::types::{DataType, Rank, ReduceOp};

/// Point-to-point and collective operations over a fixed rank set.
///
/// Implementations are process-parallel transports (MPI, or the in-process
/// [`LoopbackCluster`]). Collective calls must be issued in the same order
/// on every rank.
pub trait Messaging: Send + Sync + 'static {
    /// Number of ranks participating.
    fn world_size(&self) -> usize;

    /// This process's rank.
    fn rank(&self) -> Rank;

    /// The rank that gathers and rebroadcasts headers.
    fn main_rank(&self) -> Rank {
        0
    }

    fn is_main(&self) -> bool {
        self.rank() == self.main_rank()
    }

    /// Whether the transport can read device memory directly (GDR).
    fn gpu_direct(&self) -> bool;

    /// Send `payload` to `dest`. The returned future resolves when the send
    /// has completed.
    fn send(&self, dest: Rank, tag: u64, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Receive the next message from `src` carrying `tag`.
    fn recv(&self, src: Rank, tag: u64) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Broadcast `buf` from `root` in place.
    fn broadcast(&self, root: Rank, buf: &mut [u8]) -> impl Future<Output = Result<()>> + Send;

    /// In-place element-wise all-reduce over memory the transport can read
    /// (host memory, or device memory when [`Messaging::gpu_direct`]).
    ///
    /// # Safety
    /// `ptr` must be valid for `count * dtype.size_in_bytes()` bytes for the
    /// lifetime of the returned future.
    unsafe fn all_reduce(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> impl Future<Output = Result<()>> + Send;

    /// All-gather of `count` elements of `elem_bytes` each per rank, placed
    /// in rank order at `recv_ptr`.
    ///
    /// # Safety
    /// `send_ptr` must be valid for `count * elem_bytes` bytes and
    /// `recv_ptr` for `count * elem_bytes * world_size` bytes for the
    /// lifetime of the returned future.
    unsafe fn all_gather(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        elem_bytes: usize,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> impl Future<Output = Result<()>> + Send;
}
