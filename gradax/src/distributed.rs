//! All-gather / all-reduce entry points sharing the aggregator's backend
//! selection, for non-gradient tensors (statistics, parameter sync).

use std::sync::Arc;

use crate::aggregator::GradAggregator;
use crate::error::{AggError, Result};
use crate::memory::{PinnedBuf, PinnedBufferPool};
use crate::messaging::Messaging;
use crate::probe::{Branch, Capabilities};
use crate::tensor::GradTensor;
use crate::types::{DeviceId, ReduceOp};

/// The two pinned staging buffers (send and receive side) used when the
/// distributed primitives must stage through the host.
#[derive(Default)]
pub(crate) struct DistStaging {
    send: Option<PinnedBuf>,
    recv: Option<PinnedBuf>,
    _pool: Option<Arc<PinnedBufferPool>>,
}

impl<M: Messaging> GradAggregator<M> {
    /// Pre-size the staging buffers for the distributed primitives.
    ///
    /// `buffer_bytes` must cover the largest payload either side will carry;
    /// for all-gather that is the fully gathered image. A no-op when nothing
    /// would be staged (single rank, host tensors, GDR, or an operable
    /// device collective).
    pub fn distributed_init(&mut self, device: DeviceId, buffer_bytes: usize) -> Result<()> {
        if self.mpi.world_size() == 1 {
            return Ok(());
        }
        let caps = Capabilities::probe(&*self.mpi, &*self.collective, device);
        if caps.stage_through_host() {
            let pool = PinnedBufferPool::new(Arc::clone(&self.adapter), buffer_bytes, 2);
            self.dist.send = Some(pool.checkout(buffer_bytes)?);
            self.dist.recv = Some(pool.checkout(buffer_bytes)?);
            self.dist._pool = Some(pool);
        }
        Ok(())
    }

    /// Whether `value` is identical on every rank: one all-gather plus a
    /// local scan. Detects desynchronized minibatch sizes.
    pub async fn distributed_check(&self, value: u64, rank_count: usize) -> Result<bool> {
        if rank_count != self.mpi.world_size() {
            return Err(AggError::BufferSizeMismatch {
                expected: self.mpi.world_size() * 8,
                actual: rank_count * 8,
            });
        }
        let send = value.to_le_bytes();
        let mut gathered = vec![0u8; 8 * rank_count];
        unsafe {
            self.mpi
                .all_gather(send.as_ptr() as u64, gathered.as_mut_ptr() as u64, 1, 8)
        }
        .await?;
        let first = &gathered[0..8];
        Ok(gathered.chunks_exact(8).all(|chunk| chunk == first))
    }

    /// Gather `count` elements from every rank's `src` into `dst`, in rank
    /// order.
    ///
    /// # Safety
    /// `src` must be valid for `count` elements and `dst` for
    /// `count * world_size` elements for the duration of the call.
    pub async unsafe fn distributed_all_gather(
        &mut self,
        src: &GradTensor,
        dst: &GradTensor,
        count: usize,
    ) -> Result<()> {
        let caps = Capabilities::probe(&*self.mpi, &*self.collective, src.device());
        let dtype = src.dtype();
        let elem = dtype.size_in_bytes();
        match caps.branch() {
            Branch::HostStaged => {
                let world = self.mpi.world_size();
                let send_bytes = count * elem;
                let gathered_bytes = send_bytes * world;
                if dst.byte_len() != gathered_bytes {
                    return Err(AggError::BufferSizeMismatch {
                        expected: gathered_bytes,
                        actual: dst.byte_len(),
                    });
                }
                let (send_buf, recv_buf) = match (&mut self.dist.send, &mut self.dist.recv) {
                    (Some(send), Some(recv)) => (send, recv),
                    _ => return Err(AggError::StagingUnavailable),
                };
                if send_bytes > send_buf.len() || gathered_bytes > recv_buf.len() {
                    return Err(AggError::BufferSizeMismatch {
                        expected: gathered_bytes,
                        actual: recv_buf.len(),
                    });
                }
                unsafe {
                    self.adapter
                        .copy_device_to_host(src.ptr(), &mut send_buf.as_mut_slice()[..send_bytes])?
                };
                unsafe { self.mpi.all_gather(send_buf.ptr(), recv_buf.ptr(), count, elem) }.await?;
                unsafe {
                    self.adapter
                        .copy_host_to_device(&recv_buf.as_mut_slice()[..gathered_bytes], dst.ptr())?
                };
            }
            Branch::HostMessaging | Branch::DeviceDirect => {
                unsafe { self.mpi.all_gather(src.ptr(), dst.ptr(), count, elem) }.await?;
            }
            Branch::DeviceCollective => {
                unsafe { self.collective.all_gather(src.ptr(), dst.ptr(), count, dtype) }.await?;
                self.collective.sync()?;
            }
        }
        Ok(())
    }

    /// In-place all-reduce of `buf` with an associative-commutative
    /// operator.
    ///
    /// # Safety
    /// `buf`'s pointer must be valid for its byte length for the duration
    /// of the call.
    pub async unsafe fn distributed_all_reduce(
        &mut self,
        buf: &GradTensor,
        op: ReduceOp,
    ) -> Result<()> {
        let caps = Capabilities::probe(&*self.mpi, &*self.collective, buf.device());
        let dtype = buf.dtype();
        let count = buf.element_count();
        match caps.branch() {
            Branch::HostStaged => {
                let bytes = buf.byte_len();
                let staged = match &mut self.dist.send {
                    Some(staged) => staged,
                    None => return Err(AggError::StagingUnavailable),
                };
                if bytes > staged.len() {
                    return Err(AggError::BufferSizeMismatch {
                        expected: bytes,
                        actual: staged.len(),
                    });
                }
                unsafe {
                    self.adapter
                        .copy_device_to_host(buf.ptr(), &mut staged.as_mut_slice()[..bytes])?
                };
                unsafe { self.mpi.all_reduce(staged.ptr(), count, dtype, op) }.await?;
                unsafe {
                    self.adapter
                        .copy_host_to_device(&staged.as_mut_slice()[..bytes], buf.ptr())?
                };
            }
            Branch::HostMessaging | Branch::DeviceDirect => {
                unsafe { self.mpi.all_reduce(buf.ptr(), count, dtype, op) }.await?;
            }
            Branch::DeviceCollective => {
                unsafe {
                    self.collective
                        .all_reduce(buf.ptr(), buf.ptr(), count, dtype, op)
                }
                .await?;
                self.collective.sync()?;
            }
        }
        Ok(())
    }

    /// Barrier across the full rank set via the messaging layer.
    pub async fn wait_all(&self) -> Result<()> {
        self.mpi.barrier().await
    }
}
