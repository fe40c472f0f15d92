//! The pipelined reduce orchestrator: one of four backends per call, run
//! concurrently with the header exchange.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;

use crate::collective::{DeviceCollective, DeviceSpan};
use crate::config::AggConfig;
use crate::device::DeviceAdapter;
use crate::error::Result;
use crate::header::GradHeader;
use crate::memory::{PinnedBuf, PinnedBufferPool};
use crate::messaging::Messaging;
use crate::probe::{Branch, Capabilities};
use crate::stats::{AggTrace, Stage};
use crate::tensor::GradTensor;
use crate::transfer::TransferEngine;
use crate::types::ReduceOp;

use super::exchange::exchange_headers;
use super::plan::{AggPlan, AggSlot, Scratch};

/// The synchronous aggregation engine. Owns the one-shot plan, the packed
/// scratch, host staging, and the transfer engines; in asynchronous mode the
/// whole core moves onto the background task and back.
pub(crate) struct SyncCore<M: Messaging> {
    mpi: Arc<M>,
    collective: Arc<dyn DeviceCollective>,
    adapter: Arc<dyn DeviceAdapter>,
    plan: AggPlan,
    scratch: Option<Scratch>,
    pool: Option<Arc<PinnedBufferPool>>,
    staging: Vec<PinnedBuf>,
    engines: Vec<Box<dyn TransferEngine>>,
    recv_headers: Vec<GradHeader>,
    sync_transfer_on_zero: bool,
    pub(crate) trace: AggTrace,
}

impl<M: Messaging> SyncCore<M> {
    /// One-shot capacity planning over the first call's gradient set.
    ///
    /// Host staging is deferred to the first call that actually stages
    /// through the host, so a run that starts (or ends up) on the device
    /// collective never allocates pinned memory.
    pub(crate) fn new(
        mpi: Arc<M>,
        collective: Arc<dyn DeviceCollective>,
        adapter: Arc<dyn DeviceAdapter>,
        gradients: &[GradTensor],
        num_eval: usize,
        config: &AggConfig,
    ) -> Result<Self> {
        let mut plan = AggPlan::build(gradients, config.use_async, config.pack_threshold_bytes)?;
        let scratch = Scratch::allocate(&*adapter, &mut plan, gradients.len());
        let recv_headers = if mpi.is_main() {
            vec![GradHeader::new(num_eval); mpi.world_size() - 1]
        } else {
            Vec::new()
        };
        Ok(Self {
            mpi,
            collective,
            adapter,
            plan,
            scratch,
            pool: None,
            staging: Vec::new(),
            engines: Vec::new(),
            recv_headers,
            sync_transfer_on_zero: config.use_async,
            trace: AggTrace::new(config.detail_profile),
        })
    }

    /// Reduce every gradient across ranks and aggregate the header.
    ///
    /// On return every rank holds the element-wise sum of every gradient,
    /// the aggregated header, and no pending work.
    ///
    /// # Safety
    /// Every gradient's pointer (and the scratch, staging, and shadow
    /// storage reachable from the plan) must be valid and unaliased for the
    /// duration of the call.
    pub(crate) async unsafe fn aggregate(
        &mut self,
        gradients: &[GradTensor],
        header: &mut GradHeader,
        show_stats: bool,
    ) -> Result<()> {
        let call_started = show_stats.then(Instant::now);
        let device = gradients[0].device();
        let caps = Capabilities::probe(&*self.mpi, &*self.collective, device);
        let branch = caps.branch();
        tracing::debug!(
            target: "gradax::aggregate",
            branch = branch.name(),
            gpu_direct = caps.gpu_direct,
            device_collective = caps.device_collective,
            on_host = caps.on_host,
            "selected reduction backend"
        );

        // A rank that processed no samples contributes zeros.
        if header.num_samples == 0 {
            header.debug_assert_zeroed();
            let t = self.trace.start();
            for g in gradients {
                unsafe { self.adapter.fill_zero(g.ptr(), g.byte_len())? };
            }
            if self.sync_transfer_on_zero {
                let event = self.adapter.create_compute_event()?;
                event.synchronize_transfer_stream()?;
            }
            self.trace.record(Stage::Zero, t);
        }

        if let Some(scratch) = &self.scratch {
            let t = self.trace.start();
            let elem = self.plan.dtype.size_in_bytes();
            let mut offset = 0usize;
            for &i in &self.plan.packed {
                let g = &gradients[i];
                unsafe {
                    self.adapter.copy_within_device(
                        g.ptr(),
                        scratch.ptr() + (offset * elem) as u64,
                        g.byte_len(),
                    )?
                };
                offset += g.element_count();
            }
            self.trace.record(Stage::Pack, t);
        }

        if branch == Branch::HostStaged {
            self.ensure_staging(gradients)?;
        }

        // A tag equal to the gradient count separates header traffic from
        // anything else in flight.
        let tag = gradients.len() as u64;
        let t = self.trace.start();
        {
            let Self {
                mpi,
                collective,
                adapter,
                plan,
                scratch,
                staging,
                engines,
                recv_headers,
                ..
            } = &mut *self;
            let reduce_fut = unsafe {
                reduce_gradients(
                    &**mpi,
                    &**collective,
                    &**adapter,
                    plan,
                    scratch.as_ref(),
                    staging,
                    engines,
                    gradients,
                    branch,
                )
            };
            let exchange_fut = exchange_headers(&**mpi, header, recv_headers, tag);
            let (exchanged, reduced) = tokio::join!(exchange_fut, reduce_fut);
            exchanged?;
            reduced?;
        }
        self.trace.record(Stage::Reduce, t);

        if let Some(scratch) = &self.scratch {
            let t = self.trace.start();
            let elem = self.plan.dtype.size_in_bytes();
            let mut offset = 0usize;
            for &i in &self.plan.packed {
                let g = &gradients[i];
                unsafe {
                    self.adapter.copy_within_device(
                        scratch.ptr() + (offset * elem) as u64,
                        g.ptr(),
                        g.byte_len(),
                    )?
                };
                offset += g.element_count();
            }
            self.trace.record(Stage::Unpack, t);
        }

        if let Some(started) = call_started {
            tracing::info!(
                target: "gradax::aggregate",
                seconds = started.elapsed().as_secs_f64(),
                "gradient aggregation time"
            );
        }
        Ok(())
    }

    /// Allocate the pinned staging buffers and transfer engines, one per
    /// slot, on the first host-staged call.
    fn ensure_staging(&mut self, gradients: &[GradTensor]) -> Result<()> {
        if self.staging.len() == self.plan.slots.len() {
            return Ok(());
        }
        let pool = if let Some(pool) = &self.pool {
            Arc::clone(pool)
        } else {
            let capacity = self.plan.max_slot_bytes(gradients);
            let pool = PinnedBufferPool::new(Arc::clone(&self.adapter), capacity, self.plan.slots.len());
            self.pool = Some(Arc::clone(&pool));
            pool
        };
        let elem = self.plan.dtype.size_in_bytes();
        for &slot in &self.plan.slots {
            let bytes = self.plan.slot_elements(slot, gradients) * elem;
            self.staging.push(pool.checkout(bytes)?);
            self.engines.push(self.adapter.create_transfer_engine()?);
        }
        Ok(())
    }
}

/// Reduce every slot across ranks through the selected backend.
///
/// # Safety
/// See [`SyncCore::aggregate`].
#[allow(clippy::too_many_arguments)]
async unsafe fn reduce_gradients<M: Messaging>(
    mpi: &M,
    collective: &dyn DeviceCollective,
    adapter: &dyn DeviceAdapter,
    plan: &AggPlan,
    scratch: Option<&Scratch>,
    staging: &mut [PinnedBuf],
    engines: &[Box<dyn TransferEngine>],
    gradients: &[GradTensor],
    branch: Branch,
) -> Result<()> {
    if plan.slots.is_empty() {
        return Ok(());
    }
    let dtype = plan.dtype;
    let span_of = |slot: AggSlot| -> (u64, usize) {
        match slot {
            AggSlot::Packed => {
                let scratch = scratch.expect("packed slot requires the scratch buffer");
                (scratch.ptr(), scratch.elements())
            }
            AggSlot::Individual(i) => (gradients[i].ptr(), gradients[i].element_count()),
        }
    };

    match branch {
        Branch::HostStaged => {
            let elem = dtype.size_in_bytes();
            let n = plan.slots.len();
            debug_assert_eq!(staging.len(), n);
            debug_assert_eq!(engines.len(), n);

            // Prime the pipeline: the first device-to-host copy completes
            // before any reduction begins.
            let (first_ptr, first_count) = span_of(plan.slots[0]);
            unsafe {
                adapter
                    .copy_device_to_host(first_ptr, &mut staging[0].as_mut_slice()[..first_count * elem])?
            };

            for i in 0..n {
                // Overlap: start copying slot i+1 down while slot i reduces.
                if i + 1 < n {
                    let (next_ptr, next_count) = span_of(plan.slots[i + 1]);
                    unsafe {
                        engines[i + 1].copy_device_to_host_async(
                            next_ptr,
                            staging[i + 1].ptr(),
                            next_count * elem,
                        )?
                    };
                }
                if i > 0 {
                    engines[i].wait_device_to_host()?;
                }
                let (ptr, count) = span_of(plan.slots[i]);
                unsafe { mpi.all_reduce(staging[i].ptr(), count, dtype, ReduceOp::Sum) }.await?;
                unsafe { engines[i].copy_host_to_device_async(staging[i].ptr(), ptr, count * elem)? };
            }
            for engine in engines {
                engine.wait_host_to_device()?;
            }
        }
        Branch::DeviceDirect => {
            for &slot in &plan.slots {
                let (ptr, count) = span_of(slot);
                unsafe { mpi.all_reduce(ptr, count, dtype, ReduceOp::Sum) }.await?;
            }
        }
        Branch::HostMessaging => {
            let reduces: Vec<_> = plan
                .slots
                .iter()
                .map(|&slot| {
                    let (ptr, count) = span_of(slot);
                    unsafe { mpi.all_reduce(ptr, count, dtype, ReduceOp::Sum) }
                })
                .collect();
            try_join_all(reduces).await?;
        }
        Branch::DeviceCollective => {
            let spans: Vec<DeviceSpan> = plan
                .slots
                .iter()
                .map(|&slot| {
                    let (ptr, count) = span_of(slot);
                    DeviceSpan { ptr, count, dtype }
                })
                .collect();
            unsafe { collective.all_reduce_batch(&spans) }.await?;
            collective.sync()?;
        }
    }
    Ok(())
}
