//! The distributed gradient aggregator.

mod exchange;
mod plan;
mod sync;

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::collective::{DeviceCollective, NullCollective};
use crate::config::AggConfig;
use crate::device::{DeviceAdapter, HostAdapter, OwnedRegion};
use crate::error::{AggError, Result};
use crate::header::GradHeader;
use crate::messaging::Messaging;
use crate::stats::Stage;
use crate::tensor::GradTensor;

pub(crate) use sync::SyncCore;

/// Shadow copies of the live gradients and header, swapped in on every
/// asynchronous call.
pub(crate) struct ShadowSet {
    gradients: Vec<GradTensor>,
    header: GradHeader,
    /// Keeps the shadow storage alive; the views above point into it.
    _regions: Vec<Box<dyn OwnedRegion>>,
}

type TaskReturn<M> = (SyncCore<M>, ShadowSet, Result<()>);

/// Aggregates dense gradients and a statistics header across a fixed set of
/// worker processes.
///
/// Synchronous mode reduces in place and returns when every rank holds the
/// element-wise sum. Asynchronous mode double-buffers: each call returns the
/// previous iteration's aggregate and hands the current gradients to a
/// background task, overlapping aggregation with the next forward/backward.
pub struct GradAggregator<M: Messaging> {
    pub(crate) mpi: Arc<M>,
    pub(crate) adapter: Arc<dyn DeviceAdapter>,
    pub(crate) collective: Arc<dyn DeviceCollective>,
    config: AggConfig,
    /// `None` only while a background task holds the core.
    core: Option<SyncCore<M>>,
    shadows: Option<ShadowSet>,
    pending: Option<JoinHandle<TaskReturn<M>>>,
    pub(crate) dist: crate::distributed::DistStaging,
    iteration: u64,
    initialized: bool,
}

impl<M: Messaging> GradAggregator<M> {
    pub fn new(
        mpi: Arc<M>,
        adapter: Arc<dyn DeviceAdapter>,
        collective: Arc<dyn DeviceCollective>,
        config: AggConfig,
    ) -> Self {
        Self {
            mpi,
            adapter,
            collective,
            config,
            core: None,
            shadows: None,
            pending: None,
            dist: Default::default(),
            iteration: 0,
            initialized: false,
        }
    }

    /// An aggregator over host memory with no device collective, the common
    /// configuration for CPU training and for tests.
    pub fn with_host_backend(mpi: Arc<M>, config: AggConfig) -> Self {
        let adapter = Arc::new(HostAdapter::for_device(config.device));
        Self::new(mpi, adapter, Arc::new(NullCollective), config)
    }

    pub fn num_ranks(&self) -> usize {
        self.mpi.world_size()
    }

    pub fn rank(&self) -> crate::types::Rank {
        self.mpi.rank()
    }

    /// Whether a background aggregation is still in flight.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Aggregate `gradients` and `header` across all ranks.
    ///
    /// Returns whether the aggregated outputs are meaningful: in synchronous
    /// mode, whether any rank contributed samples; in asynchronous mode,
    /// whether the *previous* iteration contributed samples (or a reset was
    /// forced). A `false` return means the caller should treat this
    /// iteration as a no-op for aggregated results.
    ///
    /// `reset_state` zeroes the double buffer and forces a launch; passing
    /// it while a background aggregation is in flight is a programming
    /// error.
    ///
    /// # Safety
    /// Every gradient's pointer must be valid for its byte length and not
    /// written by anything else for the duration of the call. In
    /// asynchronous mode the storage must additionally stay valid until the
    /// next call (or until the aggregator is dropped), since the background
    /// task reads and writes the swapped-out buffers.
    pub async unsafe fn aggregate(
        &mut self,
        gradients: &mut [GradTensor],
        header: &mut GradHeader,
        reset_state: bool,
    ) -> Result<bool> {
        assert!(!gradients.is_empty(), "aggregate requires at least one gradient");

        // Single-rank world: nothing to aggregate.
        if self.mpi.world_size() == 1 {
            return Ok(header.num_samples != 0);
        }

        if reset_state && self.pending.is_some() {
            return Err(AggError::ResetWithPending);
        }

        let first_call = !self.initialized;
        self.ensure_initialized(gradients, header.num_eval())?;
        if !first_call && reset_state {
            self.reset_shadows()?;
        }

        let show_stats =
            self.config.stats_interval > 0 && self.iteration % self.config.stats_interval == 0;
        self.iteration += 1;

        if self.config.use_async {
            unsafe { self.aggregate_async(gradients, header, reset_state, show_stats) }.await
        } else {
            let core = self.core.as_mut().expect("core present in sync mode");
            unsafe { core.aggregate(gradients, header, show_stats) }.await?;
            core.trace.tick();
            Ok(header.num_samples != 0)
        }
    }

    /// The double-buffered path: join, swap, relaunch.
    async unsafe fn aggregate_async(
        &mut self,
        gradients: &mut [GradTensor],
        header: &mut GradHeader,
        reset_state: bool,
        show_stats: bool,
    ) -> Result<bool> {
        if let Some(handle) = self.pending.take() {
            let wait_started = Instant::now();
            let (mut core, shadows, result) = handle.await.map_err(|e| AggError::TaskJoin {
                reason: e.to_string(),
            })?;
            if show_stats {
                tracing::info!(
                    target: "gradax::aggregate",
                    seconds = wait_started.elapsed().as_secs_f64(),
                    "async aggregation wait time"
                );
            }
            if core.trace.enabled() {
                core.trace.record(Stage::AsyncWait, Some(wait_started));
            }
            core.trace.tick();
            self.core = Some(core);
            self.shadows = Some(shadows);
            // Errors from the background task surface at the join.
            result?;
        }

        let shadows = self.shadows.as_mut().expect("shadow set present in async mode");
        if shadows.gradients.len() != gradients.len() {
            return Err(AggError::ShadowMismatch {
                index: shadows.gradients.len().min(gradients.len()),
            });
        }
        let swap_started = Instant::now();
        for (index, (live, shadow)) in gradients.iter_mut().zip(&mut shadows.gradients).enumerate() {
            if !live.matches(shadow) {
                return Err(AggError::ShadowMismatch { index });
            }
            live.swap_storage(shadow);
        }
        std::mem::swap(header, &mut shadows.header);
        // Post-swap, the live header carries the previous iteration's
        // aggregate and the shadow header carries this iteration's inputs.
        let previous_had_samples = header.num_samples != 0;

        if reset_state || shadows.header.num_samples != 0 {
            let event = self.adapter.create_compute_event()?;
            let mut core = self.core.take().expect("core present when launching");
            if core.trace.enabled() {
                core.trace.record(Stage::Swap, Some(swap_started));
            }
            let mut shadows = self.shadows.take().expect("shadow set present when launching");
            let adapter = Arc::clone(&self.adapter);
            self.pending = Some(tokio::spawn(async move {
                // Done synchronously (and before the nested async block below)
                // so the event, which is not `Sync`, need not be held across
                // an await point.
                let setup = adapter.set_thread_device().and_then(|_| {
                    // The compute stream's gradient writes must be visible
                    // before any transfer.
                    event.synchronize_transfer_stream()
                });
                let result = async {
                    setup?;
                    let ShadowSet {
                        gradients, header, ..
                    } = &mut shadows;
                    unsafe { core.aggregate(gradients, header, show_stats) }.await
                }
                .await;
                (core, shadows, result)
            }));
        }

        Ok(reset_state || previous_had_samples)
    }

    fn ensure_initialized(&mut self, gradients: &[GradTensor], num_eval: usize) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let core = SyncCore::new(
            Arc::clone(&self.mpi),
            Arc::clone(&self.collective),
            Arc::clone(&self.adapter),
            gradients,
            num_eval,
            &self.config,
        )?;
        if self.config.use_async {
            let mut shadow_tensors = Vec::with_capacity(gradients.len());
            let mut regions = Vec::with_capacity(gradients.len());
            for g in gradients {
                let region = self.adapter.alloc_device(g.byte_len())?;
                unsafe { self.adapter.fill_zero(region.ptr(), g.byte_len())? };
                shadow_tensors.push(GradTensor::from_raw_parts(
                    region.ptr(),
                    g.rows(),
                    g.cols(),
                    g.dtype(),
                    g.device(),
                ));
                regions.push(region);
            }
            self.shadows = Some(ShadowSet {
                gradients: shadow_tensors,
                header: GradHeader::new(num_eval),
                _regions: regions,
            });
        }
        self.core = Some(core);
        self.initialized = true;
        Ok(())
    }

    /// Zero the double buffer after a forced reset.
    fn reset_shadows(&mut self) -> Result<()> {
        if let Some(shadows) = &mut self.shadows {
            for g in &shadows.gradients {
                unsafe { self.adapter.fill_zero(g.ptr(), g.byte_len())? };
            }
            shadows.header.clear();
        }
        Ok(())
    }
}
