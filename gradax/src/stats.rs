//! Per-stage timing owned by the aggregator.
//!
//! Accumulators are updated wherever the stage runs, but emission happens
//! only from the foreground thread, at a fixed iteration cadence.

use std::time::{Duration, Instant};

/// Emission cadence for the detail profile.
const PROFILE_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Zeroing gradients on a zero-sample iteration.
    Zero,
    /// Copying small gradients into the packed scratch buffer.
    Pack,
    /// The overlapped header-exchange + gradient-reduce phase.
    Reduce,
    /// Copying packed slices back out of the scratch buffer.
    Unpack,
    /// Swapping live and shadow buffers (async mode).
    Swap,
    /// Waiting for the previous background aggregation (async mode).
    AsyncWait,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct AggTrace {
    enabled: bool,
    iterations: u64,
    zero: Duration,
    pack: Duration,
    reduce: Duration,
    unpack: Duration,
    swap: Duration,
    async_wait: Duration,
}

impl AggTrace {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    /// Start a stage timer, or `None` when profiling is off.
    pub(crate) fn start(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub(crate) fn record(&mut self, stage: Stage, started: Option<Instant>) {
        let Some(started) = started else { return };
        let elapsed = started.elapsed();
        match stage {
            Stage::Zero => self.zero += elapsed,
            Stage::Pack => self.pack += elapsed,
            Stage::Reduce => self.reduce += elapsed,
            Stage::Unpack => self.unpack += elapsed,
            Stage::Swap => self.swap += elapsed,
            Stage::AsyncWait => self.async_wait += elapsed,
        }
    }

    /// Count one aggregation and emit the accumulated stage times every
    /// [`PROFILE_EVERY`] iterations. Call from the foreground thread only.
    pub(crate) fn tick(&mut self) {
        if !self.enabled {
            return;
        }
        self.iterations += 1;
        if self.iterations % PROFILE_EVERY != 0 {
            return;
        }
        tracing::info!(
            target: "gradax::profile",
            iteration = self.iterations,
            zero_s = self.zero.as_secs_f64(),
            pack_s = self.pack.as_secs_f64(),
            reduce_s = self.reduce.as_secs_f64(),
            unpack_s = self.unpack.as_secs_f64(),
            swap_s = self.swap.as_secs_f64(),
            async_wait_s = self.async_wait.as_secs_f64(),
            "aggregation stage times"
        );
        self.zero = Duration::ZERO;
        self.pack = Duration::ZERO;
        self.reduce = Duration::ZERO;
        self.unpack = Duration::ZERO;
        self.swap = Duration::ZERO;
        self.async_wait = Duration::ZERO;
    }
}
