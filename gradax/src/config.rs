//! Runtime-configurable tuning parameters for the aggregator.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `GRADAX_`) or by constructing a custom `AggConfig`.

use crate::types::{DeviceId, HOST_DEVICE};

/// Gradients whose byte size is at or below this threshold are packed into a
/// single contiguous buffer in synchronous mode.
pub const DEFAULT_PACK_THRESHOLD_BYTES: usize = 32 * 1024;

/// Construction parameters for [`crate::GradAggregator`].
#[derive(Debug, Clone)]
pub struct AggConfig {
    /// Overlap aggregation with the next iteration via double buffering.
    pub use_async: bool,

    /// Device the gradients live on. [`HOST_DEVICE`] for host tensors.
    pub device: DeviceId,

    /// Emit an aggregation wall-time trace every this many iterations.
    /// Zero disables the trace.
    pub stats_interval: u64,

    /// Pack threshold in bytes. Ignored in asynchronous mode, where the
    /// double buffer already provides a monolithic reduction target.
    pub pack_threshold_bytes: usize,

    /// Emit per-stage timing output at a fixed iteration cadence.
    pub detail_profile: bool,
}

impl Default for AggConfig {
    fn default() -> Self {
        Self {
            use_async: false,
            device: HOST_DEVICE,
            stats_interval: 0,
            pack_threshold_bytes: DEFAULT_PACK_THRESHOLD_BYTES,
            detail_profile: false,
        }
    }
}

impl AggConfig {
    pub fn new(use_async: bool, device: DeviceId) -> Self {
        Self {
            use_async,
            device,
            ..Self::default()
        }
    }

    /// Apply environment overrides, falling back to the current values.
    ///
    /// Recognized variables:
    /// - `GRADAX_PACK_THRESHOLD_BYTES`
    /// - `GRADAX_STATS_INTERVAL`
    /// - `GRADAX_DETAIL_PROFILE` (any non-empty value other than `0`)
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("GRADAX_PACK_THRESHOLD_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.pack_threshold_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("GRADAX_STATS_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.stats_interval = n;
            }
        }
        if let Ok(v) = std::env::var("GRADAX_DETAIL_PROFILE") {
            self.detail_profile = !v.is_empty() && v != "0";
        }
        self
    }
}
