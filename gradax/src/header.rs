//! The fixed-size statistics record aggregated alongside the gradients.

use crate::error::{AggError, Result};

/// Per-iteration training statistics exchanged through the main rank.
///
/// Aggregation is element-wise addition across ranks. The eval-error count
/// is fixed for the lifetime of a training run; every rank must carry the
/// same count.
#[derive(Debug, Clone, PartialEq)]
pub struct GradHeader {
    pub num_samples: u64,
    pub num_samples_with_label: u64,
    pub criterion: f64,
    /// One `(error, count)` pair per evaluation metric.
    pub eval_errors: Vec<(f64, f64)>,
}

/// Counters (`num_samples`, `num_samples_with_label`, `criterion`, eval count)
/// precede the inline eval-error array on the wire.
const COUNTER_BYTES: usize = 32;
const PAIR_BYTES: usize = 16;

impl GradHeader {
    /// A zeroed header carrying `num_eval` evaluation metrics.
    pub fn new(num_eval: usize) -> Self {
        Self {
            num_samples: 0,
            num_samples_with_label: 0,
            criterion: 0.0,
            eval_errors: vec![(0.0, 0.0); num_eval],
        }
    }

    pub fn num_eval(&self) -> usize {
        self.eval_errors.len()
    }

    /// Byte size of the wire image for a header with `num_eval` metrics.
    pub fn wire_size(num_eval: usize) -> usize {
        COUNTER_BYTES + num_eval * PAIR_BYTES
    }

    /// Reset every field to zero, keeping the eval-error count.
    pub fn clear(&mut self) {
        self.num_samples = 0;
        self.num_samples_with_label = 0;
        self.criterion = 0.0;
        for pair in &mut self.eval_errors {
            *pair = (0.0, 0.0);
        }
    }

    /// Element-wise add `other` into `self`.
    pub fn add_from(&mut self, other: &GradHeader) -> Result<()> {
        if other.num_eval() != self.num_eval() {
            return Err(AggError::EvalNodeMismatch {
                expected: self.num_eval(),
                actual: other.num_eval(),
            });
        }
        self.num_samples += other.num_samples;
        self.num_samples_with_label += other.num_samples_with_label;
        self.criterion += other.criterion;
        for (dst, src) in self.eval_errors.iter_mut().zip(&other.eval_errors) {
            dst.0 += src.0;
            dst.1 += src.1;
        }
        Ok(())
    }

    /// Raw little-endian byte image: counters first, then the eval pairs.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::wire_size(self.num_eval()));
        buf.extend_from_slice(&self.num_samples.to_le_bytes());
        buf.extend_from_slice(&self.num_samples_with_label.to_le_bytes());
        buf.extend_from_slice(&self.criterion.to_le_bytes());
        buf.extend_from_slice(&(self.num_eval() as u64).to_le_bytes());
        for &(err, count) in &self.eval_errors {
            buf.extend_from_slice(&err.to_le_bytes());
            buf.extend_from_slice(&count.to_le_bytes());
        }
        buf
    }

    /// Decode a wire image into this header. The eval-error count on the
    /// wire must match this header's count.
    pub fn decode_into(&mut self, bytes: &[u8]) -> Result<()> {
        let expected = Self::wire_size(self.num_eval());
        if bytes.len() != expected {
            return Err(AggError::BufferSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte field"));
        let f64_at = |off: usize| f64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte field"));

        let num_eval = u64_at(24) as usize;
        if num_eval != self.num_eval() {
            return Err(AggError::EvalNodeMismatch {
                expected: self.num_eval(),
                actual: num_eval,
            });
        }
        self.num_samples = u64_at(0);
        self.num_samples_with_label = u64_at(8);
        self.criterion = f64_at(16);
        for (i, pair) in self.eval_errors.iter_mut().enumerate() {
            let off = COUNTER_BYTES + i * PAIR_BYTES;
            *pair = (f64_at(off), f64_at(off + 8));
        }
        Ok(())
    }

    /// A rank that processed no samples must carry an all-zero header.
    pub(crate) fn debug_assert_zeroed(&self) {
        debug_assert_eq!(self.criterion, 0.0);
        debug_assert_eq!(self.num_samples_with_label, 0);
        for &(err, count) in &self.eval_errors {
            debug_assert_eq!(err, 0.0);
            debug_assert_eq!(count, 0.0);
        }
    }
}
