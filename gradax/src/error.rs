use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, AggError>;

#[derive(Debug, thiserror::Error)]
pub enum AggError {
    #[error("gradient {index} is sparse: aggregation supports dense tensors only")]
    SparseGradient { index: usize },

    #[error("no shadow tensor matching gradient {index} (shape or device changed)")]
    ShadowMismatch { index: usize },

    #[error("reset requested while a background aggregation is still in flight")]
    ResetWithPending,

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("allocation of {what} ({bytes} bytes) failed")]
    AllocationFailed { what: &'static str, bytes: usize },

    #[error("distributed staging buffers not initialized: call distributed_init first")]
    StagingUnavailable,

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("header eval-node count mismatch: expected {expected}, got {actual}")]
    EvalNodeMismatch { expected: usize, actual: usize },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: usize },

    #[error("unsupported data type {dtype} for {operation}")]
    UnsupportedDType {
        dtype: DataType,
        operation: &'static str,
    },

    #[error("device adapter error: {message}")]
    Device { message: String },

    #[error("background aggregation task failed: {reason}")]
    TaskJoin { reason: String },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl AggError {
    /// Create a `CollectiveFailed` for the named messaging primitive.
    pub fn collective(operation: &'static str, rank: Rank, reason: impl Into<String>) -> Self {
        Self::CollectiveFailed {
            operation,
            rank,
            reason: reason.into(),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collective_failed_display() {
        let e = AggError::collective("all_reduce", 3, "connection reset");
        assert_eq!(e.to_string(), "all_reduce failed at rank 3: connection reset");
    }

    #[test]
    fn test_sparse_display() {
        let e = AggError::SparseGradient { index: 7 };
        assert!(e.to_string().contains("gradient 7"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<AggError> = vec![
            AggError::SparseGradient { index: 0 },
            AggError::ShadowMismatch { index: 1 },
            AggError::ResetWithPending,
            AggError::collective("broadcast", 2, "peer gone"),
            AggError::AllocationFailed {
                what: "packed scratch",
                bytes: 4096,
            },
            AggError::StagingUnavailable,
            AggError::BufferSizeMismatch {
                expected: 64,
                actual: 32,
            },
            AggError::EvalNodeMismatch {
                expected: 2,
                actual: 3,
            },
            AggError::InvalidRank {
                rank: 9,
                world_size: 4,
            },
            AggError::UnsupportedDType {
                dtype: DataType::F32,
                operation: "reduce",
            },
            AggError::device("oom"),
            AggError::TaskJoin {
                reason: "panicked".into(),
            },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
