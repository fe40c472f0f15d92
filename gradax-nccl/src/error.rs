pub type Result<T> = std::result::Result<T, NcclBackendError>;

#[derive(Debug, thiserror::Error)]
pub enum NcclBackendError {
    #[error("NCCL error: {0:?}")]
    Nccl(cudarc::nccl::result::NcclError),

    #[error("CUDA driver error: {0}")]
    CudaDriver(#[from] cudarc::driver::DriverError),

    #[error("NCCL unique id exchange failed: {0}")]
    Bootstrap(String),
}

impl From<cudarc::nccl::result::NcclError> for NcclBackendError {
    fn from(e: cudarc::nccl::result::NcclError) -> Self {
        Self::Nccl(e)
    }
}

impl NcclBackendError {
    /// Map onto the aggregator's error type at the trait boundary.
    pub fn into_agg(self) -> gradax::AggError {
        gradax::AggError::device(self.to_string())
    }
}
