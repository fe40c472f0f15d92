pub mod comm;
pub mod error;
pub mod transfer;
pub mod types;

pub use comm::NcclComm;
pub use error::{NcclBackendError, Result};
pub use transfer::CudaAdapter;
pub use types::{to_nccl_dtype, to_nccl_op};
