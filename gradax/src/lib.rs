pub mod aggregator;
pub mod collective;
pub mod config;
pub mod device;
mod distributed;
pub mod error;
pub mod header;
pub mod memory;
pub mod messaging;
pub mod probe;
pub(crate) mod reduce;
pub(crate) mod stats;
pub mod tensor;
pub mod transfer;
pub mod types;

pub use aggregator::GradAggregator;
pub use collective::{DeviceCollective, DeviceSpan, NullCollective};
pub use config::{AggConfig, DEFAULT_PACK_THRESHOLD_BYTES};
pub use device::{DeviceAdapter, HostAdapter, OwnedRegion};
pub use error::{AggError, Result};
pub use header::GradHeader;
pub use memory::{PinnedBuf, PinnedBufferPool};
pub use messaging::{LoopbackCluster, LoopbackCollective, LoopbackMessaging, Messaging};
pub use probe::Capabilities;
pub use tensor::{GradTensor, StorageFormat};
pub use transfer::{ComputeStreamEvent, TransferEngine};
pub use types::{DataType, DeviceId, HOST_DEVICE, Rank, ReduceOp};
