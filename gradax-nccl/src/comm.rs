use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::CudaStream;
use cudarc::nccl::{result as nccl, safe::Id, sys};
use futures::future::BoxFuture;

use gradax::{DataType, DeviceCollective, DeviceSpan, Messaging, ReduceOp};

use crate::error::{NcclBackendError, Result};
use crate::types::{to_nccl_dtype, to_nccl_op};

/// Wrapper around a raw `ncclComm_t` handle implementing the aggregator's
/// device-collective interface.
///
/// Uses cudarc's `result` layer directly (raw pointers) rather than the
/// `safe` layer, because gradients reach us as `u64` device pointers.
pub struct NcclComm {
    comm: sys::ncclComm_t,
    stream: Arc<CudaStream>,
    rank: usize,
    world: usize,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization. The CudaStream is already Send+Sync via Arc.
unsafe impl Send for NcclComm {}
unsafe impl Sync for NcclComm {}

impl NcclComm {
    /// Initialize a communicator from a pre-shared unique id. Every rank
    /// must call this with the same `id` and `world`, but its own `rank`.
    pub fn init(stream: Arc<CudaStream>, rank: usize, world: usize, id: Id) -> Result<Self> {
        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(comm.as_mut_ptr(), world as i32, *id_to_sys(&id), rank as i32)?;
        }
        Ok(Self {
            comm: unsafe { comm.assume_init() },
            stream,
            rank,
            world,
        })
    }

    /// Form a communicator by exchanging the NCCL unique id over the
    /// messaging layer: the main rank creates it and broadcasts the raw
    /// bytes, then every rank joins.
    pub async fn bootstrap<M: Messaging>(mpi: &M, stream: Arc<CudaStream>) -> Result<Self> {
        let mut image = if mpi.is_main() {
            let id = Id::new().map_err(NcclBackendError::from)?;
            id_to_bytes(&id)
        } else {
            vec![0u8; 128]
        };
        mpi.broadcast(mpi.main_rank(), &mut image)
            .await
            .map_err(|e| NcclBackendError::Bootstrap(e.to_string()))?;
        Self::init(
            stream,
            mpi.rank() as usize,
            mpi.world_size(),
            id_from_bytes(&image),
        )
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world(&self) -> usize {
        self.world
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    fn cu_stream(&self) -> sys::cudaStream_t {
        self.stream.cu_stream() as sys::cudaStream_t
    }
}

impl DeviceCollective for NcclComm {
    fn is_supported(&self) -> bool {
        // A constructed communicator is operable; construction fails
        // otherwise.
        true
    }

    unsafe fn all_reduce_batch<'a>(&'a self, spans: &'a [DeviceSpan]) -> BoxFuture<'a, gradax::Result<()>> {
        let result = (|| -> Result<()> {
            // Group the launches so NCCL fuses them into one collective.
            nccl::group_start()?;
            for span in spans {
                let ptr = span.ptr as *mut c_void;
                unsafe {
                    nccl::all_reduce(
                        ptr as *const c_void,
                        ptr,
                        span.count,
                        to_nccl_dtype(span.dtype),
                        sys::ncclRedOp_t::ncclSum,
                        self.comm,
                        self.cu_stream(),
                    )?;
                }
            }
            nccl::group_end()?;
            Ok(())
        })();
        Box::pin(async move { result.map_err(NcclBackendError::into_agg) })
    }

    unsafe fn all_reduce<'a>(
        &'a self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, gradax::Result<()>> {
        let result = unsafe {
            nccl::all_reduce(
                send as *const c_void,
                recv as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                to_nccl_op(op),
                self.comm,
                self.cu_stream(),
            )
        }
        .map_err(|e| NcclBackendError::from(e).into_agg());
        Box::pin(async move { result })
    }

    unsafe fn all_gather<'a>(
        &'a self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
    ) -> BoxFuture<'a, gradax::Result<()>> {
        let result = unsafe {
            nccl::all_gather(
                send as *const c_void,
                recv as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                self.comm,
                self.cu_stream(),
            )
        }
        .map_err(|e| NcclBackendError::from(e).into_agg());
        Box::pin(async move { result })
    }

    fn sync(&self) -> gradax::Result<()> {
        unsafe {
            cudarc::driver::result::stream::synchronize(self.stream.cu_stream() as _)
                .map_err(|e| NcclBackendError::CudaDriver(e).into_agg())?;
        }
        Ok(())
    }
}

impl Drop for NcclComm {
    fn drop(&mut self) {
        unsafe {
            // comm_abort is the safest cleanup path without a stream sync.
            let _ = nccl::comm_abort(self.comm);
        }
    }
}

/// Convert our `Id` to the sys-level `ncclUniqueId`.
///
/// `ncclUniqueId` is `#[repr(C)]` with a single `internal: [c_char; 128]`
/// field, the exact layout `Id::internal()` exposes.
fn id_to_sys(id: &Id) -> &sys::ncclUniqueId {
    let internal = id.internal();
    unsafe { &*(internal as *const [std::ffi::c_char; 128] as *const sys::ncclUniqueId) }
}

/// Serialize an NCCL unique id for transfer over the messaging layer.
fn id_to_bytes(id: &Id) -> Vec<u8> {
    id.internal().iter().map(|&c| c as u8).collect()
}

/// Deserialize an NCCL unique id received over the messaging layer.
fn id_from_bytes(bytes: &[u8]) -> Id {
    let mut internal = [0i8; 128];
    for (dst, &b) in internal.iter_mut().zip(bytes.iter().take(128)) {
        *dst = b as i8;
    }
    Id::uninit(internal)
}
