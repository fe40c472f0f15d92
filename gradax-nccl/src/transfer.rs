//! CUDA implementations of the aggregator's device seams: adapter,
//! transfer engine, and compute-stream event.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaStream, result as cuda, sys};

use gradax::error::Result as AggResult;
use gradax::{ComputeStreamEvent, DeviceAdapter, DeviceId, OwnedRegion, TransferEngine};

use crate::error::NcclBackendError;

fn driver_err(e: cudarc::driver::DriverError) -> gradax::AggError {
    NcclBackendError::CudaDriver(e).into_agg()
}

/// Device adapter over the CUDA driver API for one device ordinal.
///
/// Holds a dedicated transfer stream that compute-stream events gate, so
/// background device-to-host copies never race the gradient writes.
pub struct CudaAdapter {
    device: Arc<CudaDevice>,
    device_id: DeviceId,
    transfer_stream: Arc<CudaStream>,
}

impl CudaAdapter {
    pub fn new(device_id: DeviceId) -> crate::error::Result<Self> {
        let device = CudaDevice::new(device_id as usize)?;
        let transfer_stream = Arc::new(device.fork_default_stream()?);
        Ok(Self {
            device,
            device_id,
            transfer_stream,
        })
    }

    pub fn cuda_device(&self) -> &Arc<CudaDevice> {
        &self.device
    }
}

impl DeviceAdapter for CudaAdapter {
    fn device(&self) -> DeviceId {
        self.device_id
    }

    fn set_thread_device(&self) -> AggResult<()> {
        self.device.bind_to_thread().map_err(driver_err)
    }

    unsafe fn copy_device_to_host(&self, src: u64, dst: &mut [u8]) -> AggResult<()> {
        unsafe { cuda::memcpy_dtoh_sync(dst, src as sys::CUdeviceptr) }.map_err(driver_err)
    }

    unsafe fn copy_host_to_device(&self, src: &[u8], dst: u64) -> AggResult<()> {
        unsafe { cuda::memcpy_htod_sync(dst as sys::CUdeviceptr, src) }.map_err(driver_err)
    }

    unsafe fn copy_within_device(&self, src: u64, dst: u64, bytes: usize) -> AggResult<()> {
        unsafe { cuda::memcpy_dtod_sync(dst as sys::CUdeviceptr, src as sys::CUdeviceptr, bytes) }
            .map_err(driver_err)
    }

    unsafe fn fill_zero(&self, ptr: u64, bytes: usize) -> AggResult<()> {
        unsafe { cuda::memset_d8_sync(ptr as sys::CUdeviceptr, 0, bytes) }.map_err(driver_err)
    }

    fn alloc_device(&self, bytes: usize) -> AggResult<Box<dyn OwnedRegion>> {
        let ptr = unsafe { cuda::malloc_sync(bytes) }.map_err(driver_err)?;
        Ok(Box::new(DeviceRegion { ptr, bytes }))
    }

    fn alloc_pinned(&self, bytes: usize) -> AggResult<Box<dyn OwnedRegion>> {
        let ptr = unsafe { cuda::malloc_host(bytes, sys::CU_MEMHOSTALLOC_PORTABLE) }
            .map_err(driver_err)?;
        Ok(Box::new(PinnedRegion {
            ptr: ptr as u64,
            bytes,
        }))
    }

    fn create_transfer_engine(&self) -> AggResult<Box<dyn TransferEngine>> {
        let d2h = self.device.fork_default_stream().map_err(driver_err)?;
        let h2d = self.device.fork_default_stream().map_err(driver_err)?;
        Ok(Box::new(CudaTransferEngine {
            d2h: Arc::new(d2h),
            h2d: Arc::new(h2d),
        }))
    }

    fn create_compute_event(&self) -> AggResult<Box<dyn ComputeStreamEvent>> {
        let event = cuda::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(driver_err)?;
        unsafe {
            // Record on the default (compute) stream at the current point.
            cuda::event::record(event, std::ptr::null_mut()).map_err(driver_err)?;
        }
        Ok(Box::new(CudaComputeEvent {
            event,
            transfer_stream: Arc::clone(&self.transfer_stream),
        }))
    }
}

struct DeviceRegion {
    ptr: sys::CUdeviceptr,
    bytes: usize,
}

unsafe impl Send for DeviceRegion {}
unsafe impl Sync for DeviceRegion {}

impl OwnedRegion for DeviceRegion {
    fn ptr(&self) -> u64 {
        self.ptr as u64
    }

    fn len(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = cuda::free_sync(self.ptr);
        }
    }
}

struct PinnedRegion {
    ptr: u64,
    bytes: usize,
}

unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl OwnedRegion for PinnedRegion {
    fn ptr(&self) -> u64 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.bytes
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = cuda::free_host(self.ptr as *mut std::ffi::c_void);
        }
    }
}

/// One device-to-host / host-to-device stream pair; waits are stream syncs.
pub struct CudaTransferEngine {
    d2h: Arc<CudaStream>,
    h2d: Arc<CudaStream>,
}

impl TransferEngine for CudaTransferEngine {
    unsafe fn copy_device_to_host_async(&self, src: u64, dst: u64, bytes: usize) -> AggResult<()> {
        let dst = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, bytes) };
        unsafe { cuda::memcpy_dtoh_async(dst, src as sys::CUdeviceptr, self.d2h.cu_stream()) }
            .map_err(driver_err)
    }

    unsafe fn copy_host_to_device_async(&self, src: u64, dst: u64, bytes: usize) -> AggResult<()> {
        let src = unsafe { std::slice::from_raw_parts(src as *const u8, bytes) };
        unsafe { cuda::memcpy_htod_async(dst as sys::CUdeviceptr, src, self.h2d.cu_stream()) }
            .map_err(driver_err)
    }

    fn wait_device_to_host(&self) -> AggResult<()> {
        unsafe { cuda::stream::synchronize(self.d2h.cu_stream()) }.map_err(driver_err)
    }

    fn wait_host_to_device(&self) -> AggResult<()> {
        unsafe { cuda::stream::synchronize(self.h2d.cu_stream()) }.map_err(driver_err)
    }
}

/// An event recorded on the compute stream, gating the adapter's transfer
/// stream.
pub struct CudaComputeEvent {
    event: sys::CUevent,
    transfer_stream: Arc<CudaStream>,
}

unsafe impl Send for CudaComputeEvent {}

impl ComputeStreamEvent for CudaComputeEvent {
    fn synchronize_transfer_stream(&self) -> AggResult<()> {
        unsafe {
            cuda::stream::wait_event(
                self.transfer_stream.cu_stream(),
                self.event,
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(driver_err)
    }

    fn synchronize(&self) -> AggResult<()> {
        unsafe { cuda::event::synchronize(self.event) }.map_err(driver_err)
    }
}

impl Drop for CudaComputeEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = cuda::event::destroy(self.event);
        }
    }
}
