use crate::error::Result;
use crate::transfer::{ComputeStreamEvent, TransferEngine};
use crate::types::{DeviceId, HOST_DEVICE};

use super::adapter::{DeviceAdapter, OwnedRegion};

/// Adapter for host-resident tensors: every copy is a `memcpy`, the
/// "transfer stream" completes inline, and pinned memory is plain host
/// memory.
///
/// `HostAdapter::for_device` tags the adapter with an accelerator id while
/// still treating pointers as host memory; integration tests use it to drive
/// the host-staged and device-direct branches without real device memory.
pub struct HostAdapter {
    device: DeviceId,
}

impl HostAdapter {
    pub fn new() -> Self {
        Self {
            device: HOST_DEVICE,
        }
    }

    pub fn for_device(device: DeviceId) -> Self {
        Self { device }
    }
}

impl Default for HostAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAdapter for HostAdapter {
    fn device(&self) -> DeviceId {
        self.device
    }

    unsafe fn copy_device_to_host(&self, src: u64, dst: &mut [u8]) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    unsafe fn copy_host_to_device(&self, src: &[u8], dst: u64) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
        Ok(())
    }

    unsafe fn copy_within_device(&self, src: u64, dst: u64, bytes: usize) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
        }
        Ok(())
    }

    unsafe fn fill_zero(&self, ptr: u64, bytes: usize) -> Result<()> {
        unsafe {
            std::ptr::write_bytes(ptr as *mut u8, 0, bytes);
        }
        Ok(())
    }

    fn alloc_device(&self, bytes: usize) -> Result<Box<dyn OwnedRegion>> {
        Ok(Box::new(HostRegion::new(bytes)))
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<Box<dyn OwnedRegion>> {
        Ok(Box::new(HostRegion::new(bytes)))
    }

    fn create_transfer_engine(&self) -> Result<Box<dyn TransferEngine>> {
        Ok(Box::new(HostTransferEngine))
    }

    fn create_compute_event(&self) -> Result<Box<dyn ComputeStreamEvent>> {
        Ok(Box::new(HostComputeEvent))
    }
}

/// Heap-backed region with a stable address.
struct HostRegion {
    data: Box<[u8]>,
}

impl HostRegion {
    fn new(bytes: usize) -> Self {
        Self {
            data: vec![0u8; bytes].into_boxed_slice(),
        }
    }
}

impl OwnedRegion for HostRegion {
    fn ptr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Host copies complete before the call returns, so the waits are no-ops.
struct HostTransferEngine;

impl TransferEngine for HostTransferEngine {
    unsafe fn copy_device_to_host_async(&self, src: u64, dst: u64, bytes: usize) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
        }
        Ok(())
    }

    unsafe fn copy_host_to_device_async(&self, src: u64, dst: u64, bytes: usize) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
        }
        Ok(())
    }

    fn wait_device_to_host(&self) -> Result<()> {
        Ok(())
    }

    fn wait_host_to_device(&self) -> Result<()> {
        Ok(())
    }
}

/// Host compute work is ordered by the borrow checker, not by streams.
struct HostComputeEvent;

impl ComputeStreamEvent for HostComputeEvent {
    fn synchronize_transfer_stream(&self) -> Result<()> {
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
