use crate::types::{DataType, DeviceId, HOST_DEVICE};

/// Storage layout of a gradient tensor.
///
/// The aggregator only operates on dense tensors; the planner rejects any
/// sparse input with a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Dense,
    SparseCsc,
}

/// A dense 2-D row-major tensor view over contiguous storage on one device.
///
/// `GradTensor` carries no ownership or lifetime: it is a `(pointer, shape,
/// device)` record, the aggregator's unit of work. The caller retains
/// ownership of live gradient storage; shadow tensors created in asynchronous
/// mode point into allocations the aggregator owns.
///
/// Operations that dereference the pointer ([`crate::GradAggregator`]'s entry
/// points) are `unsafe` and document their validity requirements.
#[derive(Debug, Clone)]
pub struct GradTensor {
    ptr: u64,
    rows: usize,
    cols: usize,
    dtype: DataType,
    device: DeviceId,
    format: StorageFormat,
}

impl GradTensor {
    /// Build a dense tensor view from raw storage.
    pub fn from_raw_parts(ptr: u64, rows: usize, cols: usize, dtype: DataType, device: DeviceId) -> Self {
        Self {
            ptr,
            rows,
            cols,
            dtype,
            device,
            format: StorageFormat::Dense,
        }
    }

    /// View over a host `f32` slice laid out as `rows x cols`, row-major.
    pub fn from_f32_slice(data: &mut [f32], rows: usize, cols: usize) -> Self {
        assert_eq!(data.len(), rows * cols, "slice length must match shape");
        Self::from_raw_parts(data.as_mut_ptr() as u64, rows, cols, DataType::F32, HOST_DEVICE)
    }

    /// View over a host `f64` slice laid out as `rows x cols`, row-major.
    pub fn from_f64_slice(data: &mut [f64], rows: usize, cols: usize) -> Self {
        assert_eq!(data.len(), rows * cols, "slice length must match shape");
        Self::from_raw_parts(data.as_mut_ptr() as u64, rows, cols, DataType::F64, HOST_DEVICE)
    }

    /// Re-tag the tensor with a device id (the storage pointer is unchanged).
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }

    /// Mark the tensor as sparse. Such tensors are rejected by the planner.
    pub fn with_format(mut self, format: StorageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn element_count(&self) -> usize {
        self.rows * self.cols
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    pub fn is_dense(&self) -> bool {
        self.format == StorageFormat::Dense
    }

    /// Whether `other` can stand in for this tensor in a double-buffer swap.
    pub(crate) fn matches(&self, other: &GradTensor) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self.dtype == other.dtype
            && self.device == other.device
    }

    /// Exchange the underlying storage of two equally-shaped tensors.
    pub(crate) fn swap_storage(&mut self, other: &mut GradTensor) {
        debug_assert!(self.matches(other));
        std::mem::swap(&mut self.ptr, &mut other.ptr);
    }
}
