//! One-shot capacity planning: which gradients are packed, which are
//! reduced individually.

use crate::device::{DeviceAdapter, OwnedRegion};
use crate::error::{AggError, Result};
use crate::tensor::GradTensor;
use crate::types::{DataType, DeviceId};

/// One entry of the reduction schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggSlot {
    /// The packed scratch buffer holding every small gradient.
    Packed,
    /// A single gradient, reduced on its own.
    Individual(usize),
}

/// The schedule decided on the first aggregate call. Shapes are stable from
/// then on, so the plan is never rebuilt.
#[derive(Debug)]
pub(crate) struct AggPlan {
    /// Reduction order; `Packed` comes first when packing is in use.
    pub slots: Vec<AggSlot>,
    /// Gradient indices living in the packed scratch, in pack order.
    pub packed: Vec<usize>,
    /// Total element count of the packed scratch.
    pub packed_elements: usize,
    pub dtype: DataType,
    pub device: DeviceId,
}

impl AggPlan {
    /// Classify each gradient by byte size. In asynchronous mode packing is
    /// disabled: the double buffer already provides a monolithic reduction
    /// target per tensor.
    pub(crate) fn build(gradients: &[GradTensor], use_async: bool, threshold_bytes: usize) -> Result<Self> {
        assert!(!gradients.is_empty(), "cannot plan over an empty gradient set");
        for (index, g) in gradients.iter().enumerate() {
            if !g.is_dense() {
                return Err(AggError::SparseGradient { index });
            }
        }

        let mut packed = Vec::new();
        let mut slots = Vec::new();
        let mut packed_elements = 0usize;
        for (i, g) in gradients.iter().enumerate() {
            if !use_async && g.byte_len() <= threshold_bytes {
                packed_elements += g.element_count();
                packed.push(i);
            } else {
                slots.push(AggSlot::Individual(i));
            }
        }
        if packed_elements > 0 {
            slots.insert(0, AggSlot::Packed);
        }

        Ok(Self {
            slots,
            packed,
            packed_elements,
            dtype: gradients[0].dtype(),
            device: gradients[0].device(),
        })
    }

    /// Abandon packing: every gradient is reduced individually.
    pub(crate) fn flatten(&mut self, num_gradients: usize) {
        self.packed.clear();
        self.packed_elements = 0;
        self.slots = (0..num_gradients).map(AggSlot::Individual).collect();
    }

    /// Element count a slot contributes to the reduction.
    pub(crate) fn slot_elements(&self, slot: AggSlot, gradients: &[GradTensor]) -> usize {
        match slot {
            AggSlot::Packed => self.packed_elements,
            AggSlot::Individual(i) => gradients[i].element_count(),
        }
    }

    /// Byte size of the largest slot, for staging-pool sizing.
    pub(crate) fn max_slot_bytes(&self, gradients: &[GradTensor]) -> usize {
        self.slots
            .iter()
            .map(|&s| self.slot_elements(s, gradients) * self.dtype.size_in_bytes())
            .max()
            .unwrap_or(0)
    }
}

/// The packed scratch: a `(1, packed_elements)` dense buffer on the gradient
/// device.
pub(crate) struct Scratch {
    region: Box<dyn OwnedRegion>,
    elements: usize,
}

impl Scratch {
    /// Allocate scratch for `plan`, or `None` (with the plan flattened) when
    /// the allocation fails.
    pub(crate) fn allocate(
        adapter: &dyn DeviceAdapter,
        plan: &mut AggPlan,
        num_gradients: usize,
    ) -> Option<Scratch> {
        if plan.packed_elements == 0 {
            return None;
        }
        let bytes = plan.packed_elements * plan.dtype.size_in_bytes();
        match adapter.alloc_device(bytes) {
            Ok(region) => Some(Scratch {
                region,
                elements: plan.packed_elements,
            }),
            Err(_) => {
                tracing::warn!(
                    target: "gradax::plan",
                    bytes,
                    "packed scratch allocation failed; reducing every gradient individually"
                );
                plan.flatten(num_gradients);
                None
            }
        }
    }

    pub(crate) fn ptr(&self) -> u64 {
        self.region.ptr()
    }

    pub(crate) fn elements(&self) -> usize {
        self.elements
    }
}
