//! Per-call capability probe driving backend selection.

use crate::collective::DeviceCollective;
use crate::messaging::Messaging;
use crate::types::{DeviceId, HOST_DEVICE};

/// What the runtime can do for this aggregation call.
///
/// Probed on every call (the device collective may initialize lazily and
/// turn operable mid-run), but never re-deciding the one-shot packing plan
/// or buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The messaging layer may read device memory directly (GDR).
    pub gpu_direct: bool,
    /// The device-direct collective library is initialized and operable.
    pub device_collective: bool,
    /// The gradient device is the host.
    pub on_host: bool,
}

impl Capabilities {
    pub fn probe<M: Messaging>(mpi: &M, collective: &dyn DeviceCollective, device: DeviceId) -> Self {
        Self {
            gpu_direct: mpi.gpu_direct(),
            device_collective: collective.is_supported(),
            on_host: device == HOST_DEVICE,
        }
    }

    /// Gradients must be staged through pinned host memory before the
    /// messaging layer can reduce them.
    pub fn stage_through_host(&self) -> bool {
        !self.device_collective && !self.gpu_direct && !self.on_host
    }

    /// Select the reduction backend. The cascade is exhaustive: every
    /// capability combination maps to exactly one branch.
    pub(crate) fn branch(&self) -> Branch {
        if self.device_collective {
            Branch::DeviceCollective
        } else if self.stage_through_host() {
            Branch::HostStaged
        } else if self.on_host {
            Branch::HostMessaging
        } else {
            Branch::DeviceDirect
        }
    }
}

/// The four reduction backends of the sync aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Branch {
    /// Pipelined device→host copy, host reduce, host→device copy.
    HostStaged,
    /// Blocking in-place reduce directly over device memory (GDR).
    DeviceDirect,
    /// Non-blocking in-place reduces over host memory, joined at the end.
    HostMessaging,
    /// One batched all-reduce through the device collective library.
    DeviceCollective,
}

impl Branch {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Branch::HostStaged => "host-staged",
            Branch::DeviceDirect => "device-direct",
            Branch::HostMessaging => "host-messaging",
            Branch::DeviceCollective => "device-collective",
        }
    }
}
