mod adapter;
mod host;

pub use adapter::{DeviceAdapter, OwnedRegion};
pub use host::HostAdapter;
