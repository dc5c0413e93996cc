pub mod commands;

pub use commands::FleetContext;

// Re-export commonly used types
pub use hostfleet_core::{
    error::{FleetError, FleetResult},
    types::{AllocationRequest, Disk, NetworkClass, Ram},
    FleetConfig,
};

pub use hostfleet_vm::DnsmasqFile;
