//! Address allocation and configuration expansion for a small, fixed fleet
//! of VM hosts.
//!
//! The database is a YAML map of VM name to [`types::VmRecord`]. The
//! [`allocator::Allocator`] adds records inside a
//! [`storage::DatabaseStore::transact`] call, and the
//! [`expander::ConfigExpander`] turns records into interface lists for the
//! artifact renderers.

pub mod allocator;
pub mod config;
pub mod error;
pub mod expander;
pub mod ip_pool;
pub mod storage;
pub mod topology;
pub mod types;

pub use allocator::Allocator;
pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use expander::ConfigExpander;
pub use ip_pool::{available, AddressPool};
pub use storage::DatabaseStore;
pub use topology::Topology;
