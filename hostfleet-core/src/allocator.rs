use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};
use crate::ip_pool::AddressPool;
use crate::topology::Topology;
use crate::types::{AllocationRequest, IpAssignment, VmDatabase, VmRecord};

/// Validates allocation requests against the topology and records them in a
/// database snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Allocator<'a> {
    topology: &'a Topology,
}

impl<'a> Allocator<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    /// Insert a record for `request` into `db`.
    ///
    /// The address id is the lowest free id of the requested class at the
    /// time of the call. Only the vCPU count of this VM is checked against
    /// the host ceiling; the sum over all VMs on a host is not.
    ///
    /// `db` is left untouched on every error path. Nothing is persisted here,
    /// run this inside [`crate::storage::DatabaseStore::transact`] so the pool
    /// and the write see the same snapshot.
    pub fn allocate(
        &self,
        db: &mut VmDatabase,
        request: &AllocationRequest,
    ) -> FleetResult<IpAssignment> {
        if db.contains_key(&request.vm_name) {
            return Err(FleetError::DuplicateName {
                vm_name: request.vm_name.clone(),
            });
        }

        let host = self.topology.host(&request.host)?;
        if request.vcpus > host.cpu_ceiling {
            return Err(FleetError::CapacityExceeded {
                host: request.host.clone(),
                ceiling: host.cpu_ceiling,
                requested: request.vcpus,
            });
        }

        let pool = AddressPool::from_database(self.topology, db)?;
        debug!(
            "{} free {} addresses before allocating '{}'",
            pool.free_count(request.network),
            request.network,
            request.vm_name
        );

        let addr_id = pool
            .next_free(request.network)
            .ok_or(FleetError::PoolExhausted {
                network: request.network,
            })?;
        let ip = IpAssignment(request.network, addr_id);

        db.insert(
            request.vm_name.clone(),
            VmRecord {
                host: request.host.clone(),
                ram: request.ram,
                vcpus: request.vcpus,
                disk: request.disk,
                ip,
            },
        );

        info!(
            "Allocated {}/{} to VM '{}' on {}",
            request.network, addr_id, request.vm_name, request.host
        );
        Ok(ip)
    }
}
