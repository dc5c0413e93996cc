//! Address pool derived from the database.
//!
//! There is no persisted free list. Every allocation rebuilds the pool from
//! the configured ranges minus the ids the database already hands out, so the
//! pool must be built from the same snapshot the allocation will mutate
//! (inside the store transaction).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

use crate::error::{FleetError, FleetResult};
use crate::topology::Topology;
use crate::types::{AddrId, NetworkClass, VmDatabase};

/// Free address ids per network class.
///
/// Every class of the topology has an entry, possibly an empty set. Ids are
/// kept ordered and [`AddressPool::next_free`] hands out the lowest one, so
/// allocation order is reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    free: BTreeMap<NetworkClass, BTreeSet<AddrId>>,
}

impl AddressPool {
    /// Full configured ranges, nothing allocated.
    pub fn full(topology: &Topology) -> Self {
        let free = NetworkClass::ALL
            .into_iter()
            .map(|class| (class, topology.range(class).ids().collect()))
            .collect();
        Self { free }
    }

    /// Configured ranges minus every id claimed by a record in `db`.
    ///
    /// Two records claiming the same id is a corrupted database and fails
    /// with [`FleetError::AddressConflict`]. An id outside the configured
    /// range is skipped with a warning.
    pub fn from_database(topology: &Topology, db: &VmDatabase) -> FleetResult<Self> {
        let mut pool = Self::full(topology);
        let mut owners: HashMap<(NetworkClass, AddrId), &str> = HashMap::new();

        for (name, record) in db {
            let class = record.ip.class();
            let addr_id = record.ip.addr_id();

            if let Some(first) = owners.insert((class, addr_id), name.as_str()) {
                return Err(FleetError::AddressConflict {
                    network: class,
                    addr_id,
                    first: first.to_string(),
                    second: name.clone(),
                });
            }

            if !topology.range(class).contains(addr_id) {
                warn!(
                    "VM '{}' holds {}/{} outside the configured range {}",
                    name,
                    class,
                    addr_id,
                    topology.range(class)
                );
                continue;
            }

            pool.claim(class, addr_id);
        }

        Ok(pool)
    }

    /// Free ids of `class`.
    pub fn available(&self, class: NetworkClass) -> &BTreeSet<AddrId> {
        static EMPTY: BTreeSet<AddrId> = BTreeSet::new();
        self.free.get(&class).unwrap_or(&EMPTY)
    }

    /// Lowest free id of `class`, if any remain.
    pub fn next_free(&self, class: NetworkClass) -> Option<AddrId> {
        self.available(class).first().copied()
    }

    pub fn free_count(&self, class: NetworkClass) -> usize {
        self.available(class).len()
    }

    pub fn is_free(&self, class: NetworkClass, addr_id: AddrId) -> bool {
        self.available(class).contains(&addr_id)
    }

    /// Remove an id from the free set. Returns false if it was not free.
    pub fn claim(&mut self, class: NetworkClass, addr_id: AddrId) -> bool {
        self.free
            .get_mut(&class)
            .map(|ids| ids.remove(&addr_id))
            .unwrap_or(false)
    }

    pub fn into_inner(self) -> BTreeMap<NetworkClass, BTreeSet<AddrId>> {
        self.free
    }
}

/// Free ids per class for `db`, keyed by every class.
pub fn available(
    topology: &Topology,
    db: &VmDatabase,
) -> FleetResult<BTreeMap<NetworkClass, BTreeSet<AddrId>>> {
    AddressPool::from_database(topology, db).map(AddressPool::into_inner)
}
