use crate::error::FleetResult;
use crate::topology::{HostTopology, LinkClass, Topology};
use crate::types::{
    AddrId, ExpandedConfig, ExpandedInterface, NetworkClass, VmDatabase, VmRecord,
};

/// Turns stored records into concrete interface lists.
///
/// Expansion only reads the record and the topology, so the same input
/// always gives the same output.
#[derive(Debug, Clone, Copy)]
pub struct ConfigExpander<'a> {
    topology: &'a Topology,
}

impl<'a> ConfigExpander<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    /// Public VMs get the internal `pubpriv` link as device 0 and the public
    /// link as device 1. Private VMs get the private link as device 0.
    pub fn expand(&self, vm_name: &str, record: &VmRecord) -> FleetResult<ExpandedConfig> {
        let host = self.topology.host(&record.host)?;
        let addr_id = record.ip.addr_id();

        let links: &[LinkClass] = match record.ip.class() {
            NetworkClass::Public => &[LinkClass::PubPriv, LinkClass::Public],
            NetworkClass::Private => &[LinkClass::Private],
        };

        let interfaces = links
            .iter()
            .zip(0u8..)
            .map(|(link, dev)| interface(host, *link, dev, addr_id))
            .collect();

        Ok(ExpandedConfig {
            host: record.host.clone(),
            vm_name: vm_name.to_string(),
            ram: record.ram,
            vcpus: record.vcpus,
            disk: record.disk,
            interfaces,
        })
    }

    /// Expand every record, in VM name order.
    pub fn expand_all(&self, db: &VmDatabase) -> FleetResult<Vec<ExpandedConfig>> {
        db.iter()
            .map(|(name, record)| self.expand(name, record))
            .collect()
    }
}

fn interface(host: &HostTopology, link: LinkClass, dev: u8, addr_id: AddrId) -> ExpandedInterface {
    let template = host.link(link);
    ExpandedInterface {
        dev,
        bridge: template.bridge.clone(),
        mac: template.mac(addr_id),
        ip: template.ip(addr_id),
    }
}
