use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::FleetError;

/// Numeric address identifier handed out from a network class pool.
///
/// It becomes the last octet of both the MAC and the IPv4 address of every
/// interface the VM gets, so it always fits in a byte.
pub type AddrId = u8;

/// The whole database: VM name to record, kept sorted by name.
pub type VmDatabase = BTreeMap<String, VmRecord>;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Public,
    #[default]
    Private,
}

impl NetworkClass {
    pub const ALL: [NetworkClass; 2] = [NetworkClass::Public, NetworkClass::Private];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkClass::Public => "public",
            NetworkClass::Private => "private",
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkClass {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(NetworkClass::Public),
            "private" => Ok(NetworkClass::Private),
            other => Err(FleetError::InvalidInput {
                field: "network".to_string(),
                message: format!("unknown network class '{}'", other),
            }),
        }
    }
}

/// Unit suffix accepted after an amount, e.g. the `GiB` in `4GiB`.
pub trait SizeUnit: Copy + Sized + 'static {
    const ALL: &'static [Self];
    const FIELD: &'static str;

    fn suffix(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryUnit {
    MiB,
    GiB,
}

impl SizeUnit for MemoryUnit {
    const ALL: &'static [Self] = &[MemoryUnit::MiB, MemoryUnit::GiB];
    const FIELD: &'static str = "ram";

    fn suffix(&self) -> &'static str {
        match self {
            MemoryUnit::MiB => "MiB",
            MemoryUnit::GiB => "GiB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskUnit {
    G,
    M,
}

impl SizeUnit for DiskUnit {
    const ALL: &'static [Self] = &[DiskUnit::G, DiskUnit::M];
    const FIELD: &'static str = "disk";

    fn suffix(&self) -> &'static str {
        match self {
            DiskUnit::G => "G",
            DiskUnit::M => "M",
        }
    }
}

/// A positive amount with a unit, stored as `{amt, unit}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    try_from = "RawAmount<U>",
    bound(deserialize = "U: SizeUnit + Deserialize<'de>")
)]
pub struct Amount<U> {
    pub amt: u32,
    pub unit: U,
}

/// On-disk shape of [`Amount`] before the positivity check.
#[derive(Deserialize)]
struct RawAmount<U> {
    amt: u32,
    unit: U,
}

impl<U: SizeUnit> TryFrom<RawAmount<U>> for Amount<U> {
    type Error = FleetError;

    fn try_from(raw: RawAmount<U>) -> Result<Self, Self::Error> {
        if raw.amt == 0 {
            return Err(FleetError::InvalidInput {
                field: U::FIELD.to_string(),
                message: format!("{}: amount must be positive", Amount::new(0, raw.unit)),
            });
        }
        Ok(Self::new(raw.amt, raw.unit))
    }
}

pub type Ram = Amount<MemoryUnit>;
pub type Disk = Amount<DiskUnit>;

impl<U: SizeUnit> Amount<U> {
    pub fn new(amt: u32, unit: U) -> Self {
        Self { amt, unit }
    }
}

impl<U: SizeUnit> fmt::Display for Amount<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amt, self.unit.suffix())
    }
}

impl<U: SizeUnit> FromStr for Amount<U> {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| FleetError::InvalidInput {
            field: U::FIELD.to_string(),
            message,
        };

        let unit = U::ALL
            .iter()
            .find(|unit| s.ends_with(unit.suffix()))
            .ok_or_else(|| {
                let allowed: Vec<_> = U::ALL.iter().map(|u| u.suffix()).collect();
                invalid(format!("'{}' must end in one of {}", s, allowed.join(", ")))
            })?;

        let digits = &s[..s.len() - unit.suffix().len()];
        let amt: u32 = digits
            .parse()
            .map_err(|e| invalid(format!("'{}': {}", s, e)))?;
        if amt == 0 {
            return Err(invalid(format!("'{}': amount must be positive", s)));
        }

        Ok(Self { amt, unit: *unit })
    }
}

/// `(network class, address id)`, stored as a two element sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpAssignment(pub NetworkClass, pub AddrId);

impl IpAssignment {
    pub fn class(&self) -> NetworkClass {
        self.0
    }

    pub fn addr_id(&self) -> AddrId {
        self.1
    }
}

/// A persisted VM. Created only by allocation, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub host: String,
    pub ram: Ram,
    pub vcpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<Disk>,
    pub ip: IpAssignment,
}

/// What the operator asks for when allocating a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub host: String,
    pub vm_name: String,
    pub ram: Ram,
    pub vcpus: u32,
    pub disk: Option<Disk>,
    pub network: NetworkClass,
}

impl AllocationRequest {
    /// A request with the command line defaults: 1GiB of RAM, one vCPU,
    /// a 2G disk on the private network.
    pub fn new(host: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            vm_name: vm_name.into(),
            ram: Ram::new(1, MemoryUnit::GiB),
            vcpus: 1,
            disk: Some(Disk::new(2, DiskUnit::G)),
            network: NetworkClass::Private,
        }
    }

    pub fn ram(mut self, ram: Ram) -> Self {
        self.ram = ram;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn disk(mut self, disk: Option<Disk>) -> Self {
        self.disk = disk;
        self
    }

    pub fn network(mut self, network: NetworkClass) -> Self {
        self.network = network;
        self
    }
}

/// One concrete NIC of a VM after expansion against the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedInterface {
    pub dev: u8,
    pub bridge: String,
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// A VM record with every network detail resolved, ready for templating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedConfig {
    pub host: String,
    pub vm_name: String,
    pub ram: Ram,
    pub vcpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<Disk>,
    pub interfaces: Vec<ExpandedInterface>,
}
