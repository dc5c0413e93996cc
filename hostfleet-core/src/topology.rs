//! Static description of the physical hosts and the address ranges VMs
//! draw from.
//!
//! The registry is plain data. It is built once (the built-in table, or the
//! `[topology]` section of the config file), validated, and then handed by
//! reference to the allocator and the expander.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::error::{FleetError, FleetResult};
use crate::types::{AddrId, NetworkClass};

/// Closed range of address identifiers for one network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrRange {
    pub start: AddrId,
    pub end: AddrId,
}

impl AddrRange {
    pub const fn new(start: AddrId, end: AddrId) -> Self {
        Self { start, end }
    }

    pub fn ids(&self) -> RangeInclusive<AddrId> {
        self.start..=self.end
    }

    pub fn contains(&self, id: AddrId) -> bool {
        self.ids().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRanges {
    pub public: AddrRange,
    pub private: AddrRange,
}

impl PoolRanges {
    pub fn range(&self, class: NetworkClass) -> AddrRange {
        match class {
            NetworkClass::Public => self.public,
            NetworkClass::Private => self.private,
        }
    }
}

/// Which of a host's links an interface is built from.
///
/// `PubPriv` is the internal leg that every public VM keeps next to its
/// public interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkClass {
    Public,
    PubPriv,
    Private,
}

impl fmt::Display for LinkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkClass::Public => write!(f, "public"),
            LinkClass::PubPriv => write!(f, "pubpriv"),
            LinkClass::Private => write!(f, "private"),
        }
    }
}

/// First five octets of a MAC address; the address id supplies the sixth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacPrefix(pub [u8; 5]);

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e)
    }
}

impl FromStr for MacPrefix {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FleetError::InvalidConfiguration {
            message: format!("MAC prefix '{}' must be five hex octets", s),
        };

        let mut octets = [0u8; 5];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(MacPrefix(octets))
    }
}

impl TryFrom<String> for MacPrefix {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacPrefix> for String {
    fn from(prefix: MacPrefix) -> Self {
        prefix.to_string()
    }
}

/// Bridge plus MAC and IP patterns for one link of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTemplate {
    pub bridge: String,
    pub mac_prefix: MacPrefix,
    /// Network whose final octet is replaced by the address id.
    pub ip_base: Ipv4Addr,
}

impl LinkTemplate {
    pub fn new(bridge: &str, mac_prefix: [u8; 5], ip_base: [u8; 3]) -> Self {
        let [a, b, c] = ip_base;
        Self {
            bridge: bridge.to_string(),
            mac_prefix: MacPrefix(mac_prefix),
            ip_base: Ipv4Addr::new(a, b, c, 0),
        }
    }

    /// MAC with the id as the last octet in two-digit uppercase hex.
    pub fn mac(&self, id: AddrId) -> String {
        format!("{}:{:02X}", self.mac_prefix, id)
    }

    /// IPv4 address with the id as the final octet.
    pub fn ip(&self, id: AddrId) -> Ipv4Addr {
        let [a, b, c, _] = self.ip_base.octets();
        Ipv4Addr::new(a, b, c, id)
    }

    fn network(&self) -> [u8; 3] {
        let [a, b, c, _] = self.ip_base.octets();
        [a, b, c]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTopology {
    /// Most vCPUs a single VM on this host may ask for.
    pub cpu_ceiling: u32,
    pub public: LinkTemplate,
    pub pubpriv: LinkTemplate,
    pub private: LinkTemplate,
}

impl HostTopology {
    pub fn link(&self, class: LinkClass) -> &LinkTemplate {
        match class {
            LinkClass::Public => &self.public,
            LinkClass::PubPriv => &self.pubpriv,
            LinkClass::Private => &self.private,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub hosts: BTreeMap<String, HostTopology>,
    pub pools: PoolRanges,
}

impl Default for Topology {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Topology {
    /// The two-host deployment this tool was written for.
    pub fn builtin() -> Self {
        let mut hosts = BTreeMap::new();
        hosts.insert(
            "ceto".to_string(),
            HostTopology {
                cpu_ceiling: 4,
                public: LinkTemplate::new("br0", [0x52, 0x54, 0x01, 0x00, 0x00], [164, 39, 7]),
                pubpriv: LinkTemplate::new("br1", [0x52, 0x54, 0x01, 0x01, 0x01], [10, 0, 1]),
                private: LinkTemplate::new("br1", [0x52, 0x54, 0x01, 0x01, 0x03], [10, 0, 3]),
            },
        );
        hosts.insert(
            "phorcys".to_string(),
            HostTopology {
                cpu_ceiling: 8,
                public: LinkTemplate::new("br0", [0x52, 0x54, 0x02, 0x00, 0x00], [164, 39, 7]),
                pubpriv: LinkTemplate::new("br1", [0x52, 0x54, 0x02, 0x01, 0x02], [10, 0, 2]),
                private: LinkTemplate::new("br1", [0x52, 0x54, 0x02, 0x01, 0x04], [10, 0, 4]),
            },
        );

        Self {
            hosts,
            pools: PoolRanges {
                public: AddrRange::new(115, 124),
                private: AddrRange::new(2, 254),
            },
        }
    }

    pub fn host(&self, name: &str) -> FleetResult<&HostTopology> {
        self.hosts.get(name).ok_or_else(|| FleetError::UnknownHost {
            host: name.to_string(),
        })
    }

    pub fn host_names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn contains_host(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }

    pub fn range(&self, class: NetworkClass) -> AddrRange {
        self.pools.range(class)
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.hosts.is_empty() {
            return Err(FleetError::InvalidConfiguration {
                message: "topology has no hosts".to_string(),
            });
        }

        for class in NetworkClass::ALL {
            let range = self.range(class);
            if range.is_empty() {
                return Err(FleetError::InvalidConfiguration {
                    message: format!("{} range {} is empty", class, range),
                });
            }
            // 0 and 255 are the network and broadcast octets
            if range.start == 0 || range.end == 255 {
                return Err(FleetError::InvalidConfiguration {
                    message: format!("{} range {} must stay within 1-254", class, range),
                });
            }
        }

        for (name, host) in &self.hosts {
            if host.cpu_ceiling == 0 {
                return Err(FleetError::InvalidConfiguration {
                    message: format!("host {} has a cpu_ceiling of 0", name),
                });
            }
            // pubpriv and private ids come from overlapping pools
            if host.pubpriv.network() == host.private.network() {
                return Err(FleetError::InvalidConfiguration {
                    message: format!(
                        "host {} uses {} for both pubpriv and private links",
                        name, host.private.ip_base
                    ),
                });
            }
        }

        Ok(())
    }
}
