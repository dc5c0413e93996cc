//! Turning expanded VM configs into things the host understands: libvirt
//! domain definitions, logical volumes and dnsmasq files.

pub mod dnsmasq;
pub mod provisioner;
pub mod renderer;
pub mod system;

pub use dnsmasq::DnsmasqSync;
pub use provisioner::{CommandExecutor, CommandOutput, Provisioner, SystemCommandExecutor};
pub use renderer::{ArtifactRenderer, DnsmasqFile};
pub use system::{HostEnvironment, SystemEnvironment};
