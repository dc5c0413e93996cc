//! Configuration for hostfleet
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, `HOSTFLEET_*` environment variables, and finally command line
//! flags applied by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{FleetError, FleetResult};
use crate::topology::Topology;

pub mod defaults;

pub use defaults::*;

/// Root configuration structure for hostfleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// YAML database of VM records
    pub database_path: PathBuf,

    /// How long to wait for another invocation to release the database
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Delay between lock attempts
    #[serde(with = "humantime_serde")]
    pub lock_poll_interval: Duration,

    /// libvirt connection used by `create`
    pub libvirt_uri: String,

    /// Directory of `*.tera` files overriding the built-in templates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,

    pub dnsmasq: DnsmasqConfig,

    pub provisioning: ProvisioningConfig,

    /// Hosts, link templates and address ranges
    pub topology: Topology,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsmasqConfig {
    /// Where the `dhcp` and `hosts` files are written
    pub output_dir: PathBuf,

    /// Pid file of the running dnsmasq, signalled after a sync
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Logical volume every VM disk is cloned from
    pub base_volume: String,

    /// Partition of the base image grown to fill the new volume
    pub expand_partition: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS),
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            template_dir: None,
            dnsmasq: DnsmasqConfig::default(),
            provisioning: ProvisioningConfig::default(),
            topology: Topology::builtin(),
        }
    }
}

impl Default for DnsmasqConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_DNSMASQ_OUTPUT_DIR),
            pid_file: PathBuf::from(DEFAULT_DNSMASQ_PID_FILE),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            base_volume: DEFAULT_BASE_VOLUME.to_string(),
            expand_partition: DEFAULT_EXPAND_PARTITION.to_string(),
        }
    }
}

impl FleetConfig {
    /// Defaults, then `path` if given, then the environment. Validated.
    pub fn load(path: Option<&Path>) -> FleetResult<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> FleetResult<Self> {
        debug!("Reading configuration from {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| FleetError::io(path, e))?;
        toml::from_str(&content).map_err(|e| FleetError::InvalidConfiguration {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    /// Apply `HOSTFLEET_*` environment overrides
    pub fn with_env(mut self) -> FleetResult<Self> {
        if let Ok(path) = std::env::var("HOSTFLEET_DB") {
            self.database_path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("HOSTFLEET_LOCK_TIMEOUT_SECS") {
            let secs: u64 = val.parse().map_err(|_| FleetError::InvalidConfiguration {
                message: format!("Invalid HOSTFLEET_LOCK_TIMEOUT_SECS '{}'", val),
            })?;
            self.lock_timeout = Duration::from_secs(secs);
        }

        if let Ok(uri) = std::env::var("HOSTFLEET_LIBVIRT_URI") {
            self.libvirt_uri = uri;
        }

        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> FleetResult<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(FleetError::InvalidConfiguration {
                message: "database_path must not be empty".to_string(),
            });
        }

        if self.lock_timeout.is_zero() {
            return Err(FleetError::InvalidConfiguration {
                message: "lock_timeout must be non-zero".to_string(),
            });
        }

        if self.lock_poll_interval.is_zero() || self.lock_poll_interval > self.lock_timeout {
            return Err(FleetError::InvalidConfiguration {
                message: "lock_poll_interval must be non-zero and below lock_timeout".to_string(),
            });
        }

        self.topology.validate()
    }
}
