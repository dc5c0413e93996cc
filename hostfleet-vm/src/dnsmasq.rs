use hostfleet_core::config::FleetConfig;
use hostfleet_core::error::{FleetError, FleetResult};
use hostfleet_core::topology::Topology;
use hostfleet_core::types::ExpandedConfig;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::renderer::{ArtifactRenderer, DnsmasqFile};
use crate::system::{require_root, HostEnvironment, SystemEnvironment};

/// Keeps the local dnsmasq in step with the database.
pub struct DnsmasqSync {
    renderer: ArtifactRenderer,
    output_dir: PathBuf,
    pid_file: PathBuf,
    env: Box<dyn HostEnvironment>,
}

impl DnsmasqSync {
    pub fn new(config: &FleetConfig) -> FleetResult<Self> {
        Ok(Self::with_parts(
            ArtifactRenderer::from_config(config)?,
            config.dnsmasq.output_dir.clone(),
            config.dnsmasq.pid_file.clone(),
            Box::new(SystemEnvironment),
        ))
    }

    pub fn with_parts(
        renderer: ArtifactRenderer,
        output_dir: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
        env: Box<dyn HostEnvironment>,
    ) -> Self {
        Self {
            renderer,
            output_dir: output_dir.into(),
            pid_file: pid_file.into(),
            env,
        }
    }

    /// Render both files for `host` into the output directory.
    pub fn write_files(&self, vms: &[ExpandedConfig], host: &str) -> FleetResult<Vec<PathBuf>> {
        DnsmasqFile::ALL
            .iter()
            .map(|file| {
                let path = self.output_dir.join(file.file_name());
                info!("Writing {}", path.display());

                let content = self.renderer.dnsmasq_file(vms, host, *file)?;
                std::fs::write(&path, content).map_err(|e| FleetError::io(&path, e))?;
                Ok(path)
            })
            .collect()
    }

    /// Send SIGHUP to the dnsmasq named in the pid file.
    pub fn reload(&self) -> FleetResult<i32> {
        let pid = read_pid(&self.pid_file)?;

        info!("HUP dnsmasq ({})", pid);
        kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| FleetError::VmOperationFailed {
            operation: "reload dnsmasq".to_string(),
            details: format!("kill -HUP {}: {}", pid, e),
        })?;

        Ok(pid)
    }

    /// Write this host's files and reload dnsmasq. Must run as root on one
    /// of the topology's hosts.
    pub fn sync(&self, vms: &[ExpandedConfig], topology: &Topology) -> FleetResult<()> {
        require_root(self.env.as_ref(), "sync-dnsmasq")?;

        let host = self.env.hostname()?;
        if !topology.contains_host(&host) {
            return Err(FleetError::InvalidOperation {
                operation: "sync-dnsmasq".to_string(),
                reason: format!(
                    "must be run on one of {}, this is {}",
                    topology.host_names().collect::<Vec<_>>().join(", "),
                    host
                ),
            });
        }

        self.write_files(vms, &host)?;
        self.reload()?;
        Ok(())
    }
}

fn read_pid(path: &Path) -> FleetResult<i32> {
    debug!("Reading pid from {:?}", path);
    let content = std::fs::read_to_string(path).map_err(|e| FleetError::io(path, e))?;

    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(FleetError::InvalidInput {
            field: "pid_file".to_string(),
            message: format!("{} does not hold a pid: {:?}", path.display(), content.trim()),
        }),
    }
}
