use hostfleet_core::config::{FleetConfig, ProvisioningConfig};
use hostfleet_core::error::{FleetError, FleetResult};
use hostfleet_core::types::ExpandedConfig;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use crate::renderer::ArtifactRenderer;
use crate::system::{require_root, HostEnvironment, SystemEnvironment};

/// Trait for executing commands - allows mocking in tests
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error>;
}

pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Default command executor that runs real commands
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Brings an allocated VM to life on the local host: defines the libvirt
/// domain, carves its logical volume out of the base image and starts it.
pub struct Provisioner {
    executor: Box<dyn CommandExecutor>,
    env: Box<dyn HostEnvironment>,
    renderer: ArtifactRenderer,
    libvirt_uri: String,
    provisioning: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(config: &FleetConfig) -> FleetResult<Self> {
        Ok(Self::with_parts(
            Box::new(SystemCommandExecutor),
            Box::new(SystemEnvironment),
            ArtifactRenderer::from_config(config)?,
            config,
        ))
    }

    pub fn with_parts(
        executor: Box<dyn CommandExecutor>,
        env: Box<dyn HostEnvironment>,
        renderer: ArtifactRenderer,
        config: &FleetConfig,
    ) -> Self {
        Self {
            executor,
            env,
            renderer,
            libvirt_uri: config.libvirt_uri.clone(),
            provisioning: config.provisioning.clone(),
        }
    }

    pub async fn create(&self, vm: &ExpandedConfig) -> FleetResult<()> {
        require_root(self.env.as_ref(), "create")?;

        let local = self.env.hostname()?;
        if local != vm.host {
            return Err(FleetError::InvalidOperation {
                operation: "create".to_string(),
                reason: format!("VM '{}' must be created on {}, this is {}", vm.vm_name, vm.host, local),
            });
        }

        let disk = vm.disk.ok_or_else(|| FleetError::InvalidOperation {
            operation: "create".to_string(),
            reason: format!("VM '{}' has no disk size", vm.vm_name),
        })?;

        if self.domain_exists(&vm.vm_name).await? {
            return Err(FleetError::InvalidOperation {
                operation: "create".to_string(),
                reason: format!("libvirt domain '{}' already exists", vm.vm_name),
            });
        }

        info!("Defining {}", vm.vm_name);
        let xml = self.renderer.domain_xml(vm)?;
        let mut xml_file = tempfile::Builder::new()
            .prefix(&format!("{}-", vm.vm_name))
            .suffix(".xml")
            .tempfile()?;
        xml_file.write_all(xml.as_bytes())?;
        xml_file.flush()?;
        self.virsh(&["define", &path_arg(xml_file.path())?]).await?;

        let volume = format!("vm-{}", vm.vm_name);
        let size = disk.to_string();
        self.run("lvcreate", &["--quiet", &vm.host, "--name", &volume, "--size", &size])
            .await?;

        let base = format!("/dev/{}/{}", vm.host, self.provisioning.base_volume);
        let target = format!("/dev/{}/{}", vm.host, volume);
        self.run(
            "virt-resize",
            &["-q", "--expand", &self.provisioning.expand_partition, &base, &target],
        )
        .await?;

        info!("Starting {}", vm.vm_name);
        self.virsh(&["start", &vm.vm_name]).await?;

        Ok(())
    }

    async fn domain_exists(&self, vm_name: &str) -> FleetResult<bool> {
        let output = self.virsh(&["list", "--all", "--name"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.trim() == vm_name))
    }

    async fn virsh(&self, args: &[&str]) -> FleetResult<CommandOutput> {
        let mut full = vec!["--connect", self.libvirt_uri.as_str()];
        full.extend_from_slice(args);
        self.run("virsh", &full).await
    }

    async fn run(&self, program: &str, args: &[&str]) -> FleetResult<CommandOutput> {
        info!("{} {}", program, args.join(" "));

        let output = self
            .executor
            .execute(program, args)
            .await
            .map_err(|e| FleetError::VmOperationFailed {
                operation: program.to_string(),
                details: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(FleetError::VmOperationFailed {
                operation: format!("{} {}", program, args.join(" ")),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }
}

fn path_arg(path: &Path) -> FleetResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| FleetError::InvalidInput {
            field: "path".to_string(),
            message: format!("{:?} is not valid UTF-8", path),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testing::FakeEnvironment;
    use hostfleet_core::types::{Disk, DiskUnit, ExpandedInterface, MemoryUnit, Ram};
    use std::net::Ipv4Addr;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::{Arc, Mutex};

    /// Mock command executor recording every invocation
    #[derive(Default)]
    struct MockCommandExecutor {
        commands: Arc<Mutex<Vec<Vec<String>>>>,
        existing_domains: Vec<String>,
        failing_program: Option<String>,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for MockCommandExecutor {
        async fn execute(
            &self,
            program: &str,
            args: &[&str],
        ) -> Result<CommandOutput, std::io::Error> {
            let mut command = vec![program.to_string()];
            command.extend(args.iter().map(|a| a.to_string()));
            self.commands.lock().unwrap().push(command);

            if self.failing_program.as_deref() == Some(program) {
                return Ok(CommandOutput {
                    status: std::process::ExitStatus::from_raw(5 << 8),
                    stdout: vec![],
                    stderr: b"  Volume group \"ceto\" has insufficient free space\n".to_vec(),
                });
            }

            let stdout = if args.contains(&"list") {
                self.existing_domains.join("\n").into_bytes()
            } else {
                vec![]
            };

            Ok(CommandOutput {
                status: std::process::ExitStatus::from_raw(0),
                stdout,
                stderr: vec![],
            })
        }
    }

    fn vm() -> ExpandedConfig {
        ExpandedConfig {
            host: "ceto".to_string(),
            vm_name: "build".to_string(),
            ram: Ram::new(4, MemoryUnit::GiB),
            vcpus: 2,
            disk: Some(Disk::new(20, DiskUnit::G)),
            interfaces: vec![ExpandedInterface {
                dev: 0,
                bridge: "br1".to_string(),
                mac: "52:54:01:01:03:07".to_string(),
                ip: Ipv4Addr::new(10, 0, 3, 7),
            }],
        }
    }

    fn provisioner(
        executor: MockCommandExecutor,
        env: FakeEnvironment,
    ) -> (Provisioner, Arc<Mutex<Vec<Vec<String>>>>) {
        let commands = executor.commands.clone();
        let provisioner = Provisioner::with_parts(
            Box::new(executor),
            Box::new(env),
            ArtifactRenderer::new().unwrap(),
            &FleetConfig::default(),
        );
        (provisioner, commands)
    }

    #[tokio::test]
    async fn test_create_runs_steps_in_order() {
        let (provisioner, commands) = provisioner(
            MockCommandExecutor {
                existing_domains: vec!["other".to_string()],
                ..Default::default()
            },
            FakeEnvironment::root_on("ceto"),
        );

        provisioner.create(&vm()).await.unwrap();

        let commands = commands.lock().unwrap();
        let programs: Vec<_> = commands
            .iter()
            .map(|c| (c[0].as_str(), c.get(3).map(String::as_str)))
            .collect();
        assert_eq!(
            programs,
            vec![
                ("virsh", Some("list")),
                ("virsh", Some("define")),
                ("lvcreate", Some("--name")),
                ("virt-resize", Some("/dev/sda1")),
                ("virsh", Some("start")),
            ]
        );

        assert_eq!(
            commands[2],
            vec!["lvcreate", "--quiet", "ceto", "--name", "vm-build", "--size", "20G"]
        );
        assert_eq!(
            commands[3],
            vec![
                "virt-resize",
                "-q",
                "--expand",
                "/dev/sda1",
                "/dev/ceto/vm-base",
                "/dev/ceto/vm-build"
            ]
        );
        assert_eq!(commands[4], vec!["virsh", "--connect", "qemu:///system", "start", "build"]);
    }

    #[tokio::test]
    async fn test_create_requires_root() {
        let (provisioner, commands) =
            provisioner(MockCommandExecutor::default(), FakeEnvironment::user_on("ceto"));

        let err = provisioner.create(&vm()).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidOperation { .. }));
        assert!(commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_on_wrong_host() {
        let (provisioner, commands) =
            provisioner(MockCommandExecutor::default(), FakeEnvironment::root_on("phorcys"));

        let err = provisioner.create(&vm()).await.unwrap_err();
        assert!(err.to_string().contains("must be created on ceto"));
        assert!(commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_domain() {
        let (provisioner, commands) = provisioner(
            MockCommandExecutor {
                existing_domains: vec!["build".to_string()],
                ..Default::default()
            },
            FakeEnvironment::root_on("ceto"),
        );

        let err = provisioner.create(&vm()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(commands.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_without_disk() {
        let (provisioner, _) =
            provisioner(MockCommandExecutor::default(), FakeEnvironment::root_on("ceto"));

        let mut vm = vm();
        vm.disk = None;
        let err = provisioner.create(&vm).await.unwrap_err();
        assert!(err.to_string().contains("no disk size"));
    }

    #[tokio::test]
    async fn test_failed_command_stops_the_workflow() {
        let (provisioner, commands) = provisioner(
            MockCommandExecutor {
                failing_program: Some("lvcreate".to_string()),
                ..Default::default()
            },
            FakeEnvironment::root_on("ceto"),
        );

        let err = provisioner.create(&vm()).await.unwrap_err();
        match err {
            FleetError::VmOperationFailed { details, .. } => {
                assert_eq!(details, "Volume group \"ceto\" has insufficient free space");
            }
            other => panic!("unexpected error: {}", other),
        }

        let commands = commands.lock().unwrap();
        assert_eq!(commands.last().unwrap()[0], "lvcreate");
    }
}
