//! Facts about the machine a command runs on

use hostfleet_core::error::{FleetError, FleetResult};

/// The local host as seen by `create` and `sync-dnsmasq`.
///
/// Abstracted so the workflows can be tested without root.
pub trait HostEnvironment: Send + Sync {
    fn is_root(&self) -> bool;

    /// Short hostname, without any domain part
    fn hostname(&self) -> FleetResult<String>;
}

/// The real machine
pub struct SystemEnvironment;

impl HostEnvironment for SystemEnvironment {
    fn is_root(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn hostname(&self) -> FleetResult<String> {
        let name = nix::unistd::gethostname().map_err(|e| FleetError::VmOperationFailed {
            operation: "gethostname".to_string(),
            details: e.to_string(),
        })?;

        let name = name.into_string().map_err(|raw| FleetError::VmOperationFailed {
            operation: "gethostname".to_string(),
            details: format!("hostname {:?} is not valid UTF-8", raw),
        })?;

        Ok(short_hostname(&name).to_string())
    }
}

pub(crate) fn short_hostname(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

pub(crate) fn require_root(env: &dyn HostEnvironment, operation: &str) -> FleetResult<()> {
    if env.is_root() {
        return Ok(());
    }

    Err(FleetError::InvalidOperation {
        operation: operation.to_string(),
        reason: "must be run as root".to_string(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct FakeEnvironment {
        pub root: bool,
        pub hostname: String,
    }

    impl FakeEnvironment {
        pub fn root_on(hostname: &str) -> Self {
            Self {
                root: true,
                hostname: hostname.to_string(),
            }
        }

        pub fn user_on(hostname: &str) -> Self {
            Self {
                root: false,
                hostname: hostname.to_string(),
            }
        }
    }

    impl HostEnvironment for FakeEnvironment {
        fn is_root(&self) -> bool {
            self.root
        }

        fn hostname(&self) -> FleetResult<String> {
            Ok(self.hostname.clone())
        }
    }
}
