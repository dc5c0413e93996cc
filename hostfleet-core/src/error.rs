use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::NetworkClass;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("VM '{vm_name}' already in database")]
    DuplicateName { vm_name: String },

    #[error("Host {host} only has {ceiling} cores, VM requested {requested}")]
    CapacityExceeded {
        host: String,
        ceiling: u32,
        requested: u32,
    },

    #[error("Network {network} exhausted")]
    PoolExhausted { network: NetworkClass },

    #[error("Unknown host '{host}'")]
    UnknownHost { host: String },

    #[error("Address {network}/{addr_id} assigned to both '{first}' and '{second}'")]
    AddressConflict {
        network: NetworkClass,
        addr_id: u8,
        first: String,
        second: String,
    },

    #[error("VM '{vm_name}' not found in database")]
    VmNotFound { vm_name: String },

    #[error("Timed out after {timeout:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Malformed database {}: {message}", path.display())]
    MalformedDatabase { path: PathBuf, message: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Failed to render template '{template}': {message}")]
    Render { template: String, message: String },

    #[error("VM operation '{operation}' failed: {details}")]
    VmOperationFailed { operation: String, details: String },

    #[error("Serialization operation '{operation}' failed: {message}")]
    Serialization { operation: String, message: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// Attach the offending path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FleetError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error signals a corrupted database or broken topology
    /// rather than a rejected request.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            FleetError::UnknownHost { .. }
                | FleetError::AddressConflict { .. }
                | FleetError::MalformedDatabase { .. }
        )
    }

    /// Process exit status for the CLI: 2 for corrupt data or an unknown
    /// host, 1 for every other failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_invariant_violation() {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = FleetError::DuplicateName {
            vm_name: "web1".to_string(),
        };
        assert_eq!(err.to_string(), "VM 'web1' already in database");

        let err = FleetError::CapacityExceeded {
            host: "ceto".to_string(),
            ceiling: 4,
            requested: 6,
        };
        assert_eq!(
            err.to_string(),
            "Host ceto only has 4 cores, VM requested 6"
        );

        let err = FleetError::PoolExhausted {
            network: NetworkClass::Public,
        };
        assert_eq!(err.to_string(), "Network public exhausted");
    }

    #[test]
    fn test_invariant_violations() {
        assert!(FleetError::UnknownHost {
            host: "nope".to_string()
        }
        .is_invariant_violation());
        assert!(!FleetError::VmNotFound {
            vm_name: "x".to_string()
        }
        .is_invariant_violation());
    }

    #[test]
    fn test_exit_codes() {
        let corrupt = FleetError::MalformedDatabase {
            path: PathBuf::from("vms.yaml"),
            message: "expected a mapping".to_string(),
        };
        assert_eq!(corrupt.exit_code(), 2);

        let exhausted = FleetError::PoolExhausted {
            network: NetworkClass::Private,
        };
        assert_eq!(exhausted.exit_code(), 1);
    }
}
