//! Default configuration values for hostfleet
//!
//! This module centralizes all default values to make them easy to find and modify.

// Database defaults
pub const DEFAULT_DATABASE_PATH: &str = "./vms.yaml";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 50;

// libvirt defaults
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

// dnsmasq defaults
pub const DEFAULT_DNSMASQ_OUTPUT_DIR: &str = "/etc/dnsmasq";
pub const DEFAULT_DNSMASQ_PID_FILE: &str = "/run/dnsmasq/dnsmasq.pid";

// Provisioning defaults
pub const DEFAULT_BASE_VOLUME: &str = "vm-base";
pub const DEFAULT_EXPAND_PARTITION: &str = "/dev/sda1";
