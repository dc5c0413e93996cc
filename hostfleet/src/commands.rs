//! Command handlers behind the `hostfleet` subcommands.
//!
//! Each handler writes its result to the given writer so the binary can
//! point it at stdout and tests can capture it.

use hostfleet_core::error::{FleetError, FleetResult};
use hostfleet_core::types::{AllocationRequest, ExpandedConfig, VmDatabase};
use hostfleet_core::{Allocator, ConfigExpander, DatabaseStore, FleetConfig};
use hostfleet_vm::{ArtifactRenderer, DnsmasqFile, DnsmasqSync, Provisioner};
use serde::Serialize;
use std::io::Write;
use tracing::info;

/// Everything a command needs: the resolved configuration and a store
/// pointing at its database.
pub struct FleetContext {
    pub config: FleetConfig,
    pub store: DatabaseStore,
}

impl FleetContext {
    pub fn new(config: FleetConfig) -> Self {
        let store = DatabaseStore::from_config(&config);
        Self { config, store }
    }

    fn expander(&self) -> ConfigExpander<'_> {
        ConfigExpander::new(&self.config.topology)
    }

    fn expand_one(&self, db: &VmDatabase, vm_name: &str) -> FleetResult<ExpandedConfig> {
        let record = db.get(vm_name).ok_or_else(|| FleetError::VmNotFound {
            vm_name: vm_name.to_string(),
        })?;
        self.expander().expand(vm_name, record)
    }

    fn load_vm(&self, vm_name: &str) -> FleetResult<ExpandedConfig> {
        let db = self.store.load()?;
        self.expand_one(&db, vm_name)
    }

    fn require_host(&self, host: &str) -> FleetResult<()> {
        self.config.topology.host(host).map(|_| ())
    }
}

/// Allocate inside one database transaction and print the expanded config.
pub fn allocate(
    ctx: &FleetContext,
    request: &AllocationRequest,
    out: &mut dyn Write,
) -> FleetResult<ExpandedConfig> {
    ctx.require_host(&request.host)?;

    let allocator = Allocator::new(&ctx.config.topology);
    let config = ctx.store.transact(|db| {
        allocator.allocate(db, request)?;
        ctx.expand_one(db, &request.vm_name)
    })?;

    write_yaml(&config, out)?;
    Ok(config)
}

/// One tab separated line per VM: name, host, then every interface address.
pub fn list(ctx: &FleetContext, out: &mut dyn Write) -> FleetResult<()> {
    let db = ctx.store.load()?;

    for vm in ctx.expander().expand_all(&db)? {
        let mut row = vec![vm.vm_name, vm.host];
        row.extend(vm.interfaces.iter().map(|i| i.ip.to_string()));
        writeln!(out, "{}", row.join("\t"))?;
    }

    Ok(())
}

pub fn show(ctx: &FleetContext, vm_name: &str, out: &mut dyn Write) -> FleetResult<()> {
    let vm = ctx.load_vm(vm_name)?;
    write_yaml(&vm, out)
}

pub fn xml(ctx: &FleetContext, vm_name: &str, out: &mut dyn Write) -> FleetResult<()> {
    let vm = ctx.load_vm(vm_name)?;
    let renderer = ArtifactRenderer::from_config(&ctx.config)?;
    writeln!(out, "{}", renderer.domain_xml(&vm)?.trim_end())?;
    Ok(())
}

pub fn dnsmasq(
    ctx: &FleetContext,
    host: &str,
    file: DnsmasqFile,
    out: &mut dyn Write,
) -> FleetResult<()> {
    ctx.require_host(host)?;

    let db = ctx.store.load()?;
    let vms = ctx.expander().expand_all(&db)?;
    let renderer = ArtifactRenderer::from_config(&ctx.config)?;
    write!(out, "{}", renderer.dnsmasq_file(&vms, host, file)?)?;
    Ok(())
}

pub async fn create(ctx: &FleetContext, vm_name: &str) -> FleetResult<()> {
    let vm = ctx.load_vm(vm_name)?;
    Provisioner::new(&ctx.config)?.create(&vm).await?;
    info!("Created {} on {}", vm.vm_name, vm.host);
    Ok(())
}

pub fn sync_dnsmasq(ctx: &FleetContext) -> FleetResult<()> {
    let db = ctx.store.load()?;
    let vms = ctx.expander().expand_all(&db)?;
    DnsmasqSync::new(&ctx.config)?.sync(&vms, &ctx.config.topology)
}

fn write_yaml<T: Serialize>(value: &T, out: &mut dyn Write) -> FleetResult<()> {
    let yaml = serde_yaml::to_string(value).map_err(|e| FleetError::Serialization {
        operation: "write YAML".to_string(),
        message: e.to_string(),
    })?;
    out.write_all(yaml.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostfleet_core::types::NetworkClass;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> FleetContext {
        let mut config = FleetConfig::default();
        config.database_path = dir.path().join("vms.yaml");
        FleetContext::new(config)
    }

    fn output(f: impl FnOnce(&mut Vec<u8>) -> FleetResult<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_allocate_prints_expanded_config() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let request = AllocationRequest::new("ceto", "www").network(NetworkClass::Public);
        let yaml = output(|out| allocate(&ctx, &request, out).map(|_| ()));

        let printed: ExpandedConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(printed.vm_name, "www");
        assert_eq!(printed.interfaces.len(), 2);
        assert_eq!(printed.interfaces[1].ip.to_string(), "164.39.7.115");
    }

    #[test]
    fn test_allocate_rejects_unknown_host_before_touching_database() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let err = allocate(&ctx, &AllocationRequest::new("pontus", "x"), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, FleetError::UnknownHost { .. }));
        assert!(!ctx.store.path().exists());
    }

    #[test]
    fn test_list_and_show() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        allocate(&ctx, &AllocationRequest::new("phorcys", "b"), &mut Vec::new()).unwrap();
        allocate(
            &ctx,
            &AllocationRequest::new("ceto", "a").network(NetworkClass::Public),
            &mut Vec::new(),
        )
        .unwrap();

        let listing = output(|out| list(&ctx, out));
        assert_eq!(listing, "a\tceto\t10.0.1.115\t164.39.7.115\nb\tphorcys\t10.0.4.2\n");

        let shown = output(|out| show(&ctx, "b", out));
        assert!(shown.contains("vm_name: b"));

        let err = show(&ctx, "c", &mut Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "VM 'c' not found in database");
    }

    #[test]
    fn test_dnsmasq_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        allocate(&ctx, &AllocationRequest::new("ceto", "a"), &mut Vec::new()).unwrap();

        let dhcp = output(|out| dnsmasq(&ctx, "ceto", DnsmasqFile::Dhcp, out));
        assert_eq!(dhcp, "52:54:01:01:03:02,10.0.3.2,a\n");

        let dhcp = output(|out| dnsmasq(&ctx, "phorcys", DnsmasqFile::Dhcp, out));
        assert_eq!(dhcp, "");

        let hosts = output(|out| dnsmasq(&ctx, "phorcys", DnsmasqFile::Hosts, out));
        assert_eq!(hosts, "10.0.3.2 a\n");
    }

    #[test]
    fn test_xml_ends_with_one_newline() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        allocate(&ctx, &AllocationRequest::new("ceto", "a"), &mut Vec::new()).unwrap();

        let xml = output(|out| xml(&ctx, "a", out));
        assert!(xml.ends_with("</domain>\n"));
        assert!(!xml.ends_with("\n\n"));
    }
}
