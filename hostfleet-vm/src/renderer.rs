use hostfleet_core::config::FleetConfig;
use hostfleet_core::error::{FleetError, FleetResult};
use hostfleet_core::types::ExpandedConfig;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tera::{Context, Tera};
use tracing::debug;

pub const DOMAIN_TEMPLATE: &str = "domain.xml";
pub const DNSMASQ_DHCP_TEMPLATE: &str = "dnsmasq-dhcp";
pub const DNSMASQ_HOSTS_TEMPLATE: &str = "dnsmasq-hosts";

const BUILTIN_TEMPLATES: [(&str, &str); 3] = [
    (DOMAIN_TEMPLATE, include_str!("../templates/domain.xml")),
    (DNSMASQ_DHCP_TEMPLATE, include_str!("../templates/dnsmasq-dhcp")),
    (DNSMASQ_HOSTS_TEMPLATE, include_str!("../templates/dnsmasq-hosts")),
];

/// The two files dnsmasq reads for the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsmasqFile {
    /// `dhcp-hostsfile`: `mac,ip,name` for each interface of VMs on the host
    Dhcp,
    /// `addn-hosts`: `ip name` with the internal address of every VM
    Hosts,
}

impl DnsmasqFile {
    pub const ALL: [DnsmasqFile; 2] = [DnsmasqFile::Dhcp, DnsmasqFile::Hosts];

    pub fn template_name(&self) -> &'static str {
        match self {
            DnsmasqFile::Dhcp => DNSMASQ_DHCP_TEMPLATE,
            DnsmasqFile::Hosts => DNSMASQ_HOSTS_TEMPLATE,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            DnsmasqFile::Dhcp => "dhcp",
            DnsmasqFile::Hosts => "hosts",
        }
    }
}

impl fmt::Display for DnsmasqFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

impl FromStr for DnsmasqFile {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dhcp" => Ok(DnsmasqFile::Dhcp),
            "hosts" => Ok(DnsmasqFile::Hosts),
            other => Err(FleetError::InvalidInput {
                field: "template".to_string(),
                message: format!("unknown dnsmasq file '{}'", other),
            }),
        }
    }
}

/// Renders libvirt domain XML and dnsmasq files from expanded configs.
///
/// Rendering is a pure function of its input. Templates are compiled into
/// the binary and any of them can be replaced by a `<name>.tera` file in a
/// template directory.
pub struct ArtifactRenderer {
    tera: Tera,
}

impl ArtifactRenderer {
    pub fn new() -> FleetResult<Self> {
        let mut tera = Tera::default();
        // output is XML attributes and plain text files, not HTML
        tera.autoescape_on(vec![]);

        for (name, content) in BUILTIN_TEMPLATES {
            add_template(&mut tera, name, content)?;
        }

        Ok(Self { tera })
    }

    /// Built-in templates, overridden by any `<name>.tera` in `dir`.
    pub fn with_template_dir(dir: &Path) -> FleetResult<Self> {
        let mut renderer = Self::new()?;

        for (name, _) in BUILTIN_TEMPLATES {
            let path: PathBuf = dir.join(format!("{}.tera", name));
            if !path.is_file() {
                continue;
            }

            debug!("Loading template override {:?}", path);
            let content = std::fs::read_to_string(&path).map_err(|e| FleetError::io(&path, e))?;
            add_template(&mut renderer.tera, name, &content)?;
        }

        Ok(renderer)
    }

    pub fn from_config(config: &FleetConfig) -> FleetResult<Self> {
        match &config.template_dir {
            Some(dir) => Self::with_template_dir(dir),
            None => Self::new(),
        }
    }

    /// libvirt domain definition for one VM.
    pub fn domain_xml(&self, vm: &ExpandedConfig) -> FleetResult<String> {
        let context = Context::from_serialize(vm).map_err(|e| render_error(DOMAIN_TEMPLATE, e))?;
        self.render(DOMAIN_TEMPLATE, &context)
    }

    /// dnsmasq file for `host`, built from every VM in the fleet.
    pub fn dnsmasq_file(
        &self,
        vms: &[ExpandedConfig],
        host: &str,
        file: DnsmasqFile,
    ) -> FleetResult<String> {
        let mut context = Context::new();
        context.insert("host", host);
        context.insert("vms", vms);
        self.render(file.template_name(), &context)
    }

    fn render(&self, template: &str, context: &Context) -> FleetResult<String> {
        self.tera
            .render(template, context)
            .map_err(|e| render_error(template, e))
    }
}

fn add_template(tera: &mut Tera, name: &str, content: &str) -> FleetResult<()> {
    tera.add_raw_template(name, content)
        .map_err(|e| render_error(name, e))
}

fn render_error(template: &str, error: tera::Error) -> FleetError {
    // tera keeps the useful part of the message in the source chain
    let mut message = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }

    FleetError::Render {
        template: template.to_string(),
        message,
    }
}
