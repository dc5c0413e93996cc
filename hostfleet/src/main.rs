use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use hostfleet::commands;
use hostfleet::{
    AllocationRequest, Disk, DnsmasqFile, FleetConfig, FleetContext, FleetError, FleetResult,
    NetworkClass, Ram,
};

#[derive(Parser)]
#[command(name = "hostfleet")]
#[command(about = "Address allocation and provisioning for a small VM fleet", long_about = None)]
struct Cli {
    /// VMs database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Allocate an address for a new VM and record it
    Allocate {
        /// VM host
        host: String,

        /// Guest hostname
        vm_name: String,

        /// RAM, with units MiB or GiB
        #[arg(long, default_value = "1GiB")]
        ram: Ram,

        #[arg(long, default_value_t = 1)]
        vcpus: u32,

        /// Disk size, with units G or M
        #[arg(long, default_value = "2G")]
        disk: Disk,

        /// Take an address from the public pool
        #[arg(long)]
        public_ip: bool,
    },
    /// List VMs and their addresses
    List,
    /// Print the expanded config of a VM
    Show { vm_name: String },
    /// Print the libvirt domain XML of a VM
    Xml { vm_name: String },
    /// Print the dnsmasq dhcp-hosts file for a host
    DnsmasqDhcp { host: String },
    /// Print the dnsmasq hosts file for a host
    DnsmasqHosts { host: String },
    /// Create an allocated VM on this machine
    Create { vm_name: String },
    /// Write the dnsmasq files for this machine and HUP dnsmasq
    SyncDnsmasq,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> FleetResult<()> {
    // Initialize logging; stdout is reserved for command output
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "hostfleet=info"
            .parse()
            .map_err(|e| FleetError::InvalidConfiguration {
                message: format!("Invalid log directive: {}", e),
            })?,
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = FleetConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let ctx = FleetContext::new(config);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Allocate {
            host,
            vm_name,
            ram,
            vcpus,
            disk,
            public_ip,
        } => {
            let network = if public_ip {
                NetworkClass::Public
            } else {
                NetworkClass::Private
            };
            let request = AllocationRequest::new(host, vm_name)
                .ram(ram)
                .vcpus(vcpus)
                .disk(Some(disk))
                .network(network);
            commands::allocate(&ctx, &request, &mut out)?;
        }
        Commands::List => commands::list(&ctx, &mut out)?,
        Commands::Show { vm_name } => commands::show(&ctx, &vm_name, &mut out)?,
        Commands::Xml { vm_name } => commands::xml(&ctx, &vm_name, &mut out)?,
        Commands::DnsmasqDhcp { host } => {
            commands::dnsmasq(&ctx, &host, DnsmasqFile::Dhcp, &mut out)?
        }
        Commands::DnsmasqHosts { host } => {
            commands::dnsmasq(&ctx, &host, DnsmasqFile::Hosts, &mut out)?
        }
        Commands::Create { vm_name } => commands::create(&ctx, &vm_name).await?,
        Commands::SyncDnsmasq => commands::sync_dnsmasq(&ctx)?,
    }

    out.flush()?;
    Ok(())
}
