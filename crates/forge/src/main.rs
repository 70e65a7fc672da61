//! vmforge - batch unattended VM installs via libvirt
//!
//! Collects specifications for one or more virtual machines, caches each
//! distribution's installation media once, renders per-VM kickstarts,
//! serves them over a transient local HTTP endpoint, drives virt-install,
//! and monitors every install to completion or a diagnosed failure.

use std::process::Command;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::{Report, Result};

mod batch;
mod command_run;
mod config;
mod distro;
mod httpd;
mod hypervisor;
mod interactive;
mod media;
mod monitor;
mod provision;
mod render;
mod spec;
mod utils;

use crate::batch::{print_report, run_batch, InstallPipeline};
use crate::config::{RunConfig, RunOpts};
use crate::distro::Distribution;
use crate::httpd::DeliveryEndpoint;
use crate::media::Downloader;
use crate::provision::Provisioner;
use crate::spec::VmSpec;
use crate::utils::{install_interrupt_flag, Interrupted};

/// External tools the pipeline shells out to, probed before any work.
const REQUIRED_TOOLS: [(&str, &str); 4] = [
    ("virsh", "--version"),
    ("virt-install", "--version"),
    ("qemu-img", "--version"),
    ("openssl", "version"),
];

/// Batch unattended VM installation for libvirt hosts.
///
/// vmforge downloads each distribution's install media once, renders a
/// kickstart per VM, serves the kickstarts to the guests over HTTP, and
/// installs the VMs strictly one at a time, reporting per-VM outcomes at
/// the end.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactively assemble a batch of VMs and install them
    Batch(BatchOpts),
    /// Install a single VM from positional arguments
    Provision(ProvisionOpts),
}

#[derive(Parser)]
struct BatchOpts {
    #[clap(flatten)]
    run: RunOpts,

    /// Emit the batch report as JSON instead of a table
    #[clap(long)]
    json: bool,
}

#[derive(Parser)]
struct ProvisionOpts {
    /// Guest distribution
    #[clap(value_enum)]
    distribution: Distribution,

    /// Host name of the new VM
    hostname: String,

    /// RAM in MiB
    ram_mib: u32,

    /// Number of vCPUs
    vcpus: u32,

    /// Disk size in GiB
    disk_gib: u32,

    /// Guest timezone (e.g. Europe/Berlin)
    timezone: String,

    /// Password for the unprivileged account
    user_password: String,

    /// Password for root
    root_password: String,

    /// Validate the spec and check for conflicts without side effects
    #[clap(long)]
    validate: bool,

    #[clap(flatten)]
    run: RunOpts,

    /// Emit the batch report as JSON instead of a table
    #[clap(long)]
    json: bool,
}

impl ProvisionOpts {
    fn to_spec(&self) -> VmSpec {
        VmSpec {
            distribution: self.distribution,
            hostname: self.hostname.clone(),
            ram_mib: self.ram_mib,
            vcpus: self.vcpus,
            disk_gib: self.disk_gib,
            timezone: self.timezone.clone(),
            user_password: self.user_password.clone(),
            root_password: self.root_password.clone(),
        }
    }
}

/// Install and configure the tracing/logging system.
///
/// Sets up structured logging with environment-based filtering,
/// error layer integration, and console output formatting.
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Verify the external toolchain is present. A missing tool is a
/// setup-phase fatal error, reported before any state is touched.
fn preflight_tools() -> Result<()> {
    for (tool, probe) in REQUIRED_TOOLS {
        let found = Command::new(tool)
            .arg(probe)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !found {
            return Err(eyre!(
                "Required tool {tool:?} is missing or not runnable; install it and retry"
            ));
        }
    }
    Ok(())
}

/// Run one batch end to end: endpoint up, media pre-fetched, every spec
/// pipelined in order, endpoint down, report printed.
fn orchestrate(
    runtime: &tokio::runtime::Handle,
    config: &RunConfig,
    specs: Vec<VmSpec>,
    json: bool,
) -> Result<()> {
    preflight_tools()?;
    config.ensure_layout()?;
    let interrupted = install_interrupt_flag(runtime);

    let endpoint = DeliveryEndpoint::start(
        runtime,
        &config.configs_dir(),
        config.http_port,
        &config.endpoint_pidfile(),
    )?;

    let mut media = Downloader::new(config);
    let mut pipeline = InstallPipeline::new(config, &endpoint, &interrupted);
    let run = run_batch(&specs, &mut media, &mut pipeline, &interrupted);

    // The endpoint comes down on every exit path; on error it is dropped.
    let run = run?;
    endpoint.stop();

    print_report(&run, json)?;
    Ok(())
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;

    let result = match cli.command {
        Commands::Batch(opts) => {
            let config = RunConfig::from_opts(&opts.run);
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            interactive::collect_specs(&mut input, &mut output)
                .and_then(|specs| orchestrate(rt.handle(), &config, specs, opts.json))
        }
        Commands::Provision(opts) => {
            let config = RunConfig::from_opts(&opts.run);
            let spec = opts.to_spec();
            if opts.validate {
                spec.validate().map_err(Report::from).and_then(|()| {
                    Provisioner::new(&config)
                        .preflight(&spec)
                        .map_err(Report::from)
                        .map(|()| println!("{} is valid and conflict-free", spec.hostname))
                })
            } else {
                // An invalid spec is a setup-phase error, never a batch entry.
                spec.validate()
                    .map_err(Report::from)
                    .and_then(|()| orchestrate(rt.handle(), &config, vec![spec], opts.json))
            }
        }
    };

    tracing::debug!("exiting");
    // Ensure we don't block on any spawned tasks
    rt.shutdown_background();

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) if e.downcast_ref::<Interrupted>().is_some() => {
            tracing::warn!("Run interrupted; endpoint and mounts released");
            std::process::exit(130)
        }
        Err(e) => Err(e),
    }
}
