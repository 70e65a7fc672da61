//! Thin wrappers over the libvirt CLI surface
//!
//! Everything the pipeline needs from the hypervisor goes through `virsh`
//! and `virt-install`; this module owns spawning those and parsing their
//! output into typed state.

use std::process::Command;
use std::str::FromStr;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, warn};

use crate::command_run::CommandRun;

/// Conventional gateway address of the libvirt default NAT network, used
/// when `net-dumpxml` cannot be parsed.
const DEFAULT_NETWORK_GATEWAY: &str = "192.168.122.1";

/// A domain's lifecycle state as reported by `virsh domstate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    ShutOff,
    Paused,
    Crashed,
    /// The hypervisor has no domain by this name.
    NotFound,
    /// Any other reported state; the monitor keeps polling through these.
    Other(String),
}

impl FromStr for DomainState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "running" => DomainState::Running,
            "shut off" => DomainState::ShutOff,
            "paused" => DomainState::Paused,
            "crashed" => DomainState::Crashed,
            other => DomainState::Other(other.to_string()),
        })
    }
}

/// How the monitor observes and nudges a domain. `Virsh` is the real
/// implementation; tests script a fake.
pub trait DomainObserver {
    fn state(&mut self, domain: &str) -> Result<DomainState>;

    /// Cumulative block device I/O in bytes, or `None` when counters are
    /// unavailable (e.g. the device has not settled yet).
    fn block_io_bytes(&mut self, domain: &str) -> Result<Option<u64>>;

    fn resume(&mut self, domain: &str) -> Result<()>;
}

/// Handle on one libvirt connection.
#[derive(Debug, Clone, Default)]
pub struct Virsh {
    connect: Option<String>,
}

impl Virsh {
    pub fn new(connect: Option<String>) -> Self {
        Self { connect }
    }

    pub fn connect_uri(&self) -> Option<&str> {
        self.connect.as_deref()
    }

    /// Create a virsh command with the connection URI applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.connect {
            cmd.arg("-c").arg(uri);
        }
        cmd
    }

    pub fn domain_exists(&self, domain: &str) -> Result<bool> {
        let output = self
            .command()
            .args(["domstate", domain])
            .output()
            .context("Failed to run virsh domstate")?;
        Ok(output.status.success())
    }

    /// The address on the default virtual network that guests can reach the
    /// host at, parsed from `virsh net-dumpxml default`.
    pub fn host_address(&self) -> String {
        match self
            .command()
            .args(["net-dumpxml", "default"])
            .run_get_string()
        {
            Ok(xml) => parse_network_ip(&xml).unwrap_or_else(|| {
                warn!(
                    "No ip address in default network XML, assuming {}",
                    DEFAULT_NETWORK_GATEWAY
                );
                DEFAULT_NETWORK_GATEWAY.to_string()
            }),
            Err(e) => {
                warn!(
                    "Failed to query default network, assuming {}: {e}",
                    DEFAULT_NETWORK_GATEWAY
                );
                DEFAULT_NETWORK_GATEWAY.to_string()
            }
        }
    }
}

/// Extract the bridge address from libvirt network XML, i.e. the `address`
/// attribute of the `<ip>` element.
fn parse_network_ip(xml: &str) -> Option<String> {
    let ip_elem = xml.find("<ip ")?;
    let rest = &xml[ip_elem..];
    let elem_end = rest.find('>')?;
    let elem = &rest[..elem_end];
    let attr = elem.find("address=")?;
    let quoted = &elem[attr + "address=".len()..];
    let quote = quoted.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let value = &quoted[1..];
    let end = value.find(quote)?;
    Some(value[..end].to_string())
}

impl DomainObserver for Virsh {
    fn state(&mut self, domain: &str) -> Result<DomainState> {
        let output = self
            .command()
            .args(["domstate", domain])
            .output()
            .context("Failed to run virsh domstate")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("failed to get domain") || stderr.contains("Domain not found") {
                return Ok(DomainState::NotFound);
            }
            return Err(eyre!("virsh domstate failed: {}", stderr));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let state = stdout
            .lines()
            .next()
            .unwrap_or("")
            .parse()
            .unwrap_or(DomainState::Other(String::new()));
        Ok(state)
    }

    fn block_io_bytes(&mut self, domain: &str) -> Result<Option<u64>> {
        // The install disk is the first virtio device.
        let output = match self
            .command()
            .args(["domblkstat", domain, "vda"])
            .run_get_string()
        {
            Ok(o) => o,
            Err(e) => {
                debug!("domblkstat unavailable for {domain}: {e}");
                return Ok(None);
            }
        };
        let mut total: u64 = 0;
        let mut matched = false;
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_), Some(counter), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if counter == "rd_bytes" || counter == "wr_bytes" {
                if let Ok(v) = value.parse::<u64>() {
                    total += v;
                    matched = true;
                }
            }
        }
        Ok(matched.then_some(total))
    }

    fn resume(&mut self, domain: &str) -> Result<()> {
        self.command()
            .args(["resume", domain])
            .run()
            .with_context(|| format!("Failed to resume domain {domain}"))
    }
}
