//! Run-scoped configuration
//!
//! Everything a batch run needs to know about its environment lives here and
//! is passed down explicitly; components never reach for process-global state.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;

/// Default state directory for vmforge data (media cache, boot artifacts,
/// rendered kickstarts, disk images).
pub const DEFAULT_STATEDIR: &str = "/var/lib/vmforge";

/// Default directory holding the shipped kickstart templates.
pub const DEFAULT_TEMPLATE_DIR: &str = "/usr/share/vmforge/templates";

/// Default port for the kickstart delivery endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 8925;

/// Options shared by every provisioning entry point.
#[derive(Debug, Parser, Clone)]
pub struct RunOpts {
    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    #[clap(short = 'c', long = "connect", global = true)]
    pub connect: Option<String>,

    /// State directory for media cache, boot artifacts and disk images
    #[clap(long, default_value = DEFAULT_STATEDIR)]
    pub state_dir: Utf8PathBuf,

    /// Directory containing kickstart templates
    #[clap(long, default_value = DEFAULT_TEMPLATE_DIR)]
    pub template_dir: Utf8PathBuf,

    /// Port the kickstart delivery endpoint listens on
    #[clap(long, default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Overall per-VM install timeout in seconds
    #[clap(long, default_value_t = 1800)]
    pub install_timeout: u64,

    /// Seconds between domain state polls
    #[clap(long, default_value_t = 10)]
    pub poll_interval: u64,

    /// Seconds of zero disk I/O (while running) before an install is
    /// declared stuck
    #[clap(long, default_value_t = 300)]
    pub stuck_threshold: u64,
}

/// Thresholds driving the installation monitor state machine.
///
/// These are configuration rather than constants so tests can shrink them
/// to millisecond scale.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Overall deadline for one install.
    pub timeout: Duration,
    /// Sleep between `domstate` polls.
    pub poll_interval: Duration,
    /// How long observed disk I/O may stay flat before the install is
    /// declared stuck.
    pub stuck_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(10),
            stuck_threshold: Duration::from_secs(300),
        }
    }
}

/// Resolved configuration for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub connect: Option<String>,
    pub state_dir: Utf8PathBuf,
    pub template_dir: Utf8PathBuf,
    pub http_port: u16,
    pub monitor: MonitorConfig,
}

impl RunConfig {
    pub fn from_opts(opts: &RunOpts) -> Self {
        Self {
            connect: opts.connect.clone(),
            state_dir: opts.state_dir.clone(),
            template_dir: opts.template_dir.clone(),
            http_port: opts.http_port,
            monitor: MonitorConfig {
                timeout: Duration::from_secs(opts.install_timeout),
                poll_interval: Duration::from_secs(opts.poll_interval),
                stuck_threshold: Duration::from_secs(opts.stuck_threshold),
            },
        }
    }

    /// Media cache directory, one ISO per distribution.
    pub fn media_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("media")
    }

    /// Per-distribution boot artifact directory (kernel + initrd pair).
    pub fn boot_dir(&self, distro_id: &str) -> Utf8PathBuf {
        self.state_dir.join("boot").join(distro_id)
    }

    /// Directory the rendered kickstarts are written to and served from.
    pub fn configs_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("configs")
    }

    /// Directory the per-VM disk images are allocated in.
    pub fn disks_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("disks")
    }

    /// Pidfile recording the delivery endpoint's process identity.
    pub fn endpoint_pidfile(&self) -> Utf8PathBuf {
        self.state_dir.join("httpd.pid")
    }

    /// Create the state directory layout. Existing directories are left
    /// untouched.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.media_dir(),
            self.state_dir.join("boot"),
            self.configs_dir(),
            self.disks_dir(),
        ] {
            create_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {dir}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let cfg = RunConfig {
            connect: None,
            state_dir: Utf8PathBuf::from("/var/lib/vmforge"),
            template_dir: Utf8PathBuf::from(DEFAULT_TEMPLATE_DIR),
            http_port: DEFAULT_HTTP_PORT,
            monitor: MonitorConfig::default(),
        };
        assert_eq!(cfg.media_dir(), "/var/lib/vmforge/media");
        assert_eq!(cfg.boot_dir("fedora-42"), "/var/lib/vmforge/boot/fedora-42");
        assert_eq!(cfg.configs_dir(), "/var/lib/vmforge/configs");
        assert_eq!(cfg.endpoint_pidfile(), "/var/lib/vmforge/httpd.pid");
    }

    #[test]
    fn test_monitor_config_from_opts() {
        let opts = RunOpts::parse_from([
            "vmforge",
            "--install-timeout",
            "60",
            "--poll-interval",
            "1",
            "--stuck-threshold",
            "5",
        ]);
        let cfg = RunConfig::from_opts(&opts);
        assert_eq!(cfg.monitor.timeout, Duration::from_secs(60));
        assert_eq!(cfg.monitor.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.monitor.stuck_threshold, Duration::from_secs(5));
    }
}
