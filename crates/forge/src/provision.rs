//! Single-VM provisioning
//!
//! Drives the hypervisor toolchain to create one VM: conflict checks,
//! credential hashing, disk allocation, and the `virt-install` launch whose
//! boot parameters point the unattended installer at the delivery endpoint.
//! Each step fails this VM's pipeline without touching the rest of the
//! batch. The created domain and disk persist regardless of the eventual
//! install outcome; nothing here rolls them back.

use std::process::Command;

use camino::Utf8PathBuf;
use color_eyre::eyre::Context as _;
use tracing::{debug, info};

use crate::command_run::CommandRun;
use crate::config::RunConfig;
use crate::httpd::DeliveryEndpoint;
use crate::hypervisor::Virsh;
use crate::media::MediaPaths;
use crate::spec::{ValidationError, VmSpec};

/// A name or path we would have to overwrite. Always a hard stop.
#[derive(Debug, thiserror::Error)]
pub enum ResourceConflict {
    #[error("a domain named {0:?} already exists")]
    DomainExists(String),
    #[error("disk image {0} already exists")]
    DiskExists(Utf8PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ResourceConflict),
    #[error("{which} password hash is not a SHA-512 crypt credential")]
    CredentialFormat { which: &'static str },
    #[error(transparent)]
    Other(#[from] color_eyre::Report),
}

/// A provisioned domain, handed off to the installation monitor.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub domain: String,
    pub disk: Utf8PathBuf,
}

/// Hashed credentials ready for kickstart substitution.
#[derive(Debug)]
pub struct Credentials {
    pub user_password_hash: String,
    pub root_password_hash: String,
}

pub struct Provisioner<'a> {
    config: &'a RunConfig,
    virsh: Virsh,
}

impl<'a> Provisioner<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self {
            config,
            virsh: Virsh::new(config.connect.clone()),
        }
    }

    pub fn disk_path(&self, spec: &VmSpec) -> Utf8PathBuf {
        self.config.disks_dir().join(format!("{}.qcow2", spec.hostname))
    }

    /// Validation and conflict checks only; no side effects. Used both as
    /// the first provisioning step and for `provision --validate`.
    pub fn preflight(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        spec.validate()?;
        let disk = self.disk_path(spec);
        if disk.exists() {
            return Err(ResourceConflict::DiskExists(disk).into());
        }
        if self
            .virsh
            .domain_exists(&spec.hostname)
            .context("Checking for an existing domain")?
        {
            return Err(ResourceConflict::DomainExists(spec.hostname.clone()).into());
        }
        Ok(())
    }

    /// Hash both of the spec's passwords via `openssl passwd -6`.
    pub fn hash_credentials(&self, spec: &VmSpec) -> Result<Credentials, ProvisionError> {
        Ok(Credentials {
            user_password_hash: hash_password(&spec.user_password, "user")?,
            root_password_hash: hash_password(&spec.root_password, "root")?,
        })
    }

    /// Create the domain and launch its install. Blocks until the installer
    /// environment has booted (not until the OS install finishes; that is
    /// the monitor's job).
    pub fn provision(
        &self,
        spec: &VmSpec,
        media: &MediaPaths,
        endpoint: &DeliveryEndpoint,
        config_file_name: &str,
    ) -> Result<VmHandle, ProvisionError> {
        self.preflight(spec)?;

        let disk = self.disk_path(spec);
        allocate_disk(&disk, spec.disk_gib)?;

        let host_address = self.virsh.host_address();
        let ks_url = endpoint.url_for(&host_address, config_file_name);
        debug!("Kickstart for {} served at {}", spec.hostname, ks_url);

        let args = virt_install_args(spec, media, &disk, &ks_url, self.virsh.connect_uri());
        info!("Launching install of {}", spec.hostname);
        Command::new("virt-install")
            .args(&args)
            .run()
            .context("virt-install failed to launch the install")?;

        Ok(VmHandle {
            domain: spec.hostname.clone(),
            disk,
        })
    }
}

/// Allocate the VM's qcow2 disk image.
fn allocate_disk(disk: &Utf8PathBuf, size_gib: u32) -> Result<(), ProvisionError> {
    Command::new("qemu-img")
        .args(["create", "-f", "qcow2"])
        .arg(disk)
        .arg(format!("{size_gib}G"))
        .run()
        .with_context(|| format!("Failed to allocate disk {disk}"))?;
    Ok(())
}

/// Hash a password with the external hashing service (`openssl passwd -6`),
/// feeding the secret over stdin so it never appears in an argument list.
fn hash_password(secret: &str, which: &'static str) -> Result<String, ProvisionError> {
    let hash = Command::new("openssl")
        .args(["passwd", "-6", "-stdin"])
        .run_with_stdin_get_string(&format!("{secret}\n"))
        .with_context(|| format!("Failed to hash {which} password"))?;
    let hash = hash.trim().to_string();
    if !is_sha512_crypt(&hash) {
        return Err(ProvisionError::CredentialFormat { which });
    }
    Ok(hash)
}

/// A SHA-512 crypt credential: `$6$<salt>$<digest>`.
fn is_sha512_crypt(hash: &str) -> bool {
    let mut parts = hash.split('$');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(""), Some("6"), Some(salt), Some(digest))
            if !salt.is_empty() && !digest.is_empty()
    )
}

/// Arguments for the `virt-install` launch: platform variant, allocated
/// disk, install media, and one-shot boot parameters pointing the installer
/// at the rendered kickstart.
fn virt_install_args(
    spec: &VmSpec,
    media: &MediaPaths,
    disk: &Utf8PathBuf,
    ks_url: &str,
    connect_uri: Option<&str>,
) -> Vec<String> {
    let profile = spec.distribution.profile();
    let mut args = Vec::new();
    if let Some(uri) = connect_uri {
        args.push("--connect".to_string());
        args.push(uri.to_string());
    }
    args.extend([
        "--name".to_string(),
        spec.hostname.clone(),
        "--memory".to_string(),
        spec.ram_mib.to_string(),
        "--vcpus".to_string(),
        spec.vcpus.to_string(),
        "--disk".to_string(),
        format!("path={disk},format=qcow2,bus=virtio"),
        "--disk".to_string(),
        format!("path={},device=cdrom", media.iso),
        "--os-variant".to_string(),
        profile.os_variant.to_string(),
        "--network".to_string(),
        "network=default".to_string(),
        "--graphics".to_string(),
        "none".to_string(),
        "--noautoconsole".to_string(),
        "--install".to_string(),
        format!(
            "kernel={},initrd={},kernel_args=inst.ks={} inst.repo=cdrom console=ttyS0",
            media.kernel, media.initrd, ks_url
        ),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, RunConfig};
    use crate::distro::Distribution;

    fn test_config(state_dir: &camino::Utf8Path) -> RunConfig {
        RunConfig {
            connect: None,
            state_dir: state_dir.to_owned(),
            template_dir: state_dir.join("templates"),
            http_port: 8925,
            monitor: MonitorConfig::default(),
        }
    }

    fn spec() -> VmSpec {
        VmSpec {
            distribution: Distribution::CentosStream9,
            hostname: "db-01".to_string(),
            ram_mib: 4096,
            vcpus: 4,
            disk_gib: 40,
            timezone: "UTC".to_string(),
            user_password: "swordfish99".to_string(),
            root_password: "tr0ubador&3".to_string(),
        }
    }

    fn media() -> MediaPaths {
        MediaPaths {
            iso: Utf8PathBuf::from("/var/lib/vmforge/media/CentOS-Stream-9-latest-x86_64-dvd1.iso"),
            kernel: Utf8PathBuf::from("/var/lib/vmforge/boot/centos-stream-9/vmlinuz"),
            initrd: Utf8PathBuf::from("/var/lib/vmforge/boot/centos-stream-9/initrd.img"),
        }
    }

    #[test]
    fn test_preflight_rejects_invalid_spec_before_any_check() {
        let dir = tempfile::tempdir().unwrap();
        let state = camino::Utf8Path::from_path(dir.path()).unwrap();
        let config = test_config(state);
        let p = Provisioner::new(&config);
        let mut bad = spec();
        bad.ram_mib = 1;
        assert!(matches!(
            p.preflight(&bad),
            Err(ProvisionError::Validation(_))
        ));
    }

    #[test]
    fn test_disk_collision_is_a_conflict_before_hypervisor_work() {
        let dir = tempfile::tempdir().unwrap();
        let state = camino::Utf8Path::from_path(dir.path()).unwrap();
        let config = test_config(state);
        config.ensure_layout().unwrap();
        std::fs::write(config.disks_dir().join("db-01.qcow2"), b"").unwrap();
        let p = Provisioner::new(&config);
        // Fails on the filesystem check; virsh is never consulted.
        assert!(matches!(
            p.preflight(&spec()),
            Err(ProvisionError::Conflict(ResourceConflict::DiskExists(_)))
        ));
    }

    #[test]
    fn test_sha512_crypt_shape() {
        assert!(is_sha512_crypt("$6$rounds$abcdefg"));
        assert!(is_sha512_crypt("$6$Wl0ZFgnZ$0Qo9Abc"));
        assert!(!is_sha512_crypt("$5$salt$hash"));
        assert!(!is_sha512_crypt("$6$$"));
        assert!(!is_sha512_crypt("plaintext"));
        assert!(!is_sha512_crypt(""));
    }

    #[test]
    fn test_virt_install_args_carry_profile_and_boot_params() {
        let s = spec();
        let disk = Utf8PathBuf::from("/var/lib/vmforge/disks/db-01.qcow2");
        let url = "http://192.168.122.1:8925/db-01.ks.cfg";
        let args = virt_install_args(&s, &media(), &disk, url, None);

        assert!(args.contains(&"--os-variant".to_string()));
        assert!(args.contains(&"centos-stream9".to_string()));
        assert!(args.contains(&"--noautoconsole".to_string()));
        assert!(args.iter().any(|a| a.contains("path=/var/lib/vmforge/disks/db-01.qcow2")));
        assert!(args.iter().any(|a| a.contains("device=cdrom")));
        let install = args.last().unwrap();
        assert!(install.contains("kernel=/var/lib/vmforge/boot/centos-stream-9/vmlinuz"));
        assert!(install.contains(&format!("inst.ks={url}")));
        // No connection URI unless one was configured.
        assert!(!args.contains(&"--connect".to_string()));
    }

    #[test]
    fn test_virt_install_args_include_connect_uri() {
        let args = virt_install_args(
            &spec(),
            &media(),
            &Utf8PathBuf::from("/d.qcow2"),
            "http://h/x",
            Some("qemu:///system"),
        );
        assert_eq!(args[0], "--connect");
        assert_eq!(args[1], "qemu:///system");
    }
}
