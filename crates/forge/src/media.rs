//! Installation media cache and boot artifact extraction
//!
//! Media downloads are idempotent per distribution: an ISO already in the
//! cache is never re-fetched, and a partial transfer never survives as a
//! cache entry (download goes to a `.part` file renamed only on success).
//! Boot artifacts (kernel + initrd) are copied out of the ISO through a
//! read-only loop mount that is released on every exit path.

use std::io::Write as _;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context as _;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::command_run::CommandRun;
use crate::config::RunConfig;
use crate::distro::{Distribution, DistributionProfile};

/// Candidate in-media paths for the installer kernel, in search order.
const KERNEL_CANDIDATES: &[&str] = &["images/pxeboot/vmlinuz", "isolinux/vmlinuz"];

/// Candidate in-media paths for the installer initrd, in search order.
const INITRD_CANDIDATES: &[&str] = &["images/pxeboot/initrd.img", "isolinux/initrd.img"];

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The transfer itself failed; the media may exist but was unreachable.
    #[error("failed to download {url}")]
    Transport {
        url: String,
        #[source]
        source: color_eyre::Report,
    },
    /// The media arrived but does not have the internal layout we expect.
    #[error("{media} does not contain {expected} at any of {candidates:?}")]
    ContentShape {
        media: Utf8PathBuf,
        expected: &'static str,
        candidates: &'static [&'static str],
    },
    #[error("failed to mount {media} read-only")]
    Mount {
        media: Utf8PathBuf,
        #[source]
        source: color_eyre::Report,
    },
    #[error(transparent)]
    Other(#[from] color_eyre::Report),
}

/// Local paths for one distribution's cached media and boot artifacts.
#[derive(Debug, Clone)]
pub struct MediaPaths {
    pub iso: Utf8PathBuf,
    pub kernel: Utf8PathBuf,
    pub initrd: Utf8PathBuf,
}

/// Anything that can make a distribution's media available locally.
///
/// The orchestrator talks to this trait so tests can count invocations
/// without touching the network.
pub trait MediaSource {
    fn ensure_media(&mut self, distribution: Distribution) -> Result<MediaPaths, MediaError>;
}

/// The real media source: HTTP download plus loop-mount extraction.
pub struct Downloader<'a> {
    config: &'a RunConfig,
    http: reqwest::blocking::Client,
}

impl<'a> Downloader<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self {
            config,
            http: reqwest::blocking::Client::new(),
        }
    }

    fn download(&self, url: &str, dest: &Utf8Path) -> Result<(), MediaError> {
        let transport = |source: color_eyre::Report| MediaError::Transport {
            url: url.to_string(),
            source,
        };

        let mut resp = self
            .http
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport(e.into()))?;

        // A previous partial file is overwritten, never resumed into.
        let part = dest.with_extension("part");
        let mut file = std::fs::File::create(&part)
            .with_context(|| format!("Failed to create {part}"))
            .map_err(MediaError::Other)?;

        let pb = match resp.content_length() {
            Some(len) => ProgressBar::new(len).with_style(
                ProgressStyle::with_template("{msg} {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            ),
            None => ProgressBar::new_spinner(),
        };
        pb.set_message(format!("Downloading {}", dest.file_name().unwrap_or("media")));

        let copied = resp
            .copy_to(&mut pb.wrap_write(&mut file))
            .map_err(|e| transport(e.into()))?;
        file.flush()
            .context("flushing downloaded media")
            .map_err(MediaError::Other)?;
        pb.finish_and_clear();

        std::fs::rename(&part, dest)
            .with_context(|| format!("Failed to move {part} into place"))
            .map_err(MediaError::Other)?;
        info!("Downloaded {} ({} bytes)", dest, copied);
        Ok(())
    }

    fn extract_boot_artifacts(
        &self,
        profile: &DistributionProfile,
        iso: &Utf8Path,
        boot_dir: &Utf8Path,
    ) -> Result<(Utf8PathBuf, Utf8PathBuf), MediaError> {
        let kernel = boot_dir.join("vmlinuz");
        let initrd = boot_dir.join("initrd.img");
        if kernel.exists() && initrd.exists() {
            debug!("Boot artifacts for {} already extracted", profile.id);
            return Ok((kernel, initrd));
        }

        std::fs::create_dir_all(boot_dir)
            .with_context(|| format!("Failed to create {boot_dir}"))
            .map_err(MediaError::Other)?;

        // The guard unmounts on drop, including on the error paths below.
        let mount = MountGuard::mount_readonly(iso)?;

        copy_first_match(&mount, iso, KERNEL_CANDIDATES, "installer kernel", &kernel)?;
        copy_first_match(&mount, iso, INITRD_CANDIDATES, "installer initrd", &initrd)?;
        info!("Extracted boot artifacts for {} into {}", profile.id, boot_dir);
        Ok((kernel, initrd))
    }
}

fn copy_first_match(
    mount: &MountGuard,
    iso: &Utf8Path,
    candidates: &'static [&'static str],
    expected: &'static str,
    dest: &Utf8Path,
) -> Result<(), MediaError> {
    for candidate in candidates {
        let src = mount.path().join(candidate);
        if src.is_file() {
            std::fs::copy(&src, dest)
                .with_context(|| format!("Failed to copy {src} to {dest}"))
                .map_err(MediaError::Other)?;
            debug!("Copied {} from {}", expected, src);
            return Ok(());
        }
    }
    Err(MediaError::ContentShape {
        media: iso.to_owned(),
        expected,
        candidates,
    })
}

impl MediaSource for Downloader<'_> {
    fn ensure_media(&mut self, distribution: Distribution) -> Result<MediaPaths, MediaError> {
        let profile = distribution.profile();
        let iso = self.config.media_dir().join(profile.media_filename);

        if iso.exists() {
            info!("Media for {} already cached at {}", profile.id, iso);
        } else {
            info!("Fetching media for {} from {}", profile.id, profile.media_url);
            self.download(profile.media_url, &iso)?;
        }

        let boot_dir = self.config.boot_dir(profile.id);
        let (kernel, initrd) = self.extract_boot_artifacts(&profile, &iso, &boot_dir)?;
        Ok(MediaPaths { iso, kernel, initrd })
    }
}

/// A read-only loop mount of an ISO, released when the guard drops.
struct MountGuard {
    // Kept for the mountpoint lifetime; removed after unmount on drop.
    _dir: tempfile::TempDir,
    mountpoint: Utf8PathBuf,
    mounted: bool,
}

impl MountGuard {
    fn mount_readonly(iso: &Utf8Path) -> Result<Self, MediaError> {
        let dir = tempfile::Builder::new()
            .prefix("vmforge-media-")
            .tempdir()
            .context("creating mountpoint")
            .map_err(MediaError::Other)?;
        let mountpoint = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|p| MediaError::Other(color_eyre::eyre::eyre!("Non-UTF-8 mountpoint {p:?}")))?;
        Command::new("mount")
            .args(["-o", "loop,ro"])
            .arg(iso.as_std_path())
            .arg(&mountpoint)
            .run()
            .map_err(|source| MediaError::Mount {
                media: iso.to_owned(),
                source,
            })?;
        debug!("Mounted {} at {}", iso, mountpoint);
        Ok(Self {
            _dir: dir,
            mountpoint,
            mounted: true,
        })
    }

    fn path(&self) -> &Utf8Path {
        &self.mountpoint
    }

    fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        if let Err(e) = Command::new("umount").arg(&self.mountpoint).run() {
            warn!("Failed to unmount {}: {e}", self.mountpoint);
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        self.unmount();
    }
}
