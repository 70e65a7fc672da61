//! Supported distributions and their static installation profiles
//!
//! The set of supported distributions is closed and known at build time;
//! everything the pipeline needs to install one (media URL, local cache
//! name, libvirt os-variant, kickstart template) hangs off [`Distribution`].

use clap::ValueEnum;

/// A supported guest distribution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    ValueEnum,
)]
pub enum Distribution {
    /// Fedora Server 42
    #[strum(serialize = "fedora-42")]
    #[serde(rename = "fedora-42")]
    #[clap(name = "fedora-42")]
    Fedora42,
    /// CentOS Stream 9
    #[strum(serialize = "centos-stream-9")]
    #[serde(rename = "centos-stream-9")]
    #[clap(name = "centos-stream-9")]
    CentosStream9,
    /// AlmaLinux 9
    #[strum(serialize = "almalinux-9")]
    #[serde(rename = "almalinux-9")]
    #[clap(name = "almalinux-9")]
    AlmaLinux9,
}

/// Static installation profile for one distribution.
///
/// Immutable; looked up via [`Distribution::profile`].
#[derive(Debug, Clone, Copy)]
pub struct DistributionProfile {
    /// Stable identifier, also the media cache / boot directory key.
    pub id: &'static str,
    /// Where the installation ISO is downloaded from.
    pub media_url: &'static str,
    /// File name of the ISO inside the media cache directory.
    pub media_filename: &'static str,
    /// osinfo identifier passed to virt-install for OS-specific defaults.
    pub os_variant: &'static str,
    /// Kickstart template file name inside the template directory.
    pub template: &'static str,
}

impl Distribution {
    pub const fn profile(self) -> DistributionProfile {
        match self {
            Distribution::Fedora42 => DistributionProfile {
                id: "fedora-42",
                media_url: "https://download.fedoraproject.org/pub/fedora/linux/releases/42/Server/x86_64/iso/Fedora-Server-dvd-x86_64-42-1.1.iso",
                media_filename: "Fedora-Server-dvd-x86_64-42-1.1.iso",
                os_variant: "fedora42",
                template: "fedora-42.ks.tpl",
            },
            Distribution::CentosStream9 => DistributionProfile {
                id: "centos-stream-9",
                media_url: "https://mirror.stream.centos.org/9-stream/BaseOS/x86_64/iso/CentOS-Stream-9-latest-x86_64-dvd1.iso",
                media_filename: "CentOS-Stream-9-latest-x86_64-dvd1.iso",
                os_variant: "centos-stream9",
                template: "centos-stream-9.ks.tpl",
            },
            Distribution::AlmaLinux9 => DistributionProfile {
                id: "almalinux-9",
                media_url: "https://repo.almalinux.org/almalinux/9/isos/x86_64/AlmaLinux-9-latest-x86_64-dvd.iso",
                media_filename: "AlmaLinux-9-latest-x86_64-dvd.iso",
                os_variant: "almalinux9",
                template: "almalinux-9.ks.tpl",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_profile_ids_match_display() {
        for d in Distribution::iter() {
            assert_eq!(d.to_string(), d.profile().id);
        }
    }

    #[test]
    fn test_roundtrip() {
        for d in Distribution::iter() {
            let s = d.to_string();
            let parsed = <Distribution as FromStr>::from_str(&s).unwrap();
            assert_eq!(parsed, d);
        }
    }

    #[test]
    fn test_parse_invalid_distribution() {
        assert!(<Distribution as FromStr>::from_str("windows-11").is_err());
    }

    #[test]
    fn test_profiles_are_distinct() {
        let mut ids: Vec<_> = Distribution::iter().map(|d| d.profile().id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), Distribution::iter().count());
    }
}
