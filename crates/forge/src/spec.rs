//! Declarative VM specifications and their validation
//!
//! A [`VmSpec`] is validated before it is accepted into a batch and never
//! mutated afterwards. The provisioner re-validates at the point of use, so
//! the bounds live here as the single source of truth.

use crate::distro::Distribution;

pub const RAM_MIB_RANGE: std::ops::RangeInclusive<u32> = 1024..=16384;
pub const VCPUS_RANGE: std::ops::RangeInclusive<u32> = 1..=16;
pub const DISK_GIB_RANGE: std::ops::RangeInclusive<u32> = 10..=500;
pub const MIN_PASSWORD_LEN: usize = 8;

/// Where the system timezone database lives, when the host has one.
const ZONEINFO_DIR: &str = "/usr/share/zoneinfo";

/// A spec field failed validation. Caught before any side effect.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} {value} outside supported range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid hostname {hostname:?}: {reason}")]
    InvalidHostname {
        hostname: String,
        reason: &'static str,
    },
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("{which} password shorter than {MIN_PASSWORD_LEN} characters")]
    PasswordTooShort { which: &'static str },
}

/// One VM's declarative intent.
///
/// Constructed by operator input (interactive or positional CLI arguments),
/// consumed once by the provisioning pipeline.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub distribution: Distribution,
    pub hostname: String,
    pub ram_mib: u32,
    pub vcpus: u32,
    pub disk_gib: u32,
    pub timezone: String,
    pub user_password: String,
    pub root_password: String,
}

impl VmSpec {
    /// Validate every field. An invalid spec must never be stored in a batch.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_hostname(&self.hostname)?;
        check_range("RAM MiB", self.ram_mib, RAM_MIB_RANGE)?;
        check_range("vCPU count", self.vcpus, VCPUS_RANGE)?;
        check_range("disk GiB", self.disk_gib, DISK_GIB_RANGE)?;
        validate_timezone(&self.timezone)?;
        if self.user_password.len() < MIN_PASSWORD_LEN {
            return Err(ValidationError::PasswordTooShort { which: "user" });
        }
        if self.root_password.len() < MIN_PASSWORD_LEN {
            return Err(ValidationError::PasswordTooShort { which: "root" });
        }
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<(), ValidationError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

/// Validate a host name: alphanumeric labels with hyphens, joined by dots,
/// no leading/trailing/doubled separators.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    let err = |reason| {
        Err(ValidationError::InvalidHostname {
            hostname: hostname.to_string(),
            reason,
        })
    };
    if hostname.is_empty() {
        return err("empty");
    }
    if hostname.len() > 253 {
        return err("longer than 253 characters");
    }
    for label in hostname.split('.') {
        if label.is_empty() {
            return err("empty label (leading, trailing, or doubled dot)");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return err("label starts or ends with a hyphen");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return err("label contains characters other than alphanumerics and hyphens");
        }
    }
    Ok(())
}

/// Validate a timezone name against the system timezone database when one is
/// present, falling back to a shape check on hosts without zoneinfo.
pub fn validate_timezone(timezone: &str) -> Result<(), ValidationError> {
    let err = || Err(ValidationError::UnknownTimezone(timezone.to_string()));
    if timezone.is_empty() || timezone.starts_with('/') || timezone.contains("..") {
        return err();
    }
    if !timezone
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'))
    {
        return err();
    }
    let zoneinfo = std::path::Path::new(ZONEINFO_DIR);
    if zoneinfo.is_dir() && !zoneinfo.join(timezone).is_file() {
        return err();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_spec() -> VmSpec {
        VmSpec {
            distribution: Distribution::Fedora42,
            hostname: "web-01.example.com".to_string(),
            ram_mib: 2048,
            vcpus: 2,
            disk_gib: 20,
            timezone: "UTC".to_string(),
            user_password: "hunter2hunter2".to_string(),
            root_password: "correct-horse-battery".to_string(),
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert_eq!(valid_spec().validate(), Ok(()));
    }

    #[test]
    fn test_ram_out_of_bounds() {
        let mut spec = valid_spec();
        spec.ram_mib = 512;
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::OutOfRange { field: "RAM MiB", .. })
        ));
        spec.ram_mib = 32768;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_vcpus_out_of_bounds() {
        let mut spec = valid_spec();
        spec.vcpus = 0;
        assert!(spec.validate().is_err());
        spec.vcpus = 64;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_disk_out_of_bounds() {
        let mut spec = valid_spec();
        spec.disk_gib = 5;
        assert!(spec.validate().is_err());
        spec.disk_gib = 1000;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_short_password_rejected() {
        let mut spec = valid_spec();
        spec.user_password = "short".to_string();
        assert_eq!(
            spec.validate(),
            Err(ValidationError::PasswordTooShort { which: "user" })
        );
        let mut spec = valid_spec();
        spec.root_password = "short".to_string();
        assert_eq!(
            spec.validate(),
            Err(ValidationError::PasswordTooShort { which: "root" })
        );
    }

    #[test]
    fn test_hostname_rules() {
        assert!(validate_hostname("web01").is_ok());
        assert!(validate_hostname("web-01.example.com").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname(".web").is_err());
        assert!(validate_hostname("web.").is_err());
        assert!(validate_hostname("web..example").is_err());
        assert!(validate_hostname("-web").is_err());
        assert!(validate_hostname("web-").is_err());
        assert!(validate_hostname("web_01").is_err());
        assert!(validate_hostname("web 01").is_err());
    }

    #[test]
    fn test_timezone_shape_rules() {
        assert!(validate_timezone("").is_err());
        assert!(validate_timezone("/etc/passwd").is_err());
        assert!(validate_timezone("../../etc").is_err());
        assert!(validate_timezone("Europe Berlin").is_err());
    }

    #[test]
    fn test_timezone_known_names() {
        // Present in every zoneinfo install; also passes the shape check on
        // hosts without a timezone database.
        assert!(validate_timezone("UTC").is_ok());
        assert!(validate_timezone("America/New_York").is_ok());
    }
}
