//! Kickstart rendering from distribution templates
//!
//! Templates carry a fixed set of `@NAME@` placeholders. Substitution is a
//! single pass over the template text: substituted values are emitted
//! verbatim and never rescanned, so a password containing a literal
//! placeholder token cannot alter which placeholder is matched elsewhere.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::distro::DistributionProfile;

/// The placeholders every template must contain.
pub const PLACEHOLDERS: [&str; 5] = [
    "HOSTNAME",
    "USERNAME",
    "USER_PASSWORD_HASH",
    "ROOT_PASSWORD_HASH",
    "TIMEZONE",
];

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template {0} not found")]
    TemplateNotFound(Utf8PathBuf),
    #[error("template {template} is missing required placeholder @{placeholder}@")]
    MissingPlaceholder {
        template: Utf8PathBuf,
        placeholder: &'static str,
    },
    #[error("failed to write rendered config {0}")]
    Write(Utf8PathBuf, #[source] std::io::Error),
}

/// Values substituted into a template. Hashes, not cleartext secrets.
#[derive(Debug)]
pub struct RenderVars<'a> {
    pub hostname: &'a str,
    pub username: &'a str,
    pub user_password_hash: &'a str,
    pub root_password_hash: &'a str,
    pub timezone: &'a str,
}

impl RenderVars<'_> {
    fn lookup(&self, placeholder: &str) -> Option<&str> {
        match placeholder {
            "HOSTNAME" => Some(self.hostname),
            "USERNAME" => Some(self.username),
            "USER_PASSWORD_HASH" => Some(self.user_password_hash),
            "ROOT_PASSWORD_HASH" => Some(self.root_password_hash),
            "TIMEZONE" => Some(self.timezone),
            _ => None,
        }
    }
}

/// Render `template` into a per-VM kickstart under `out_dir`.
///
/// The caller owns the returned file: deleted after a successful install,
/// retained for debugging when the install fails.
pub fn render_to_file(
    profile: &DistributionProfile,
    template_dir: &Utf8Path,
    vars: &RenderVars<'_>,
    out_dir: &Utf8Path,
) -> Result<Utf8PathBuf, RenderError> {
    let template_path = template_dir.join(profile.template);
    let template = std::fs::read_to_string(&template_path)
        .map_err(|_| RenderError::TemplateNotFound(template_path.clone()))?;

    let rendered = render(&template, vars).map_err(|placeholder| {
        RenderError::MissingPlaceholder {
            template: template_path.clone(),
            placeholder,
        }
    })?;

    let out_path = out_dir.join(format!("{}.ks.cfg", vars.hostname));
    std::fs::write(&out_path, rendered).map_err(|e| RenderError::Write(out_path.clone(), e))?;
    debug!("Rendered {} from {}", out_path, template_path);
    Ok(out_path)
}

/// Substitute all placeholders in one pass. Returns the name of the first
/// required placeholder the template turned out not to contain.
fn render(template: &str, vars: &RenderVars<'_>) -> Result<String, &'static str> {
    let mut out = String::with_capacity(template.len());
    let mut seen = [false; PLACEHOLDERS.len()];
    let mut rest = template;

    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        // A placeholder is @NAME@ with NAME from the fixed set; any other
        // use of '@' is literal template text.
        let matched = PLACEHOLDERS.iter().enumerate().find_map(|(i, name)| {
            let token_len = name.len() + 2;
            let token = tail.get(..token_len)?;
            (token.as_bytes()[token_len - 1] == b'@' && &token[1..token_len - 1] == *name)
                .then_some((i, *name, token_len))
        });
        match matched {
            Some((i, name, token_len)) => {
                seen[i] = true;
                // Value goes out verbatim and is never rescanned.
                out.push_str(vars.lookup(name).unwrap_or_default());
                rest = &tail[token_len..];
            }
            None => {
                out.push('@');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);

    match seen.iter().position(|s| !s) {
        Some(i) => Err(PLACEHOLDERS[i]),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const TEMPLATE: &str = indoc! {"
        network --hostname=@HOSTNAME@
        timezone @TIMEZONE@ --utc
        rootpw --iscrypted @ROOT_PASSWORD_HASH@
        user --name=@USERNAME@ --iscrypted --password=@USER_PASSWORD_HASH@
    "};

    fn vars<'a>() -> RenderVars<'a> {
        RenderVars {
            hostname: "web-01",
            username: "admin",
            user_password_hash: "$6$salt$userhash",
            root_password_hash: "$6$salt$roothash",
            timezone: "Europe/Berlin",
        }
    }

    #[test]
    fn test_render_substitutes_all_placeholders() {
        let out = render(TEMPLATE, &vars()).unwrap();
        assert!(out.contains("--hostname=web-01"));
        assert!(out.contains("timezone Europe/Berlin --utc"));
        assert!(out.contains("rootpw --iscrypted $6$salt$roothash"));
        assert!(out.contains("--name=admin"));
        assert!(out.contains("--password=$6$salt$userhash"));
        assert!(!out.contains('@'));
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render(TEMPLATE, &vars()).unwrap(), render(TEMPLATE, &vars()).unwrap());
    }

    #[test]
    fn test_missing_placeholder_fails_fast() {
        let incomplete = "network --hostname=@HOSTNAME@\ntimezone @TIMEZONE@\n";
        assert_eq!(render(incomplete, &vars()), Err("USERNAME"));
    }

    #[test]
    fn test_value_containing_placeholder_token_is_literal() {
        let mut v = vars();
        // A hash that contains a placeholder token must not be expanded,
        // and must not disturb the placeholders that follow it.
        v.root_password_hash = "$6$@USERNAME@$x";
        let out = render(TEMPLATE, &v).unwrap();
        assert!(out.contains("rootpw --iscrypted $6$@USERNAME@$x"));
        assert!(out.contains("--name=admin"));
        assert!(out.contains("--password=$6$salt$userhash"));
    }

    #[test]
    fn test_literal_at_signs_pass_through() {
        let template = format!("# mail root@example.com\n{TEMPLATE}");
        let out = render(&template, &vars()).unwrap();
        assert!(out.contains("root@example.com"));
    }

    #[test]
    fn test_hostname_variation_changes_only_hostname_fields() {
        let a = render(TEMPLATE, &vars()).unwrap();
        let mut v = vars();
        v.hostname = "web-02";
        let b = render(TEMPLATE, &v).unwrap();
        let diff: Vec<(&str, &str)> = a
            .lines()
            .zip(b.lines())
            .filter(|(la, lb)| la != lb)
            .collect();
        assert_eq!(diff.len(), 1);
        assert!(diff[0].0.contains("web-01") && diff[0].1.contains("web-02"));
    }

    #[test]
    fn test_render_to_file_reports_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let profile = crate::distro::Distribution::Fedora42.profile();
        let err = render_to_file(
            &profile,
            camino::Utf8Path::from_path(dir.path()).unwrap(),
            &vars(),
            camino::Utf8Path::from_path(out.path()).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::TemplateNotFound(_)));
    }
}
