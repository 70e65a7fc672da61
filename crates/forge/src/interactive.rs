//! Interactive batch assembly
//!
//! Prompts the operator for VM count and per-VM fields, validating each
//! answer before it is accepted. Nothing here has side effects; the result
//! is a list of validated specs plus an explicit confirmation.

use std::io::{BufRead, Write};

use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use strum::IntoEnumIterator;

use crate::distro::Distribution;
use crate::spec::{self, VmSpec, DISK_GIB_RANGE, RAM_MIB_RANGE, VCPUS_RANGE};

const MAX_BATCH_SIZE: usize = 10;

/// The operator declined or ended input; a setup-phase exit, not a failure
/// of any VM.
#[derive(Debug, thiserror::Error)]
#[error("cancelled by operator")]
pub struct Cancelled;

/// Collect a confirmed batch of specs from the operator.
pub fn collect_specs(input: &mut dyn BufRead, output: &mut dyn Write) -> Result<Vec<VmSpec>> {
    let count = prompt_parsed(input, output, &format!("Number of VMs (1-{MAX_BATCH_SIZE})"), |s| {
        let n: usize = s.parse().map_err(|_| "not a number".to_string())?;
        if (1..=MAX_BATCH_SIZE).contains(&n) {
            Ok(n)
        } else {
            Err(format!("must be between 1 and {MAX_BATCH_SIZE}"))
        }
    })?;

    let mut specs = Vec::with_capacity(count);
    for i in 1..=count {
        writeln!(output, "\n--- VM {i} of {count} ---")?;
        specs.push(collect_one(input, output)?);
    }

    writeln!(output)?;
    print_summary(output, &specs)?;
    let confirmed = prompt_parsed(input, output, "Proceed with installation? (yes/no)", |s| {
        match s.to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(true),
            "n" | "no" => Ok(false),
            _ => Err("answer yes or no".to_string()),
        }
    })?;
    if !confirmed {
        return Err(Cancelled.into());
    }
    Ok(specs)
}

fn collect_one(input: &mut dyn BufRead, output: &mut dyn Write) -> Result<VmSpec> {
    let choices: Vec<Distribution> = Distribution::iter().collect();
    for (i, d) in choices.iter().enumerate() {
        writeln!(output, "  {}) {}", i + 1, d)?;
    }
    let distribution = prompt_parsed(input, output, "Distribution", |s| {
        // Accept either the menu number or the identifier itself.
        if let Ok(n) = s.parse::<usize>() {
            return choices
                .get(n.wrapping_sub(1))
                .copied()
                .ok_or_else(|| "no such choice".to_string());
        }
        s.parse::<Distribution>()
            .map_err(|_| "unknown distribution".to_string())
    })?;

    let hostname = prompt_parsed(input, output, "Hostname", |s| {
        spec::validate_hostname(s)
            .map(|()| s.to_string())
            .map_err(|e| e.to_string())
    })?;
    let ram_mib = prompt_bounded(input, output, "RAM in MiB", RAM_MIB_RANGE)?;
    let vcpus = prompt_bounded(input, output, "vCPUs", VCPUS_RANGE)?;
    let disk_gib = prompt_bounded(input, output, "Disk size in GiB", DISK_GIB_RANGE)?;
    let timezone = prompt_parsed(input, output, "Timezone (e.g. Europe/Berlin)", |s| {
        spec::validate_timezone(s)
            .map(|()| s.to_string())
            .map_err(|e| e.to_string())
    })?;
    let user_password = prompt_password(input, output, "User password")?;
    let root_password = prompt_password(input, output, "Root password")?;

    let vm = VmSpec {
        distribution,
        hostname,
        ram_mib,
        vcpus,
        disk_gib,
        timezone,
        user_password,
        root_password,
    };
    // Field prompts validated individually; this is the acceptance gate.
    vm.validate().map_err(|e| eyre!(e))?;
    Ok(vm)
}

fn prompt_bounded(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    label: &str,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32> {
    let prompt = format!("{label} ({}-{})", range.start(), range.end());
    prompt_parsed(input, output, &prompt, |s| {
        let n: u32 = s.parse().map_err(|_| "not a number".to_string())?;
        if range.contains(&n) {
            Ok(n)
        } else {
            Err(format!("must be between {} and {}", range.start(), range.end()))
        }
    })
}

fn prompt_password(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    label: &str,
) -> Result<String> {
    prompt_parsed(input, output, label, |s| {
        if s.len() >= spec::MIN_PASSWORD_LEN {
            Ok(s.to_string())
        } else {
            Err(format!("must be at least {} characters", spec::MIN_PASSWORD_LEN))
        }
    })
}

/// Prompt until `parse` accepts the answer. EOF means the operator is gone;
/// that cancels setup.
fn prompt_parsed<T>(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    label: &str,
    mut parse: impl FnMut(&str) -> Result<T, String>,
) -> Result<T> {
    loop {
        write!(output, "{label}: ")?;
        output.flush()?;
        let mut line = String::new();
        let n = input.read_line(&mut line).context("reading input")?;
        if n == 0 {
            return Err(Cancelled.into());
        }
        match parse(line.trim()) {
            Ok(v) => return Ok(v),
            Err(reason) => writeln!(output, "  invalid: {reason}")?,
        }
    }
}

fn print_summary(output: &mut dyn Write, specs: &[VmSpec]) -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "HOSTNAME",
        "DISTRIBUTION",
        "RAM (MiB)",
        "VCPUS",
        "DISK (GiB)",
        "TIMEZONE",
    ]);
    for s in specs {
        table.add_row(vec![
            s.hostname.clone(),
            s.distribution.to_string(),
            s.ram_mib.to_string(),
            s.vcpus.to_string(),
            s.disk_gib.to_string(),
            s.timezone.clone(),
        ]);
    }
    writeln!(output, "{table}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &str) -> Result<Vec<VmSpec>> {
        let mut reader = Cursor::new(input.to_string());
        let mut out = Vec::new();
        collect_specs(&mut reader, &mut out)
    }

    const ONE_VM: &str = "1\n1\nweb-01\n2048\n2\n20\nUTC\npassword123\npassword456\nyes\n";

    #[test]
    fn test_collects_one_valid_spec() {
        let specs = collect(ONE_VM).unwrap();
        assert_eq!(specs.len(), 1);
        let s = &specs[0];
        assert_eq!(s.hostname, "web-01");
        assert_eq!(s.distribution, Distribution::Fedora42);
        assert_eq!(s.ram_mib, 2048);
        assert_eq!(s.timezone, "UTC");
    }

    #[test]
    fn test_reprompts_until_valid() {
        // Bad count, bad hostname, and bad RAM answers precede the good ones.
        let input = "0\n1\n1\nbad..name\nweb-01\n64\n2048\n2\n20\nUTC\npassword123\npassword456\nyes\n";
        let specs = collect(input).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].ram_mib, 2048);
    }

    #[test]
    fn test_distribution_by_name() {
        let input = "1\nalmalinux-9\nweb-01\n2048\n2\n20\nUTC\npassword123\npassword456\nyes\n";
        let specs = collect(input).unwrap();
        assert_eq!(specs[0].distribution, Distribution::AlmaLinux9);
    }

    #[test]
    fn test_declined_confirmation_cancels() {
        let input = "1\n1\nweb-01\n2048\n2\n20\nUTC\npassword123\npassword456\nno\n";
        let err = collect(input).unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn test_eof_cancels() {
        let err = collect("1\n1\nweb-01\n").unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
