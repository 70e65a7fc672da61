//! Integration tests for vmforge
//!
//! Drives the built binary. Set VMFORGE_PATH to the binary under test;
//! tests that need a working libvirt stack skip themselves when the host
//! has none.

use std::process::Output;

use camino::Utf8Path;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use xshell::{cmd, Shell};

/// Get the path to the vmforge binary, checking VMFORGE_PATH env var first,
/// then falling back to "vmforge"
fn get_vmforge_command() -> Result<String> {
    if let Ok(path) = std::env::var("VMFORGE_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vmforge", "target/release/vmforge"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VMFORGE_PATH={path} to run using this binary"
        ));
    }
    Ok("vmforge".to_owned())
}

/// Whether this host has a usable libvirt stack for end-to-end tests.
fn host_has_libvirt() -> bool {
    let Ok(sh) = Shell::new() else { return false };
    cmd!(sh, "virsh --version").quiet().ignore_stderr().read().is_ok()
        && cmd!(sh, "virt-install --version").quiet().ignore_stderr().read().is_ok()
}

/// Captured output from a command with decoded stdout/stderr strings
struct CapturedOutput {
    output: Output,
    stdout: String,
    stderr: String,
}

impl CapturedOutput {
    fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    fn success(&self) -> bool {
        self.output.status.success()
    }
}

/// Run the vmforge command, capturing output
fn run_vmforge(args: &[&str]) -> Result<CapturedOutput> {
    let bin = get_vmforge_command()?;
    let output = std::process::Command::new(&bin).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

fn test_help_lists_subcommands() -> Result<()> {
    let out = run_vmforge(&["--help"])?;
    if !out.success() {
        return Err(eyre!("--help failed: {}", out.stderr));
    }
    for needle in ["batch", "provision"] {
        if !out.stdout.contains(needle) {
            return Err(eyre!("--help output does not mention {needle:?}"));
        }
    }
    Ok(())
}

fn test_validate_rejects_out_of_range_ram() -> Result<()> {
    let out = run_vmforge(&[
        "provision",
        "fedora-42",
        "web-01",
        "64",
        "2",
        "20",
        "UTC",
        "password123",
        "password456",
        "--validate",
    ])?;
    if out.success() {
        return Err(eyre!("expected validation failure for 64 MiB RAM"));
    }
    if !out.stderr.contains("RAM") {
        return Err(eyre!("diagnostic does not name the field: {}", out.stderr));
    }
    Ok(())
}

fn test_validate_rejects_malformed_hostname() -> Result<()> {
    let out = run_vmforge(&[
        "provision",
        "centos-stream-9",
        "bad..hostname",
        "2048",
        "2",
        "20",
        "UTC",
        "password123",
        "password456",
        "--validate",
    ])?;
    if out.success() {
        return Err(eyre!("expected validation failure for doubled dot"));
    }
    Ok(())
}

fn test_validate_rejects_short_password() -> Result<()> {
    let out = run_vmforge(&[
        "provision",
        "almalinux-9",
        "web-01",
        "2048",
        "2",
        "20",
        "UTC",
        "short",
        "password456",
        "--validate",
    ])?;
    if out.success() {
        return Err(eyre!("expected validation failure for short password"));
    }
    Ok(())
}

fn test_validate_accepts_clean_spec() -> Result<()> {
    if !host_has_libvirt() {
        println!("No libvirt stack on this host, skipping");
        return Ok(());
    }
    let state = tempfile::tempdir()?;
    let state = state
        .path()
        .to_str()
        .ok_or_else(|| eyre!("non-UTF-8 tempdir"))?
        .to_owned();
    let out = run_vmforge(&[
        "provision",
        "fedora-42",
        "itest-validate-vm",
        "2048",
        "2",
        "20",
        "UTC",
        "password123",
        "password456",
        "--validate",
        "--state-dir",
        &state,
    ])?;
    if !out.success() {
        return Err(eyre!("expected clean validation, got: {}", out.stderr));
    }
    Ok(())
}

fn main() {
    // The binary under test drives Linux-only tooling
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = [
        ("test_help_lists_subcommands", test_help_lists_subcommands as fn() -> Result<()>),
        ("test_validate_rejects_out_of_range_ram", test_validate_rejects_out_of_range_ram),
        ("test_validate_rejects_malformed_hostname", test_validate_rejects_malformed_hostname),
        ("test_validate_rejects_short_password", test_validate_rejects_short_password),
        ("test_validate_accepts_clean_spec", test_validate_accepts_clean_spec),
    ]
    .into_iter()
    .map(|(name, f)| Trial::test(name, move || f().map_err(|e| format!("{e:?}").into())))
    .collect();

    libtest_mimic::run(&args, tests).exit();
}
