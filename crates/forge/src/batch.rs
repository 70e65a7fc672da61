//! Batch orchestration
//!
//! Owns the end-to-end run: media pre-fetch (deduplicated per
//! distribution), strictly sequential per-VM pipelines, and the fail-soft
//! batch report. One VM's failure is recorded and the loop moves on; only
//! operator interrupt and setup-phase errors terminate the run early.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use tracing::{error, info};

use crate::config::RunConfig;
use crate::distro::Distribution;
use crate::httpd::DeliveryEndpoint;
use crate::hypervisor::Virsh;
use crate::media::{MediaPaths, MediaSource};
use crate::monitor::{await_install, InstallError};
use crate::provision::Provisioner;
use crate::render::{render_to_file, RenderVars};
use crate::spec::VmSpec;
use crate::utils::{check_interrupted, Interrupted};

/// Account created by every kickstart alongside root.
const DEFAULT_USERNAME: &str = "admin";

/// Which pipeline stage a VM failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Render,
    Endpoint,
    Provision,
    Monitor,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Render => "render",
            Phase::Endpoint => "endpoint",
            Phase::Provision => "provision",
            Phase::Monitor => "monitor",
        };
        write!(f, "{s}")
    }
}

/// Why one VM's pipeline stopped.
#[derive(Debug)]
pub struct VmFailure {
    pub phase: Phase,
    pub reason: String,
    /// Rendered kickstart left in place for debugging, when one exists.
    pub retained_config: Option<Utf8PathBuf>,
}

/// Terminal outcome of one VM's pipeline.
#[derive(Debug)]
pub enum VmRun {
    Ok(Duration),
    Failed(VmFailure),
}

/// One recorded result; appended as each VM completes, never edited.
#[derive(Debug)]
pub struct VmResult {
    pub hostname: String,
    pub distribution: Distribution,
    pub outcome: VmRun,
}

/// The completed state of one orchestrator invocation.
#[derive(Debug, Default)]
pub struct BatchRun {
    pub results: Vec<VmResult>,
}

impl BatchRun {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, VmRun::Ok(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// One VM's provisioning pipeline. The orchestrator drives this through a
/// trait so batch semantics are testable without a hypervisor.
pub trait VmPipeline {
    fn run(&mut self, spec: &VmSpec, media: &MediaPaths) -> Result<VmRun, Interrupted>;
}

/// Run a full batch: pre-fetch media for every distinct distribution, then
/// pipeline each spec in its original order.
pub fn run_batch(
    specs: &[VmSpec],
    media: &mut dyn MediaSource,
    pipeline: &mut dyn VmPipeline,
    interrupted: &AtomicBool,
) -> Result<BatchRun> {
    let required: BTreeSet<Distribution> = specs.iter().map(|s| s.distribution).collect();
    info!(
        "Batch of {} VM(s) across {} distribution(s)",
        specs.len(),
        required.len()
    );

    // Bulk pre-fetch: a failed download aborts before any VM work starts.
    let mut prefetched: BTreeMap<Distribution, MediaPaths> = BTreeMap::new();
    for distribution in required {
        check_interrupted(interrupted)?;
        let paths = media
            .ensure_media(distribution)
            .with_context(|| format!("Failed to prepare media for {distribution}"))?;
        prefetched.insert(distribution, paths);
    }

    let mut run = BatchRun::default();
    for spec in specs {
        check_interrupted(interrupted)?;
        let paths = &prefetched[&spec.distribution];
        let outcome = pipeline.run(spec, paths)?;
        match &outcome {
            VmRun::Ok(duration) => {
                info!("{}: installed in {}s", spec.hostname, duration.as_secs())
            }
            VmRun::Failed(failure) => {
                error!(
                    "{}: {} phase failed: {}",
                    spec.hostname, failure.phase, failure.reason
                );
            }
        }
        run.results.push(VmResult {
            hostname: spec.hostname.clone(),
            distribution: spec.distribution,
            outcome,
        });
    }
    Ok(run)
}

/// The real per-VM pipeline: render, confirm the endpoint, provision,
/// monitor. Owns converting component failures into recorded phases.
pub struct InstallPipeline<'a> {
    config: &'a RunConfig,
    endpoint: &'a DeliveryEndpoint,
    provisioner: Provisioner<'a>,
    interrupted: &'a AtomicBool,
}

impl<'a> InstallPipeline<'a> {
    pub fn new(
        config: &'a RunConfig,
        endpoint: &'a DeliveryEndpoint,
        interrupted: &'a AtomicBool,
    ) -> Self {
        Self {
            config,
            endpoint,
            provisioner: Provisioner::new(config),
            interrupted,
        }
    }
}

impl VmPipeline for InstallPipeline<'_> {
    fn run(&mut self, spec: &VmSpec, media: &MediaPaths) -> Result<VmRun, Interrupted> {
        let fail = |phase, reason: String, retained| {
            Ok(VmRun::Failed(VmFailure {
                phase,
                reason,
                retained_config: retained,
            }))
        };

        // Render (credential hashing feeds the template variables).
        let credentials = match self.provisioner.hash_credentials(spec) {
            Ok(c) => c,
            Err(e) => return fail(Phase::Render, e.to_string(), None),
        };
        let vars = RenderVars {
            hostname: &spec.hostname,
            username: DEFAULT_USERNAME,
            user_password_hash: &credentials.user_password_hash,
            root_password_hash: &credentials.root_password_hash,
            timezone: &spec.timezone,
        };
        let profile = spec.distribution.profile();
        let ks_path = match render_to_file(
            &profile,
            &self.config.template_dir,
            &vars,
            &self.config.configs_dir(),
        ) {
            Ok(p) => p,
            Err(e) => return fail(Phase::Render, e.to_string(), None),
        };
        let ks_name = ks_path.file_name().unwrap_or_default().to_string();

        check_interrupted(self.interrupted)?;

        // The endpoint is batch-scoped; re-confirm it still answers before
        // the installer is pointed at it.
        if let Err(e) = self.endpoint.verify() {
            return fail(Phase::Endpoint, e.to_string(), Some(ks_path));
        }

        check_interrupted(self.interrupted)?;

        let handle = match self.provisioner.provision(spec, media, self.endpoint, &ks_name) {
            Ok(h) => h,
            Err(e) => return fail(Phase::Provision, e.to_string(), Some(ks_path)),
        };
        info!("Created domain {} with disk {}", handle.domain, handle.disk);

        let mut observer = Virsh::new(self.config.connect.clone());
        match await_install(
            &mut observer,
            &handle.domain,
            &self.config.monitor,
            self.interrupted,
        ) {
            Ok(duration) => {
                // Success: the kickstart has served its purpose.
                if let Err(e) = std::fs::remove_file(&ks_path) {
                    tracing::warn!("Failed to remove {ks_path}: {e}");
                }
                Ok(VmRun::Ok(duration))
            }
            Err(InstallError::Interrupted) => Err(Interrupted),
            // Failure: deliberately retain the kickstart for debugging.
            Err(e) => fail(Phase::Monitor, e.to_string(), Some(ks_path)),
        }
    }
}

#[derive(Serialize)]
struct ReportRow<'a> {
    hostname: &'a str,
    distribution: String,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retained_config: Option<&'a str>,
}

#[derive(Serialize)]
struct Report<'a> {
    total: usize,
    succeeded: usize,
    failed: usize,
    vms: Vec<ReportRow<'a>>,
}

fn report_rows(run: &BatchRun) -> Vec<ReportRow<'_>> {
    run.results
        .iter()
        .map(|r| match &r.outcome {
            VmRun::Ok(duration) => ReportRow {
                hostname: &r.hostname,
                distribution: r.distribution.to_string(),
                result: "success",
                phase: None,
                detail: None,
                duration_secs: Some(duration.as_secs()),
                retained_config: None,
            },
            VmRun::Failed(failure) => ReportRow {
                hostname: &r.hostname,
                distribution: r.distribution.to_string(),
                result: "failed",
                phase: Some(failure.phase),
                detail: Some(&failure.reason),
                duration_secs: None,
                retained_config: failure.retained_config.as_deref().map(|p| p.as_str()),
            },
        })
        .collect()
}

/// Print the end-of-batch report.
pub fn print_report(run: &BatchRun, json: bool) -> Result<()> {
    if json {
        let report = Report {
            total: run.results.len(),
            succeeded: run.succeeded(),
            failed: run.failed(),
            vms: report_rows(run),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["HOSTNAME", "DISTRIBUTION", "RESULT", "PHASE", "DETAIL"]);
    for row in report_rows(run) {
        table.add_row(vec![
            row.hostname.to_string(),
            row.distribution,
            match row.duration_secs {
                Some(secs) => format!("success ({secs}s)"),
                None => row.result.to_string(),
            },
            row.phase.map(|p| p.to_string()).unwrap_or_default(),
            row.detail.unwrap_or_default().to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "Batch complete: {} total, {} succeeded, {} failed",
        run.results.len(),
        run.succeeded(),
        run.failed()
    );
    for result in &run.results {
        if let VmRun::Failed(failure) = &result.outcome {
            if let Some(path) = &failure.retained_config {
                println!(
                    "  {}: kickstart retained for debugging at {}",
                    result.hostname, path
                );
            }
        }
    }
    Ok(())
}
