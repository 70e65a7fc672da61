//! Installation monitoring
//!
//! Polls a domain's state until it reaches a terminal outcome. A clean
//! power-off is the success signal (the kickstarts end in `poweroff`);
//! everything else terminal is a distinguishable failure. While the domain
//! is running, disk I/O counters separate a slow install from one hung
//! waiting on input that will never arrive: once activity has been seen,
//! a flat counter for longer than the stuck threshold fails the install
//! without waiting out the full timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::hypervisor::{DomainObserver, DomainState};

/// Terminal failure outcomes of one monitored install.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("domain crashed during installation")]
    Crashed,
    #[error("domain disappeared during installation")]
    NotFound,
    #[error("no disk activity for {}s while still running; check that the installer could reach its kickstart", .idle.as_secs())]
    Stuck { idle: Duration },
    #[error("install still not finished after {}s; check install duration expectations", .timeout.as_secs())]
    TimedOut { timeout: Duration },
    #[error("interrupted by operator")]
    Interrupted,
}

/// Poll `domain` until it terminates, resuming it out of `paused` along the
/// way. Returns the elapsed wall-clock time on success.
pub fn await_install(
    observer: &mut dyn DomainObserver,
    domain: &str,
    config: &MonitorConfig,
    interrupted: &AtomicBool,
) -> Result<Duration, InstallError> {
    let started = Instant::now();
    let mut last_io: Option<u64> = None;
    let mut last_activity: Option<Instant> = None;

    let pb = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(200));

    debug!(
        "Monitoring install of {domain} (timeout {}s, poll {}s, stuck threshold {}s)",
        config.timeout.as_secs(),
        config.poll_interval.as_secs(),
        config.stuck_threshold.as_secs()
    );

    loop {
        if interrupted.load(Ordering::Relaxed) {
            pb.finish_and_clear();
            return Err(InstallError::Interrupted);
        }
        if started.elapsed() >= config.timeout {
            pb.finish_and_clear();
            return Err(InstallError::TimedOut {
                timeout: config.timeout,
            });
        }

        let state = match observer.state(domain) {
            Ok(state) => state,
            Err(e) => {
                // Transient query failures count against the timeout.
                warn!("Failed to query state of {domain}: {e}");
                std::thread::sleep(config.poll_interval);
                continue;
            }
        };

        pb.set_message(format!(
            "Installing {domain}: {state:?} (elapsed {}s)",
            started.elapsed().as_secs()
        ));

        match state {
            DomainState::ShutOff => {
                pb.finish_and_clear();
                info!(
                    "Install of {domain} completed in {}s",
                    started.elapsed().as_secs()
                );
                return Ok(started.elapsed());
            }
            DomainState::Crashed => {
                pb.finish_and_clear();
                return Err(InstallError::Crashed);
            }
            DomainState::NotFound => {
                pb.finish_and_clear();
                return Err(InstallError::NotFound);
            }
            DomainState::Paused => {
                info!("Domain {domain} is paused, resuming");
                if let Err(e) = observer.resume(domain) {
                    warn!("Failed to resume {domain}: {e}");
                }
            }
            DomainState::Running => {
                let io = observer.block_io_bytes(domain).unwrap_or_default();
                if let (Some(now), Some(prev)) = (io, last_io) {
                    if now != prev {
                        last_activity = Some(Instant::now());
                    }
                }
                if io.is_some() {
                    last_io = io;
                }
                if let Some(active) = last_activity {
                    let idle = active.elapsed();
                    if idle >= config.stuck_threshold {
                        pb.finish_and_clear();
                        return Err(InstallError::Stuck { idle });
                    }
                }
            }
            DomainState::Other(ref s) => {
                debug!("Domain {domain} in state {s:?}, continuing to poll");
            }
        }

        std::thread::sleep(config.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::Result;

    /// Observer scripted with a fixed sequence of states and I/O readings.
    struct ScriptedObserver {
        states: Vec<DomainState>,
        io: Vec<Option<u64>>,
        polls: usize,
        resumes: usize,
    }

    impl ScriptedObserver {
        fn new(states: Vec<DomainState>, io: Vec<Option<u64>>) -> Self {
            Self {
                states,
                io,
                polls: 0,
                resumes: 0,
            }
        }
    }

    impl DomainObserver for ScriptedObserver {
        fn state(&mut self, _domain: &str) -> Result<DomainState> {
            let i = self.polls.min(self.states.len() - 1);
            self.polls += 1;
            Ok(self.states[i].clone())
        }

        fn block_io_bytes(&mut self, _domain: &str) -> Result<Option<u64>> {
            // Indexed off the poll that just happened.
            let i = (self.polls - 1).min(self.io.len().saturating_sub(1));
            Ok(self.io.get(i).copied().flatten())
        }

        fn resume(&mut self, _domain: &str) -> Result<()> {
            self.resumes += 1;
            Ok(())
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
            stuck_threshold: Duration::from_millis(50),
        }
    }

    fn not_interrupted() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_shutoff_is_success() {
        let mut obs = ScriptedObserver::new(
            vec![
                DomainState::Running,
                DomainState::Running,
                DomainState::ShutOff,
            ],
            vec![Some(100), Some(200), None],
        );
        let r = await_install(&mut obs, "vm", &fast_config(), &not_interrupted());
        assert!(r.is_ok());
        assert_eq!(obs.polls, 3);
    }

    #[test]
    fn test_crash_fails_immediately() {
        let mut obs = ScriptedObserver::new(
            vec![DomainState::Running, DomainState::Crashed],
            vec![Some(100)],
        );
        let r = await_install(&mut obs, "vm", &fast_config(), &not_interrupted());
        assert!(matches!(r, Err(InstallError::Crashed)));
        assert_eq!(obs.polls, 2);
    }

    #[test]
    fn test_missing_domain_fails_immediately() {
        let mut obs = ScriptedObserver::new(vec![DomainState::NotFound], vec![]);
        let r = await_install(&mut obs, "vm", &fast_config(), &not_interrupted());
        assert!(matches!(r, Err(InstallError::NotFound)));
    }

    #[test]
    fn test_paused_is_resumed_not_terminal() {
        let mut obs = ScriptedObserver::new(
            vec![
                DomainState::Paused,
                DomainState::Running,
                DomainState::ShutOff,
            ],
            vec![None, Some(100), None],
        );
        let r = await_install(&mut obs, "vm", &fast_config(), &not_interrupted());
        assert!(r.is_ok());
        assert_eq!(obs.resumes, 1);
    }

    #[test]
    fn test_flat_io_declares_stuck_before_timeout() {
        // Activity on the second poll, then the counter goes flat forever.
        let config = MonitorConfig {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(5),
            stuck_threshold: Duration::from_millis(50),
        };
        let mut obs = ScriptedObserver::new(
            vec![DomainState::Running],
            vec![Some(1000), Some(2000), Some(2000)],
        );
        let started = Instant::now();
        let r = await_install(&mut obs, "vm", &config, &not_interrupted());
        assert!(matches!(r, Err(InstallError::Stuck { .. })));
        // Stuck detection must fire well before the overall timeout.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_no_observed_activity_times_out_instead_of_stuck() {
        // Counters never move, so the stuck heuristic never arms; the
        // overall timeout is the backstop.
        let mut obs =
            ScriptedObserver::new(vec![DomainState::Running], vec![Some(1000)]);
        let r = await_install(&mut obs, "vm", &fast_config(), &not_interrupted());
        assert!(matches!(r, Err(InstallError::TimedOut { .. })));
    }

    #[test]
    fn test_unknown_states_count_against_timeout() {
        let mut obs = ScriptedObserver::new(
            vec![DomainState::Other("in shutdown".to_string())],
            vec![],
        );
        let r = await_install(&mut obs, "vm", &fast_config(), &not_interrupted());
        assert!(matches!(r, Err(InstallError::TimedOut { .. })));
    }

    #[test]
    fn test_interrupt_stops_monitoring() {
        let mut obs = ScriptedObserver::new(vec![DomainState::Running], vec![]);
        let interrupted = AtomicBool::new(true);
        let r = await_install(&mut obs, "vm", &fast_config(), &interrupted);
        assert!(matches!(r, Err(InstallError::Interrupted)));
        assert_eq!(obs.polls, 0);
    }
}
