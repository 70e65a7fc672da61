use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::debug;

/// The run was interrupted by the operator. Carried to `main`, which maps
/// it to the conventional exit code 130 after cleanup has run.
#[derive(Debug, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Install a ctrl-c watcher on the shared runtime. Components poll the
/// returned flag at their suspension points; resources are released by
/// their guards as the error unwinds.
pub fn install_interrupt_flag(runtime: &tokio::runtime::Handle) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let task_flag = flag.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing up");
            task_flag.store(true, Ordering::Relaxed);
        }
    });
    flag
}

/// Bail out with [`Interrupted`] if the flag is set.
pub fn check_interrupted(flag: &AtomicBool) -> Result<(), Interrupted> {
    if flag.load(Ordering::Relaxed) {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Wait for a condition to become ready.
///
/// Generic polling function that repeatedly tests a condition until it
/// succeeds or times out.
///
/// # Arguments
///
/// * `message` - What is being waited for (used in logs and the timeout error)
/// * `test_fn` - Function that tests the readiness condition, returns Ok(true) on success
/// * `timeout` - Maximum duration to wait
/// * `poll_interval` - Duration to wait between test attempts
///
/// # Returns
///
/// Returns the elapsed duration on success, or an error on timeout.
pub fn wait_for_readiness<F>(
    message: &str,
    mut test_fn: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Duration>
where
    F: FnMut() -> Result<bool>,
{
    let start_time = Instant::now();

    debug!("{message}: polling for readiness (timeout: {}s)", timeout.as_secs());

    let mut attempt = 0;
    while start_time.elapsed() < timeout {
        attempt += 1;

        match test_fn() {
            Ok(true) => {
                debug!("{message}: ready after {attempt} attempts");
                return Ok(start_time.elapsed());
            }
            Ok(false) => {
                debug!("{message}: attempt {attempt} returned false");
            }
            Err(e) => {
                debug!("{message}: attempt {attempt} failed: {e}");
            }
        }

        std::thread::sleep(poll_interval);
    }

    Err(eyre!(
        "{message}: timeout after {}s ({attempt} attempts)",
        timeout.as_secs()
    ))
}
