//! Kickstart delivery endpoint
//!
//! Serves the rendered kickstart directory over plain HTTP, bound to all
//! interfaces so a guest on the libvirt network can reach it during boot.
//! Startup is verified, not assumed: the endpoint writes a probe file and
//! fetches it back through the listener before reporting success. The bound
//! port is exclusive; a listener left over from an earlier run (recorded in
//! the pidfile) is terminated before binding.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::utils::wait_for_readiness;

/// How long the startup probe keeps retrying before the endpoint is
/// declared unreachable.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// A running delivery endpoint. Stops serving when dropped; `stop` is the
/// explicit, awaited form.
pub struct DeliveryEndpoint {
    port: u16,
    dir: Utf8PathBuf,
    pidfile: Utf8PathBuf,
    runtime: tokio::runtime::Handle,
    shutdown: Option<oneshot::Sender<()>>,
    served: Option<tokio::task::JoinHandle<()>>,
}

impl DeliveryEndpoint {
    /// Start serving `dir` on `port` and verify reachability.
    pub fn start(
        runtime: &tokio::runtime::Handle,
        dir: &Utf8Path,
        port: u16,
        pidfile: &Utf8Path,
    ) -> Result<Self> {
        terminate_stale_listener(pidfile);

        let state = Arc::new(dir.to_owned());
        let app = Router::new()
            .route("/{file}", get(serve_file))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind(addr))
            .with_context(|| format!("Failed to bind delivery endpoint on {addr}"))?;

        let (tx, rx) = oneshot::channel::<()>();
        let served = runtime.spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!("Delivery endpoint terminated abnormally: {e}");
            }
        });

        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write pidfile {pidfile}"))?;

        let endpoint = Self {
            port,
            dir: dir.to_owned(),
            pidfile: pidfile.to_owned(),
            runtime: runtime.clone(),
            shutdown: Some(tx),
            served: Some(served),
        };
        endpoint.verify()?;
        info!("Delivery endpoint serving {} on port {}", dir, port);
        Ok(endpoint)
    }

    /// The URL a guest at `host_address` fetches `file_name` from.
    pub fn url_for(&self, host_address: &str, file_name: &str) -> String {
        format!("http://{}:{}/{}", host_address, self.port, file_name)
    }

    /// Confirm the endpoint answers: write a probe file, fetch it back
    /// through the listener, compare, remove it.
    pub fn verify(&self) -> Result<()> {
        let token = format!("vmforge-probe-{}", std::process::id());
        let probe_name = "probe.txt";
        let probe_path = self.dir.join(probe_name);
        std::fs::write(&probe_path, &token)
            .with_context(|| format!("Failed to write probe file {probe_path}"))?;

        let url = format!("http://127.0.0.1:{}/{}", self.port, probe_name);
        let fetched = wait_for_readiness(
            "Verifying delivery endpoint",
            || match reqwest::blocking::get(&url) {
                Ok(resp) if resp.status().is_success() => {
                    Ok(resp.text().map(|body| body == token).unwrap_or(false))
                }
                Ok(_) | Err(_) => Ok(false),
            },
            PROBE_TIMEOUT,
            PROBE_INTERVAL,
        );
        let _ = std::fs::remove_file(&probe_path);
        fetched
            .map(|_| ())
            .map_err(|e| eyre!("Delivery endpoint on port {} did not become reachable: {e}", self.port))
    }

    /// Stop serving and wait for the listener to wind down.
    pub fn stop(mut self) {
        self.shutdown_inner();
        if let Some(served) = self.served.take() {
            let _ = self.runtime.block_on(served);
        }
    }

    fn shutdown_inner(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if self.pidfile.exists() {
            if let Err(e) = std::fs::remove_file(&self.pidfile) {
                warn!("Failed to remove pidfile {}: {e}", self.pidfile);
            }
        }
    }
}

impl Drop for DeliveryEndpoint {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Serve one file from the kickstart directory. Only bare file names are
/// addressable; anything path-like is rejected.
async fn serve_file(
    State(dir): State<Arc<Utf8PathBuf>>,
    UrlPath(file): UrlPath<String>,
) -> (StatusCode, Vec<u8>) {
    if file.contains('/') || file.contains('\\') || file.contains("..") {
        return (StatusCode::BAD_REQUEST, Vec::new());
    }
    match tokio::fs::read(dir.join(&file).as_std_path()).await {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            debug!("Request for {file:?} failed: {e}");
            (StatusCode::NOT_FOUND, Vec::new())
        }
    }
}

/// Kill a listener recorded by a previous run, if it is still around.
fn terminate_stale_listener(pidfile: &Utf8Path) {
    let Ok(contents) = std::fs::read_to_string(pidfile) else {
        return;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        warn!("Ignoring malformed pidfile {pidfile}");
        let _ = std::fs::remove_file(pidfile);
        return;
    };
    if pid == std::process::id() as i32 {
        return;
    }
    if let Some(pid) = rustix::process::Pid::from_raw(pid) {
        match rustix::process::kill_process(pid, rustix::process::Signal::Term) {
            Ok(()) => {
                info!("Terminated stale delivery endpoint (pid {pid:?})");
                // Give it a moment to release the port.
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) if e == rustix::io::Errno::SRCH => {}
            Err(e) => warn!("Failed to signal stale endpoint pid: {e}"),
        }
    }
    let _ = std::fs::remove_file(pidfile);
}
