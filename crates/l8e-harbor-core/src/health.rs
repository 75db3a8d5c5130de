//! Health Prober: one long-lived task per backend that declares a
//! `health_check`, driving the UNKNOWN/UP/DOWN state machine from synthetic
//! traffic only. Never feeds the circuit breaker.

use crate::model::{BackendHealth, BackendState, HealthCheckConfig};
use crate::observability::Observability;
use futures_util::FutureExt;
use log::{debug, error, warn};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Handle to a running prober task. Dropping or calling [`Prober::cancel`]
/// stops the task and is how runtime state for a removed backend is
/// discarded.
pub struct Prober {
    handle: JoinHandle<()>,
    cancel_flag: Arc<AtomicBool>,
}

impl Prober {
    pub fn spawn(
        client: Client,
        backend_url: String,
        config: HealthCheckConfig,
        state: Arc<BackendState>,
        observability: Arc<Observability>,
    ) -> Self {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let task_cancel = Arc::clone(&cancel_flag);

        let handle = tokio::spawn(async move {
            run_probe_loop(client, backend_url, config, state, observability, task_cancel).await;
        });

        Self { handle, cancel_flag }
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Release);
        self.handle.abort();
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_probe_loop(
    client: Client,
    backend_url: String,
    config: HealthCheckConfig,
    state: Arc<BackendState>,
    observability: Arc<Observability>,
    cancel_flag: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.interval_ms));
    let probe_url = format!("{}{}", backend_url.trim_end_matches('/'), config.path);

    // Background tasks restart with bounded exponential backoff on panic,
    // per §7; the prober itself never panics on an ordinary probe failure
    // (that's just a failed probe), only on a logic bug, so this loop is
    // the restart boundary a supervisor would reattach to.
    let mut consecutive_task_errors: u32 = 0;

    loop {
        interval.tick().await;
        if cancel_flag.load(Ordering::Acquire) {
            debug!("health prober for {probe_url} canceled");
            return;
        }

        let outcome = std::panic::AssertUnwindSafe(probe_once(
            &client,
            &probe_url,
            &config,
        ))
        .catch_unwind()
        .await;

        let success = match outcome {
            Ok(Ok(success)) => {
                consecutive_task_errors = 0;
                success
            }
            Ok(Err(e)) => {
                debug!("probe error for {probe_url}: {e}");
                false
            }
            Err(_) => {
                consecutive_task_errors += 1;
                error!("health probe task panicked for {probe_url}, restarting probe loop");
                let backoff = Duration::from_millis(200u64.saturating_mul(1 << consecutive_task_errors.min(8)));
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let new_health = state.record_probe(
            success,
            config.healthy_threshold,
            config.unhealthy_threshold,
            now,
        );
        debug!("probe for {probe_url}: success={success} health={new_health:?}");
        let gauge_value = match new_health {
            BackendHealth::Up => 1,
            BackendHealth::Down => 0,
            BackendHealth::Unknown => -1,
        };
        observability.metrics.set_gauge(
            "l8e_backend_up",
            &format!("backend=\"{backend_url}\""),
            gauge_value,
        );
    }
}


async fn probe_once(
    client: &Client,
    probe_url: &str,
    config: &HealthCheckConfig,
) -> Result<bool, reqwest::Error> {
    let mut request = client.get(probe_url).timeout(Duration::from_millis(config.timeout_ms));
    for (k, v) in &config.headers {
        request = request.header(k, v);
    }
    match request.send().await {
        Ok(resp) => Ok(config.expected_status.contains(&resp.status().as_u16())),
        Err(e) => {
            if e.is_timeout() {
                warn!("health probe to {probe_url} timed out");
            }
            Err(e)
        }
    }
}
