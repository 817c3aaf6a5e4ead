/// Active health checking for backends
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use log::{debug, info, warn};
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, timeout};

use crate::load_balancer::{Backend, HealthState};

/// Deadline for a single probe, independent of the request timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A single out-of-band check against one backend
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Status returned by the backend; transport failures are errors
    async fn probe(&self, backend: &Backend) -> Result<StatusCode>;
}

/// `HEAD <backend url>` over reqwest
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to create health check client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, backend: &Backend) -> Result<StatusCode> {
        let response = self
            .client
            .head(backend.url())
            .send()
            .await
            .map_err(|e| anyhow!("HEAD {} failed: {}", backend.url(), e))?;
        Ok(response.status())
    }
}

/// Health for a probe outcome: errors and 5xx are unhealthy
pub fn classify(result: &Result<StatusCode>) -> HealthState {
    match result {
        Ok(status) if !status.is_server_error() => HealthState::Healthy,
        _ => HealthState::Unhealthy,
    }
}

/// Periodic prober for every distinct backend
pub struct HealthMonitor {
    backends: Vec<Arc<Backend>>,
    interval: Duration,
    probe: Arc<dyn HealthProbe>,
    running: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor; an interval of zero disables it
    pub fn new(
        backends: Vec<Arc<Backend>>,
        interval: Duration,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            backends,
            interval,
            probe,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Probe every interval until `shutdown` completes
    ///
    /// Returns at once when the monitor is disabled or already running. The
    /// first round runs one interval after start; a round in flight finishes
    /// before shutdown is observed.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if !self.is_enabled() {
            info!("Health checks disabled");
            return;
        }
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("Health checks already running");
            return;
        }

        info!(
            "Starting health checks for {} backends (interval: {:?})",
            self.backends.len(),
            self.interval
        );

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(self.interval) => {}
            }
            let stats = self.check_all().await;
            debug!(
                "Health round: {}/{} backends healthy",
                stats.healthy_backends, stats.total_backends
            );
        }

        self.running.store(false, Ordering::Relaxed);
        info!("Health checks stopped");
    }

    /// Probe every backend concurrently and apply the results
    pub async fn check_all(&self) -> HealthStats {
        let handles: Vec<_> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = Arc::clone(backend);
                let probe = Arc::clone(&self.probe);
                tokio::spawn(async move {
                    let result = match timeout(PROBE_TIMEOUT, probe.probe(&backend)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("probe timed out after {:?}", PROBE_TIMEOUT)),
                    };
                    apply(&backend, &result)
                })
            })
            .collect();

        let mut stats = HealthStats::default();
        for handle in handles {
            stats.total_backends += 1;
            match handle.await {
                Ok(HealthState::Unhealthy) | Err(_) => stats.unhealthy_backends += 1,
                Ok(_) => stats.healthy_backends += 1,
            }
        }
        stats
    }
}

/// Runs inside the Pingora server, so the loop starts after any daemon fork
#[async_trait]
impl BackgroundService for HealthMonitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        self.run_until(async move {
            // A dropped sender also means the server is going away
            let _ = shutdown.changed().await;
        })
        .await;
    }
}

/// Store a probe outcome on the backend and log transitions
fn apply(backend: &Backend, result: &Result<StatusCode>) -> HealthState {
    let previous = backend.health();
    let next = classify(result);

    match next {
        HealthState::Healthy => backend.mark_healthy(),
        _ => backend.mark_unhealthy(),
    }

    if previous != next {
        match (next, result) {
            (HealthState::Healthy, _) => info!("Backend {} is now healthy", backend.url()),
            (_, Ok(status)) => warn!(
                "Backend {} is now unhealthy: status {}",
                backend.url(),
                status
            ),
            (_, Err(e)) => warn!("Backend {} is now unhealthy: {}", backend.url(), e),
        }
    }

    next
}

/// Health statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthStats {
    /// Total number of backends probed
    pub total_backends: u32,
    /// Number of healthy backends
    pub healthy_backends: u32,
    /// Number of unhealthy backends
    pub unhealthy_backends: u32,
}

impl HealthStats {
    /// Get health percentage
    pub fn health_percentage(&self) -> f64 {
        if self.total_backends == 0 {
            100.0
        } else {
            (self.healthy_backends as f64 / self.total_backends as f64) * 100.0
        }
    }
}
