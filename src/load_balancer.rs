/// Backend state and load balancing strategies
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::config::BalancingStrategy;
use crate::error::ProxyError;

/// Health of a backend as last observed by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No probe has completed yet
    Unknown,
    /// Last probe succeeded
    Healthy,
    /// Last probe failed or returned a server error
    Unhealthy,
}

impl HealthState {
    /// Unknown backends are treated as healthy
    pub fn is_available(self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

/// Upstream server representation
#[derive(Debug)]
pub struct Backend {
    /// Base URL, e.g. `http://127.0.0.1:9001`
    url: String,
    /// Requests currently being dispatched to this backend
    active_connections: AtomicUsize,
    /// Health as last written by the health monitor
    health: ArcSwap<HealthState>,
}

impl Backend {
    /// Create a new backend in the `Unknown` health state
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            active_connections: AtomicUsize::new(0),
            health: ArcSwap::from_pointee(HealthState::Unknown),
        }
    }

    /// Base URL of the backend
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Full URL for a path-and-query on this backend
    pub fn target_url(&self, path_and_query: &str) -> String {
        let base = self.url.trim_end_matches('/');
        if path_and_query.starts_with('/') {
            format!("{}{}", base, path_and_query)
        } else {
            format!("{}/{}", base, path_and_query)
        }
    }

    /// Number of in-flight dispatches
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Take one unit of the connection count, released when the guard drops
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    fn release(&self) {
        let previous = self.active_connections.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "connection count underflow on {}", self.url);
    }

    /// Current health state
    pub fn health(&self) -> HealthState {
        **self.health.load()
    }

    /// Whether balancers that honor health may pick this backend
    pub fn is_available(&self) -> bool {
        self.health().is_available()
    }

    /// Mark server as healthy
    pub fn mark_healthy(&self) {
        self.health.store(Arc::new(HealthState::Healthy));
    }

    /// Mark server as unhealthy
    pub fn mark_unhealthy(&self) {
        self.health.store(Arc::new(HealthState::Unhealthy));
    }
}

/// Holds one active connection on a backend for the lifetime of a dispatch
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    /// Backend this guard is counted against
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}

/// Round-robin strategy that skips unhealthy backends
#[derive(Debug)]
pub struct RoundRobinBalancer {
    backends: Vec<Arc<Backend>>,
    cursor: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            cursor: Mutex::new(0),
        }
    }

    /// Scan at most one full cycle from the cursor for an available backend
    pub fn next(&self) -> Result<Arc<Backend>, ProxyError> {
        let n = self.backends.len();
        if n == 0 {
            return Err(ProxyError::NoBackends);
        }

        let mut cursor = self.cursor.lock();
        for offset in 0..n {
            let idx = (*cursor + offset) % n;
            let backend = &self.backends[idx];
            if backend.is_available() {
                *cursor = (idx + 1) % n;
                return Ok(Arc::clone(backend));
            }
        }

        Err(ProxyError::NoHealthyBackends)
    }
}

/// Least connections strategy
///
/// Health is not consulted here: an unhealthy backend with the fewest
/// connections is still selected. Only round robin skips unhealthy backends.
#[derive(Debug)]
pub struct LeastConnectionsBalancer {
    backends: Vec<Arc<Backend>>,
}

impl LeastConnectionsBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends }
    }

    /// First backend in list order with the minimum connection count
    pub fn next(&self) -> Result<Arc<Backend>, ProxyError> {
        self.backends
            .iter()
            .min_by_key(|backend| backend.active_connections())
            .cloned()
            .ok_or(ProxyError::NoBackends)
    }
}

/// Balancer variants, chosen once when a route is built
#[derive(Debug)]
pub enum Balancer {
    RoundRobin(RoundRobinBalancer),
    LeastConnections(LeastConnectionsBalancer),
}

impl Balancer {
    /// Build the balancer for a configured strategy
    pub fn new(strategy: BalancingStrategy, backends: Vec<Arc<Backend>>) -> Self {
        match strategy {
            BalancingStrategy::RoundRobin => Balancer::RoundRobin(RoundRobinBalancer::new(backends)),
            BalancingStrategy::LeastConnections => {
                Balancer::LeastConnections(LeastConnectionsBalancer::new(backends))
            }
        }
    }

    /// Select the next backend
    pub fn next(&self) -> Result<Arc<Backend>, ProxyError> {
        match self {
            Balancer::RoundRobin(rr) => rr.next(),
            Balancer::LeastConnections(lc) => lc.next(),
        }
    }

    /// Backends owned by this balancer, in configuration order
    pub fn backends(&self) -> &[Arc<Backend>] {
        match self {
            Balancer::RoundRobin(rr) => &rr.backends,
            Balancer::LeastConnections(lc) => &lc.backends,
        }
    }

    /// Configured strategy
    pub fn strategy(&self) -> BalancingStrategy {
        match self {
            Balancer::RoundRobin(_) => BalancingStrategy::RoundRobin,
            Balancer::LeastConnections(_) => BalancingStrategy::LeastConnections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn backends(n: usize) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| Arc::new(Backend::new(format!("http://10.0.0.{}:80", i + 1))))
            .collect()
    }

    #[test]
    fn test_backend_starts_unknown_and_available() {
        let backend = Backend::new("http://127.0.0.1:9001");
        assert_eq!(backend.health(), HealthState::Unknown);
        assert!(backend.is_available());

        backend.mark_unhealthy();
        assert_eq!(backend.health(), HealthState::Unhealthy);
        assert!(!backend.is_available());

        backend.mark_healthy();
        assert_eq!(backend.health(), HealthState::Healthy);
        assert!(backend.is_available());
    }

    #[test]
    fn test_target_url() {
        let backend = Backend::new("http://127.0.0.1:9001/");
        assert_eq!(
            backend.target_url("/api/users?id=1"),
            "http://127.0.0.1:9001/api/users?id=1"
        );
        assert_eq!(backend.target_url("health"), "http://127.0.0.1:9001/health");
    }

    #[test]
    fn test_connection_guard_releases_on_drop() {
        let backend = Arc::new(Backend::new("http://127.0.0.1:9001"));
        {
            let _a = backend.acquire();
            let _b = backend.acquire();
            assert_eq!(backend.active_connections(), 2);
        }
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_round_robin_fairness() {
        let pool = backends(3);
        let rr = RoundRobinBalancer::new(pool.clone());
        let mut counts: HashMap<String, usize> = HashMap::new();

        let picks: Vec<String> = (0..10)
            .map(|_| rr.next().unwrap().url().to_string())
            .collect();
        for url in &picks {
            *counts.entry(url.clone()).or_default() += 1;
        }

        // Cyclic order starting at the cursor
        for (i, url) in picks.iter().enumerate() {
            assert_eq!(url, pool[i % 3].url());
        }
        // Each backend gets floor(10/3) or ceil(10/3) picks
        for count in counts.values() {
            assert!(*count == 3 || *count == 4);
        }
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let pool = backends(3);
        pool[1].mark_unhealthy();
        let rr = RoundRobinBalancer::new(pool.clone());

        for _ in 0..20 {
            let picked = rr.next().unwrap();
            assert_ne!(picked.url(), pool[1].url());
        }
    }

    #[test]
    fn test_round_robin_all_unhealthy() {
        let pool = backends(3);
        for backend in &pool {
            backend.mark_unhealthy();
        }
        let rr = RoundRobinBalancer::new(pool);

        for _ in 0..5 {
            assert_eq!(rr.next().unwrap_err(), ProxyError::NoHealthyBackends);
        }
    }

    #[test]
    fn test_round_robin_recovers_after_health_restored() {
        let pool = backends(2);
        pool[0].mark_unhealthy();
        pool[1].mark_unhealthy();
        let rr = RoundRobinBalancer::new(pool.clone());
        assert!(rr.next().is_err());

        pool[0].mark_healthy();
        assert_eq!(rr.next().unwrap().url(), pool[0].url());
    }

    #[test]
    fn test_empty_balancers() {
        assert_eq!(
            RoundRobinBalancer::new(vec![]).next().unwrap_err(),
            ProxyError::NoBackends
        );
        assert_eq!(
            LeastConnectionsBalancer::new(vec![]).next().unwrap_err(),
            ProxyError::NoBackends
        );
    }

    #[test]
    fn test_least_connections_tie_break() {
        let pool = backends(3);
        let _held: Vec<ConnectionGuard> = vec![
            pool[0].acquire(),
            pool[0].acquire(),
            pool[1].acquire(),
            pool[1].acquire(),
            pool[2].acquire(),
        ];
        let lc = LeastConnectionsBalancer::new(pool.clone());

        // Counts [2, 2, 1]
        for _ in 0..3 {
            assert_eq!(lc.next().unwrap().url(), pool[2].url());
        }

        // Counts [2, 2, 3]: tie resolved by list order
        let _more = (pool[2].acquire(), pool[2].acquire());
        assert_eq!(lc.next().unwrap().url(), pool[0].url());
    }

    #[test]
    fn test_least_connections_ignores_health() {
        let pool = backends(2);
        pool[0].mark_unhealthy();
        let _busy = pool[1].acquire();
        let lc = LeastConnectionsBalancer::new(pool.clone());
        assert_eq!(lc.next().unwrap().url(), pool[0].url());
    }

    #[test]
    fn test_balancer_from_strategy() {
        let balancer = Balancer::new(BalancingStrategy::LeastConnections, backends(2));
        assert_eq!(balancer.strategy(), BalancingStrategy::LeastConnections);
        assert_eq!(balancer.backends().len(), 2);

        let balancer = Balancer::new(BalancingStrategy::RoundRobin, backends(1));
        assert_eq!(balancer.strategy(), BalancingStrategy::RoundRobin);
    }

    #[test]
    fn test_concurrent_round_robin_is_consistent() {
        let pool = backends(4);
        let rr = Arc::new(RoundRobinBalancer::new(pool));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rr = Arc::clone(&rr);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        rr.next().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // 8000 picks over 4 backends: cursor lands back at the start
        assert_eq!(*rr.cursor.lock(), 0);
    }
}
