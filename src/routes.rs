/// Request routing by longest path prefix
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RouteConfig;
use crate::error::ProxyError;
use crate::load_balancer::{Backend, Balancer};

/// A path prefix bound to a balancer
#[derive(Debug)]
pub struct Route {
    /// Prefix matched against the request path
    pub path_prefix: String,
    /// Balancer owning this route's backends
    pub balancer: Balancer,
}

impl Route {
    /// Whether this route claims the given path
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
    }
}

/// Route table built once from configuration
#[derive(Debug)]
pub struct Router {
    /// Routes in configuration order
    routes: Vec<Route>,
    /// Every distinct backend across all routes
    backends: Vec<Arc<Backend>>,
}

impl Router {
    /// Create a router from route configurations
    ///
    /// Backends that appear in several routes under the same URL share one
    /// `Backend`, so health and connection counts are tracked per upstream.
    pub fn new(route_configs: &[RouteConfig]) -> Self {
        let mut by_url: HashMap<String, Arc<Backend>> = HashMap::new();
        let mut backends = Vec::new();
        let mut routes = Vec::with_capacity(route_configs.len());

        for config in route_configs {
            let route_backends: Vec<Arc<Backend>> = config
                .backends
                .iter()
                .map(|url| {
                    by_url
                        .entry(url.clone())
                        .or_insert_with(|| {
                            let backend = Arc::new(Backend::new(url.clone()));
                            backends.push(Arc::clone(&backend));
                            backend
                        })
                        .clone()
                })
                .collect();

            debug!(
                "Route '{}' -> {:?} over {} backend(s)",
                config.path_prefix,
                config.strategy,
                route_backends.len()
            );

            routes.push(Route {
                path_prefix: config.path_prefix.clone(),
                balancer: Balancer::new(config.strategy, route_backends),
            });
        }

        debug!(
            "Loaded {} routes with {} distinct backends",
            routes.len(),
            backends.len()
        );

        Self { routes, backends }
    }

    /// Longest matching prefix; the first configured route wins a tie
    pub fn find_route(&self, path: &str) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if !route.matches(path) {
                continue;
            }
            match best {
                Some(current) if route.path_prefix.len() <= current.path_prefix.len() => {}
                _ => best = Some(route),
            }
        }
        best
    }

    /// Resolve a request path to a backend
    pub fn resolve(&self, path: &str) -> Result<Arc<Backend>, ProxyError> {
        let route = self.find_route(path).ok_or_else(|| {
            debug!("No route matched {}", path);
            ProxyError::NoMatchingRoute
        })?;
        route.balancer.next()
    }

    /// Get all routes
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Every distinct backend known to the router
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }
}
