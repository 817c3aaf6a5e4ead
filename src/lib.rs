//! Junction - reverse proxy library built on Pingora
//!
//! Junction routes requests by longest path prefix to a pool of backends:
//! - Round robin (health aware) and least connections balancing
//! - Active HEAD health checks on a fixed interval
//! - Byte-bounded LRU response cache
//! - Bounded retries against a fresh balancer selection
//! - JSON and Prometheus metrics on a configurable path

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod health;
pub mod load_balancer;
pub mod metrics;
pub mod routes;

pub use cache::{CacheEntry, CacheStatus, ResponseCache};
pub use config::*;
pub use dispatcher::{Forwarder, ProxyRequest, ProxyResponse, RequestDispatcher};
pub use error::ProxyError;
pub use gateway::{ProxyGateway, RequestContext};
pub use health::{HealthMonitor, HealthProbe, HealthStats};
pub use load_balancer::{Backend, Balancer, HealthState};
pub use metrics::{MetricsCollector, MetricsReport, MetricsSnapshot};
pub use routes::{Route, Router};
