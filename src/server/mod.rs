//! HTTP surface of the experiment engine
//!
//! - Experiment API under `/api/envs/{envId}/experiments`
//! - `/healthz`, `/readyz` probes and `/metrics` for Prometheus
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

pub mod api;
mod health;
pub mod metrics;
pub mod shutdown;

pub use api::{api_router, ApiResponse};
pub use health::{build_router, run_server, ReadinessState};
pub use metrics::{create_metrics, EngineMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "api_test.rs"]
mod api_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
