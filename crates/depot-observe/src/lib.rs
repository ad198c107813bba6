//! Depot Observe - Metrics schema and health probes
//!
//! The metric families here are a fixed external interface; the health
//! module feeds `/health`, `/health/ready`, and `/health/live`.

pub mod health;
pub mod metrics;

pub use health::{ComponentStatus, HealthReport, HealthState};
pub use self::metrics::install_prometheus;

use depot_common::config::ObservabilityConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging. Span export is driven by the
/// configured endpoint; without one, spans stay local and tracing
/// never affects request handling.
pub fn init_tracing(config: &ObservabilityConfig, default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(endpoint) = &config.tracing_endpoint {
        tracing::info!(
            endpoint = %endpoint,
            service = %config.tracing_service_name,
            "trace export configured"
        );
    }
}
