//! Health probes
//!
//! `/health` aggregates component checks, `/health/ready` gates on the
//! metadata store and primary backend, `/health/live` only proves the
//! process responds. The HTTP handlers live in the server binary; this
//! module produces the reports.

use depot_backend::Backend;
use depot_meta::MetaStore;
use depot_reliability::{BreakerRegistry, BreakerState};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub components: Vec<ComponentReport>,
}

impl HealthReport {
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.status == ComponentStatus::Up
    }
}

/// Shared prober over the store, the backend, and the breakers
#[derive(Clone)]
pub struct HealthState {
    meta: MetaStore,
    backend: Arc<dyn Backend>,
    breakers: BreakerRegistry,
}

impl HealthState {
    #[must_use]
    pub fn new(meta: MetaStore, backend: Arc<dyn Backend>, breakers: BreakerRegistry) -> Self {
        Self {
            meta,
            backend,
            breakers,
        }
    }

    /// Aggregate health: metadata, backend, and per-dependency breaker
    /// states. Any down component takes the aggregate down.
    pub async fn check(&self) -> HealthReport {
        let mut components = Vec::new();

        components.push(match self.meta.health_check() {
            Ok(()) => ComponentReport {
                name: "metadata".to_string(),
                status: ComponentStatus::Up,
                detail: None,
            },
            Err(err) => {
                warn!(error = %err, "metadata health check failed");
                ComponentReport {
                    name: "metadata".to_string(),
                    status: ComponentStatus::Down,
                    detail: Some(err.to_string()),
                }
            }
        });

        let token = CancellationToken::new();
        components.push(match self.backend.health_check(&token).await {
            Ok(()) => ComponentReport {
                name: format!("backend/{}", self.backend.name()),
                status: ComponentStatus::Up,
                detail: None,
            },
            Err(err) => {
                warn!(error = %err, "backend health check failed");
                ComponentReport {
                    name: format!("backend/{}", self.backend.name()),
                    status: ComponentStatus::Down,
                    detail: Some(err.to_string()),
                }
            }
        });

        for (name, state) in self.breakers.states() {
            components.push(ComponentReport {
                name: format!("breaker/{name}"),
                status: if state == BreakerState::Open {
                    ComponentStatus::Down
                } else {
                    ComponentStatus::Up
                },
                detail: Some(format!("{state:?}")),
            });
        }

        let status = if components.iter().all(|c| c.status == ComponentStatus::Up) {
            ComponentStatus::Up
        } else {
            ComponentStatus::Down
        };
        HealthReport { status, components }
    }

    /// Readiness: the metadata store and primary backend must answer
    pub async fn ready(&self) -> bool {
        if self.meta.health_check().is_err() {
            return false;
        }
        self.backend
            .health_check(&CancellationToken::new())
            .await
            .is_ok()
    }

    /// Liveness: reaching this code is the proof
    #[must_use]
    pub const fn live(&self) -> bool {
        true
    }
}
