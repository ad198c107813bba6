//! Application state shared across handlers

use depot_auth::{AuditLogger, PolicyEngine, TokenValidator};
use depot_common::config::IdentityConfig;
use depot_engine::ObjectEngine;
use depot_observe::HealthState;
use depot_supplychain::SupplyChainService;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<ObjectEngine>,
    pub supply_chain: Arc<SupplyChainService>,
    pub policies: Arc<PolicyEngine>,
    pub token_validator: Arc<TokenValidator>,
    pub audit: AuditLogger,
    pub health: HealthState,
    pub prometheus: Option<PrometheusHandle>,
    pub identity: IdentityConfig,
}
