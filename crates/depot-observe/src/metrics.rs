//! Fixed metric schema
//!
//! Metric names are part of the external interface: dashboards key on
//! them, so they are declared once here and recorded through typed
//! helpers. The Prometheus exposition is rendered by
//! `metrics-exporter-prometheus`.

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

// Counters
pub const ARTIFACT_UPLOADS_TOTAL: &str = "artifact_uploads_total";
pub const ARTIFACT_DOWNLOADS_TOTAL: &str = "artifact_downloads_total";
pub const ARTIFACT_DELETES_TOTAL: &str = "artifact_deletes_total";
pub const SIGNING_OPERATIONS_TOTAL: &str = "supplychain_signing_operations_total";
pub const VERIFICATION_OPERATIONS_TOTAL: &str = "supplychain_verification_operations_total";
pub const SBOM_OPERATIONS_TOTAL: &str = "supplychain_sbom_operations_total";
pub const ATTESTATION_OPERATIONS_TOTAL: &str = "supplychain_attestation_operations_total";
pub const AUTHENTICATION_ATTEMPTS_TOTAL: &str = "rbac_authentication_attempts_total";
pub const AUTHORIZATION_CHECKS_TOTAL: &str = "rbac_authorization_checks_total";
pub const REQUESTS_TOTAL: &str = "system_requests_total";
pub const ERRORS_TOTAL: &str = "system_errors_total";

// Histograms
pub const ARTIFACT_SIZE_BYTES: &str = "artifact_size_bytes";
pub const ARTIFACT_OPERATION_DURATION: &str = "artifact_operation_duration_seconds";
pub const SUPPLYCHAIN_OPERATION_DURATION: &str = "supplychain_operation_duration_seconds";

// Gauges
pub const ACTIVE_CONNECTIONS: &str = "system_active_connections";

/// Install the Prometheus recorder and return the render handle
pub fn install_prometheus() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| format!("failed to install prometheus recorder: {err}"))
}

fn status_label(success: bool) -> &'static str {
    if success { "success" } else { "error" }
}

pub fn record_upload(bucket: &str, content_type: &str, success: bool) {
    counter!(
        ARTIFACT_UPLOADS_TOTAL,
        "bucket" => bucket.to_string(),
        "type" => content_type.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

pub fn record_download(bucket: &str, content_type: &str, success: bool) {
    counter!(
        ARTIFACT_DOWNLOADS_TOTAL,
        "bucket" => bucket.to_string(),
        "type" => content_type.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

pub fn record_delete(bucket: &str, content_type: &str, success: bool) {
    counter!(
        ARTIFACT_DELETES_TOTAL,
        "bucket" => bucket.to_string(),
        "type" => content_type.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

pub fn record_signing(success: bool) {
    counter!(SIGNING_OPERATIONS_TOTAL, "status" => status_label(success)).increment(1);
}

pub fn record_verification(success: bool) {
    counter!(VERIFICATION_OPERATIONS_TOTAL, "status" => status_label(success)).increment(1);
}

pub fn record_sbom(format: &str, success: bool) {
    counter!(
        SBOM_OPERATIONS_TOTAL,
        "format" => format.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

pub fn record_attestation(attestation_type: &str, success: bool) {
    counter!(
        ATTESTATION_OPERATIONS_TOTAL,
        "type" => attestation_type.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

pub fn record_authentication(method: &str, success: bool) {
    counter!(
        AUTHENTICATION_ATTEMPTS_TOTAL,
        "method" => method.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

pub fn record_authorization(resource: &str, action: &str, allowed: bool) {
    counter!(
        AUTHORIZATION_CHECKS_TOTAL,
        "resource" => resource.to_string(),
        "action" => action.to_string(),
        "result" => if allowed { "allow" } else { "deny" }
    )
    .increment(1);
}

pub fn record_request(method: &str, endpoint: &str, status: u16) {
    counter!(
        REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_error(error_type: &str, component: &str) {
    counter!(
        ERRORS_TOTAL,
        "type" => error_type.to_string(),
        "component" => component.to_string()
    )
    .increment(1);
}

pub fn observe_artifact_size(bytes: u64) {
    histogram!(ARTIFACT_SIZE_BYTES).record(bytes as f64);
}

pub fn observe_artifact_duration(operation: &str, elapsed: Duration) {
    histogram!(ARTIFACT_OPERATION_DURATION, "operation" => operation.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn observe_supplychain_duration(operation: &str, elapsed: Duration) {
    histogram!(SUPPLYCHAIN_OPERATION_DURATION, "operation" => operation.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn connection_opened() {
    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn connection_closed() {
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}
