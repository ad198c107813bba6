//! Audit middleware
//!
//! Records one audit entry per request after the handler finishes:
//! user, method, resource, status, client address, and user agent.
//! Auditing is best-effort; it can never fail the request.

use crate::state::AppState;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use depot_auth::{AuditEvent, Principal};
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn audit_layer(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/metrics" || path == "/health" || path.starts_with("/health/") {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let principal = request.extensions().get::<Principal>().cloned();
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default();
    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;
    let status = response.status();

    let (user_id, username) = principal
        .map(|p| (p.user_id, p.username))
        .unwrap_or_else(|| ("anonymous".to_string(), "anonymous".to_string()));

    state.audit.record(AuditEvent {
        user_id,
        username,
        method,
        resource: path,
        status: status.as_u16(),
        ip,
        user_agent,
        error_message: if status.is_client_error() || status.is_server_error() {
            Some(
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            )
        } else {
            None
        },
    });

    response
}
