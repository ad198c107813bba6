//! Authentication middleware
//!
//! Validates `Authorization: Bearer <jwt>` through the OIDC token
//! validator and stores the resulting [`Principal`] in request
//! extensions for the authorization and audit stages. Metrics and
//! health probes are never authenticated. With the identity provider
//! disabled, every request runs as a local admin principal.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use depot_auth::Principal;
use depot_common::Error;
use depot_observe::metrics::record_authentication;
use std::sync::Arc;
use tracing::debug;

/// Routes that are reachable without any credential
fn is_open_route(path: &str) -> bool {
    path == "/metrics" || path == "/health" || path.starts_with("/health/")
}

/// The identity-disabled development principal
fn local_principal() -> Principal {
    Principal {
        user_id: "local".to_string(),
        username: "local".to_string(),
        email: None,
        roles: vec!["admin".to_string()],
        groups: Vec::new(),
        anonymous: false,
    }
}

pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if is_open_route(path) {
        return Ok(next.run(request).await);
    }

    if !state.identity.enabled {
        request.extensions_mut().insert(local_principal());
        return Ok(next.run(request).await);
    }

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let principal = match bearer {
        Some(token) => match state.token_validator.validate(token).await {
            Ok(principal) => {
                record_authentication("bearer", true);
                principal
            }
            Err(err) => {
                record_authentication("bearer", false);
                return Err(err.into());
            }
        },
        None => {
            // Anonymous access is limited to reads, and only when the
            // engine is configured for it
            let method = request.method();
            let read_only = method == Method::GET || method == Method::HEAD;
            if !(state.identity.allow_anonymous_get && read_only) {
                record_authentication("anonymous", false);
                return Err(Error::unauthorized("missing bearer token").into());
            }
            record_authentication("anonymous", true);
            Principal::anonymous()
        }
    };

    debug!(user = %principal.user_id, anonymous = principal.anonymous, "authenticated request");
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
