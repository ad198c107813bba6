//! Authorization middleware
//!
//! Derives `(resource, action)` from the method and path, asks the
//! policy engine, and rejects with `insufficient_permissions` on deny.
//! Resources are `<bucket>` for bucket operations, `<bucket>/<key>` for
//! object and supply-chain operations, and `rbac` for the control
//! surface.

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
use depot_common::{Action, Error};
use depot_observe::metrics::record_authorization;
use std::sync::Arc;

/// What a request is asking to do, in policy terms
fn required_permission(method: &Method, path: &str) -> Option<(String, Action)> {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        // Service level
        (m, ["s3"]) if m == Method::GET => Some(("*".to_string(), Action::List)),

        // Bucket operations
        (m, ["s3", bucket]) if m == Method::GET => Some(((*bucket).to_string(), Action::List)),
        (m, ["s3", bucket]) if m == Method::HEAD => Some(((*bucket).to_string(), Action::Read)),
        (m, ["s3", bucket]) if m == Method::PUT => Some(((*bucket).to_string(), Action::Write)),
        (m, ["s3", bucket]) if m == Method::DELETE => {
            Some(((*bucket).to_string(), Action::Delete))
        }

        // Object operations (multipart included; aborting an upload is
        // a write to the key)
        (m, ["s3", bucket, key @ ..]) if m == Method::GET || m == Method::HEAD => {
            Some((format!("{bucket}/{}", key.join("/")), Action::Read))
        }
        (m, ["s3", bucket, key @ ..]) if m == Method::PUT || m == Method::POST => {
            Some((format!("{bucket}/{}", key.join("/")), Action::Write))
        }
        (m, ["s3", bucket, key @ ..]) if m == Method::DELETE => {
            Some((format!("{bucket}/{}", key.join("/")), Action::Delete))
        }

        // Supply chain: signing and attaching are writes, inspection is
        // a read
        (m, ["supplychain", "sign", bucket, key @ ..]) if m == Method::POST => {
            Some((format!("{bucket}/{}", key.join("/")), Action::Write))
        }
        (m, ["supplychain", "sign", bucket, key @ ..]) if m == Method::GET => {
            Some((format!("{bucket}/{}", key.join("/")), Action::Read))
        }
        (m, ["supplychain", "verify", bucket, key @ ..]) if m == Method::POST => {
            Some((format!("{bucket}/{}", key.join("/")), Action::Read))
        }
        (m, ["supplychain", kind, bucket, key @ ..])
            if (*kind == "sbom" || *kind == "attestations") && m == Method::POST =>
        {
            Some((format!("{bucket}/{}", key.join("/")), Action::Write))
        }
        (m, ["supplychain", kind, bucket, key @ ..])
            if (*kind == "sbom" || *kind == "attestations") && m == Method::GET =>
        {
            Some((format!("{bucket}/{}", key.join("/")), Action::Read))
        }

        // Policy and audit control surface
        (_, ["rbac", ..]) => Some(("rbac".to_string(), Action::Admin)),

        _ => None,
    }
}

pub async fn authz_layer(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        // Open routes carry no principal and need no authorization
        return Ok(next.run(request).await);
    };

    let Some((resource, action)) = required_permission(request.method(), request.uri().path())
    else {
        return Ok(next.run(request).await);
    };

    let authorization = state.policies.authorize(&principal, &resource, action)?;
    record_authorization(&resource, action.as_str(), authorization.allowed());

    if !authorization.allowed() {
        let mut err = Error::new(
            depot_common::ErrorKind::InsufficientPermissions,
            format!("{action} on {resource} is not permitted"),
        )
        .with_detail("resource", resource)
        .with_detail("action", action.as_str());
        if let Some(policy) = authorization.matched_policy {
            err = err.with_detail("policy", policy.to_string());
        }
        return Err(err.into());
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_permissions() {
        assert_eq!(
            required_permission(&Method::GET, "/s3/releases/prod/a"),
            Some(("releases/prod/a".to_string(), Action::Read))
        );
        assert_eq!(
            required_permission(&Method::PUT, "/s3/releases/prod/a"),
            Some(("releases/prod/a".to_string(), Action::Write))
        );
        assert_eq!(
            required_permission(&Method::DELETE, "/s3/releases/a"),
            Some(("releases/a".to_string(), Action::Delete))
        );
    }

    #[test]
    fn test_bucket_permissions() {
        assert_eq!(
            required_permission(&Method::GET, "/s3/releases"),
            Some(("releases".to_string(), Action::List))
        );
        assert_eq!(
            required_permission(&Method::PUT, "/s3/releases"),
            Some(("releases".to_string(), Action::Write))
        );
        assert_eq!(
            required_permission(&Method::GET, "/s3"),
            Some(("*".to_string(), Action::List))
        );
    }

    #[test]
    fn test_supplychain_permissions() {
        assert_eq!(
            required_permission(&Method::POST, "/supplychain/sign/releases/app.bin"),
            Some(("releases/app.bin".to_string(), Action::Write))
        );
        assert_eq!(
            required_permission(&Method::POST, "/supplychain/verify/releases/app.bin"),
            Some(("releases/app.bin".to_string(), Action::Read))
        );
        assert_eq!(
            required_permission(&Method::GET, "/supplychain/sbom/releases/app.bin"),
            Some(("releases/app.bin".to_string(), Action::Read))
        );
    }

    #[test]
    fn test_rbac_needs_admin() {
        assert_eq!(
            required_permission(&Method::POST, "/rbac/policies"),
            Some(("rbac".to_string(), Action::Admin))
        );
        assert_eq!(
            required_permission(&Method::GET, "/rbac/audit"),
            Some(("rbac".to_string(), Action::Admin))
        );
    }

    #[test]
    fn test_unmapped_routes_pass_through() {
        assert_eq!(required_permission(&Method::GET, "/metrics"), None);
        assert_eq!(required_permission(&Method::GET, "/health/ready"), None);
    }
}
