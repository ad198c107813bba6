//! RBAC API handlers: policy CRUD, authorization checks, audit queries

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use depot_auth::Principal;
use depot_common::{Action, AuditEntry, Effect, Error, Policy, PrincipalRef};
use depot_meta::AuditQuery;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

fn parse_principals(raw: Vec<String>) -> Result<Vec<PrincipalRef>, ApiError> {
    raw.into_iter()
        .map(|p| {
            PrincipalRef::try_from(p).map_err(|reason| {
                ApiError(
                    Error::bad_request(reason).with_detail("field", "principals"),
                )
            })
        })
        .collect()
}

fn parse_policy_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError(Error::bad_request(format!("invalid policy id: {raw}")).with_detail("field", "id"))
    })
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
    pub resource_pattern: String,
    pub actions: Vec<Action>,
    pub effect: Effect,
    pub principals: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResponse {
    pub id: Uuid,
    pub resource_pattern: String,
    pub actions: Vec<Action>,
    pub effect: Effect,
    pub principals: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Policy> for PolicyResponse {
    fn from(policy: Policy) -> Self {
        Self {
            id: policy.id,
            resource_pattern: policy.resource_pattern,
            actions: policy.actions.into_iter().collect(),
            effect: policy.effect,
            principals: policy.principals.into_iter().map(|p| p.to_string()).collect(),
            created_at: policy.created_at,
            updated_at: policy.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    pub resource: String,
    pub action: Action,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuditParams {
    pub user_id: Option<String>,
    pub resource: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Create policy (POST /rbac/policies)
pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PolicyRequest>,
) -> ApiResult<(StatusCode, Json<PolicyResponse>)> {
    let policy = state.policies.create_policy(
        request.resource_pattern,
        request.actions.into_iter().collect::<BTreeSet<_>>(),
        request.effect,
        parse_principals(request.principals)?,
    )?;
    Ok((StatusCode::CREATED, Json(policy.into())))
}

/// List policies (GET /rbac/policies)
pub async fn list_policies(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<PolicyResponse>>> {
    let policies = state
        .policies
        .list_policies()?
        .into_iter()
        .map(PolicyResponse::from)
        .collect();
    Ok(Json(policies))
}

/// Get policy (GET /rbac/policies/{id})
pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<PolicyResponse>> {
    let policy = state.policies.get_policy(parse_policy_id(&id)?)?;
    Ok(Json(policy.into()))
}

/// Replace policy (PUT /rbac/policies/{id})
pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<PolicyRequest>,
) -> ApiResult<Json<PolicyResponse>> {
    let id = parse_policy_id(&id)?;
    let existing = state.policies.get_policy(id)?;
    let updated = state.policies.update_policy(Policy {
        id,
        resource_pattern: request.resource_pattern,
        actions: request.actions.into_iter().collect(),
        effect: request.effect,
        principals: parse_principals(request.principals)?,
        conditions: existing.conditions,
        created_at: existing.created_at,
        updated_at: existing.updated_at,
    })?;
    Ok(Json(updated.into()))
}

/// Delete policy (DELETE /rbac/policies/{id})
pub async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.policies.delete_policy(parse_policy_id(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Evaluate a hypothetical access (POST /rbac/authorize)
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AuthorizeRequest>,
) -> ApiResult<Json<AuthorizeResponse>> {
    let principal = Principal {
        user_id: request.user_id.clone(),
        username: request.user_id,
        email: None,
        roles: request.roles,
        groups: request.groups,
        anonymous: false,
    };
    let authorization = state
        .policies
        .authorize(&principal, &request.resource, request.action)?;
    Ok(Json(AuthorizeResponse {
        allowed: authorization.allowed(),
        matched_policy: authorization.matched_policy,
    }))
}

/// Query the audit log
/// (GET /rbac/audit?userId=&resource=&startTime=&endTime=&limit=)
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditParams>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let entries = state.audit.query(&AuditQuery {
        user_id: params.user_id,
        resource_prefix: params.resource,
        start: params.start_time,
        end: params.end_time,
        limit: params.limit,
    })?;
    Ok(Json(entries))
}
