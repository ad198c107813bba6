//! Supply-chain API handlers: signatures, verification, SBOM,
//! attestations

use crate::error::{ApiError, ApiResult};
use crate::s3::{parse_bucket, parse_key};
use crate::state::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use depot_auth::Principal;
use depot_common::{AttestationRecord, Error, SbomRecord, SignatureRecord};
use depot_observe::metrics::{
    observe_supplychain_duration, record_attestation, record_sbom, record_signing,
    record_verification,
};
use depot_supplychain::SignatureOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn actor(principal: Option<&Principal>) -> String {
    principal.map_or_else(|| "anonymous".to_string(), |p| p.username.clone())
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub private_key_pem: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResponse {
    pub id: Uuid,
    pub artifact_ref: String,
    pub algorithm: String,
    pub signature: String,
    pub public_key_pem: String,
    pub signed_by: String,
    pub signed_at: DateTime<Utc>,
}

impl From<SignatureRecord> for SignatureResponse {
    fn from(record: SignatureRecord) -> Self {
        Self {
            id: record.id,
            artifact_ref: record.artifact_ref,
            algorithm: record.algorithm,
            signature: base64::engine::general_purpose::STANDARD.encode(&record.signature),
            public_key_pem: record.public_key_pem,
            signed_by: record.signed_by,
            signed_at: record.signed_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    pub artifact_ref: String,
    pub results: Vec<SignatureOutcome>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SbomParams {
    pub format: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRequest {
    #[serde(rename = "type")]
    pub attestation_type: String,
    pub predicate_type: String,
    pub predicate: serde_json::Value,
    /// Optional detached signature, base64
    pub signature: Option<String>,
}

// ============================================================================
// Signatures
// ============================================================================

/// Sign an artifact (POST /supplychain/sign/{bucket}/{key})
pub async fn sign_artifact(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    principal: Option<axum::Extension<Principal>>,
    Json(request): Json<SignRequest>,
) -> ApiResult<(StatusCode, Json<SignatureResponse>)> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let start = Instant::now();

    let result = state
        .supply_chain
        .sign_artifact(
            &CancellationToken::new(),
            &bucket,
            &key,
            &request.private_key_pem,
            &actor(principal.as_deref()),
        )
        .await;

    record_signing(result.is_ok());
    observe_supplychain_duration("sign", start.elapsed());
    let record = result?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// List signatures (GET /supplychain/sign/{bucket}/{key})
pub async fn list_signatures(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Json<Vec<SignatureResponse>>> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let records = state
        .supply_chain
        .list_signatures(&bucket, &key)?
        .into_iter()
        .map(SignatureResponse::from)
        .collect();
    Ok(Json(records))
}

/// Verify all signatures (POST /supplychain/verify/{bucket}/{key})
pub async fn verify_artifact(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Json<VerifyResponse>> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let start = Instant::now();

    let result = state
        .supply_chain
        .verify_artifact(&CancellationToken::new(), &bucket, &key)
        .await;

    record_verification(result.as_ref().map(|r| r.all_valid).unwrap_or(false));
    observe_supplychain_duration("verify", start.elapsed());
    let verification = result?;
    Ok(Json(VerifyResponse {
        valid: verification.all_valid,
        artifact_ref: verification.artifact_ref,
        results: verification.results,
    }))
}

// ============================================================================
// SBOM
// ============================================================================

/// Attach an SBOM; the body is the document
/// (POST /supplychain/sbom/{bucket}/{key}?format=&version=)
pub async fn attach_sbom(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<SbomParams>,
    principal: Option<axum::Extension<Principal>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SbomRecord>)> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let format = params.format.unwrap_or_default();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let start = Instant::now();

    let result = state.supply_chain.attach_sbom(
        &bucket,
        &key,
        &format,
        params.version.unwrap_or_default(),
        body.to_vec(),
        content_type,
        &actor(principal.as_deref()),
    );

    record_sbom(&format, result.is_ok());
    observe_supplychain_duration("sbom", start.elapsed());
    let attachment = result?;

    if let Some(replaced) = &attachment.replaced {
        // Replacements are worth an explicit audit trail entry beyond
        // the request-level one
        state.audit.record(depot_auth::AuditEvent {
            user_id: actor(principal.as_deref()),
            username: actor(principal.as_deref()),
            method: "REPLACE_SBOM".to_string(),
            resource: attachment.record.artifact_ref.clone(),
            status: 200,
            ip: String::new(),
            user_agent: String::new(),
            error_message: Some(format!("replaced sbom {}", replaced.id)),
        });
    }

    Ok((StatusCode::CREATED, Json(attachment.record)))
}

/// Fetch the SBOM (GET /supplychain/sbom/{bucket}/{key})
pub async fn get_sbom(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Json<SbomRecord>> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    Ok(Json(state.supply_chain.get_sbom(&bucket, &key)?))
}

// ============================================================================
// Attestations
// ============================================================================

/// Add an attestation (POST /supplychain/attestations/{bucket}/{key})
pub async fn add_attestation(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    principal: Option<axum::Extension<Principal>>,
    Json(request): Json<AttestationRequest>,
) -> ApiResult<(StatusCode, Json<AttestationRecord>)> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let signature = request
        .signature
        .map(|raw| {
            base64::engine::general_purpose::STANDARD
                .decode(&raw)
                .map_err(|err| {
                    ApiError(
                        Error::bad_request("signature is not valid base64")
                            .with_detail("field", "signature")
                            .with_source(err),
                    )
                })
        })
        .transpose()?;
    let start = Instant::now();

    let result = state.supply_chain.add_attestation(
        &bucket,
        &key,
        &request.attestation_type,
        request.predicate_type,
        request.predicate,
        signature,
        &actor(principal.as_deref()),
    );

    record_attestation(&request.attestation_type, result.is_ok());
    observe_supplychain_duration("attestation", start.elapsed());
    let record = result?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// List attestations (GET /supplychain/attestations/{bucket}/{key})
pub async fn list_attestations(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Json<Vec<AttestationRecord>>> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    Ok(Json(state.supply_chain.list_attestations(&bucket, &key)?))
}
