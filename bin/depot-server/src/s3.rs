//! S3-compatible API handlers

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use depot_common::{Artifact, BucketName, Error, ObjectKey};
use depot_engine::multipart::CompletedPart;
use depot_engine::parse_range_header;
use depot_observe::metrics::observe_artifact_size;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) fn parse_bucket(name: &str) -> Result<BucketName, ApiError> {
    BucketName::new(name).map_err(|err| {
        Error::bad_request(format!("invalid bucket name: {err}"))
            .with_detail("field", "bucket")
            .with_detail("reason", err.to_string())
            .into()
    })
}

pub(crate) fn parse_key(key: &str) -> Result<ObjectKey, ApiError> {
    ObjectKey::new(key).map_err(|err| {
        Error::bad_request(format!("invalid object key: {err}"))
            .with_detail("field", "key")
            .with_detail("reason", err.to_string())
            .into()
    })
}

fn parse_upload_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        Error::bad_request(format!("invalid upload id: {raw}"))
            .with_detail("field", "uploadId")
            .into()
    })
}

/// Capture `X-Amz-Meta-*` headers, stripped of their prefix
fn extract_user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_lowercase();
        if let Some(stripped) = name.strip_prefix("x-amz-meta-") {
            if let Ok(value) = value.to_str() {
                metadata.insert(stripped.to_string(), value.to_string());
            }
        }
    }
    metadata
}

fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn quoted(etag: &str) -> String {
    format!("\"{etag}\"")
}

/// Common object headers for GET and HEAD responses
fn object_headers(
    mut builder: axum::http::response::Builder,
    artifact: &Artifact,
) -> axum::http::response::Builder {
    builder = builder
        .header(header::CONTENT_TYPE, &artifact.content_type)
        .header(header::ETAG, quoted(&artifact.etag))
        .header(header::LAST_MODIFIED, http_date(artifact.updated_at))
        .header("X-Content-SHA256", &artifact.content_digest);
    for (key, value) in &artifact.custom_headers {
        builder = builder.header(format!("x-amz-meta-{key}"), value);
    }
    builder
}

fn empty_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub object_count: u64,
    pub total_bytes: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
}

impl From<&Artifact> for ObjectSummary {
    fn from(artifact: &Artifact) -> Self {
        Self {
            key: artifact.key.as_str().to_string(),
            size: artifact.size,
            etag: artifact.etag.clone(),
            last_modified: artifact.updated_at,
            content_type: artifact.content_type.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsResponse {
    pub bucket: String,
    pub prefix: String,
    pub objects: Vec<ObjectSummary>,
    pub is_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListObjectsParams {
    prefix: Option<String>,
    #[serde(rename = "max-keys")]
    max_keys: Option<usize>,
    marker: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteBucketParams {
    /// Presence (even empty) requests recursive deletion
    recursive: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PutObjectParams {
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    part_number: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PostObjectParams {
    /// If present (even empty), initiate a multipart upload
    uploads: Option<String>,
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteObjectParams {
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateMultipartResponse {
    pub bucket: String,
    pub key: String,
    pub upload_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartResponse {
    pub etag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    pub parts: Vec<CompletePartRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePartRequest {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartResponse {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
}

// ============================================================================
// Bucket handlers
// ============================================================================

/// List all buckets (GET /s3)
pub async fn list_buckets(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BucketSummary>>> {
    let buckets = state
        .engine
        .list_buckets()?
        .into_iter()
        .map(|bucket| BucketSummary {
            name: bucket.name.as_str().to_string(),
            created_at: bucket.created_at,
            object_count: bucket.object_count,
            total_bytes: bucket.total_bytes,
        })
        .collect();
    Ok(Json(buckets))
}

/// Create bucket (PUT /s3/{bucket})
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    state
        .engine
        .create_bucket(&CancellationToken::new(), &bucket)
        .await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::LOCATION, format!("/s3/{bucket}"))
        .body(Body::empty())
        .unwrap_or_default())
}

/// Delete bucket (DELETE /s3/{bucket}, `?recursive` to empty it first)
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    Query(params): Query<DeleteBucketParams>,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    state
        .engine
        .delete_bucket(&CancellationToken::new(), &bucket, params.recursive.is_some())
        .await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

/// Head bucket (HEAD /s3/{bucket})
pub async fn head_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    state.engine.head_bucket(&bucket)?;
    Ok(empty_response(StatusCode::OK))
}

/// List objects (GET /s3/{bucket}?prefix=&max-keys=&marker=)
pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    Query(params): Query<ListObjectsParams>,
) -> ApiResult<Json<ListObjectsResponse>> {
    let bucket = parse_bucket(&bucket)?;
    let prefix = params.prefix.unwrap_or_default();
    let listing = state.engine.list_objects(
        &bucket,
        &prefix,
        params.marker.as_deref(),
        params.max_keys,
    )?;

    Ok(Json(ListObjectsResponse {
        bucket: bucket.as_str().to_string(),
        prefix,
        objects: listing.objects.iter().map(ObjectSummary::from).collect(),
        is_truncated: listing.truncated,
        next_marker: listing.next_marker,
    }))
}

// ============================================================================
// Object handlers
// ============================================================================

/// Put object, upload part, or server-side copy
/// (PUT /s3/{bucket}/{key}[?uploadId=&partNumber=])
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<PutObjectParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let token = CancellationToken::new();

    // Multipart part upload
    if let Some(upload_id) = &params.upload_id {
        let upload_id = parse_upload_id(upload_id)?;
        let part_number = params.part_number.ok_or_else(|| {
            ApiError(
                Error::bad_request("partNumber is required with uploadId")
                    .with_detail("field", "partNumber"),
            )
        })?;
        let etag = state
            .engine
            .upload_part(&token, upload_id, part_number, body)
            .await?;
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, quoted(&etag))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&UploadPartResponse { etag }).unwrap_or_default()))
            .unwrap_or_default());
    }

    // Server-side copy
    if let Some(source) = headers.get("x-amz-copy-source").and_then(|v| v.to_str().ok()) {
        let decoded = urlencoding::decode(source).unwrap_or_else(|_| source.into());
        let trimmed = decoded.trim_start_matches('/');
        let (src_bucket, src_key) = trimmed.split_once('/').ok_or_else(|| {
            ApiError(
                Error::bad_request("x-amz-copy-source must be <bucket>/<key>")
                    .with_detail("field", "x-amz-copy-source"),
            )
        })?;
        let src_bucket = parse_bucket(src_bucket)?;
        let src_key = parse_key(src_key)?;

        let artifact = state
            .engine
            .copy_object(&token, &src_bucket, &src_key, &bucket, &key)
            .await?;
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, quoted(&artifact.etag))
            .body(Body::empty())
            .unwrap_or_default());
    }

    // Single-shot PUT
    let artifact = state
        .engine
        .put_object(
            &token,
            &bucket,
            &key,
            body,
            content_type_of(&headers),
            extract_user_metadata(&headers),
        )
        .await?;
    observe_artifact_size(artifact.size);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, quoted(&artifact.etag))
        .body(Body::empty())
        .unwrap_or_default())
}

/// Get object, honoring a single `Range: bytes=a-b` (GET /s3/{bucket}/{key})
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let token = CancellationToken::new();

    let artifact = state.engine.head_object(&bucket, &key)?;
    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => parse_range_header(value, artifact.size)?,
        None => None,
    };

    let result = state.engine.get_object(&token, &bucket, &key, range).await?;

    let mut builder = object_headers(Response::builder(), &result.artifact);
    builder = match result.range {
        Some(range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_LENGTH, range.length())
            .header(header::CONTENT_RANGE, range.content_range(result.artifact.size)),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, result.artifact.size),
    };

    builder
        .body(Body::from_stream(ReaderStream::new(result.reader)))
        .map_err(|err| ApiError(Error::internal("response build failed").with_source(err)))
}

/// Metadata only (HEAD /s3/{bucket}/{key})
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let artifact = state.engine.head_object(&bucket, &key)?;

    object_headers(Response::builder(), &artifact)
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, artifact.size)
        .body(Body::empty())
        .map_err(|err| ApiError(Error::internal("response build failed").with_source(err)))
}

/// Idempotent delete or multipart abort
/// (DELETE /s3/{bucket}/{key}[?uploadId=])
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<DeleteObjectParams>,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let token = CancellationToken::new();

    if let Some(upload_id) = &params.upload_id {
        let upload_id = parse_upload_id(upload_id)?;
        state.engine.abort_multipart(&token, upload_id).await?;
        return Ok(empty_response(StatusCode::NO_CONTENT));
    }

    state.engine.delete_object(&token, &bucket, &key).await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

/// Initiate (POST ?uploads) or complete (POST ?uploadId=) a multipart
/// upload
pub async fn post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<PostObjectParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let bucket = parse_bucket(&bucket)?;
    let key = parse_key(&key)?;
    let token = CancellationToken::new();

    if params.uploads.is_some() {
        let session = state.engine.initiate_multipart(
            &bucket,
            &key,
            content_type_of(&headers),
            extract_user_metadata(&headers),
        )?;
        let response = InitiateMultipartResponse {
            bucket: bucket.as_str().to_string(),
            key: key.as_str().to_string(),
            upload_id: session.upload_id,
        };
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&response).unwrap_or_default()))
            .unwrap_or_default());
    }

    if let Some(upload_id) = &params.upload_id {
        let upload_id = parse_upload_id(upload_id)?;
        let request: CompleteMultipartRequest = serde_json::from_slice(&body).map_err(|err| {
            ApiError(
                Error::bad_request("invalid complete-multipart body")
                    .with_detail("reason", err.to_string()),
            )
        })?;
        let parts: Vec<CompletedPart> = request
            .parts
            .into_iter()
            .map(|part| CompletedPart {
                part_number: part.part_number,
                etag: part.etag,
            })
            .collect();

        let artifact = state
            .engine
            .complete_multipart(&token, upload_id, &parts)
            .await?;
        observe_artifact_size(artifact.size);

        let response = CompleteMultipartResponse {
            bucket: bucket.as_str().to_string(),
            key: key.as_str().to_string(),
            etag: artifact.etag.clone(),
            size: artifact.size,
        };
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, quoted(&artifact.etag))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&response).unwrap_or_default()))
            .unwrap_or_default());
    }

    Err(ApiError(Error::bad_request(
        "POST on an object requires ?uploads or ?uploadId",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_metadata_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-meta-build", "42".parse().unwrap());
        headers.insert("X-Amz-Meta-Commit", "abc123".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());

        let metadata = extract_user_metadata(&headers);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.get("build").map(String::as_str), Some("42"));
        assert_eq!(metadata.get("commit").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_http_date_format() {
        let at = DateTime::parse_from_rfc3339("1994-11-06T08:49:37Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(http_date(at), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_bucket_validation_details() {
        let err = parse_bucket("Bad_Bucket").unwrap_err().0;
        assert_eq!(err.kind(), depot_common::ErrorKind::BadRequest);
        assert_eq!(err.details().get("field").map(String::as_str), Some("bucket"));
    }
}
