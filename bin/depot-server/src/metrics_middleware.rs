//! Metrics middleware
//!
//! Classifies each request into an operation, records the fixed metric
//! families, and tracks the active-connection gauge. Metrics and health
//! endpoints are not themselves measured.

use axum::{body::Body, extract::Request, http::Method, middleware::Next, response::Response};
use depot_observe::metrics::{
    connection_closed, connection_opened, observe_artifact_duration, record_delete,
    record_download, record_request, record_upload,
};
use std::time::Instant;

/// Artifact-level operation derived from method and path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ListBuckets,
    CreateBucket,
    DeleteBucket,
    HeadBucket,
    ListObjects,
    PutObject,
    GetObject,
    HeadObject,
    DeleteObject,
    SupplyChain,
    Rbac,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::ListBuckets => "list_buckets",
            Self::CreateBucket => "create_bucket",
            Self::DeleteBucket => "delete_bucket",
            Self::HeadBucket => "head_bucket",
            Self::ListObjects => "list_objects",
            Self::PutObject => "put_object",
            Self::GetObject => "get_object",
            Self::HeadObject => "head_object",
            Self::DeleteObject => "delete_object",
            Self::SupplyChain => "supplychain",
            Self::Rbac => "rbac",
        }
    }
}

/// Route template for the `endpoint` label, keeping cardinality bounded
fn classify(method: &Method, path: &str) -> Option<(Operation, &'static str, Option<String>)> {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (m, ["s3"]) if m == Method::GET => Some((Operation::ListBuckets, "/s3", None)),
        (m, ["s3", bucket]) => {
            let bucket = Some((*bucket).to_string());
            if *m == Method::GET {
                Some((Operation::ListObjects, "/s3/{bucket}", bucket))
            } else if *m == Method::PUT {
                Some((Operation::CreateBucket, "/s3/{bucket}", bucket))
            } else if *m == Method::DELETE {
                Some((Operation::DeleteBucket, "/s3/{bucket}", bucket))
            } else if *m == Method::HEAD {
                Some((Operation::HeadBucket, "/s3/{bucket}", bucket))
            } else {
                None
            }
        }
        (m, ["s3", bucket, ..]) => {
            let bucket = Some((*bucket).to_string());
            if *m == Method::GET {
                Some((Operation::GetObject, "/s3/{bucket}/{key}", bucket))
            } else if *m == Method::PUT || *m == Method::POST {
                Some((Operation::PutObject, "/s3/{bucket}/{key}", bucket))
            } else if *m == Method::HEAD {
                Some((Operation::HeadObject, "/s3/{bucket}/{key}", bucket))
            } else if *m == Method::DELETE {
                Some((Operation::DeleteObject, "/s3/{bucket}/{key}", bucket))
            } else {
                None
            }
        }
        (_, ["supplychain", ..]) => Some((Operation::SupplyChain, "/supplychain", None)),
        (_, ["rbac", ..]) => Some((Operation::Rbac, "/rbac", None)),
        _ => None,
    }
}

fn content_type_label(headers: &axum::http::HeaderMap) -> String {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| "application/octet-stream".to_string(), |v| {
            v.split(';').next().unwrap_or(v).to_string()
        })
}

pub async fn metrics_layer(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if path == "/metrics" || path == "/health" || path.starts_with("/health/") {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().clone();
    let classified = classify(&method, &path);
    let request_content_type = content_type_label(request.headers());

    connection_opened();
    let response = next.run(request).await;
    connection_closed();

    let status = response.status().as_u16();
    let success = response.status().is_success();

    if let Some((operation, endpoint, bucket)) = classified {
        record_request(method.as_str(), endpoint, status);
        observe_artifact_duration(operation.as_str(), start.elapsed());

        if let Some(bucket) = bucket {
            match operation {
                Operation::PutObject => record_upload(&bucket, &request_content_type, success),
                Operation::GetObject => {
                    record_download(&bucket, &content_type_label(response.headers()), success);
                }
                Operation::DeleteObject => {
                    record_delete(&bucket, "application/octet-stream", success);
                }
                _ => {}
            }
        }
    } else {
        record_request(method.as_str(), "unmatched", status);
    }

    response
}
