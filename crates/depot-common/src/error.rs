//! Error types for Depot
//!
//! This module defines the common error type used throughout the system:
//! a closed set of wire-visible error codes, each mapped to a category,
//! an HTTP status, and a retryability flag via fixed tables.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Common result type for Depot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of wire-visible error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Client errors
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    EntityTooLarge,
    InvalidRange,
    PreconditionFailed,

    // Server errors
    Internal,
    NotImplemented,
    ServiceUnavailable,
    GatewayTimeout,

    // Storage errors
    StorageFailure,
    StorageUnavailable,
    QuotaExceeded,

    // Metadata errors
    MetadataCorrupted,
    MetadataLocked,

    // Network errors
    NetworkTimeout,
    NetworkUnreachable,
    ConnectionReset,

    // Auth errors
    TokenExpired,
    TokenInvalid,
    InsufficientPermissions,

    // Supply-chain errors
    SignatureInvalid,
    VerificationFailed,
    SbomInvalid,
}

/// Broad error category used by the reliability layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Client,
    Server,
    Transient,
    Permanent,
}

impl ErrorKind {
    /// Wire code emitted in JSON error bodies
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::EntityTooLarge => "entity_too_large",
            Self::InvalidRange => "invalid_range",
            Self::PreconditionFailed => "precondition_failed",
            Self::Internal => "internal_error",
            Self::NotImplemented => "not_implemented",
            Self::ServiceUnavailable => "service_unavailable",
            Self::GatewayTimeout => "gateway_timeout",
            Self::StorageFailure => "storage_failure",
            Self::StorageUnavailable => "storage_unavailable",
            Self::QuotaExceeded => "quota_exceeded",
            Self::MetadataCorrupted => "metadata_corrupted",
            Self::MetadataLocked => "metadata_locked",
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkUnreachable => "network_unreachable",
            Self::ConnectionReset => "connection_reset",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::SignatureInvalid => "signature_invalid",
            Self::VerificationFailed => "verification_failed",
            Self::SbomInvalid => "sbom_invalid",
        }
    }

    /// Category for the reliability layer
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::BadRequest
            | Self::Unauthorized
            | Self::Forbidden
            | Self::NotFound
            | Self::Conflict
            | Self::EntityTooLarge
            | Self::InvalidRange
            | Self::PreconditionFailed
            | Self::TokenExpired
            | Self::TokenInvalid
            | Self::InsufficientPermissions
            | Self::SignatureInvalid
            | Self::SbomInvalid => ErrorCategory::Client,

            Self::Internal
            | Self::NotImplemented
            | Self::StorageFailure
            | Self::MetadataCorrupted
            | Self::VerificationFailed => ErrorCategory::Server,

            Self::ServiceUnavailable
            | Self::GatewayTimeout
            | Self::StorageUnavailable
            | Self::MetadataLocked
            | Self::NetworkTimeout
            | Self::NetworkUnreachable
            | Self::ConnectionReset => ErrorCategory::Transient,

            Self::QuotaExceeded => ErrorCategory::Permanent,
        }
    }

    /// HTTP status code for the dispatcher
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized | Self::TokenExpired | Self::TokenInvalid => 401,
            Self::Forbidden | Self::InsufficientPermissions => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::EntityTooLarge => 413,
            Self::InvalidRange => 416,
            Self::SignatureInvalid | Self::VerificationFailed | Self::SbomInvalid => 422,
            Self::Internal | Self::StorageFailure | Self::MetadataCorrupted => 500,
            Self::NotImplemented => 501,
            Self::NetworkUnreachable | Self::ConnectionReset => 502,
            Self::ServiceUnavailable | Self::StorageUnavailable | Self::MetadataLocked => 503,
            Self::GatewayTimeout | Self::NetworkTimeout => 504,
            Self::QuotaExceeded => 507,
        }
    }

    /// Whether the retry layer may re-attempt an operation that failed
    /// with this kind. Transient kinds retry, plus the server-side
    /// storage and internal codes.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
            || matches!(self, Self::Internal | Self::StorageFailure)
    }
}

/// Common error type for Depot
///
/// Carries a kind from the closed set, a human message, a detail map
/// populated at the failure site, and an optional underlying cause.
/// Causes are preserved for logs and never emitted to clients.
#[derive(Debug, Error)]
#[error("{}: {message}", .kind.code())]
pub struct Error {
    kind: ErrorKind,
    message: String,
    details: BTreeMap<String, String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create a new error with the given kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
            source: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRange, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageFailure, message)
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageUnavailable, message)
    }

    pub fn metadata_corrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MetadataCorrupted, message)
    }

    pub fn token_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TokenInvalid, message)
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TokenExpired, message)
    }

    pub fn signature_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SignatureInvalid, message)
    }

    pub fn sbom_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SbomInvalid, message)
    }

    /// Content digest disagreed with the stored hash. The closed code
    /// set folds this into `verification_failed` (422) with the
    /// expected/actual digests in the detail map.
    pub fn checksum_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::new(ErrorKind::VerificationFailed, "checksum mismatch")
            .with_detail("expected", expected)
            .with_detail("actual", actual)
    }

    /// The request context was cancelled. Surfaced with a marker detail
    /// so the retry loop and circuit breaker can tell cancellation
    /// apart from a genuine timeout.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::GatewayTimeout, "operation cancelled").with_detail("cancelled", "true")
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.details.get("cancelled").is_some_and(|v| v == "true")
    }

    /// A circuit breaker rejected the call while open. Marked so the
    /// outer retryer treats it as non-retryable and avoids storms.
    pub fn circuit_open(dependency: &str) -> Self {
        Self::new(
            ErrorKind::ServiceUnavailable,
            format!("circuit breaker for {dependency} is open"),
        )
        .with_detail("circuit_open", "true")
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        self.details.get("circuit_open").is_some_and(|v| v == "true")
    }

    /// Attach a detail key/value populated at the failure site
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause, preserved for logs only
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Re-wrap this error under a different kind, keeping it as the cause
    #[must_use]
    pub fn wrap(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
            source: Some(Box::new(self)),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Mark this error so the retry layer will not re-attempt it even
    /// when its kind is normally retryable (e.g. a failed streaming
    /// write whose payload cannot be replayed).
    #[must_use]
    pub fn into_non_retryable(self) -> Self {
        self.with_detail("no_retry", "true")
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !self.details.contains_key("no_retry")
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }

    /// JSON body emitted to clients: `{code, message, details?}`
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.kind.code(),
            message: self.message.clone(),
            details: if self.details.is_empty() {
                None
            } else {
                Some(self.details.clone())
            },
        }
    }
}

/// Wire shape of an error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::NetworkTimeout,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                ErrorKind::ConnectionReset
            }
            // Verifying readers surface digest mismatches as InvalidData
            std::io::ErrorKind::InvalidData => ErrorKind::VerificationFailed,
            _ => ErrorKind::StorageFailure,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_table() {
        assert!(ErrorKind::NetworkTimeout.is_retryable());
        assert!(ErrorKind::StorageUnavailable.is_retryable());
        assert!(ErrorKind::StorageFailure.is_retryable());
        assert!(ErrorKind::Internal.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::TokenExpired.is_retryable());
        assert!(!ErrorKind::QuotaExceeded.is_retryable());
    }

    #[test]
    fn test_http_status_table() {
        assert_eq!(ErrorKind::BadRequest.http_status(), 400);
        assert_eq!(ErrorKind::TokenExpired.http_status(), 401);
        assert_eq!(ErrorKind::InsufficientPermissions.http_status(), 403);
        assert_eq!(ErrorKind::InvalidRange.http_status(), 416);
        assert_eq!(ErrorKind::VerificationFailed.http_status(), 422);
        assert_eq!(ErrorKind::StorageUnavailable.http_status(), 503);
    }

    #[test]
    fn test_category_table() {
        assert_eq!(ErrorKind::NotFound.category(), ErrorCategory::Client);
        assert_eq!(ErrorKind::Internal.category(), ErrorCategory::Server);
        assert_eq!(ErrorKind::NetworkTimeout.category(), ErrorCategory::Transient);
        assert_eq!(ErrorKind::QuotaExceeded.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_details_and_body() {
        let err = Error::bad_request("invalid bucket name")
            .with_detail("field", "bucket")
            .with_detail("reason", "pattern mismatch");
        let body = err.to_body();
        assert_eq!(body.code, "bad_request");
        let details = body.details.expect("details present");
        assert_eq!(details.get("field").map(String::as_str), Some("bucket"));
    }

    #[test]
    fn test_cause_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk exploded");
        let err = Error::storage("write failed").with_source(io);
        let source = std::error::Error::source(&err).expect("source kept");
        assert!(source.to_string().contains("disk exploded"));
    }

    #[test]
    fn test_checksum_mismatch_is_422() {
        let err = Error::checksum_mismatch("aa", "bb");
        assert_eq!(err.http_status(), 422);
        assert!(!err.is_retryable());
    }
}
