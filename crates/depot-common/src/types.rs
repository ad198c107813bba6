//! Core type definitions for Depot
//!
//! This module defines the fundamental types used throughout the system:
//! validated identifiers, artifact metadata records, policies, and the
//! supply-chain record types.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Name of a bucket
///
/// Must match `^[a-z0-9][a-z0-9-]*[a-z0-9]$` and be 3-63 bytes long.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BucketName(String);

impl BucketName {
    /// Create a new bucket name, validating the naming rules
    pub fn new(name: impl Into<String>) -> Result<Self, BucketNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the bucket name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), BucketNameError> {
        if name.len() < 3 {
            return Err(BucketNameError::TooShort);
        }
        if name.len() > 63 {
            return Err(BucketNameError::TooLong);
        }

        let first = name.chars().next().unwrap();
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(BucketNameError::InvalidStartChar);
        }

        let last = name.chars().last().unwrap();
        if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
            return Err(BucketNameError::InvalidEndChar);
        }

        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
                return Err(BucketNameError::InvalidChar(c));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketName({:?})", self.0)
    }
}

/// Errors that can occur when creating a bucket name
#[derive(Debug, Clone, thiserror::Error)]
pub enum BucketNameError {
    #[error("bucket name must be at least 3 characters")]
    TooShort,
    #[error("bucket name must be at most 63 characters")]
    TooLong,
    #[error("bucket name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("bucket name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("bucket name contains invalid character: {0}")]
    InvalidChar(char),
}

/// Object key (path within a bucket)
///
/// An opaque UTF-8 path. `/` is allowed; `..` and `.` segments are kept
/// as literal text and never resolved against the filesystem.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create a new object key
    pub fn new(key: impl Into<String>) -> Result<Self, ObjectKeyError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the object key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), ObjectKeyError> {
        if key.is_empty() {
            return Err(ObjectKeyError::Empty);
        }
        if key.len() > 1024 {
            return Err(ObjectKeyError::TooLong);
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({:?})", self.0)
    }
}

/// Errors that can occur when creating an object key
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key cannot exceed 1024 bytes")]
    TooLong,
}

/// Reference to an artifact as `<bucket>/<key>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub bucket: BucketName,
    pub key: ObjectKey,
}

impl ArtifactRef {
    #[must_use]
    pub const fn new(bucket: BucketName, key: ObjectKey) -> Self {
        Self { bucket, key }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Bucket metadata record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: BucketName,
    pub created_at: DateTime<Utc>,
    /// Reserved; versioned object history is not implemented
    pub versioning: bool,
    pub object_count: u64,
    pub total_bytes: u64,
}

impl Bucket {
    #[must_use]
    pub fn new(name: BucketName) -> Self {
        Self {
            name,
            created_at: Utc::now(),
            versioning: false,
            object_count: 0,
            total_bytes: 0,
        }
    }
}

/// Artifact (object) metadata record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub bucket: BucketName,
    pub key: ObjectKey,
    pub size: u64,
    pub content_type: String,
    /// Hex SHA-256 of the stored bytes, verified end-to-end on read
    pub content_digest: String,
    /// Hex MD5 for single-part uploads; composite `<md5>-N` for multipart
    pub etag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Captured `X-Amz-Meta-*` headers, without the prefix
    pub custom_headers: HashMap<String, String>,
    /// Path of the payload within the backend
    pub storage_path: String,
    /// Present when the artifact was assembled from a multipart session
    pub multipart_id: Option<Uuid>,
}

impl Artifact {
    #[must_use]
    pub fn artifact_ref(&self) -> ArtifactRef {
        ArtifactRef::new(self.bucket.clone(), self.key.clone())
    }
}

/// A single uploaded part within a multipart session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Hex MD5 of the part bytes
    pub etag: String,
    pub size: u64,
    /// Byte offset of this part within the assembled object
    pub offset: u64,
}

/// Multipart upload session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartSession {
    pub upload_id: Uuid,
    pub bucket: BucketName,
    pub key: ObjectKey,
    pub initiated_at: DateTime<Utc>,
    pub content_type: String,
    pub custom_headers: HashMap<String, String>,
    /// Parts keyed by part number, 1..=10000
    pub parts: BTreeMap<u32, PartInfo>,
}

/// Inclusive part number bounds for multipart uploads
pub const MIN_PART_NUMBER: u32 = 1;
pub const MAX_PART_NUMBER: u32 = 10_000;

impl MultipartSession {
    #[must_use]
    pub fn new(
        bucket: BucketName,
        key: ObjectKey,
        content_type: String,
        custom_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            upload_id: Uuid::new_v4(),
            bucket,
            key,
            initiated_at: Utc::now(),
            content_type,
            custom_headers,
            parts: BTreeMap::new(),
        }
    }
}

/// Authorization action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Delete,
    List,
    Admin,
}

impl Action {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy effect
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// Reference to a principal: a user, role, group, or everyone
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrincipalRef {
    User(String),
    Role(String),
    Group(String),
    Wildcard,
}

impl TryFrom<String> for PrincipalRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "*" {
            return Ok(Self::Wildcard);
        }
        if let Some(id) = value.strip_prefix("user:") {
            return Ok(Self::User(id.to_string()));
        }
        if let Some(name) = value.strip_prefix("role:") {
            return Ok(Self::Role(name.to_string()));
        }
        if let Some(name) = value.strip_prefix("group:") {
            return Ok(Self::Group(name.to_string()));
        }
        Err(format!(
            "invalid principal reference: {value} (expected user:<id>, role:<name>, group:<name>, or *)"
        ))
    }
}

impl From<PrincipalRef> for String {
    fn from(p: PrincipalRef) -> Self {
        p.to_string()
    }
}

impl fmt::Display for PrincipalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Role(name) => write!(f, "role:{name}"),
            Self::Group(name) => write!(f, "group:{name}"),
            Self::Wildcard => f.write_str("*"),
        }
    }
}

/// Authorization policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    /// Glob-style resource pattern; `*` spans path segments
    pub resource_pattern: String,
    pub actions: BTreeSet<Action>,
    pub effect: Effect,
    pub principals: Vec<PrincipalRef>,
    /// Reserved; condition evaluation is not implemented
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub username: String,
    pub method: String,
    pub resource: String,
    pub status: u16,
    pub ip: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Detached artifact signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub id: Uuid,
    pub artifact_ref: String,
    /// Always "RSA-SHA256"
    pub algorithm: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub public_key_pem: String,
    pub signed_by: String,
    pub signed_at: DateTime<Utc>,
}

/// SBOM document format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SbomFormat {
    Spdx,
    Cyclonedx,
}

impl SbomFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spdx => "spdx",
            Self::Cyclonedx => "cyclonedx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spdx" => Some(Self::Spdx),
            "cyclonedx" => Some(Self::Cyclonedx),
            _ => None,
        }
    }
}

impl fmt::Display for SbomFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Software Bill of Materials attached to an artifact (at most one)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomRecord {
    pub id: Uuid,
    pub artifact_ref: String,
    pub format: SbomFormat,
    pub version: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub content_type: String,
    /// Hex SHA-256 of the document bytes
    pub content_digest: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Attestation type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationType {
    Build,
    Test,
    Scan,
    Deploy,
    Provenance,
}

impl AttestationType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Scan => "scan",
            Self::Deploy => "deploy",
            Self::Provenance => "provenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build" => Some(Self::Build),
            "test" => Some(Self::Test),
            "scan" => Some(Self::Scan),
            "deploy" => Some(Self::Deploy),
            "provenance" => Some(Self::Provenance),
            _ => None,
        }
    }
}

impl fmt::Display for AttestationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed claim about an artifact (many per artifact)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub id: Uuid,
    pub artifact_ref: String,
    #[serde(rename = "type")]
    pub attestation_type: AttestationType,
    /// Predicate type URI, e.g. `https://slsa.dev/provenance/v1`
    pub predicate_type: String,
    /// Opaque structured predicate, stored as-is
    pub predicate: serde_json::Value,
    #[serde(with = "base64_bytes_opt", default)]
    pub signature: Option<Vec<u8>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Serde helpers rendering binary fields as base64 strings on the wire
mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        match bytes {
            Some(b) => ser.serialize_some(&base64::engine::general_purpose::STANDARD.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        use base64::Engine;
        let s = Option::<String>::deserialize(de)?;
        s.map(|s| {
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_valid() {
        assert!(BucketName::new("releases").is_ok());
        assert!(BucketName::new("my-bucket").is_ok());
        assert!(BucketName::new("bucket123").is_ok());
    }

    #[test]
    fn test_bucket_name_invalid() {
        assert!(BucketName::new("ab").is_err()); // Too short
        assert!(BucketName::new("-bucket").is_err()); // Invalid start
        assert!(BucketName::new("bucket-").is_err()); // Invalid end
        assert!(BucketName::new("Bucket").is_err()); // Uppercase
        assert!(BucketName::new("a.b.c").is_err()); // Periods not allowed
    }

    #[test]
    fn test_object_key_literal_dots() {
        // Relative segments are accepted as literal text
        let key = ObjectKey::new("a/../b/./c").unwrap();
        assert_eq!(key.as_str(), "a/../b/./c");
    }

    #[test]
    fn test_object_key_bounds() {
        assert!(ObjectKey::new("").is_err());
        assert!(ObjectKey::new("x".repeat(1025)).is_err());
        assert!(ObjectKey::new("x".repeat(1024)).is_ok());
    }

    #[test]
    fn test_artifact_ref_display() {
        let r = ArtifactRef::new(
            BucketName::new_unchecked("releases"),
            ObjectKey::new_unchecked("app/v1/app.bin"),
        );
        assert_eq!(r.to_string(), "releases/app/v1/app.bin");
    }

    #[test]
    fn test_principal_ref_round_trip() {
        for s in ["user:alice", "role:dev", "group:build", "*"] {
            let p = PrincipalRef::try_from(s.to_string()).unwrap();
            assert_eq!(p.to_string(), s);
        }
        assert!(PrincipalRef::try_from("alice".to_string()).is_err());
    }

    #[test]
    fn test_sbom_format_parse() {
        assert_eq!(SbomFormat::parse("spdx"), Some(SbomFormat::Spdx));
        assert_eq!(SbomFormat::parse("cyclonedx"), Some(SbomFormat::Cyclonedx));
        assert_eq!(SbomFormat::parse("swid"), None);
    }

    #[test]
    fn test_signature_record_base64_wire_shape() {
        let record = SignatureRecord {
            id: Uuid::new_v4(),
            artifact_ref: "releases/app.bin".to_string(),
            algorithm: "RSA-SHA256".to_string(),
            signature: vec![1, 2, 3],
            public_key_pem: "-----BEGIN PUBLIC KEY-----".to_string(),
            signed_by: "alice".to_string(),
            signed_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["signature"], "AQID");
    }
}
