//! Typed attestations
//!
//! Structured claims about an artifact: a type from the closed set, a
//! predicate-type URI, and an opaque JSON predicate stored as-is. Many
//! attestations may attach to one artifact; a detached signature is
//! optional.

use crate::SupplyChainService;
use chrono::Utc;
use depot_common::{
    AttestationRecord, AttestationType, BucketName, Error, ObjectKey, Result,
};
use uuid::Uuid;

impl SupplyChainService {
    pub fn add_attestation(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
        attestation_type: &str,
        predicate_type: String,
        predicate: serde_json::Value,
        signature: Option<Vec<u8>>,
        created_by: &str,
    ) -> Result<AttestationRecord> {
        let attestation_type = AttestationType::parse(attestation_type).ok_or_else(|| {
            Error::bad_request(format!("unknown attestation type: {attestation_type}"))
                .with_detail("field", "type")
        })?;
        if !self
            .config()
            .allowed_attestation_types
            .contains(&attestation_type)
        {
            return Err(Error::bad_request(format!(
                "attestation type {attestation_type} is not allowed"
            ))
            .with_detail("type", attestation_type.as_str()));
        }
        if predicate_type.is_empty() {
            return Err(
                Error::bad_request("predicate type is empty").with_detail("field", "predicate_type")
            );
        }

        let artifact = self.engine().head_object(bucket, key)?;
        let record = AttestationRecord {
            id: Uuid::new_v4(),
            artifact_ref: artifact.artifact_ref().to_string(),
            attestation_type,
            predicate_type,
            predicate,
            signature,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };
        self.meta().put_attestation(&record)?;
        Ok(record)
    }

    pub fn list_attestations(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<Vec<AttestationRecord>> {
        let artifact = self.engine().head_object(bucket, key)?;
        self.meta()
            .list_attestations(&artifact.artifact_ref().to_string())
    }
}
