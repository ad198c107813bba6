//! SBOM attachment
//!
//! SPDX and CycloneDX documents are stored as opaque bytes with their
//! SHA-256. At most one SBOM per artifact; a resubmission replaces the
//! previous document, and callers surface the replacement in audit.

use crate::SupplyChainService;
use chrono::Utc;
use depot_common::{BucketName, Error, ObjectKey, Result, SbomFormat, SbomRecord, digest};
use tracing::info;
use uuid::Uuid;

/// A stored SBOM plus whether it replaced an earlier one
#[derive(Debug, Clone)]
pub struct SbomAttachment {
    pub record: SbomRecord,
    pub replaced: Option<SbomRecord>,
}

impl SupplyChainService {
    pub fn attach_sbom(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
        format: &str,
        version: String,
        content: Vec<u8>,
        content_type: String,
        created_by: &str,
    ) -> Result<SbomAttachment> {
        let format = SbomFormat::parse(format).ok_or_else(|| {
            Error::sbom_invalid(format!("unknown sbom format: {format}"))
                .with_detail("field", "format")
        })?;
        if !self.config().allowed_sbom_formats.contains(&format) {
            return Err(Error::sbom_invalid(format!(
                "sbom format {format} is not allowed"
            ))
            .with_detail("format", format.as_str()));
        }
        if content.is_empty() {
            return Err(Error::sbom_invalid("sbom content is empty"));
        }

        let artifact = self.engine().head_object(bucket, key)?;
        let record = SbomRecord {
            id: Uuid::new_v4(),
            artifact_ref: artifact.artifact_ref().to_string(),
            format,
            version,
            content_digest: digest::sha256_hex(&content),
            content,
            content_type,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };

        let replaced = self.meta().put_sbom(&record)?;
        if replaced.is_some() {
            info!(artifact = %record.artifact_ref, format = %record.format, "replaced sbom");
        }
        Ok(SbomAttachment { record, replaced })
    }

    pub fn get_sbom(&self, bucket: &BucketName, key: &ObjectKey) -> Result<SbomRecord> {
        let artifact = self.engine().head_object(bucket, key)?;
        self.meta()
            .get_sbom(&artifact.artifact_ref().to_string())?
            .ok_or_else(|| {
                Error::not_found(format!("no sbom for artifact: {}", artifact.artifact_ref()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{bucket, key, seeded_service};
    use depot_common::ErrorKind;

    #[tokio::test]
    async fn test_attach_and_get() {
        let (service, _dir) = seeded_service(b"artifact").await;

        let attachment = service
            .attach_sbom(
                &bucket(),
                &key("app.bin"),
                "spdx",
                "2.3".to_string(),
                br#"{"spdxVersion":"SPDX-2.3"}"#.to_vec(),
                "application/json".to_string(),
                "ci",
            )
            .unwrap();
        assert!(attachment.replaced.is_none());
        assert_eq!(attachment.record.format, SbomFormat::Spdx);
        assert_eq!(
            attachment.record.content_digest,
            digest::sha256_hex(br#"{"spdxVersion":"SPDX-2.3"}"#)
        );

        let fetched = service.get_sbom(&bucket(), &key("app.bin")).unwrap();
        assert_eq!(fetched.id, attachment.record.id);
    }

    #[tokio::test]
    async fn test_resubmission_replaces() {
        let (service, _dir) = seeded_service(b"artifact").await;

        let first = service
            .attach_sbom(
                &bucket(),
                &key("app.bin"),
                "spdx",
                "2.3".to_string(),
                b"{}".to_vec(),
                "application/json".to_string(),
                "ci",
            )
            .unwrap();
        let second = service
            .attach_sbom(
                &bucket(),
                &key("app.bin"),
                "cyclonedx",
                "1.5".to_string(),
                b"{}".to_vec(),
                "application/json".to_string(),
                "ci",
            )
            .unwrap();

        assert_eq!(second.replaced.unwrap().id, first.record.id);
        let current = service.get_sbom(&bucket(), &key("app.bin")).unwrap();
        assert_eq!(current.format, SbomFormat::Cyclonedx);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (service, _dir) = seeded_service(b"artifact").await;

        let err = service
            .attach_sbom(
                &bucket(),
                &key("app.bin"),
                "swid",
                String::new(),
                b"{}".to_vec(),
                String::new(),
                "ci",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SbomInvalid);

        let err = service
            .attach_sbom(
                &bucket(),
                &key("app.bin"),
                "spdx",
                String::new(),
                Vec::new(),
                String::new(),
                "ci",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SbomInvalid);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_referential_error() {
        let (service, _dir) = seeded_service(b"artifact").await;
        let err = service
            .attach_sbom(
                &bucket(),
                &key("ghost"),
                "spdx",
                String::new(),
                b"{}".to_vec(),
                String::new(),
                "ci",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
