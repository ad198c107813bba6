//! Depot Supply Chain - Signing, verification, SBOM, attestations
//!
//! Every record here is content-addressed against an existing
//! artifact: inserts check referential integrity, and the records die
//! with their artifact.

pub mod attestation;
pub mod sbom;
pub mod sign;

use depot_common::config::SupplyChainConfig;
use depot_common::{BucketName, ObjectKey, Result};
use depot_engine::ObjectEngine;
use depot_meta::MetaStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use sbom::SbomAttachment;
pub use sign::{SIGNATURE_ALGORITHM, SignatureOutcome, VerificationResult};

/// Supply-chain operations over the object engine
pub struct SupplyChainService {
    engine: Arc<ObjectEngine>,
    config: SupplyChainConfig,
}

impl SupplyChainService {
    #[must_use]
    pub fn new(engine: Arc<ObjectEngine>, config: SupplyChainConfig) -> Self {
        Self { engine, config }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<ObjectEngine> {
        &self.engine
    }

    #[must_use]
    pub const fn config(&self) -> &SupplyChainConfig {
        &self.config
    }

    pub(crate) fn meta(&self) -> &MetaStore {
        self.engine.meta()
    }

    /// Full artifact bytes through the verifying reader
    pub(crate) async fn read_artifact(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<Vec<u8>> {
        let result = self.engine.get_object(token, bucket, key, None).await?;
        depot_backend::read_to_end(result.reader).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use depot_backend::FilesystemBackend;
    use std::time::Duration;

    pub(crate) fn bucket() -> BucketName {
        BucketName::new_unchecked("releases")
    }

    pub(crate) fn key(s: &str) -> ObjectKey {
        ObjectKey::new_unchecked(s)
    }

    pub(crate) async fn service() -> (SupplyChainService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("metadata.db")).unwrap();
        let backend = Arc::new(FilesystemBackend::new(dir.path().join("data"), true));
        let engine = Arc::new(ObjectEngine::new(
            meta,
            backend,
            Duration::from_secs(3600),
        ));
        engine
            .create_bucket(&CancellationToken::new(), &bucket())
            .await
            .unwrap();
        (
            SupplyChainService::new(engine, SupplyChainConfig::default()),
            dir,
        )
    }

    /// Service with `releases/app.bin` already stored
    pub(crate) async fn seeded_service(body: &[u8]) -> (SupplyChainService, tempfile::TempDir) {
        let (service, dir) = service().await;
        service
            .engine()
            .put_object(
                &CancellationToken::new(),
                &bucket(),
                &key("app.bin"),
                Bytes::copy_from_slice(body),
                "application/octet-stream".to_string(),
                Default::default(),
            )
            .await
            .unwrap();
        (service, dir)
    }
}
