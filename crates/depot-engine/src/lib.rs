//! Depot Engine - S3-style object engine
//!
//! Orchestrates bucket and object lifecycle over a storage [`Backend`]
//! and the metadata store. Write ordering: a write intent is recorded,
//! the payload lands in the backend, then metadata commits; the orphan
//! sweeper repairs anything that failed in between. Deletions remove
//! the payload first and metadata second.

pub mod multipart;
pub mod range;
pub mod sweeper;

use bytes::Bytes;
use chrono::Utc;
use depot_backend::{Backend, ObjectReader, WritePayload};
use depot_common::{
    Artifact, Bucket, BucketName, DigestWriter, Error, ObjectKey, Result,
};
use depot_meta::{MetaStore, WriteIntent};
use range::ByteRange;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use range::parse_range_header;
pub use sweeper::spawn_sweeper;

/// Default page size for object listings
pub const DEFAULT_MAX_KEYS: usize = 1000;

/// A successful object read
pub struct GetResult {
    pub artifact: Artifact,
    pub reader: ObjectReader,
    /// Present when a satisfiable `Range` was applied
    pub range: Option<ByteRange>,
}

impl std::fmt::Debug for GetResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetResult")
            .field("artifact", &self.artifact)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// One page of an object listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResult {
    pub objects: Vec<Artifact>,
    pub truncated: bool,
    /// Marker for the next page: the last returned key
    pub next_marker: Option<String>,
}

/// The S3-style object engine
pub struct ObjectEngine {
    meta: MetaStore,
    backend: Arc<dyn Backend>,
    multipart_idle: Duration,
}

impl ObjectEngine {
    #[must_use]
    pub fn new(meta: MetaStore, backend: Arc<dyn Backend>, multipart_idle: Duration) -> Self {
        Self {
            meta,
            backend,
            multipart_idle,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub const fn multipart_idle(&self) -> Duration {
        self.multipart_idle
    }

    fn require_bucket(&self, bucket: &BucketName) -> Result<Bucket> {
        self.meta
            .get_bucket(bucket)?
            .ok_or_else(|| Error::not_found(format!("bucket not found: {bucket}")))
    }

    fn missing_object(bucket: &BucketName, key: &ObjectKey) -> Error {
        Error::not_found(format!("object not found: {bucket}/{key}"))
            .with_detail("bucket", bucket.as_str())
            .with_detail("key", key.as_str())
    }

    // =========== Buckets ===========

    pub async fn create_bucket(
        &self,
        token: &CancellationToken,
        name: &BucketName,
    ) -> Result<Bucket> {
        if self.meta.get_bucket(name)?.is_some() {
            return Err(Error::conflict(format!("bucket already exists: {name}")));
        }
        self.backend.create_bucket(token, name).await?;
        let bucket = Bucket::new(name.clone());
        self.meta.put_bucket(&bucket)?;
        info!(bucket = %name, "created bucket");
        Ok(bucket)
    }

    pub async fn delete_bucket(
        &self,
        token: &CancellationToken,
        name: &BucketName,
        recursive: bool,
    ) -> Result<()> {
        let bucket = self.require_bucket(name)?;
        if bucket.object_count > 0 && !recursive {
            return Err(Error::conflict(format!(
                "bucket {name} holds {} objects",
                bucket.object_count
            ))
            .with_detail("object_count", bucket.object_count.to_string()));
        }

        if recursive {
            for artifact in self.meta.list_all_artifacts(name)? {
                self.delete_object(token, name, &artifact.key).await?;
            }
        }

        self.backend.delete_bucket(token, name).await?;
        self.meta.delete_bucket(name)?;
        info!(bucket = %name, "deleted bucket");
        Ok(())
    }

    pub fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.meta.list_buckets()
    }

    pub fn head_bucket(&self, name: &BucketName) -> Result<Bucket> {
        self.require_bucket(name)
    }

    // =========== Objects ===========

    /// Single-shot PUT. SHA-256 and MD5 are computed in one pass before
    /// the payload streams into the backend; metadata commits only after
    /// the backend write succeeds.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %bucket, key = %key))]
    pub async fn put_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        body: Bytes,
        content_type: String,
        custom_headers: HashMap<String, String>,
    ) -> Result<Artifact> {
        self.require_bucket(bucket)?;

        let mut digests = DigestWriter::new();
        digests.update(&body);
        let digests = digests.finalize();
        let storage_path = format!("{}/{}", bucket.as_str(), key.as_str());

        self.meta.put_intent(&WriteIntent {
            bucket: bucket.clone(),
            key: key.clone(),
            storage_path: storage_path.clone(),
            started_at: Utc::now(),
        })?;

        let outcome = self
            .backend
            .write_object(token, bucket, key, WritePayload::Bytes(body))
            .await?;

        let previous = self.meta.get_artifact(bucket, key)?;
        let now = Utc::now();
        let artifact = Artifact {
            bucket: bucket.clone(),
            key: key.clone(),
            size: outcome.written,
            content_type,
            content_digest: digests.sha256,
            etag: digests.md5,
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
            custom_headers,
            storage_path,
            multipart_id: None,
        };

        self.commit_artifact(&artifact, previous.as_ref())?;
        Ok(artifact)
    }

    /// Commit artifact metadata and keep the bucket counters in step.
    /// The write intent clears last: a crash beforehand leaves a
    /// committed object plus a stale intent, which the sweeper resolves
    /// in favor of the metadata.
    fn commit_artifact(&self, artifact: &Artifact, previous: Option<&Artifact>) -> Result<()> {
        self.meta.put_artifact(artifact)?;
        let (delta_objects, delta_bytes) = match previous {
            Some(previous) => (0, artifact.size as i64 - previous.size as i64),
            None => (1, artifact.size as i64),
        };
        self.meta
            .adjust_bucket_stats(&artifact.bucket, delta_objects, delta_bytes)?;
        self.meta.delete_intent(&artifact.bucket, &artifact.key)?;
        Ok(())
    }

    /// GET with an optional pre-parsed range. Full reads come back
    /// through the verifying reader; range reads are served raw.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %bucket, key = %key))]
    pub async fn get_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        range: Option<ByteRange>,
    ) -> Result<GetResult> {
        let artifact = self
            .meta
            .get_artifact(bucket, key)?
            .ok_or_else(|| Self::missing_object(bucket, key))?;

        let reader = match range {
            Some(range) => {
                self.backend
                    .read_object_range(
                        token,
                        bucket,
                        key,
                        range.offset(),
                        range.length() as i64,
                    )
                    .await?
            }
            None => self.backend.read_object(token, bucket, key).await?,
        };

        Ok(GetResult {
            artifact,
            reader,
            range,
        })
    }

    pub fn head_object(&self, bucket: &BucketName, key: &ObjectKey) -> Result<Artifact> {
        self.meta
            .get_artifact(bucket, key)?
            .ok_or_else(|| Self::missing_object(bucket, key))
    }

    /// Idempotent delete: payload first, metadata second. Returns false
    /// when there was nothing to delete. A payload already missing from
    /// the backend is tolerated; callers surface it in audit only.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %bucket, key = %key))]
    pub async fn delete_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<bool> {
        let Some(artifact) = self.meta.get_artifact(bucket, key)? else {
            return Ok(false);
        };

        if let Err(err) = self.backend.delete_object(token, bucket, key).await {
            if !err.is_not_found() {
                return Err(err);
            }
            warn!(bucket = %bucket, key = %key, "payload already missing on delete");
        }

        self.meta.delete_artifact(bucket, key)?;
        self.meta
            .adjust_bucket_stats(bucket, -1, -(artifact.size as i64))?;
        self.meta
            .delete_supply_chain(&artifact.artifact_ref().to_string())?;
        Ok(true)
    }

    pub fn list_objects(
        &self,
        bucket: &BucketName,
        prefix: &str,
        marker: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<ListResult> {
        self.require_bucket(bucket)?;
        let max_keys = max_keys.unwrap_or(DEFAULT_MAX_KEYS).max(1);

        let (objects, truncated) = self.meta.list_artifacts(bucket, prefix, marker, max_keys)?;
        let next_marker = if truncated {
            objects.last().map(|a| a.key.as_str().to_string())
        } else {
            None
        };
        Ok(ListResult {
            objects,
            truncated,
            next_marker,
        })
    }

    /// Server-side copy: source streams through its verifying reader
    /// into a fresh PUT at the destination. The source is untouched.
    pub async fn copy_object(
        &self,
        token: &CancellationToken,
        src_bucket: &BucketName,
        src_key: &ObjectKey,
        dst_bucket: &BucketName,
        dst_key: &ObjectKey,
    ) -> Result<Artifact> {
        let source = self
            .meta
            .get_artifact(src_bucket, src_key)?
            .ok_or_else(|| Self::missing_object(src_bucket, src_key))?;

        let reader = self.backend.read_object(token, src_bucket, src_key).await?;
        let data = depot_backend::read_to_end(reader).await?;

        self.put_object(
            token,
            dst_bucket,
            dst_key,
            Bytes::from(data),
            source.content_type.clone(),
            source.custom_headers.clone(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_backend::FilesystemBackend;
    use depot_common::ErrorKind;
    use tokio::io::AsyncReadExt;

    pub(crate) fn engine() -> (ObjectEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("metadata.db")).unwrap();
        let backend = Arc::new(FilesystemBackend::new(dir.path().join("data"), true));
        (
            ObjectEngine::new(meta, backend, Duration::from_secs(3600)),
            dir,
        )
    }

    pub(crate) fn bucket() -> BucketName {
        BucketName::new_unchecked("releases")
    }

    pub(crate) fn key(s: &str) -> ObjectKey {
        ObjectKey::new_unchecked(s)
    }

    async fn put(engine: &ObjectEngine, k: &str, body: &[u8]) -> Artifact {
        engine
            .put_object(
                &CancellationToken::new(),
                &bucket(),
                &key(k),
                Bytes::copy_from_slice(body),
                "application/octet-stream".to_string(),
                HashMap::new(),
            )
            .await
            .unwrap()
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();

        let artifact = put(&engine, "app.bin", b"hello").await;
        assert_eq!(artifact.etag, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            artifact.content_digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(artifact.size, 5);

        let result = engine
            .get_object(&token, &bucket(), &key("app.bin"), None)
            .await
            .unwrap();
        assert_eq!(read_all(result.reader).await, b"hello");

        // Write intent was cleared on commit
        assert!(engine.meta().list_intents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_into_missing_bucket() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        let err = engine
            .put_object(
                &token,
                &bucket(),
                &key("a"),
                Bytes::from_static(b"x"),
                String::new(),
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_overwrite_updates_stats_and_keeps_created_at() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();

        let first = put(&engine, "a", b"one").await;
        let second = put(&engine, "a", b"twotwo").await;
        assert_eq!(first.created_at, second.created_at);
        assert_ne!(first.etag, second.etag);

        let stats = engine.head_bucket(&bucket()).unwrap();
        assert_eq!(stats.object_count, 1);
        assert_eq!(stats.total_bytes, 6);
    }

    #[tokio::test]
    async fn test_range_read() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();
        put(&engine, "a", b"hello").await;

        let range = parse_range_header("bytes=1-3", 5).unwrap();
        let result = engine
            .get_object(&token, &bucket(), &key("a"), range)
            .await
            .unwrap();
        assert_eq!(read_all(result.reader).await, b"ell");
        assert_eq!(result.range.unwrap().content_range(5), "bytes 1-3/5");
    }

    #[tokio::test]
    async fn test_delete_object_idempotent() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();
        put(&engine, "a", b"x").await;

        assert!(engine.delete_object(&token, &bucket(), &key("a")).await.unwrap());
        assert!(!engine.delete_object(&token, &bucket(), &key("a")).await.unwrap());

        let err = engine
            .get_object(&token, &bucket(), &key("a"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let stats = engine.head_bucket(&bucket()).unwrap();
        assert_eq!(stats.object_count, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[tokio::test]
    async fn test_nonempty_bucket_delete_requires_recursive() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();
        put(&engine, "a", b"x").await;

        let err = engine
            .delete_bucket(&token, &bucket(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        engine.delete_bucket(&token, &bucket(), true).await.unwrap();
        assert!(engine.head_bucket(&bucket()).is_err());
    }

    #[tokio::test]
    async fn test_list_objects_pagination() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();
        for k in ["logs/1", "logs/2", "logs/3", "other/1"] {
            put(&engine, k, b"x").await;
        }

        let page = engine
            .list_objects(&bucket(), "logs/", None, Some(2))
            .unwrap();
        assert!(page.truncated);
        assert_eq!(page.next_marker.as_deref(), Some("logs/2"));

        let rest = engine
            .list_objects(&bucket(), "logs/", page.next_marker.as_deref(), Some(2))
            .unwrap();
        assert!(!rest.truncated);
        assert_eq!(rest.objects.len(), 1);
        assert_eq!(rest.objects[0].key.as_str(), "logs/3");
    }

    #[tokio::test]
    async fn test_empty_body_put() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();

        let artifact = put(&engine, "empty", b"").await;
        assert_eq!(artifact.size, 0);
        assert_eq!(
            artifact.content_digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let result = engine
            .get_object(&token, &bucket(), &key("empty"), None)
            .await
            .unwrap();
        assert!(read_all(result.reader).await.is_empty());
    }

    #[tokio::test]
    async fn test_copy_object() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();
        let src = put(&engine, "src", b"payload").await;

        let copy = engine
            .copy_object(&token, &bucket(), &key("src"), &bucket(), &key("dst"))
            .await
            .unwrap();
        assert_eq!(copy.content_digest, src.content_digest);
        assert_eq!(copy.etag, src.etag);

        // Source untouched
        let result = engine
            .get_object(&token, &bucket(), &key("src"), None)
            .await
            .unwrap();
        assert_eq!(read_all(result.reader).await, b"payload");
    }

    #[tokio::test]
    async fn test_delete_cascades_supply_chain() {
        let (engine, _dir) = engine();
        let token = CancellationToken::new();
        engine.create_bucket(&token, &bucket()).await.unwrap();
        let artifact = put(&engine, "a", b"x").await;
        let artifact_ref = artifact.artifact_ref().to_string();

        engine
            .meta()
            .put_signature(&depot_common::SignatureRecord {
                id: uuid::Uuid::new_v4(),
                artifact_ref: artifact_ref.clone(),
                algorithm: "RSA-SHA256".to_string(),
                signature: vec![1],
                public_key_pem: "pem".to_string(),
                signed_by: "alice".to_string(),
                signed_at: Utc::now(),
            })
            .unwrap();

        engine.delete_object(&token, &bucket(), &key("a")).await.unwrap();
        assert!(engine.meta().list_signatures(&artifact_ref).unwrap().is_empty());
    }
}
