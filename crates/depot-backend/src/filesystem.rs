//! Local filesystem backend
//!
//! Objects live at `<root>/<bucket>/<key>` with a `<key>.sha256` sidecar
//! holding the hex digest. Writes land in `<path>.tmp` and are atomically
//! renamed into place; concurrent writes to the same key serialize
//! through a keyed lock map.

use crate::{Backend, ObjectReader, RANGE_TO_EOF, VerifyingReader, WriteOutcome, WritePayload};
use async_trait::async_trait;
use dashmap::DashMap;
use depot_common::{BucketName, Error, ObjectKey, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SIDECAR_SUFFIX: &str = ".sha256";
const TMP_SUFFIX: &str = ".tmp";
const HEALTH_PROBE: &str = ".depot-health";
const CHUNK_SIZE: usize = 64 * 1024;

/// Filesystem-backed object storage
pub struct FilesystemBackend {
    root: PathBuf,
    enable_checksum: bool,
    /// Per-key write locks, keyed `bucket/key`
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FilesystemBackend {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, enable_checksum: bool) -> Self {
        Self {
            root: root.into(),
            enable_checksum,
            locks: DashMap::new(),
        }
    }

    fn bucket_path(&self, bucket: &BucketName) -> PathBuf {
        self.root.join(bucket.as_str())
    }

    /// Map a key to its on-disk path. `.` and `..` segments are stored
    /// percent-encoded so the OS never resolves them against the tree.
    fn object_path(&self, bucket: &BucketName, key: &ObjectKey) -> PathBuf {
        let mut path = self.bucket_path(bucket);
        for segment in key.as_str().split('/') {
            match segment {
                "" => path.push("%2F"),
                "." => path.push("%2E"),
                ".." => path.push("%2E%2E"),
                other => path.push(other),
            }
        }
        path
    }

    fn write_lock(&self, bucket: &BucketName, key: &ObjectKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{}/{}", bucket.as_str(), key.as_str()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn suffixed(path: &Path, suffix: &str) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(suffix);
        PathBuf::from(s)
    }

    async fn stored_hash(&self, path: &Path) -> Option<String> {
        let sidecar = Self::suffixed(path, SIDECAR_SUFFIX);
        fs::read_to_string(&sidecar)
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn missing_object(&self, bucket: &BucketName, key: &ObjectKey) -> Error {
        Error::not_found(format!("object not found: {}/{}", bucket, key))
            .with_detail("bucket", bucket.as_str())
            .with_detail("key", key.as_str())
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn write_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        payload: WritePayload,
    ) -> Result<WriteOutcome> {
        let lock = self.write_lock(bucket, key);
        let _guard = lock.lock().await;

        let final_path = self.object_path(bucket, key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = Self::suffixed(&final_path, TMP_SUFFIX);
        let mut file = fs::File::create(&tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        let write_result: Result<()> = async {
            match payload {
                WritePayload::Bytes(bytes) => {
                    if token.is_cancelled() {
                        return Err(Error::cancelled());
                    }
                    hasher.update(&bytes);
                    written = bytes.len() as u64;
                    file.write_all(&bytes).await?;
                }
                WritePayload::Stream { mut reader, .. } => {
                    let mut chunk = vec![0u8; CHUNK_SIZE];
                    loop {
                        if token.is_cancelled() {
                            return Err(Error::cancelled());
                        }
                        let n = reader.read(&mut chunk).await?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&chunk[..n]);
                        written += n as u64;
                        file.write_all(&chunk[..n]).await?;
                    }
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            drop(file);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(file);

        let sha256 = hex::encode(hasher.finalize());
        if self.enable_checksum {
            fs::write(Self::suffixed(&final_path, SIDECAR_SUFFIX), &sha256).await?;
        }
        fs::rename(&tmp_path, &final_path).await?;
        debug!(bucket = %bucket, key = %key, written, "wrote object");

        Ok(WriteOutcome { written, sha256 })
    }

    async fn read_object(
        &self,
        _token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<ObjectReader> {
        let path = self.object_path(bucket, key);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.missing_object(bucket, key));
            }
            Err(err) => return Err(err.into()),
        };

        if self.enable_checksum {
            if let Some(expected) = self.stored_hash(&path).await {
                return Ok(Box::new(VerifyingReader::new(file, expected)));
            }
        }
        Ok(Box::new(file))
    }

    async fn read_object_range(
        &self,
        _token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        offset: u64,
        length: i64,
    ) -> Result<ObjectReader> {
        let path = self.object_path(bucket, key);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.missing_object(bucket, key));
            }
            Err(err) => return Err(err.into()),
        };

        let size = file.metadata().await?.len();
        if offset > 0 && offset >= size {
            return Err(Error::invalid_range(format!(
                "offset {offset} beyond object size {size}"
            ))
            .with_detail("offset", offset.to_string())
            .with_detail("size", size.to_string()));
        }

        let take = if length == RANGE_TO_EOF {
            size - offset
        } else {
            let length = u64::try_from(length)
                .map_err(|_| Error::invalid_range(format!("negative length {length}")))?;
            if offset + length > size {
                return Err(Error::invalid_range(format!(
                    "range {offset}+{length} beyond object size {size}"
                )));
            }
            length
        };

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(take)))
    }

    async fn delete_object(
        &self,
        _token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<()> {
        let path = self.object_path(bucket, key);
        for target in [path.clone(), Self::suffixed(&path, SIDECAR_SUFFIX)] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn create_bucket(&self, _token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        fs::create_dir_all(self.bucket_path(bucket)).await?;
        Ok(())
    }

    async fn delete_bucket(&self, _token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        match fs::remove_dir_all(self.bucket_path(bucket)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn bucket_exists(&self, _token: &CancellationToken, bucket: &BucketName) -> Result<bool> {
        Ok(fs::metadata(self.bucket_path(bucket))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn object_exists(
        &self,
        _token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<bool> {
        Ok(fs::metadata(self.object_path(bucket, key))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn object_size(
        &self,
        _token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<u64> {
        match fs::metadata(self.object_path(bucket, key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(self.missing_object(bucket, key))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn object_hash(
        &self,
        _token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<String> {
        let path = self.object_path(bucket, key);
        if let Some(hash) = self.stored_hash(&path).await {
            return Ok(hash);
        }

        // No sidecar: recompute by streaming the payload
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.missing_object(bucket, key));
            }
            Err(err) => return Err(err.into()),
        };
        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    async fn health_check(&self, _token: &CancellationToken) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(HEALTH_PROBE);
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use depot_common::ErrorKind;
    use depot_common::digest::sha256_hex;

    fn backend() -> (FilesystemBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FilesystemBackend::new(dir.path(), true), dir)
    }

    fn bucket() -> BucketName {
        BucketName::new_unchecked("releases")
    }

    fn key(s: &str) -> ObjectKey {
        ObjectKey::new_unchecked(s)
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();

        let outcome = backend
            .write_object(
                &token,
                &bucket(),
                &key("app.bin"),
                Bytes::from_static(b"hello").into(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.written, 5);
        assert_eq!(outcome.sha256, sha256_hex(b"hello"));

        let reader = backend.read_object(&token, &bucket(), &key("app.bin")).await.unwrap();
        let data = crate::read_to_end(reader).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_object_hash_is_precomputed() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();
        backend
            .write_object(&token, &bucket(), &key("a"), Bytes::from_static(b"hello").into())
            .await
            .unwrap();

        let hash = backend.object_hash(&token, &bucket(), &key("a")).await.unwrap();
        assert_eq!(hash, sha256_hex(b"hello"));
    }

    #[tokio::test]
    async fn test_range_reads() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();
        backend
            .write_object(&token, &bucket(), &key("a"), Bytes::from_static(b"hello").into())
            .await
            .unwrap();

        let reader = backend
            .read_object_range(&token, &bucket(), &key("a"), 1, 3)
            .await
            .unwrap();
        assert_eq!(crate::read_to_end(reader).await.unwrap(), b"ell");

        let reader = backend
            .read_object_range(&token, &bucket(), &key("a"), 2, RANGE_TO_EOF)
            .await
            .unwrap();
        assert_eq!(crate::read_to_end(reader).await.unwrap(), b"llo");

        // Offset at EOF is out of range
        let err = match backend
            .read_object_range(&token, &bucket(), &key("a"), 5, RANGE_TO_EOF)
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_in_place() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();
        backend
            .write_object(&token, &bucket(), &key("a"), Bytes::from_static(b"one").into())
            .await
            .unwrap();
        backend
            .write_object(&token, &bucket(), &key("a"), Bytes::from_static(b"twotwo").into())
            .await
            .unwrap();

        assert_eq!(backend.object_size(&token, &bucket(), &key("a")).await.unwrap(), 6);
        let hash = backend.object_hash(&token, &bucket(), &key("a")).await.unwrap();
        assert_eq!(hash, sha256_hex(b"twotwo"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();
        backend
            .write_object(&token, &bucket(), &key("a"), Bytes::from_static(b"x").into())
            .await
            .unwrap();

        backend.delete_object(&token, &bucket(), &key("a")).await.unwrap();
        backend.delete_object(&token, &bucket(), &key("a")).await.unwrap();
        assert!(!backend.object_exists(&token, &bucket(), &key("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_dot_segments_stay_inside_the_bucket() {
        let (backend, dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();

        backend
            .write_object(
                &token,
                &bucket(),
                &key("../escape.bin"),
                Bytes::from_static(b"x").into(),
            )
            .await
            .unwrap();

        // Nothing escaped the bucket directory
        assert!(!dir.path().join("escape.bin").exists());
        assert!(backend
            .object_exists(&token, &bucket(), &key("../escape.bin"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_object() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();
        let outcome = backend
            .write_object(&token, &bucket(), &key("empty"), Bytes::new().into())
            .await
            .unwrap();
        assert_eq!(outcome.written, 0);
        assert_eq!(outcome.sha256, sha256_hex(b""));

        let reader = backend.read_object(&token, &bucket(), &key("empty")).await.unwrap();
        assert!(crate::read_to_end(reader).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_write() {
        let (backend, _dir) = backend();
        let token = CancellationToken::new();
        backend.create_bucket(&token, &bucket()).await.unwrap();

        let payload = WritePayload::Stream {
            reader: Box::new(std::io::Cursor::new(b"streamed payload".to_vec())),
            size: 16,
        };
        let outcome = backend
            .write_object(&token, &bucket(), &key("s"), payload)
            .await
            .unwrap();
        assert_eq!(outcome.written, 16);
        assert_eq!(outcome.sha256, sha256_hex(b"streamed payload"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let (backend, _dir) = backend();
        backend.health_check(&CancellationToken::new()).await.unwrap();
    }
}
