//! Depot Backend - Pluggable object storage
//!
//! Every storage target implements the [`Backend`] contract: uniform
//! bucket and object operations with inline SHA-256 checksumming,
//! atomic writes at the object key, and verified streaming reads. The
//! engine only ever talks to a `Backend`, usually through the
//! [`retrying::RetryingBackend`] wrapper.

pub mod azure;
pub mod filesystem;
pub mod gcs;
pub mod retrying;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use depot_common::{BucketName, ObjectKey, Result};
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

pub use filesystem::FilesystemBackend;
pub use retrying::RetryingBackend;

/// Streaming object reader
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Result of a completed object write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: u64,
    /// Hex SHA-256 computed inline during the write
    pub sha256: String,
}

/// Payload handed to `write_object`
///
/// `Bytes` payloads are replayable and therefore retryable; `Stream`
/// payloads can be consumed exactly once.
pub enum WritePayload {
    Bytes(Bytes),
    Stream { reader: ObjectReader, size: u64 },
}

impl WritePayload {
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Stream { size, .. } => *size,
        }
    }

    #[must_use]
    pub const fn is_replayable(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }
}

impl From<Bytes> for WritePayload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// Read `length = -1` as "until EOF"
pub const RANGE_TO_EOF: i64 = -1;

/// Uniform object/bucket operations over any storage target
///
/// Semantics all implementations must uphold:
/// - `write_object` is atomic at the key: concurrent readers observe
///   either the prior object or the new one, never a partial write.
/// - When checksumming is enabled the SHA-256 is computed inline and
///   stored alongside the object, making `object_hash` O(1).
/// - `read_object` returns a verifying reader that rejects at EOF when
///   the accumulated digest disagrees with the stored hash.
/// - Out-of-range `read_object_range` requests fail with `invalid_range`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name, used to key the circuit breaker
    fn name(&self) -> &'static str;

    async fn write_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        payload: WritePayload,
    ) -> Result<WriteOutcome>;

    async fn read_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<ObjectReader>;

    async fn read_object_range(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        offset: u64,
        length: i64,
    ) -> Result<ObjectReader>;

    async fn delete_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<()>;

    async fn create_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()>;

    async fn delete_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()>;

    async fn bucket_exists(&self, token: &CancellationToken, bucket: &BucketName) -> Result<bool>;

    async fn object_exists(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<bool>;

    async fn object_size(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<u64>;

    /// Hex SHA-256 of the stored object
    async fn object_hash(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<String>;

    async fn health_check(&self, token: &CancellationToken) -> Result<()>;
}

/// Reader that accumulates SHA-256 and rejects at EOF on digest mismatch
///
/// The mismatch surfaces as an `InvalidData` I/O error, which the error
/// taxonomy maps to `verification_failed`.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Option<Sha256>,
    expected: String,
}

impl<R> VerifyingReader<R> {
    pub fn new(inner: R, expected_sha256_hex: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            expected: expected_sha256_hex.into(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    // EOF: verify the accumulated digest exactly once
                    if let Some(hasher) = self.hasher.take() {
                        let actual = hex::encode(hasher.finalize());
                        if actual != self.expected {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!(
                                    "checksum mismatch: expected {}, got {actual}",
                                    self.expected
                                ),
                            )));
                        }
                    }
                } else if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(filled);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

pub(crate) mod remote {
    //! Shared plumbing for the HTTP-based remote backends

    use crate::{ObjectReader, WritePayload};
    use bytes::Bytes;
    use depot_common::{Error, ErrorKind, Result};
    use futures::TryStreamExt;
    use tokio_util::io::StreamReader;

    /// Map a transport-level failure onto the network error kinds
    pub fn transport_error(err: reqwest::Error) -> Error {
        let kind = if err.is_timeout() {
            ErrorKind::NetworkTimeout
        } else if err.is_connect() {
            ErrorKind::NetworkUnreachable
        } else {
            ErrorKind::ConnectionReset
        };
        Error::new(kind, err.to_string()).with_source(err)
    }

    /// Map an unexpected HTTP status onto the storage error kinds
    pub fn status_error(status: reqwest::StatusCode, context: &str) -> Error {
        let kind = match status.as_u16() {
            404 => ErrorKind::NotFound,
            416 => ErrorKind::InvalidRange,
            429 | 500..=599 => ErrorKind::StorageUnavailable,
            _ => ErrorKind::StorageFailure,
        };
        Error::new(kind, format!("{context}: upstream returned {status}"))
            .with_detail("status", status.as_u16().to_string())
    }

    /// Adapt a response body into an [`ObjectReader`]
    pub fn body_reader(response: reqwest::Response) -> ObjectReader {
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err.to_string()));
        Box::new(StreamReader::new(Box::pin(stream)))
    }

    /// Materialize a payload so its digest can be sent ahead of the body.
    /// The remote protocols carry the hash in request headers, so
    /// streamed payloads are buffered here.
    pub async fn materialize(payload: WritePayload) -> Result<Bytes> {
        match payload {
            WritePayload::Bytes(bytes) => Ok(bytes),
            WritePayload::Stream { reader, .. } => {
                Ok(Bytes::from(crate::read_to_end(reader).await?))
            }
        }
    }

    /// AWS-style URI encoding, keeping `/` as a path separator
    pub fn encode_path_segment(segment: &str) -> String {
        let mut out = String::with_capacity(segment.len());
        for byte in segment.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char);
                }
                _ => out.push_str(&format!("%{byte:02X}")),
            }
        }
        out
    }

    pub fn encode_object_path(path: &str) -> String {
        path.split('/')
            .map(encode_path_segment)
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Drain a reader to its end, returning the bytes read
///
/// Used by verification paths that need the full payload in memory.
pub async fn read_to_end(mut reader: ObjectReader) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_common::{ErrorKind, digest::sha256_hex};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_verifying_reader_accepts_matching_digest() {
        let data = b"hello world".to_vec();
        let reader = VerifyingReader::new(std::io::Cursor::new(data.clone()), sha256_hex(&data));
        let mut out = Vec::new();
        let mut reader = reader;
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_verifying_reader_rejects_mismatch_at_eof() {
        let data = b"hello world".to_vec();
        let mut reader = VerifyingReader::new(std::io::Cursor::new(data), "00".repeat(32));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mapped: depot_common::Error = err.into();
        assert_eq!(mapped.kind(), ErrorKind::VerificationFailed);
    }

    #[test]
    fn test_payload_replayability() {
        assert!(WritePayload::Bytes(Bytes::from_static(b"x")).is_replayable());
        let stream = WritePayload::Stream {
            reader: Box::new(std::io::Cursor::new(Vec::new())),
            size: 0,
        };
        assert!(!stream.is_replayable());
    }
}
