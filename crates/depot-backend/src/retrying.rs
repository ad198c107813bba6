//! Retry-wrapping backend
//!
//! Routes every backend call through the retry policy and the circuit
//! breaker keyed by the wrapped backend's name. Writes are made
//! replayable by buffering payloads up to a cap; reads come back as
//! resuming readers that reissue a range request from the last
//! delivered byte after a transient mid-stream failure.

use crate::{
    Backend, ObjectReader, RANGE_TO_EOF, WriteOutcome, WritePayload, read_to_end,
};
use async_trait::async_trait;
use bytes::Bytes;
use depot_common::{BucketName, Error, ObjectKey, Result};
use depot_reliability::{BreakerRegistry, CircuitBreaker, RetryPolicy};
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Backend wrapper applying the reliability policy to every call
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    /// Streamed write payloads up to this size are buffered for replay
    buffer_cap: usize,
}

impl RetryingBackend {
    #[must_use]
    pub fn new(
        inner: Arc<dyn Backend>,
        policy: RetryPolicy,
        breakers: &BreakerRegistry,
        buffer_cap: usize,
    ) -> Self {
        let breaker = breakers.get(inner.name());
        Self {
            inner,
            policy,
            breaker,
            buffer_cap,
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn write_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        payload: WritePayload,
    ) -> Result<WriteOutcome> {
        let replayable = match payload {
            WritePayload::Bytes(bytes) => Some(bytes),
            WritePayload::Stream { reader, size } if size as usize <= self.buffer_cap => {
                // Bounded buffering turns the one-shot stream into a
                // replayable payload
                Some(Bytes::from(read_to_end(reader).await?))
            }
            stream => {
                // Too large to buffer and not seekable: exactly one attempt
                return self
                    .breaker
                    .call(|| self.inner.write_object(token, bucket, key, stream))
                    .await
                    .map_err(|err| {
                        if err.is_retryable() {
                            warn!(bucket = %bucket, key = %key, "streamed write failed without replay buffer");
                            err.into_non_retryable()
                        } else {
                            err
                        }
                    });
            }
        };

        let bytes = replayable.expect("buffered payload present");
        self.policy
            .run(token, |attempt| {
                let bytes = bytes.clone();
                async move {
                    if attempt > 0 {
                        debug!(bucket = %bucket, key = %key, attempt, "replaying buffered write");
                    }
                    self.breaker
                        .call(|| {
                            self.inner
                                .write_object(token, bucket, key, WritePayload::Bytes(bytes))
                        })
                        .await
                }
            })
            .await
    }

    async fn read_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<ObjectReader> {
        let expected = self
            .policy
            .run(token, |_| {
                self.breaker
                    .call(|| self.inner.object_hash(token, bucket, key))
            })
            .await?;

        let first = self
            .policy
            .run(token, |_| {
                self.breaker.call(|| {
                    self.inner
                        .read_object_range(token, bucket, key, 0, RANGE_TO_EOF)
                })
            })
            .await?;

        Ok(resuming_reader(
            self.inner.clone(),
            token.clone(),
            bucket.clone(),
            key.clone(),
            first,
            Some(expected),
            self.policy.clone(),
        ))
    }

    async fn read_object_range(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        offset: u64,
        length: i64,
    ) -> Result<ObjectReader> {
        self.policy
            .run(token, |_| {
                self.breaker.call(|| {
                    self.inner
                        .read_object_range(token, bucket, key, offset, length)
                })
            })
            .await
    }

    async fn delete_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<()> {
        self.policy
            .run(token, |_| {
                self.breaker
                    .call(|| self.inner.delete_object(token, bucket, key))
            })
            .await
    }

    async fn create_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        self.policy
            .run(token, |_| {
                self.breaker.call(|| self.inner.create_bucket(token, bucket))
            })
            .await
    }

    async fn delete_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        self.policy
            .run(token, |_| {
                self.breaker.call(|| self.inner.delete_bucket(token, bucket))
            })
            .await
    }

    async fn bucket_exists(&self, token: &CancellationToken, bucket: &BucketName) -> Result<bool> {
        self.policy
            .run(token, |_| {
                self.breaker.call(|| self.inner.bucket_exists(token, bucket))
            })
            .await
    }

    async fn object_exists(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<bool> {
        self.policy
            .run(token, |_| {
                self.breaker
                    .call(|| self.inner.object_exists(token, bucket, key))
            })
            .await
    }

    async fn object_size(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<u64> {
        self.policy
            .run(token, |_| {
                self.breaker
                    .call(|| self.inner.object_size(token, bucket, key))
            })
            .await
    }

    async fn object_hash(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<String> {
        self.policy
            .run(token, |_| {
                self.breaker
                    .call(|| self.inner.object_hash(token, bucket, key))
            })
            .await
    }

    async fn health_check(&self, token: &CancellationToken) -> Result<()> {
        // Probes bypass retry so readiness reflects the live state
        self.inner.health_check(token).await
    }
}

struct ResumeState {
    backend: Arc<dyn Backend>,
    token: CancellationToken,
    bucket: BucketName,
    key: ObjectKey,
    reader: Option<ObjectReader>,
    offset: u64,
    hasher: Option<Sha256>,
    expected: Option<String>,
    policy: RetryPolicy,
    attempt: u32,
    done: bool,
}

/// Reader that counts delivered bytes and, on a transient mid-stream
/// failure, reopens `bytes=<delivered>-` and keeps going. The SHA-256
/// accumulates across resumes, so the EOF verification still covers the
/// whole object.
fn resuming_reader(
    backend: Arc<dyn Backend>,
    token: CancellationToken,
    bucket: BucketName,
    key: ObjectKey,
    first: ObjectReader,
    expected: Option<String>,
    policy: RetryPolicy,
) -> ObjectReader {
    let state = ResumeState {
        backend,
        token,
        bucket,
        key,
        reader: Some(first),
        offset: 0,
        hasher: Some(Sha256::new()),
        expected,
        policy,
        attempt: 0,
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            if st.token.is_cancelled() {
                st.done = true;
                return Some((Err(io::Error::other("operation cancelled")), st));
            }

            if st.reader.is_none() {
                match st
                    .backend
                    .read_object_range(&st.token, &st.bucket, &st.key, st.offset, RANGE_TO_EOF)
                    .await
                {
                    Ok(reader) => st.reader = Some(reader),
                    Err(err) if err.is_retryable() && st.attempt + 1 < st.policy.max_attempts => {
                        let delay = st.policy.delay_for(st.attempt);
                        st.attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    Err(err) => {
                        st.done = true;
                        return Some((Err(io::Error::other(err.to_string())), st));
                    }
                }
            }

            let mut chunk = vec![0u8; CHUNK_SIZE];
            match st.reader.as_mut().expect("reader open").read(&mut chunk).await {
                Ok(0) => {
                    st.done = true;
                    if let (Some(hasher), Some(expected)) = (st.hasher.take(), st.expected.take())
                    {
                        let actual = hex::encode(hasher.finalize());
                        if actual != expected {
                            return Some((
                                Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("checksum mismatch: expected {expected}, got {actual}"),
                                )),
                                st,
                            ));
                        }
                    }
                    return None;
                }
                Ok(n) => {
                    chunk.truncate(n);
                    if let Some(hasher) = st.hasher.as_mut() {
                        hasher.update(&chunk);
                    }
                    st.offset += n as u64;
                    return Some((Ok(Bytes::from(chunk)), st));
                }
                Err(err) if st.attempt + 1 < st.policy.max_attempts => {
                    warn!(
                        bucket = %st.bucket, key = %st.key, offset = st.offset, error = %err,
                        "mid-stream read failed, resuming from last delivered byte"
                    );
                    let delay = st.policy.delay_for(st.attempt);
                    st.attempt += 1;
                    st.reader = None;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
            }
        }
    });

    Box::new(StreamReader::new(Box::pin(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_common::ErrorKind;
    use depot_common::digest::sha256_hex;
    use depot_reliability::{BreakerConfig, BreakerState};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Scriptable backend: fails the first `fail_writes` writes and,
    /// when `fail_read_after` is set, truncates the first read at that
    /// byte offset.
    struct FlakyBackend {
        data: Mutex<Option<Vec<u8>>>,
        write_calls: AtomicU32,
        fail_writes: u32,
        read_calls: AtomicU32,
        fail_read_after: Option<usize>,
    }

    impl FlakyBackend {
        fn new(fail_writes: u32, fail_read_after: Option<usize>) -> Self {
            Self {
                data: Mutex::new(None),
                write_calls: AtomicU32::new(0),
                fail_writes,
                read_calls: AtomicU32::new(0),
                fail_read_after,
            }
        }
    }

    /// Reader that yields a prefix and then errors out
    struct TruncatedReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl tokio::io::AsyncRead for TruncatedReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.pos >= self.data.len() {
                return std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "link dropped",
                )));
            }
            let n = (self.data.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.data[pos..pos + n]);
            self.pos += n;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn write_object(
            &self,
            _token: &CancellationToken,
            _bucket: &BucketName,
            _key: &ObjectKey,
            payload: WritePayload,
        ) -> Result<WriteOutcome> {
            let calls = self.write_calls.fetch_add(1, Ordering::SeqCst);
            if calls < self.fail_writes {
                return Err(Error::storage_unavailable("write lost"));
            }
            let bytes = crate::remote::materialize(payload).await?;
            let sha256 = sha256_hex(&bytes);
            let written = bytes.len() as u64;
            *self.data.lock().unwrap() = Some(bytes.to_vec());
            Ok(WriteOutcome { written, sha256 })
        }

        async fn read_object(
            &self,
            token: &CancellationToken,
            bucket: &BucketName,
            key: &ObjectKey,
        ) -> Result<ObjectReader> {
            self.read_object_range(token, bucket, key, 0, RANGE_TO_EOF).await
        }

        async fn read_object_range(
            &self,
            _token: &CancellationToken,
            _bucket: &BucketName,
            _key: &ObjectKey,
            offset: u64,
            _length: i64,
        ) -> Result<ObjectReader> {
            let data = self
                .data
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::not_found("no object"))?;
            let tail = data[offset as usize..].to_vec();

            let calls = self.read_calls.fetch_add(1, Ordering::SeqCst);
            if calls == 0 {
                if let Some(cut) = self.fail_read_after {
                    let cut = cut.min(tail.len());
                    return Ok(Box::new(TruncatedReader {
                        data: tail[..cut].to_vec(),
                        pos: 0,
                    }));
                }
            }
            Ok(Box::new(std::io::Cursor::new(tail)))
        }

        async fn delete_object(
            &self,
            _token: &CancellationToken,
            _bucket: &BucketName,
            _key: &ObjectKey,
        ) -> Result<()> {
            Ok(())
        }

        async fn create_bucket(&self, _t: &CancellationToken, _b: &BucketName) -> Result<()> {
            Ok(())
        }

        async fn delete_bucket(&self, _t: &CancellationToken, _b: &BucketName) -> Result<()> {
            Ok(())
        }

        async fn bucket_exists(&self, _t: &CancellationToken, _b: &BucketName) -> Result<bool> {
            Ok(true)
        }

        async fn object_exists(
            &self,
            _t: &CancellationToken,
            _b: &BucketName,
            _k: &ObjectKey,
        ) -> Result<bool> {
            Ok(self.data.lock().unwrap().is_some())
        }

        async fn object_size(
            &self,
            _t: &CancellationToken,
            _b: &BucketName,
            _k: &ObjectKey,
        ) -> Result<u64> {
            Ok(self.data.lock().unwrap().as_ref().map_or(0, Vec::len) as u64)
        }

        async fn object_hash(
            &self,
            _t: &CancellationToken,
            _b: &BucketName,
            _k: &ObjectKey,
        ) -> Result<String> {
            self.data
                .lock()
                .unwrap()
                .as_ref()
                .map(|d| sha256_hex(d))
                .ok_or_else(|| Error::not_found("no object"))
        }

        async fn health_check(&self, _t: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn wrap(inner: FlakyBackend) -> (RetryingBackend, Arc<FlakyBackend>) {
        let inner = Arc::new(inner);
        let registry = BreakerRegistry::new(BreakerConfig {
            max_failures: 5,
            ..BreakerConfig::default()
        });
        (
            RetryingBackend::new(inner.clone(), fast_policy(), &registry, 1024),
            inner,
        )
    }

    fn bucket() -> BucketName {
        BucketName::new_unchecked("releases")
    }

    fn key() -> ObjectKey {
        ObjectKey::new_unchecked("app.bin")
    }

    #[tokio::test]
    async fn test_replayable_write_retries_through_transient_failures() {
        let (backend, inner) = wrap(FlakyBackend::new(2, None));
        let token = CancellationToken::new();

        let outcome = backend
            .write_object(&token, &bucket(), &key(), Bytes::from_static(b"payload").into())
            .await
            .unwrap();
        assert_eq!(outcome.written, 7);
        assert_eq!(inner.write_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_small_stream_is_buffered_and_retried() {
        let (backend, inner) = wrap(FlakyBackend::new(1, None));
        let token = CancellationToken::new();

        let payload = WritePayload::Stream {
            reader: Box::new(std::io::Cursor::new(b"streamed".to_vec())),
            size: 8,
        };
        backend
            .write_object(&token, &bucket(), &key(), payload)
            .await
            .unwrap();
        assert_eq!(inner.write_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oversized_stream_fails_without_retry() {
        let (backend, inner) = wrap(FlakyBackend::new(1, None));
        let token = CancellationToken::new();

        let data = vec![0u8; 4096]; // over the 1024 buffer cap
        let payload = WritePayload::Stream {
            reader: Box::new(std::io::Cursor::new(data)),
            size: 4096,
        };
        let err = backend
            .write_object(&token, &bucket(), &key(), payload)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(!err.is_retryable());
        assert_eq!(inner.write_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_resumes_mid_stream_and_verifies() {
        let payload = (0u8..=255).cycle().take(200_000).collect::<Vec<u8>>();
        let (backend, inner) = wrap(FlakyBackend::new(0, Some(100_000)));
        let token = CancellationToken::new();
        backend
            .write_object(&token, &bucket(), &key(), Bytes::from(payload.clone()).into())
            .await
            .unwrap();

        let reader = backend.read_object(&token, &bucket(), &key()).await.unwrap();
        let data = read_to_end(reader).await.unwrap();
        assert_eq!(data, payload);
        // One truncated attempt plus the resumed range read
        assert!(inner.read_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_after_consecutive_failures() {
        let inner = Arc::new(FlakyBackend::new(u32::MAX, None));
        let registry = BreakerRegistry::new(BreakerConfig {
            max_failures: 5,
            timeout: Duration::from_secs(30),
            ..BreakerConfig::default()
        });
        let backend = RetryingBackend::new(inner.clone(), fast_policy(), &registry, 1024);
        let token = CancellationToken::new();

        // Two writes of 3 attempts each trip the 5-failure threshold
        for _ in 0..2 {
            let _ = backend
                .write_object(&token, &bucket(), &key(), Bytes::from_static(b"x").into())
                .await;
        }
        assert_eq!(backend.breaker().state(), BreakerState::Open);

        let calls_before = inner.write_calls.load(Ordering::SeqCst);
        let err = backend
            .write_object(&token, &bucket(), &key(), Bytes::from_static(b"x").into())
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        // Rejected without reaching the backend
        assert_eq!(inner.write_calls.load(Ordering::SeqCst), calls_before);
    }
}
