//! Google Cloud Storage remote backend
//!
//! Uses the JSON API with a bearer token from configuration. Depot
//! buckets are flat `<bucket>/<key>` prefixes inside one GCS bucket;
//! the content SHA-256 rides in the object's `metadata.sha256` entry.

use crate::remote::{body_reader, materialize, status_error, transport_error};
use crate::{Backend, ObjectReader, RANGE_TO_EOF, VerifyingReader, WriteOutcome, WritePayload};
use async_trait::async_trait;
use depot_common::config::RemoteBackendConfig;
use depot_common::{BucketName, Error, ObjectKey, Result, digest::sha256_hex};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUCKET_MARKER: &str = ".depot-bucket";
const HEALTH_SENTINEL: &str = ".depot-health";

/// GCS object resource, reduced to the fields Depot reads
#[derive(Debug, Deserialize)]
struct ObjectResource {
    #[serde(default)]
    size: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// GCS-backed remote object storage
pub struct GcsBackend {
    client: reqwest::Client,
    endpoint: String,
    container: String,
    token: String,
}

impl GcsBackend {
    #[must_use]
    pub fn new(config: &RemoteBackendConfig) -> Self {
        let endpoint = if config.endpoint.is_empty() {
            "https://storage.googleapis.com".to_string()
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };
        Self {
            client: reqwest::Client::new(),
            endpoint,
            container: config.container.clone(),
            token: config.token.clone(),
        }
    }

    fn object_name(bucket: &BucketName, key: &ObjectKey) -> String {
        format!("{}/{}", bucket.as_str(), key.as_str())
    }

    /// Object URLs carry the name as a single URL-encoded path component
    fn object_url(&self, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            self.container,
            urlencoding::encode(object)
        )
    }

    fn upload_url(&self, object: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            self.container,
            urlencoding::encode(object)
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn resource(
        &self,
        token: &CancellationToken,
        object: &str,
    ) -> Result<Option<ObjectResource>> {
        if token.is_cancelled() {
            return Err(Error::cancelled());
        }
        let response = self
            .authorized(self.client.get(self.object_url(object)))
            .send()
            .await
            .map_err(transport_error)?;
        match response.status().as_u16() {
            200 => Ok(Some(
                response
                    .json()
                    .await
                    .map_err(|err| Error::storage("invalid object resource").with_source(err))?,
            )),
            404 => Ok(None),
            _ => Err(status_error(response.status(), "stat object")),
        }
    }

    fn missing(object: &str) -> Error {
        Error::not_found(format!("object not found: {object}"))
    }
}

#[async_trait]
impl Backend for GcsBackend {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn write_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        payload: WritePayload,
    ) -> Result<WriteOutcome> {
        if token.is_cancelled() {
            return Err(Error::cancelled());
        }
        let bytes = materialize(payload).await?;
        let sha256 = sha256_hex(&bytes);
        let written = bytes.len() as u64;
        let object = Self::object_name(bucket, key);

        let response = self
            .authorized(self.client.post(self.upload_url(&object)))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "upload object"));
        }

        // Second call attaches the digest as custom metadata
        let patch = serde_json::json!({ "metadata": { "sha256": sha256 } });
        let response = self
            .authorized(self.client.patch(self.object_url(&object)))
            .json(&patch)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "attach object metadata"));
        }

        debug!(bucket = %bucket, key = %key, written, "wrote object to gcs");
        Ok(WriteOutcome { written, sha256 })
    }

    async fn read_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<ObjectReader> {
        let object = Self::object_name(bucket, key);
        let expected = self
            .resource(token, &object)
            .await?
            .ok_or_else(|| Self::missing(&object))?
            .metadata
            .get("sha256")
            .cloned();

        let response = self
            .authorized(
                self.client
                    .get(format!("{}?alt=media", self.object_url(&object))),
            )
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "get object"));
        }

        let reader = body_reader(response);
        match expected {
            Some(expected) => Ok(Box::new(VerifyingReader::new(reader, expected))),
            None => Ok(reader),
        }
    }

    async fn read_object_range(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        offset: u64,
        length: i64,
    ) -> Result<ObjectReader> {
        if token.is_cancelled() {
            return Err(Error::cancelled());
        }
        let range = if length == RANGE_TO_EOF {
            format!("bytes={offset}-")
        } else {
            let length = u64::try_from(length)
                .map_err(|_| Error::invalid_range(format!("negative length {length}")))?;
            format!("bytes={offset}-{}", offset + length.saturating_sub(1))
        };

        let object = Self::object_name(bucket, key);
        let response = self
            .authorized(
                self.client
                    .get(format!("{}?alt=media", self.object_url(&object))),
            )
            .header(reqwest::header::RANGE, range)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status().as_u16() {
            200 | 206 => Ok(body_reader(response)),
            416 => Err(Error::invalid_range(format!(
                "range starting at {offset} is outside the object"
            ))),
            404 => Err(Self::missing(&object)),
            _ => Err(status_error(response.status(), "get object range")),
        }
    }

    async fn delete_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::cancelled());
        }
        let object = Self::object_name(bucket, key);
        let response = self
            .authorized(self.client.delete(self.object_url(&object)))
            .send()
            .await
            .map_err(transport_error)?;
        match response.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            _ => Err(status_error(response.status(), "delete object")),
        }
    }

    async fn create_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        let marker = ObjectKey::new_unchecked(BUCKET_MARKER);
        self.write_object(token, bucket, &marker, bytes::Bytes::new().into())
            .await
            .map(|_| ())
    }

    async fn delete_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        let marker = ObjectKey::new_unchecked(BUCKET_MARKER);
        self.delete_object(token, bucket, &marker).await
    }

    async fn bucket_exists(&self, token: &CancellationToken, bucket: &BucketName) -> Result<bool> {
        let marker = format!("{}/{BUCKET_MARKER}", bucket.as_str());
        Ok(self.resource(token, &marker).await?.is_some())
    }

    async fn object_exists(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<bool> {
        Ok(self
            .resource(token, &Self::object_name(bucket, key))
            .await?
            .is_some())
    }

    async fn object_size(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<u64> {
        let object = Self::object_name(bucket, key);
        let resource = self
            .resource(token, &object)
            .await?
            .ok_or_else(|| Self::missing(&object))?;
        resource
            .size
            .parse()
            .map_err(|_| Error::storage("invalid size in object resource"))
    }

    async fn object_hash(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<String> {
        let object = Self::object_name(bucket, key);
        let resource = self
            .resource(token, &object)
            .await?
            .ok_or_else(|| Self::missing(&object))?;
        if let Some(hash) = resource.metadata.get("sha256") {
            return Ok(hash.clone());
        }

        let reader = self.read_object(token, bucket, key).await?;
        let data = crate::read_to_end(reader).await?;
        Ok(sha256_hex(&data))
    }

    async fn health_check(&self, token: &CancellationToken) -> Result<()> {
        self.resource(token, HEALTH_SENTINEL).await.map(|_| ())
    }
}
