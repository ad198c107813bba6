//! Azure Blob Storage remote backend
//!
//! Speaks the Blob REST API with SharedKey request signing. Depot
//! buckets are flat `<bucket>/<key>` prefixes inside one container; the
//! content SHA-256 is stored as the `x-ms-meta-sha256` blob metadata.

use crate::remote::{
    body_reader, encode_object_path, materialize, status_error, transport_error,
};
use crate::{Backend, ObjectReader, RANGE_TO_EOF, VerifyingReader, WriteOutcome, WritePayload};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use depot_common::config::RemoteBackendConfig;
use depot_common::{BucketName, Error, ObjectKey, Result, digest::sha256_hex};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";
const HASH_META_HEADER: &str = "x-ms-meta-sha256";
const BUCKET_MARKER: &str = ".depot-bucket";
const HEALTH_SENTINEL: &str = ".depot-health";

/// Azure Blob remote object storage
pub struct AzureBackend {
    client: reqwest::Client,
    endpoint: String,
    account: String,
    container: String,
    /// Base64-encoded account key
    account_key: String,
}

impl AzureBackend {
    #[must_use]
    pub fn new(config: &RemoteBackendConfig) -> Self {
        let endpoint = if config.endpoint.is_empty() {
            format!("https://{}.blob.core.windows.net", config.account)
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };
        Self {
            client: reqwest::Client::new(),
            endpoint,
            account: config.account.clone(),
            container: config.container.clone(),
            account_key: config.secret_key.clone(),
        }
    }

    fn blob_name(bucket: &BucketName, key: &ObjectKey) -> String {
        format!("{}/{}", bucket.as_str(), key.as_str())
    }

    fn blob_url(&self, blob: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.container,
            encode_object_path(blob)
        )
    }

    /// SharedKey authorization over the canonicalized headers + resource
    fn sign(
        &self,
        method: &str,
        blob: &str,
        content_length: Option<u64>,
        headers: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        headers.insert(
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let canonicalized_headers: String = headers
            .iter()
            .filter(|(name, _)| name.starts_with("x-ms-"))
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let canonicalized_resource =
            format!("/{}/{}/{}", self.account, self.container, blob);
        let length_field = match content_length {
            Some(0) | None => String::new(),
            Some(n) => n.to_string(),
        };

        // SharedKey string-to-sign, 2015-02-21 and later format
        let string_to_sign = format!(
            "{method}\n\n\n{length_field}\n\n\n\n\n\n\n\n\n{canonicalized_headers}{canonicalized_resource}"
        );

        let key = base64::engine::general_purpose::STANDARD
            .decode(&self.account_key)
            .map_err(|err| Error::storage("invalid azure account key").with_source(err))?;
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC accepts any key size");
        mac.update(string_to_sign.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        headers.insert(
            "authorization".to_string(),
            format!("SharedKey {}:{signature}", self.account),
        );
        Ok(())
    }

    async fn request(
        &self,
        token: &CancellationToken,
        method: reqwest::Method,
        blob: &str,
        mut headers: BTreeMap<String, String>,
        body: Option<bytes::Bytes>,
    ) -> Result<reqwest::Response> {
        if token.is_cancelled() {
            return Err(Error::cancelled());
        }

        let content_length = body.as_ref().map(|b| b.len() as u64);
        self.sign(method.as_str(), blob, content_length, &mut headers)?;

        let mut request = self.client.request(method, self.blob_url(blob));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.map_err(transport_error)
    }

    async fn head(
        &self,
        token: &CancellationToken,
        blob: &str,
    ) -> Result<Option<reqwest::Response>> {
        let response = self
            .request(token, reqwest::Method::HEAD, blob, BTreeMap::new(), None)
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response)),
            404 => Ok(None),
            _ => Err(status_error(response.status(), "head blob")),
        }
    }

    fn missing(blob: &str) -> Error {
        Error::not_found(format!("object not found: {blob}"))
    }
}

#[async_trait]
impl Backend for AzureBackend {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn write_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        payload: WritePayload,
    ) -> Result<WriteOutcome> {
        let bytes = materialize(payload).await?;
        let sha256 = sha256_hex(&bytes);
        let written = bytes.len() as u64;

        let mut headers = BTreeMap::new();
        headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());
        headers.insert(HASH_META_HEADER.to_string(), sha256.clone());

        let response = self
            .request(
                token,
                reqwest::Method::PUT,
                &Self::blob_name(bucket, key),
                headers,
                Some(bytes),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "put blob"));
        }
        debug!(bucket = %bucket, key = %key, written, "wrote object to azure");
        Ok(WriteOutcome { written, sha256 })
    }

    async fn read_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<ObjectReader> {
        let blob = Self::blob_name(bucket, key);
        let expected = self
            .head(token, &blob)
            .await?
            .ok_or_else(|| Self::missing(&blob))?
            .headers()
            .get(HASH_META_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let response = self
            .request(token, reqwest::Method::GET, &blob, BTreeMap::new(), None)
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "get blob"));
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
        let range = if length == RANGE_TO_EOF {
            format!("bytes={offset}-")
        } else {
            let length = u64::try_from(length)
                .map_err(|_| Error::invalid_range(format!("negative length {length}")))?;
            format!("bytes={offset}-{}", offset + length.saturating_sub(1))
        };

        let blob = Self::blob_name(bucket, key);
        let mut headers = BTreeMap::new();
        headers.insert("x-ms-range".to_string(), range);

        let response = self
            .request(token, reqwest::Method::GET, &blob, headers, None)
            .await?;
        match response.status().as_u16() {
            200 | 206 => Ok(body_reader(response)),
            416 => Err(Error::invalid_range(format!(
                "range starting at {offset} is outside the blob"
            ))),
            404 => Err(Self::missing(&blob)),
            _ => Err(status_error(response.status(), "get blob range")),
        }
    }

    async fn delete_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<()> {
        let response = self
            .request(
                token,
                reqwest::Method::DELETE,
                &Self::blob_name(bucket, key),
                BTreeMap::new(),
                None,
            )
            .await?;
        match response.status().as_u16() {
            200 | 202 | 204 | 404 => Ok(()),
            _ => Err(status_error(response.status(), "delete blob")),
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
        Ok(self.head(token, &marker).await?.is_some())
    }

    async fn object_exists(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<bool> {
        Ok(self.head(token, &Self::blob_name(bucket, key)).await?.is_some())
    }

    async fn object_size(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<u64> {
        let blob = Self::blob_name(bucket, key);
        let response = self
            .head(token, &blob)
            .await?
            .ok_or_else(|| Self::missing(&blob))?;
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::storage("missing content-length on head response"))
    }

    async fn object_hash(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<String> {
        let blob = Self::blob_name(bucket, key);
        let response = self
            .head(token, &blob)
            .await?
            .ok_or_else(|| Self::missing(&blob))?;
        if let Some(hash) = response
            .headers()
            .get(HASH_META_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            return Ok(hash.to_string());
        }

        let reader = self.read_object(token, bucket, key).await?;
        let data = crate::read_to_end(reader).await?;
        Ok(sha256_hex(&data))
    }

    async fn health_check(&self, token: &CancellationToken) -> Result<()> {
        self.head(token, HEALTH_SENTINEL).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> AzureBackend {
        AzureBackend::new(&RemoteBackendConfig {
            account: "depotacct".to_string(),
            container: "depot-data".to_string(),
            secret_key: base64::engine::general_purpose::STANDARD.encode(b"account-key"),
            ..RemoteBackendConfig::default()
        })
    }

    #[test]
    fn test_default_endpoint_uses_account_host() {
        let backend = backend();
        assert_eq!(
            backend.blob_url("releases/app.bin"),
            "https://depotacct.blob.core.windows.net/depot-data/releases/app.bin"
        );
    }

    #[test]
    fn test_shared_key_signing_sets_headers() {
        let backend = backend();
        let mut headers = BTreeMap::new();
        backend
            .sign("GET", "releases/app.bin", None, &mut headers)
            .unwrap();
        assert!(headers.contains_key("x-ms-date"));
        assert_eq!(headers.get("x-ms-version").unwrap(), API_VERSION);
        assert!(headers.get("authorization").unwrap().starts_with("SharedKey depotacct:"));
    }

    #[test]
    fn test_signing_rejects_bad_account_key() {
        let backend = AzureBackend::new(&RemoteBackendConfig {
            account: "a".to_string(),
            container: "c".to_string(),
            secret_key: "not base64!!".to_string(),
            ..RemoteBackendConfig::default()
        });
        let mut headers = BTreeMap::new();
        assert!(backend.sign("GET", "x", None, &mut headers).is_err());
    }
}
