//! S3 remote backend
//!
//! Speaks the S3 REST API directly over reqwest with SigV4 request
//! signing. All Depot buckets map into one remote bucket as flat
//! `<bucket>/<key>` prefixes; the content SHA-256 travels as the
//! `x-amz-meta-sha256` user-metadata entry so `object_hash` stays O(1).

use crate::remote::{
    body_reader, encode_object_path, materialize, status_error, transport_error,
};
use crate::{Backend, ObjectReader, RANGE_TO_EOF, VerifyingReader, WriteOutcome, WritePayload};
use async_trait::async_trait;
use chrono::Utc;
use depot_common::config::RemoteBackendConfig;
use depot_common::{BucketName, Error, ObjectKey, Result, digest::sha256_hex};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const HASH_META_HEADER: &str = "x-amz-meta-sha256";
const BUCKET_MARKER: &str = ".depot-bucket";
const HEALTH_SENTINEL: &str = ".depot-health";
const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3-compatible remote object storage
pub struct S3Backend {
    client: reqwest::Client,
    endpoint: String,
    region: String,
    container: String,
    access_key: String,
    secret_key: String,
}

impl S3Backend {
    #[must_use]
    pub fn new(config: &RemoteBackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            region: config.region.clone(),
            container: config.container.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn object_name(bucket: &BucketName, key: &ObjectKey) -> String {
        format!("{}/{}", bucket.as_str(), key.as_str())
    }

    fn path_for(&self, object: &str) -> String {
        format!("/{}/{}", self.container, encode_object_path(object))
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    /// Build the SigV4 `Authorization` header plus the signed headers
    fn sign(
        &self,
        method: &str,
        path: &str,
        payload_hash: &str,
        extra_headers: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let mut headers: BTreeMap<String, String> = extra_headers.clone();
        headers.insert("host".to_string(), self.host());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{method}\n{path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        headers.insert(
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key
            ),
        );
        headers.remove("host"); // reqwest sets Host itself
        headers
    }

    async fn request(
        &self,
        token: &CancellationToken,
        method: reqwest::Method,
        object: &str,
        payload_hash: &str,
        extra_headers: BTreeMap<String, String>,
        body: Option<bytes::Bytes>,
    ) -> Result<reqwest::Response> {
        if token.is_cancelled() {
            return Err(Error::cancelled());
        }

        let path = self.path_for(object);
        let headers = self.sign(method.as_str(), &path, payload_hash, &extra_headers);

        let mut request = self.client.request(method, self.url_for(&path));
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
        object: &str,
    ) -> Result<Option<reqwest::Response>> {
        let response = self
            .request(
                token,
                reqwest::Method::HEAD,
                object,
                EMPTY_PAYLOAD_HASH,
                BTreeMap::new(),
                None,
            )
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response)),
            404 => Ok(None),
            _ => Err(status_error(response.status(), "head object")),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
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
        headers.insert(HASH_META_HEADER.to_string(), sha256.clone());

        let response = self
            .request(
                token,
                reqwest::Method::PUT,
                &Self::object_name(bucket, key),
                &sha256,
                headers,
                Some(bytes),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "put object"));
        }
        debug!(bucket = %bucket, key = %key, written, "wrote object to s3");
        Ok(WriteOutcome { written, sha256 })
    }

    async fn read_object(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<ObjectReader> {
        let object = Self::object_name(bucket, key);
        let expected = match self.head(token, &object).await? {
            Some(response) => response
                .headers()
                .get(HASH_META_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            None => {
                return Err(Error::not_found(format!("object not found: {object}")));
            }
        };

        let response = self
            .request(
                token,
                reqwest::Method::GET,
                &object,
                EMPTY_PAYLOAD_HASH,
                BTreeMap::new(),
                None,
            )
            .await?;
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
        let range = if length == RANGE_TO_EOF {
            format!("bytes={offset}-")
        } else {
            let length = u64::try_from(length)
                .map_err(|_| Error::invalid_range(format!("negative length {length}")))?;
            format!("bytes={offset}-{}", offset + length.saturating_sub(1))
        };

        let mut headers = BTreeMap::new();
        headers.insert("range".to_string(), range);

        let response = self
            .request(
                token,
                reqwest::Method::GET,
                &Self::object_name(bucket, key),
                EMPTY_PAYLOAD_HASH,
                headers,
                None,
            )
            .await?;
        match response.status().as_u16() {
            200 | 206 => Ok(body_reader(response)),
            416 => Err(Error::invalid_range(format!(
                "range starting at {offset} is outside the object"
            ))),
            _ => Err(status_error(response.status(), "get object range")),
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
                &Self::object_name(bucket, key),
                EMPTY_PAYLOAD_HASH,
                BTreeMap::new(),
                None,
            )
            .await?;
        match response.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            _ => Err(status_error(response.status(), "delete object")),
        }
    }

    async fn create_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        let marker = format!("{}/{BUCKET_MARKER}", bucket.as_str());
        let response = self
            .request(
                token,
                reqwest::Method::PUT,
                &marker,
                EMPTY_PAYLOAD_HASH,
                BTreeMap::new(),
                Some(bytes::Bytes::new()),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "create bucket marker"));
        }
        Ok(())
    }

    async fn delete_bucket(&self, token: &CancellationToken, bucket: &BucketName) -> Result<()> {
        let marker = format!("{}/{BUCKET_MARKER}", bucket.as_str());
        let response = self
            .request(
                token,
                reqwest::Method::DELETE,
                &marker,
                EMPTY_PAYLOAD_HASH,
                BTreeMap::new(),
                None,
            )
            .await?;
        match response.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            _ => Err(status_error(response.status(), "delete bucket marker")),
        }
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
        Ok(self
            .head(token, &Self::object_name(bucket, key))
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
        let response = self
            .head(token, &object)
            .await?
            .ok_or_else(|| Error::not_found(format!("object not found: {object}")))?;
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
        let object = Self::object_name(bucket, key);
        let response = self
            .head(token, &object)
            .await?
            .ok_or_else(|| Error::not_found(format!("object not found: {object}")))?;
        if let Some(hash) = response
            .headers()
            .get(HASH_META_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            return Ok(hash.to_string());
        }

        // Written by something other than Depot: recompute from the payload
        let reader = self.read_object(token, bucket, key).await?;
        let data = crate::read_to_end(reader).await?;
        Ok(sha256_hex(&data))
    }

    async fn health_check(&self, token: &CancellationToken) -> Result<()> {
        // HEAD on a reserved sentinel: 404 still proves the store answers
        self.head(token, HEALTH_SENTINEL).await.map(|_| ())
    }
}
