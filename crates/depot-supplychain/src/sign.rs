//! Detached artifact signatures
//!
//! SHA-256 over the stored content, signed RSA-PKCS#1 v1.5. Keys
//! arrive as PEM; the public half is stored with each signature so
//! verification needs nothing external. Verification re-reads the
//! object through the verifying reader, so a payload whose digest no
//! longer matches its metadata fails before any signature is checked.

use crate::SupplyChainService;
use chrono::Utc;
use depot_common::{BucketName, Error, ObjectKey, Result, SignatureRecord};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// The one signature algorithm Depot produces
pub const SIGNATURE_ALGORITHM: &str = "RSA-SHA256";

/// Outcome for a single stored signature
#[derive(Debug, Clone, Serialize)]
pub struct SignatureOutcome {
    pub id: Uuid,
    pub signed_by: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-signature outcomes plus the aggregate verdict
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub artifact_ref: String,
    /// True only when at least one signature exists and every one of
    /// them verifies
    pub all_valid: bool,
    pub results: Vec<SignatureOutcome>,
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|err| {
            Error::bad_request("private key is not valid PKCS#8 or PKCS#1 PEM")
                .with_detail("field", "private_key")
                .with_source(err)
        })
}

impl SupplyChainService {
    /// Sign the stored artifact bytes and persist the detached
    /// signature. Many signatures may accumulate per artifact.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %bucket, key = %key))]
    pub async fn sign_artifact(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
        private_key_pem: &str,
        signed_by: &str,
    ) -> Result<SignatureRecord> {
        if !self.config().signing_enabled {
            return Err(Error::forbidden("artifact signing is disabled"));
        }

        let artifact = self.engine().head_object(bucket, key)?;
        let content = self.read_artifact(token, bucket, key).await?;

        let private_key = parse_private_key(private_key_pem)?;
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| Error::internal("public key encoding failed").with_source(err))?;

        let signing_key = SigningKey::<Sha256>::new(private_key);
        let signature = signing_key.sign(&content).to_vec();

        let record = SignatureRecord {
            id: Uuid::new_v4(),
            artifact_ref: artifact.artifact_ref().to_string(),
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            signature,
            public_key_pem,
            signed_by: signed_by.to_string(),
            signed_at: Utc::now(),
        };
        self.meta().put_signature(&record)?;
        info!(artifact = %record.artifact_ref, signed_by, "signed artifact");
        Ok(record)
    }

    pub fn list_signatures(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<Vec<SignatureRecord>> {
        let artifact = self.engine().head_object(bucket, key)?;
        self.meta()
            .list_signatures(&artifact.artifact_ref().to_string())
    }

    /// Re-read the artifact and cryptographically verify every stored
    /// signature against the current bytes.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %bucket, key = %key))]
    pub async fn verify_artifact(
        &self,
        token: &CancellationToken,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<VerificationResult> {
        let artifact = self.engine().head_object(bucket, key)?;
        let artifact_ref = artifact.artifact_ref().to_string();
        let signatures = self.meta().list_signatures(&artifact_ref)?;
        let content = self.read_artifact(token, bucket, key).await?;

        let results: Vec<SignatureOutcome> = signatures
            .iter()
            .map(|record| verify_one(record, &content))
            .collect();
        let all_valid = !results.is_empty() && results.iter().all(|r| r.valid);

        Ok(VerificationResult {
            artifact_ref,
            all_valid,
            results,
        })
    }
}

fn verify_one(record: &SignatureRecord, content: &[u8]) -> SignatureOutcome {
    let outcome = |valid: bool, error: Option<String>| SignatureOutcome {
        id: record.id,
        signed_by: record.signed_by.clone(),
        valid,
        error,
    };

    let public_key = match RsaPublicKey::from_public_key_pem(&record.public_key_pem) {
        Ok(key) => key,
        Err(err) => return outcome(false, Some(format!("unparsable public key: {err}"))),
    };
    let signature = match rsa::pkcs1v15::Signature::try_from(record.signature.as_slice()) {
        Ok(signature) => signature,
        Err(err) => return outcome(false, Some(format!("malformed signature: {err}"))),
    };

    match VerifyingKey::<Sha256>::new(public_key).verify(content, &signature) {
        Ok(()) => outcome(true, None),
        Err(_) => outcome(false, Some("signature does not match content".to_string())),
    }
}
