//! Multipart upload lifecycle
//!
//! Parts stage as backend objects under
//! `.multipart/<upload_id>/part-<n>` inside the destination bucket.
//! `complete` validates the client's part list against the session,
//! streams the concatenation into the final object write, and commits
//! metadata with the composite ETag.

use crate::ObjectEngine;
use bytes::Bytes;
use chrono::Utc;
use depot_backend::WritePayload;
use depot_common::types::{MAX_PART_NUMBER, MIN_PART_NUMBER};
use depot_common::{
    Artifact, BucketName, Error, MultipartSession, ObjectKey, PartInfo, Result, digest,
};
use depot_meta::WriteIntent;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A part reference supplied by the client on complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

fn staging_key(session: &MultipartSession, part_number: u32) -> ObjectKey {
    ObjectKey::new_unchecked(format!(
        ".multipart/{}/part-{part_number}",
        session.upload_id
    ))
}

impl ObjectEngine {
    pub fn initiate_multipart(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
        content_type: String,
        custom_headers: HashMap<String, String>,
    ) -> Result<MultipartSession> {
        self.head_bucket(bucket)?;
        let session =
            MultipartSession::new(bucket.clone(), key.clone(), content_type, custom_headers);
        self.meta().put_session(&session)?;
        info!(bucket = %bucket, key = %key, upload_id = %session.upload_id, "initiated multipart upload");
        Ok(session)
    }

    /// Stage one part. Re-uploading the same part number overwrites the
    /// staged payload and its recorded etag.
    pub async fn upload_part(
        &self,
        token: &CancellationToken,
        upload_id: uuid::Uuid,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(Error::bad_request(format!(
                "part number {part_number} outside [{MIN_PART_NUMBER}, {MAX_PART_NUMBER}]"
            ))
            .with_detail("part_number", part_number.to_string()));
        }

        let mut session = self
            .meta()
            .get_session(upload_id)?
            .ok_or_else(|| Error::not_found(format!("no such upload: {upload_id}")))?;

        let etag = digest::md5_hex(&body);
        let size = body.len() as u64;
        self.backend()
            .write_object(
                token,
                &session.bucket,
                &staging_key(&session, part_number),
                WritePayload::Bytes(body),
            )
            .await?;

        session.parts.insert(
            part_number,
            PartInfo {
                etag: etag.clone(),
                size,
                offset: 0,
            },
        );
        self.meta().put_session(&session)?;
        Ok(etag)
    }

    /// Validate the supplied part list and assemble the final object.
    /// The session record is removed after the artifact commits, so a
    /// repeated complete sees `not_found`.
    #[tracing::instrument(level = "debug", skip_all, fields(upload_id = %upload_id))]
    pub async fn complete_multipart(
        &self,
        token: &CancellationToken,
        upload_id: uuid::Uuid,
        parts: &[CompletedPart],
    ) -> Result<Artifact> {
        let session = self
            .meta()
            .get_session(upload_id)?
            .ok_or_else(|| Error::not_found(format!("no such upload: {upload_id}")))?;

        validate_parts(&session, parts)?;

        let total: u64 = session.parts.values().map(|p| p.size).sum();
        let etag = digest::composite_etag(session.parts.values().map(|p| p.etag.as_str()))
            .map_err(|err| Error::internal("corrupt part etag").with_source(err))?;
        let storage_path = format!("{}/{}", session.bucket.as_str(), session.key.as_str());

        self.meta().put_intent(&WriteIntent {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            storage_path: storage_path.clone(),
            started_at: Utc::now(),
        })?;

        // Feed the concatenated parts through a duplex pipe so the final
        // write sees one continuous stream
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let feeder = {
            let backend = self.backend().clone();
            let token = token.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let mut writer = writer;
                for part_number in session.parts.keys().copied() {
                    let staged = staging_key(&session, part_number);
                    let mut part_reader = backend
                        .read_object(&token, &session.bucket, &staged)
                        .await?;
                    tokio::io::copy(&mut part_reader, &mut writer).await?;
                }
                Ok::<(), Error>(())
            })
        };

        let outcome = self
            .backend()
            .write_object(
                token,
                &session.bucket,
                &session.key,
                WritePayload::Stream {
                    reader: Box::new(reader),
                    size: total,
                },
            )
            .await?;

        match feeder.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(Error::internal("part feeder panicked").with_source(err)),
        }
        if outcome.written != total {
            return Err(Error::storage(format!(
                "assembled {} bytes, expected {total}",
                outcome.written
            )));
        }

        let previous = self.meta().get_artifact(&session.bucket, &session.key)?;
        let now = Utc::now();
        let artifact = Artifact {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            size: total,
            content_type: session.content_type.clone(),
            content_digest: outcome.sha256,
            etag,
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
            custom_headers: session.custom_headers.clone(),
            storage_path,
            multipart_id: Some(upload_id),
        };
        self.commit_artifact(&artifact, previous.as_ref())?;

        self.cleanup_session(token, &session).await;
        info!(
            bucket = %session.bucket, key = %session.key, upload_id = %upload_id,
            parts = session.parts.len(), size = total, "completed multipart upload"
        );
        Ok(artifact)
    }

    /// Remove all staged parts and the session record. Idempotent: an
    /// unknown upload id is already aborted.
    pub async fn abort_multipart(
        &self,
        token: &CancellationToken,
        upload_id: uuid::Uuid,
    ) -> Result<()> {
        let Some(session) = self.meta().get_session(upload_id)? else {
            return Ok(());
        };
        self.cleanup_session(token, &session).await;
        info!(upload_id = %upload_id, "aborted multipart upload");
        Ok(())
    }

    async fn cleanup_session(&self, token: &CancellationToken, session: &MultipartSession) {
        for part_number in session.parts.keys().copied() {
            let staged = staging_key(session, part_number);
            if let Err(err) = self
                .backend()
                .delete_object(token, &session.bucket, &staged)
                .await
            {
                warn!(upload_id = %session.upload_id, part_number, error = %err, "failed to remove staged part");
            }
        }
        if let Err(err) = self.meta().delete_session(session.upload_id) {
            warn!(upload_id = %session.upload_id, error = %err, "failed to remove multipart session");
        }
    }

    /// Abort sessions that have been idle past the configured timeout
    pub async fn reap_idle_sessions(&self, token: &CancellationToken) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.multipart_idle())
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut reaped = 0;
        for session in self.meta().list_sessions()? {
            if session.initiated_at < cutoff {
                warn!(upload_id = %session.upload_id, "reaping idle multipart session");
                self.cleanup_session(token, &session).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

/// Client part list must name exactly the stored parts, strictly
/// ascending, with matching etags.
fn validate_parts(session: &MultipartSession, parts: &[CompletedPart]) -> Result<()> {
    if parts.is_empty() {
        return Err(Error::bad_request("part list is empty"));
    }

    let mut last = 0u32;
    for part in parts {
        if part.part_number <= last {
            return Err(Error::bad_request("part numbers must be strictly ascending")
                .with_detail("part_number", part.part_number.to_string()));
        }
        last = part.part_number;
    }

    if parts.len() != session.parts.len() {
        return Err(Error::bad_request(format!(
            "{} parts supplied, {} uploaded",
            parts.len(),
            session.parts.len()
        )));
    }

    for part in parts {
        let stored = session.parts.get(&part.part_number).ok_or_else(|| {
            Error::bad_request(format!("part {} was never uploaded", part.part_number))
                .with_detail("part_number", part.part_number.to_string())
        })?;
        let client_etag = part.etag.trim_matches('"');
        if client_etag != stored.etag {
            return Err(Error::bad_request(format!(
                "etag mismatch for part {}",
                part.part_number
            ))
            .with_detail("part_number", part.part_number.to_string())
            .with_detail("expected", stored.etag.clone())
            .with_detail("provided", client_etag.to_string()));
        }
    }
    Ok(())
}
