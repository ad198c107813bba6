//! Main metadata store
//!
//! A single redb database file holds nine logical namespaces. Values
//! are bincode, except policies and attestations whose free-form JSON
//! documents require a self-describing encoding. One store is opened
//! per process; redb serializes writers per transaction.

use crate::tables;
use chrono::{DateTime, Utc};
use depot_common::{
    Artifact, AuditEntry, AttestationRecord, Bucket, BucketName, Error, ErrorKind,
    MultipartSession, ObjectKey, Policy, Result, SbomRecord, SignatureRecord,
};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Hard caps on audit query results
pub const AUDIT_DEFAULT_LIMIT: usize = 100;
pub const AUDIT_MAX_LIMIT: usize = 10_000;

const SEP: char = '\x00';

/// Pending backend write, recorded before the payload lands so the
/// orphan sweeper can repair failures between write and commit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntent {
    pub bucket: BucketName,
    pub key: ObjectKey,
    pub storage_path: String,
    pub started_at: DateTime<Utc>,
}

/// Filters for audit log queries
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub resource_prefix: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(AUDIT_DEFAULT_LIMIT)
            .min(AUDIT_MAX_LIMIT)
    }
}

fn meta_err(err: impl Into<redb::Error>) -> Error {
    let err = err.into();
    let kind = match &err {
        redb::Error::Io(_) => ErrorKind::StorageFailure,
        redb::Error::Corrupted(_) => ErrorKind::MetadataCorrupted,
        _ => ErrorKind::Internal,
    };
    Error::new(kind, format!("metadata store: {err}"))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|err| Error::internal("metadata encode failed").with_source(err))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|err| Error::metadata_corrupted("metadata decode failed").with_source(err))
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|err| Error::internal("metadata encode failed").with_source(err))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|err| Error::metadata_corrupted("metadata decode failed").with_source(err))
}

fn artifact_key(bucket: &BucketName, key: &ObjectKey) -> String {
    format!("{}{SEP}{}", bucket.as_str(), key.as_str())
}

fn ref_key(artifact_ref: &str, id: Uuid) -> String {
    format!("{artifact_ref}{SEP}{id}")
}

fn audit_key(timestamp: DateTime<Utc>, id: Uuid) -> String {
    let micros = timestamp.timestamp_micros().max(0) as u64;
    format!("{:020}{SEP}{id}", u64::MAX - micros)
}

/// Metadata store backed by a single redb file
#[derive(Clone)]
pub struct MetaStore {
    db: Arc<Database>,
}

impl MetaStore {
    /// Open (or create) the store and ensure every table exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(|err| {
            Error::new(
                ErrorKind::MetadataLocked,
                format!("cannot open metadata store: {err}"),
            )
        })?;

        let txn = db.begin_write().map_err(meta_err)?;
        for table in tables::ALL {
            txn.open_table(*table).map_err(meta_err)?;
        }
        txn.commit().map_err(meta_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Lightweight readiness probe: one read transaction
    pub fn health_check(&self) -> Result<()> {
        let txn = self.db.begin_read().map_err(meta_err)?;
        txn.open_table(tables::BUCKETS).map_err(meta_err)?;
        Ok(())
    }

    fn insert(&self, table: TableDefinition<'_, &str, &[u8]>, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.db.begin_write().map_err(meta_err)?;
        {
            let mut table = txn.open_table(table).map_err(meta_err)?;
            table.insert(key, value).map_err(meta_err)?;
        }
        txn.commit().map_err(meta_err)
    }

    fn fetch(&self, table: TableDefinition<'_, &str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(meta_err)?;
        let table = txn.open_table(table).map_err(meta_err)?;
        Ok(table
            .get(key)
            .map_err(meta_err)?
            .map(|guard| guard.value().to_vec()))
    }

    fn remove(&self, table: TableDefinition<'_, &str, &[u8]>, key: &str) -> Result<bool> {
        let txn = self.db.begin_write().map_err(meta_err)?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(meta_err)?;
            existed = table.remove(key).map_err(meta_err)?.is_some();
        }
        txn.commit().map_err(meta_err)?;
        Ok(existed)
    }

    /// Collect `(key, value)` pairs starting at `from`, while keys keep
    /// the given prefix, up to `max` entries (`None` = unbounded)
    fn scan_prefix(
        &self,
        table: TableDefinition<'_, &str, &[u8]>,
        prefix: &str,
        from: &str,
        max: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(meta_err)?;
        let table = txn.open_table(table).map_err(meta_err)?;
        let mut out = Vec::new();
        for entry in table.range(from..).map_err(meta_err)? {
            let (key, value) = entry.map_err(meta_err)?;
            let key = key.value().to_string();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value.value().to_vec()));
            if max.is_some_and(|max| out.len() >= max) {
                break;
            }
        }
        Ok(out)
    }

    fn remove_prefix(&self, table: TableDefinition<'_, &str, &[u8]>, prefix: &str) -> Result<usize> {
        let keys: Vec<String> = self
            .scan_prefix(table, prefix, prefix, None)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let txn = self.db.begin_write().map_err(meta_err)?;
        {
            let mut table = txn.open_table(table).map_err(meta_err)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(meta_err)?;
            }
        }
        txn.commit().map_err(meta_err)?;
        Ok(keys.len())
    }

    // =========== Buckets ===========

    pub fn put_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.insert(tables::BUCKETS, bucket.name.as_str(), &encode(bucket)?)
    }

    pub fn get_bucket(&self, name: &BucketName) -> Result<Option<Bucket>> {
        self.fetch(tables::BUCKETS, name.as_str())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn delete_bucket(&self, name: &BucketName) -> Result<bool> {
        self.remove(tables::BUCKETS, name.as_str())
    }

    pub fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.scan_prefix(tables::BUCKETS, "", "", None)?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    /// Adjust a bucket's object count and byte totals in one transaction
    pub fn adjust_bucket_stats(
        &self,
        name: &BucketName,
        delta_objects: i64,
        delta_bytes: i64,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(meta_err)?;
        {
            let mut table = txn.open_table(tables::BUCKETS).map_err(meta_err)?;
            // Dropping the transaction without commit aborts it
            let Some(existing) = table.get(name.as_str()).map_err(meta_err)? else {
                return Err(Error::not_found(format!("bucket not found: {name}")));
            };
            let mut bucket: Bucket = decode(existing.value())?;
            drop(existing);
            bucket.object_count = bucket.object_count.saturating_add_signed(delta_objects);
            bucket.total_bytes = bucket.total_bytes.saturating_add_signed(delta_bytes);
            table
                .insert(name.as_str(), encode(&bucket)?.as_slice())
                .map_err(meta_err)?;
        }
        txn.commit().map_err(meta_err)
    }

    // =========== Artifacts ===========

    pub fn put_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.insert(
            tables::ARTIFACTS,
            &artifact_key(&artifact.bucket, &artifact.key),
            &encode(artifact)?,
        )
    }

    pub fn get_artifact(&self, bucket: &BucketName, key: &ObjectKey) -> Result<Option<Artifact>> {
        self.fetch(tables::ARTIFACTS, &artifact_key(bucket, key))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn delete_artifact(&self, bucket: &BucketName, key: &ObjectKey) -> Result<bool> {
        self.remove(tables::ARTIFACTS, &artifact_key(bucket, key))
    }

    /// Prefix scan ordered lexicographically by key. `marker` is the
    /// last key of the previous page; results start strictly after it.
    /// Returns one extra-element sentinel: `truncated` is true when more
    /// results remain.
    pub fn list_artifacts(
        &self,
        bucket: &BucketName,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> Result<(Vec<Artifact>, bool)> {
        let table_prefix = format!("{}{SEP}{prefix}", bucket.as_str());
        let from = match marker {
            // '\x00' is the smallest char, so appending it starts the
            // scan strictly after the marker key
            Some(marker) => format!("{}{SEP}{marker}{SEP}", bucket.as_str()),
            None => table_prefix.clone(),
        };

        let rows = self.scan_prefix(
            tables::ARTIFACTS,
            &table_prefix,
            &from,
            Some(max_keys.saturating_add(1)),
        )?;
        let truncated = rows.len() > max_keys;
        rows.into_iter()
            .take(max_keys)
            .map(|(_, bytes)| decode(&bytes))
            .collect::<Result<Vec<_>>>()
            .map(|artifacts| (artifacts, truncated))
    }

    /// All artifacts in a bucket, for recursive bucket deletion
    pub fn list_all_artifacts(&self, bucket: &BucketName) -> Result<Vec<Artifact>> {
        let prefix = format!("{}{SEP}", bucket.as_str());
        self.scan_prefix(tables::ARTIFACTS, &prefix, &prefix, None)?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    // =========== Multipart sessions ===========

    pub fn put_session(&self, session: &MultipartSession) -> Result<()> {
        self.insert(
            tables::MULTIPART_UPLOADS,
            &session.upload_id.to_string(),
            &encode(session)?,
        )
    }

    pub fn get_session(&self, upload_id: Uuid) -> Result<Option<MultipartSession>> {
        self.fetch(tables::MULTIPART_UPLOADS, &upload_id.to_string())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn delete_session(&self, upload_id: Uuid) -> Result<bool> {
        self.remove(tables::MULTIPART_UPLOADS, &upload_id.to_string())
    }

    pub fn list_sessions(&self) -> Result<Vec<MultipartSession>> {
        self.scan_prefix(tables::MULTIPART_UPLOADS, "", "", None)?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    // =========== Write intents ===========

    pub fn put_intent(&self, intent: &WriteIntent) -> Result<()> {
        self.insert(
            tables::UPLOAD_PROGRESS,
            &artifact_key(&intent.bucket, &intent.key),
            &encode(intent)?,
        )
    }

    pub fn delete_intent(&self, bucket: &BucketName, key: &ObjectKey) -> Result<bool> {
        self.remove(tables::UPLOAD_PROGRESS, &artifact_key(bucket, key))
    }

    pub fn list_intents(&self) -> Result<Vec<WriteIntent>> {
        self.scan_prefix(tables::UPLOAD_PROGRESS, "", "", None)?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    // =========== Policies ===========

    pub fn put_policy(&self, policy: &Policy) -> Result<()> {
        self.insert(
            tables::POLICIES,
            &policy.id.to_string(),
            &encode_json(policy)?,
        )
    }

    pub fn get_policy(&self, id: Uuid) -> Result<Option<Policy>> {
        self.fetch(tables::POLICIES, &id.to_string())?
            .map(|bytes| decode_json(&bytes))
            .transpose()
    }

    pub fn delete_policy(&self, id: Uuid) -> Result<bool> {
        self.remove(tables::POLICIES, &id.to_string())
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>> {
        self.scan_prefix(tables::POLICIES, "", "", None)?
            .into_iter()
            .map(|(_, bytes)| decode_json(&bytes))
            .collect()
    }

    // =========== Audit log ===========

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.insert(
            tables::AUDIT_LOGS,
            &audit_key(entry.timestamp, entry.id),
            &encode(entry)?,
        )
    }

    /// Query audit entries, newest first, applying filters in-scan
    pub fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let limit = query.effective_limit();
        let txn = self.db.begin_read().map_err(meta_err)?;
        let table = txn.open_table(tables::AUDIT_LOGS).map_err(meta_err)?;

        let mut out = Vec::new();
        for entry in table.range::<&str>(..).map_err(meta_err)? {
            let (_, value) = entry.map_err(meta_err)?;
            let record: AuditEntry = decode(value.value())?;

            // Keys are inverted timestamps, so entries arrive newest
            // first; anything older than `start` ends the scan.
            if let Some(start) = query.start {
                if record.timestamp < start {
                    break;
                }
            }
            if let Some(end) = query.end {
                if record.timestamp > end {
                    continue;
                }
            }
            if let Some(user_id) = &query.user_id {
                if &record.user_id != user_id {
                    continue;
                }
            }
            if let Some(prefix) = &query.resource_prefix {
                if !record.resource.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            out.push(record);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    // =========== Signatures ===========

    pub fn put_signature(&self, record: &SignatureRecord) -> Result<()> {
        self.insert(
            tables::SIGNATURES,
            &ref_key(&record.artifact_ref, record.id),
            &encode(record)?,
        )
    }

    pub fn list_signatures(&self, artifact_ref: &str) -> Result<Vec<SignatureRecord>> {
        let prefix = format!("{artifact_ref}{SEP}");
        self.scan_prefix(tables::SIGNATURES, &prefix, &prefix, None)?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    pub fn delete_signatures(&self, artifact_ref: &str) -> Result<usize> {
        self.remove_prefix(tables::SIGNATURES, &format!("{artifact_ref}{SEP}"))
    }

    // =========== SBOMs ===========

    pub fn put_sbom(&self, record: &SbomRecord) -> Result<Option<SbomRecord>> {
        let previous = self.get_sbom(&record.artifact_ref)?;
        self.insert(tables::SBOMS, &record.artifact_ref, &encode(record)?)?;
        Ok(previous)
    }

    pub fn get_sbom(&self, artifact_ref: &str) -> Result<Option<SbomRecord>> {
        self.fetch(tables::SBOMS, artifact_ref)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn delete_sbom(&self, artifact_ref: &str) -> Result<bool> {
        self.remove(tables::SBOMS, artifact_ref)
    }

    // =========== Attestations ===========

    pub fn put_attestation(&self, record: &AttestationRecord) -> Result<()> {
        self.insert(
            tables::ATTESTATIONS,
            &ref_key(&record.artifact_ref, record.id),
            &encode_json(record)?,
        )
    }

    pub fn list_attestations(&self, artifact_ref: &str) -> Result<Vec<AttestationRecord>> {
        let prefix = format!("{artifact_ref}{SEP}");
        self.scan_prefix(tables::ATTESTATIONS, &prefix, &prefix, None)?
            .into_iter()
            .map(|(_, bytes)| decode_json(&bytes))
            .collect()
    }

    pub fn delete_attestations(&self, artifact_ref: &str) -> Result<usize> {
        self.remove_prefix(tables::ATTESTATIONS, &format!("{artifact_ref}{SEP}"))
    }

    /// Drop every supply-chain record attached to an artifact. Runs when
    /// the artifact itself is deleted.
    pub fn delete_supply_chain(&self, artifact_ref: &str) -> Result<()> {
        self.delete_signatures(artifact_ref)?;
        self.delete_sbom(artifact_ref)?;
        self.delete_attestations(artifact_ref)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_common::{Action, Effect, PrincipalRef, SbomFormat};
    use std::collections::{BTreeSet, HashMap};

    fn store() -> (MetaStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (MetaStore::open(dir.path().join("metadata.db")).unwrap(), dir)
    }

    fn bucket_name() -> BucketName {
        BucketName::new_unchecked("releases")
    }

    fn artifact(key: &str, size: u64) -> Artifact {
        Artifact {
            bucket: bucket_name(),
            key: ObjectKey::new_unchecked(key),
            size,
            content_type: "application/octet-stream".to_string(),
            content_digest: "00".repeat(32),
            etag: "11".repeat(16),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            custom_headers: HashMap::new(),
            storage_path: format!("releases/{key}"),
            multipart_id: None,
        }
    }

    #[test]
    fn test_bucket_round_trip() {
        let (store, _dir) = store();
        let bucket = Bucket::new(bucket_name());
        store.put_bucket(&bucket).unwrap();
        assert_eq!(store.get_bucket(&bucket_name()).unwrap(), Some(bucket));

        assert!(store.delete_bucket(&bucket_name()).unwrap());
        assert_eq!(store.get_bucket(&bucket_name()).unwrap(), None);
        assert!(!store.delete_bucket(&bucket_name()).unwrap());
    }

    #[test]
    fn test_bucket_stats_adjustment() {
        let (store, _dir) = store();
        store.put_bucket(&Bucket::new(bucket_name())).unwrap();
        store.adjust_bucket_stats(&bucket_name(), 2, 100).unwrap();
        store.adjust_bucket_stats(&bucket_name(), -1, -40).unwrap();

        let bucket = store.get_bucket(&bucket_name()).unwrap().unwrap();
        assert_eq!(bucket.object_count, 1);
        assert_eq!(bucket.total_bytes, 60);
    }

    #[test]
    fn test_artifact_listing_with_prefix_and_marker() {
        let (store, _dir) = store();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            store.put_artifact(&artifact(key, 1)).unwrap();
        }

        let (page, truncated) = store.list_artifacts(&bucket_name(), "a/", None, 2).unwrap();
        assert!(truncated);
        assert_eq!(
            page.iter().map(|a| a.key.as_str()).collect::<Vec<_>>(),
            vec!["a/1", "a/2"]
        );

        let (page, truncated) = store
            .list_artifacts(&bucket_name(), "a/", Some("a/2"), 2)
            .unwrap();
        assert!(!truncated);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key.as_str(), "a/3");
    }

    #[test]
    fn test_listing_is_lexicographic() {
        let (store, _dir) = store();
        for key in ["zeta", "alpha", "mid/x"] {
            store.put_artifact(&artifact(key, 1)).unwrap();
        }
        let (page, _) = store.list_artifacts(&bucket_name(), "", None, 10).unwrap();
        let keys: Vec<_> = page.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "mid/x", "zeta"]);
    }

    #[test]
    fn test_audit_query_newest_first_with_filters() {
        let (store, _dir) = store();
        let base = Utc::now();
        for (i, user) in ["alice", "bob", "alice"].iter().enumerate() {
            store
                .append_audit(&AuditEntry {
                    id: Uuid::new_v4(),
                    timestamp: base + chrono::Duration::seconds(i as i64),
                    user_id: (*user).to_string(),
                    username: (*user).to_string(),
                    method: "PUT".to_string(),
                    resource: format!("/s3/releases/obj-{i}"),
                    status: 200,
                    ip: "127.0.0.1".to_string(),
                    user_agent: "test".to_string(),
                    error_message: None,
                })
                .unwrap();
        }

        let all = store.query_audit(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        // Newest first
        assert!(all[0].timestamp > all[2].timestamp);

        let alice = store
            .query_audit(&AuditQuery {
                user_id: Some("alice".to_string()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(alice.len(), 2);

        let limited = store
            .query_audit(&AuditQuery {
                limit: Some(1),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_policy_json_round_trip() {
        let (store, _dir) = store();
        let policy = Policy {
            id: Uuid::new_v4(),
            resource_pattern: "releases/*".to_string(),
            actions: BTreeSet::from([Action::Read, Action::Write]),
            effect: Effect::Allow,
            principals: vec![PrincipalRef::Role("dev".to_string())],
            conditions: Some(serde_json::json!({"ip_range": "10.0.0.0/8"})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_policy(&policy).unwrap();
        assert_eq!(store.get_policy(policy.id).unwrap(), Some(policy.clone()));
        assert_eq!(store.list_policies().unwrap().len(), 1);
        assert!(store.delete_policy(policy.id).unwrap());
    }

    #[test]
    fn test_signatures_are_multi_value() {
        let (store, _dir) = store();
        for _ in 0..3 {
            store
                .put_signature(&SignatureRecord {
                    id: Uuid::new_v4(),
                    artifact_ref: "releases/app.bin".to_string(),
                    algorithm: "RSA-SHA256".to_string(),
                    signature: vec![1, 2, 3],
                    public_key_pem: "pem".to_string(),
                    signed_by: "alice".to_string(),
                    signed_at: Utc::now(),
                })
                .unwrap();
        }
        assert_eq!(store.list_signatures("releases/app.bin").unwrap().len(), 3);
        assert_eq!(store.list_signatures("releases/other").unwrap().len(), 0);
        assert_eq!(store.delete_signatures("releases/app.bin").unwrap(), 3);
    }

    #[test]
    fn test_sbom_replaces_and_reports_previous() {
        let (store, _dir) = store();
        let mut record = SbomRecord {
            id: Uuid::new_v4(),
            artifact_ref: "releases/app.bin".to_string(),
            format: SbomFormat::Spdx,
            version: "2.3".to_string(),
            content: b"{}".to_vec(),
            content_type: "application/json".to_string(),
            content_digest: "aa".repeat(32),
            created_by: "alice".to_string(),
            created_at: Utc::now(),
        };
        assert!(store.put_sbom(&record).unwrap().is_none());

        record.id = Uuid::new_v4();
        record.format = SbomFormat::Cyclonedx;
        let previous = store.put_sbom(&record).unwrap().unwrap();
        assert_eq!(previous.format, SbomFormat::Spdx);

        let current = store.get_sbom("releases/app.bin").unwrap().unwrap();
        assert_eq!(current.format, SbomFormat::Cyclonedx);
    }

    #[test]
    fn test_supply_chain_cascade_delete() {
        let (store, _dir) = store();
        let artifact_ref = "releases/app.bin";
        store
            .put_signature(&SignatureRecord {
                id: Uuid::new_v4(),
                artifact_ref: artifact_ref.to_string(),
                algorithm: "RSA-SHA256".to_string(),
                signature: vec![1],
                public_key_pem: "pem".to_string(),
                signed_by: "alice".to_string(),
                signed_at: Utc::now(),
            })
            .unwrap();
        store
            .put_attestation(&AttestationRecord {
                id: Uuid::new_v4(),
                artifact_ref: artifact_ref.to_string(),
                attestation_type: depot_common::AttestationType::Build,
                predicate_type: "https://slsa.dev/provenance/v1".to_string(),
                predicate: serde_json::json!({"builder": "ci"}),
                signature: None,
                created_by: "ci".to_string(),
                created_at: Utc::now(),
            })
            .unwrap();

        store.delete_supply_chain(artifact_ref).unwrap();
        assert!(store.list_signatures(artifact_ref).unwrap().is_empty());
        assert!(store.list_attestations(artifact_ref).unwrap().is_empty());
        assert!(store.get_sbom(artifact_ref).unwrap().is_none());
    }

    #[test]
    fn test_write_intents() {
        let (store, _dir) = store();
        let intent = WriteIntent {
            bucket: bucket_name(),
            key: ObjectKey::new_unchecked("app.bin"),
            storage_path: "releases/app.bin".to_string(),
            started_at: Utc::now(),
        };
        store.put_intent(&intent).unwrap();
        assert_eq!(store.list_intents().unwrap(), vec![intent.clone()]);
        assert!(store.delete_intent(&intent.bucket, &intent.key).unwrap());
        assert!(store.list_intents().unwrap().is_empty());
    }

    #[test]
    fn test_multipart_sessions() {
        let (store, _dir) = store();
        let session = MultipartSession::new(
            bucket_name(),
            ObjectKey::new_unchecked("big.bin"),
            "application/octet-stream".to_string(),
            HashMap::new(),
        );
        store.put_session(&session).unwrap();
        assert_eq!(store.get_session(session.upload_id).unwrap(), Some(session.clone()));
        assert_eq!(store.list_sessions().unwrap().len(), 1);
        assert!(store.delete_session(session.upload_id).unwrap());
        assert_eq!(store.get_session(session.upload_id).unwrap(), None);
    }
}
