//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Object storage metadata
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");
// Key: "bucket\x00key", prefix-scannable for listing
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");
// Key: upload_id (uuid)
pub const MULTIPART_UPLOADS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("multipart_uploads");
// Key: "bucket\x00key", write intents consumed by the orphan sweeper
pub const UPLOAD_PROGRESS: TableDefinition<&str, &[u8]> = TableDefinition::new("upload_progress");

// Authorization
// Key: policy id (uuid), Value: JSON (conditions are free-form documents)
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");
// Key: "{inverted_micros:020}\x00{id}" so plain ascending scans run newest-first
pub const AUDIT_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("audit_logs");

// Supply chain
// Key: "artifact_ref\x00id", multi-value by prefix scan
pub const SIGNATURES: TableDefinition<&str, &[u8]> = TableDefinition::new("signatures");
// Key: artifact_ref, at most one per artifact
pub const SBOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("sboms");
// Key: "artifact_ref\x00id", Value: JSON (predicates are free-form documents)
pub const ATTESTATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("attestations");

/// All tables, opened once at startup so later reads never race table
/// creation.
pub const ALL: &[TableDefinition<'static, &str, &[u8]>] = &[
    BUCKETS,
    ARTIFACTS,
    MULTIPART_UPLOADS,
    UPLOAD_PROGRESS,
    POLICIES,
    AUDIT_LOGS,
    SIGNATURES,
    SBOMS,
    ATTESTATIONS,
];
