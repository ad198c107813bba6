//! Audit logger
//!
//! Append-only access log. Records go through a bounded queue drained
//! by one writer task; a full queue drops the entry (counted in
//! `system_errors_total`) rather than stalling or failing the request.

use chrono::Utc;
use depot_common::AuditEntry;
use depot_common::Result;
use depot_meta::{AuditQuery, MetaStore};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Everything captured about one request
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: String,
    pub username: String,
    pub method: String,
    pub resource: String,
    pub status: u16,
    pub ip: String,
    pub user_agent: String,
    pub error_message: Option<String>,
}

impl AuditEvent {
    /// Event for an unauthenticated request
    #[must_use]
    pub fn anonymous(method: &str, resource: &str) -> Self {
        Self {
            user_id: "anonymous".to_string(),
            username: "anonymous".to_string(),
            method: method.to_string(),
            resource: resource.to_string(),
            status: 0,
            ip: String::new(),
            user_agent: String::new(),
            error_message: None,
        }
    }
}

/// Handle for recording and querying audit entries
#[derive(Clone)]
pub struct AuditLogger {
    meta: MetaStore,
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditLogger {
    /// Start the writer task and return the logger handle
    #[must_use]
    pub fn spawn(meta: MetaStore) -> Self {
        Self::with_capacity(meta, DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(meta: MetaStore, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(capacity.max(1));
        let writer_meta = meta.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(err) = writer_meta.append_audit(&entry) {
                    // Best effort: log locally, never fail the request
                    warn!(error = %err, "audit append failed");
                    counter!(
                        "system_errors_total",
                        "type" => "audit_write",
                        "component" => "audit"
                    )
                    .increment(1);
                }
            }
        });
        Self { meta, tx }
    }

    /// Enqueue one entry. Non-blocking; drops (and counts) when the
    /// queue is full.
    pub fn record(&self, event: AuditEvent) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: event.user_id,
            username: event.username,
            method: event.method,
            resource: event.resource,
            status: event.status,
            ip: event.ip,
            user_agent: event.user_agent,
            error_message: event.error_message,
        };
        if self.tx.try_send(entry).is_err() {
            warn!("audit queue full, dropping entry");
            counter!(
                "system_errors_total",
                "type" => "audit_drop",
                "component" => "audit"
            )
            .increment(1);
        }
    }

    /// Filterable query over the append-only log, newest first
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.meta.query_audit(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn logger() -> (AuditLogger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("metadata.db")).unwrap();
        (AuditLogger::spawn(meta), dir)
    }

    async fn drain(logger: &AuditLogger, expected: usize) -> Vec<AuditEntry> {
        // The writer task drains asynchronously; poll briefly
        for _ in 0..100 {
            let entries = logger.query(&AuditQuery::default()).unwrap();
            if entries.len() >= expected {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        logger.query(&AuditQuery::default()).unwrap()
    }

    #[tokio::test]
    async fn test_record_and_query() {
        let (logger, _dir) = logger();
        logger.record(AuditEvent {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            method: "PUT".to_string(),
            resource: "/s3/releases/app.bin".to_string(),
            status: 200,
            ip: "10.0.0.1".to_string(),
            user_agent: "depot-cli".to_string(),
            error_message: None,
        });

        let entries = drain(&logger, 1).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, "u1");
        assert_eq!(entries[0].method, "PUT");
        assert_eq!(entries[0].status, 200);
    }

    #[tokio::test]
    async fn test_resource_prefix_filter() {
        let (logger, _dir) = logger();
        for resource in ["/s3/releases/a", "/s3/releases/b", "/rbac/policies"] {
            let mut event = AuditEvent::anonymous("GET", resource);
            event.status = 200;
            logger.record(event);
        }

        drain(&logger, 3).await;
        let entries = logger
            .query(&AuditQuery {
                resource_prefix: Some("/s3/releases/".to_string()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("metadata.db")).unwrap();
        let logger = AuditLogger::with_capacity(meta, 1);

        // Recording more than fits must not block the caller
        for _ in 0..50 {
            logger.record(AuditEvent::anonymous("GET", "/s3/releases/a"));
        }
    }
}
