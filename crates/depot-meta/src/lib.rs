//! Depot Meta - Embedded metadata store
//!
//! One redb database file holds the nine metadata namespaces: buckets,
//! artifacts, multipart sessions, write intents, policies, audit logs,
//! signatures, SBOMs, and attestations.

pub mod store;
pub mod tables;

pub use store::{
    AUDIT_DEFAULT_LIMIT, AUDIT_MAX_LIMIT, AuditQuery, MetaStore, WriteIntent,
};
