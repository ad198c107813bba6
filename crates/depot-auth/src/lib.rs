//! Depot Auth - Policy engine, token validation, and audit logging
//!
//! Access control in three pieces: the OIDC token validator turns
//! bearer tokens into [`Principal`]s, the policy engine decides what a
//! principal may do with deny precedence, and the audit logger records
//! every request.

pub mod audit;
pub mod policy;
pub mod token;

pub use audit::{AuditEvent, AuditLogger};
pub use policy::{Authorization, Decision, PolicyEngine};
pub use token::{Claims, TokenValidator};

/// An authenticated (or anonymous) caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub anonymous: bool,
}

impl Principal {
    /// The unauthenticated caller, allowed only where anonymous access
    /// is configured
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            username: "anonymous".to_string(),
            email: None,
            roles: Vec::new(),
            groups: Vec::new(),
            anonymous: true,
        }
    }

    /// Principals carrying the `admin` role bypass policy evaluation
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }
}
