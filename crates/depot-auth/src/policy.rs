//! Policy engine: principal/resource/action matching with deny
//! precedence
//!
//! Policies live in the metadata store and are cached in memory; any
//! policy CRUD invalidates the cache. Matching is glob-style: `*`
//! spans path segments, everything else is literal.

use crate::Principal;
use chrono::Utc;
use depot_common::{Action, Effect, Error, Policy, PrincipalRef, Result};
use depot_meta::MetaStore;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Authorization outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Decision plus the policy that produced it (absent on default deny
/// and on the admin bypass)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub decision: Decision,
    pub matched_policy: Option<Uuid>,
}

impl Authorization {
    #[must_use]
    pub const fn allowed(&self) -> bool {
        matches!(self.decision, Decision::Allow)
    }
}

/// Glob match where `*` matches any character sequence, `/` included
fn pattern_matches(pattern: &str, resource: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let resource: Vec<char> = resource.chars().collect();

    // Two-pointer wildcard match with backtracking to the last `*`
    let (mut p, mut r) = (0usize, 0usize);
    let (mut star, mut star_r) = (None::<usize>, 0usize);
    while r < resource.len() {
        if p < pattern.len() && (pattern[p] == resource[r]) {
            p += 1;
            r += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_r = r;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_r += 1;
            r = star_r;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

fn policy_references(policy: &Policy, principal: &Principal) -> bool {
    policy.principals.iter().any(|reference| match reference {
        PrincipalRef::Wildcard => true,
        PrincipalRef::User(id) => *id == principal.user_id,
        PrincipalRef::Role(role) => principal.roles.iter().any(|r| r == role),
        PrincipalRef::Group(group) => principal.groups.iter().any(|g| g == group),
    })
}

/// Policy storage plus the in-memory evaluation cache
pub struct PolicyEngine {
    meta: MetaStore,
    cache: RwLock<Option<Arc<Vec<Policy>>>>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(meta: MetaStore) -> Self {
        Self {
            meta,
            cache: RwLock::new(None),
        }
    }

    fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn policies(&self) -> Result<Arc<Vec<Policy>>> {
        if let Some(policies) = self.cache.read().clone() {
            return Ok(policies);
        }
        let policies = Arc::new(self.meta.list_policies()?);
        *self.cache.write() = Some(policies.clone());
        Ok(policies)
    }

    // =========== CRUD ===========

    pub fn create_policy(
        &self,
        resource_pattern: String,
        actions: BTreeSet<Action>,
        effect: Effect,
        principals: Vec<PrincipalRef>,
    ) -> Result<Policy> {
        if resource_pattern.is_empty() {
            return Err(Error::bad_request("resource pattern is empty")
                .with_detail("field", "resource_pattern"));
        }
        if actions.is_empty() {
            return Err(Error::bad_request("policy grants no actions").with_detail("field", "actions"));
        }
        let now = Utc::now();
        let policy = Policy {
            id: Uuid::new_v4(),
            resource_pattern,
            actions,
            effect,
            principals,
            conditions: None,
            created_at: now,
            updated_at: now,
        };
        self.meta.put_policy(&policy)?;
        self.invalidate();
        Ok(policy)
    }

    pub fn get_policy(&self, id: Uuid) -> Result<Policy> {
        self.meta
            .get_policy(id)?
            .ok_or_else(|| Error::not_found(format!("policy not found: {id}")))
    }

    pub fn update_policy(&self, mut policy: Policy) -> Result<Policy> {
        self.get_policy(policy.id)?;
        policy.updated_at = Utc::now();
        self.meta.put_policy(&policy)?;
        self.invalidate();
        Ok(policy)
    }

    pub fn delete_policy(&self, id: Uuid) -> Result<()> {
        if !self.meta.delete_policy(id)? {
            return Err(Error::not_found(format!("policy not found: {id}")));
        }
        self.invalidate();
        Ok(())
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>> {
        self.meta.list_policies()
    }

    // =========== Evaluation ===========

    /// Deny-precedence evaluation:
    /// 1. `role:admin` principals bypass with allow.
    /// 2. Among policies referencing the principal and matching the
    ///    resource and action: any deny wins, else any allow wins,
    ///    else default deny.
    pub fn authorize(
        &self,
        principal: &Principal,
        resource: &str,
        action: Action,
    ) -> Result<Authorization> {
        if principal.is_admin() {
            return Ok(Authorization {
                decision: Decision::Allow,
                matched_policy: None,
            });
        }

        let policies = self.policies()?;
        let matched: Vec<&Policy> = policies
            .iter()
            .filter(|policy| policy_references(policy, principal))
            .filter(|policy| policy.actions.contains(&action))
            .filter(|policy| pattern_matches(&policy.resource_pattern, resource))
            .collect();

        if let Some(deny) = matched.iter().find(|p| p.effect == Effect::Deny) {
            debug!(user = %principal.user_id, resource, action = %action, policy = %deny.id, "denied by policy");
            return Ok(Authorization {
                decision: Decision::Deny,
                matched_policy: Some(deny.id),
            });
        }
        if let Some(allow) = matched.first() {
            return Ok(Authorization {
                decision: Decision::Allow,
                matched_policy: Some(allow.id),
            });
        }

        debug!(user = %principal.user_id, resource, action = %action, "default deny");
        Ok(Authorization {
            decision: Decision::Deny,
            matched_policy: None,
        })
    }
}
