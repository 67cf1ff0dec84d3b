//! Route authorization policies and their evaluation.
//!
//! Decisions for a given `(user, session, policy)` are cached for a short TTL. The
//! policy part of the key is a SHA-256 fingerprint of the policy's normalized form,
//! so two routes with equivalent policies share cache entries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::claims::UserContext;
use crate::services::cache::{SweeperHandle, TtlCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyType {
    Public,
    #[default]
    Authenticated,
    RoleBased,
    PermissionBased,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CombinationLogic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[default]
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorizationPolicy {
    #[serde(rename = "type", default)]
    pub policy_type: PolicyType,
    #[serde(default, alias = "roles")]
    pub required_roles: BTreeSet<String>,
    #[serde(default, alias = "permissions")]
    pub required_permissions: BTreeSet<String>,
    #[serde(default)]
    pub logic: CombinationLogic,
    /// Registered custom policy name, for `type = custom`.
    #[serde(default)]
    pub custom: Option<String>,
}

fn strings<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl AuthorizationPolicy {
    pub fn public() -> Self {
        Self {
            policy_type: PolicyType::Public,
            ..Self::default()
        }
    }

    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn roles<I, S>(logic: CombinationLogic, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policy_type: PolicyType::RoleBased,
            required_roles: strings(roles),
            logic,
            ..Self::default()
        }
    }

    pub fn permissions<I, S>(logic: CombinationLogic, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policy_type: PolicyType::PermissionBased,
            required_permissions: strings(permissions),
            logic,
            ..Self::default()
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            policy_type: PolicyType::Custom,
            custom: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn is_public(&self) -> bool {
        self.policy_type == PolicyType::Public
    }

    /// Stable fingerprint of the policy's meaning.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}|{:?}|", self.policy_type, self.logic));
        for role in &self.required_roles {
            hasher.update(b"r:");
            hasher.update(role.as_bytes());
            hasher.update(b"\n");
        }
        for permission in &self.required_permissions {
            hasher.update(b"p:");
            hasher.update(permission.as_bytes());
            hasher.update(b"\n");
        }
        if let Some(custom) = &self.custom {
            hasher.update(b"c:");
            hasher.update(custom.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Vec<String>>,
}

impl PolicyDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.details.insert(key.into(), values);
        self
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{0} policy lists no requirements")]
    EmptyRequirements(&'static str),
    #[error("custom policy `{0}` is not registered")]
    UnknownCustomPolicy(String),
    #[error("custom policy has no name")]
    UnnamedCustomPolicy,
}

/// Application-defined policy, registered by name.
pub trait CustomPolicy: Send + Sync {
    fn evaluate(&self, user: &UserContext) -> PolicyDecision;
}

impl<F> CustomPolicy for F
where
    F: Fn(&UserContext) -> PolicyDecision + Send + Sync,
{
    fn evaluate(&self, user: &UserContext) -> PolicyDecision {
        self(user)
    }
}

/// `(user id, session id, policy fingerprint)`
type DecisionKey = (String, Option<String>, String);

pub struct PolicyEvaluator {
    custom: HashMap<String, Arc<dyn CustomPolicy>>,
    cache: Arc<TtlCache<DecisionKey, PolicyDecision>>,
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("PolicyEvaluator")
            .field("custom", &names)
            .field("cache_ttl", &self.cache.ttl())
            .finish()
    }
}

impl PolicyEvaluator {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            custom: HashMap::new(),
            cache: Arc::new(TtlCache::new(cache_ttl)),
        }
    }

    pub fn register(mut self, name: impl Into<String>, policy: Arc<dyn CustomPolicy>) -> Self {
        self.custom.insert(name.into(), policy);
        self
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }

    pub fn start_sweeper(&self, period: Duration) -> SweeperHandle {
        self.cache.start_sweeper("policy-decisions", period)
    }

    /// Evaluate `policy` for `user`. `None` means the request carries no identity,
    /// which only a public policy admits.
    pub fn evaluate(
        &self,
        policy: &AuthorizationPolicy,
        user: Option<&UserContext>,
    ) -> Result<PolicyDecision, PolicyError> {
        if policy.is_public() {
            return Ok(PolicyDecision::allow("public route"));
        }
        let Some(user) = user else {
            return Ok(PolicyDecision::deny("authentication required"));
        };

        let key = (
            user.user_id().to_string(),
            user.session_id().map(str::to_string),
            policy.fingerprint(),
        );
        if let Some(decision) = self.cache.get(&key) {
            return Ok(decision);
        }

        let decision = self.decide(policy, user)?;
        self.cache.insert(key, decision.clone());
        Ok(decision)
    }

    fn decide(
        &self,
        policy: &AuthorizationPolicy,
        user: &UserContext,
    ) -> Result<PolicyDecision, PolicyError> {
        match policy.policy_type {
            PolicyType::Public => Ok(PolicyDecision::allow("public route")),
            PolicyType::Authenticated => Ok(PolicyDecision::allow("authenticated")),
            PolicyType::RoleBased => {
                if policy.required_roles.is_empty() {
                    return Err(PolicyError::EmptyRequirements("role-based"));
                }
                Ok(match_requirements(
                    "role",
                    &policy.required_roles,
                    policy.logic,
                    |role| user.has_role(role),
                ))
            }
            PolicyType::PermissionBased => {
                if policy.required_permissions.is_empty() {
                    return Err(PolicyError::EmptyRequirements("permission-based"));
                }
                Ok(match_requirements(
                    "permission",
                    &policy.required_permissions,
                    policy.logic,
                    |permission| user.has_permission(permission),
                ))
            }
            PolicyType::Custom => {
                let name = policy
                    .custom
                    .as_deref()
                    .ok_or(PolicyError::UnnamedCustomPolicy)?;
                let custom = self
                    .custom
                    .get(name)
                    .ok_or_else(|| PolicyError::UnknownCustomPolicy(name.to_string()))?;
                Ok(custom.evaluate(user))
            }
        }
    }
}

fn match_requirements(
    kind: &str,
    required: &BTreeSet<String>,
    logic: CombinationLogic,
    holds: impl Fn(&str) -> bool,
) -> PolicyDecision {
    let missing: Vec<String> = required
        .iter()
        .filter(|item| !holds(item.as_str()))
        .cloned()
        .collect();

    let allowed = match logic {
        CombinationLogic::And => missing.is_empty(),
        CombinationLogic::Or => missing.len() < required.len(),
    };

    if allowed {
        return PolicyDecision::allow(format!("{kind} requirement satisfied"));
    }

    let reason = match logic {
        CombinationLogic::And => format!("missing required {kind}s"),
        CombinationLogic::Or => format!("none of the required {kind}s present"),
    };
    PolicyDecision::deny(reason)
        .with_detail(format!("required_{kind}s"), required.iter().cloned().collect())
        .with_detail(format!("missing_{kind}s"), missing)
}
