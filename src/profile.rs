//! The profile loader and scope ACL. The spec treats "can the loaded
//! profile access the claimed scope" as delegated to an external
//! collaborator (§4.3: "per an ACL delegated to the profile loader") — this
//! crate defines the trait contract and ships one in-memory implementation
//! (`StaticProfileLoader`) so the pipeline and its tests have something real
//! to call; a production deployment would swap in a database-backed loader
//! without touching the pipeline at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::async_trait;

use crate::error::{AppError, AppResult};
use crate::router::Scope;

/// A loaded profile: its default scope, the set of scopes it may act under,
/// and the permission grants the router consults (pattern → max scope).
#[derive(Debug, Clone)]
pub struct Profile {
    pub profile_id: i64,
    pub default_scope_entity_id: i64,
    pub accessible_scopes: HashSet<i64>,
    /// Route-pattern → granted scope, consulted by the router as the
    /// caller's permission grants.
    pub permissions: HashMap<String, Scope>,
}

impl Profile {
    pub fn can_access_scope(&self, scope_entity_id: i64) -> bool {
        scope_entity_id == 0
            || scope_entity_id == self.default_scope_entity_id
            || self.accessible_scopes.contains(&scope_entity_id)
    }
}

#[async_trait]
pub trait ProfileLoader: Send + Sync {
    async fn load(&self, account_id: i64, profile_id: i64) -> AppResult<Profile>;
}

/// In-memory profile directory keyed by `(account_id, profile_id)`. Good
/// enough for the demo handlers and integration tests; a real deployment
/// swaps this for a database-backed loader behind the same trait.
#[derive(Default)]
pub struct StaticProfileLoader {
    profiles: HashMap<(i64, i64), Profile>,
}

impl StaticProfileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, account_id: i64, profile: Profile) -> Self {
        self.profiles.insert((account_id, profile.profile_id), profile);
        self
    }
}

#[async_trait]
impl ProfileLoader for StaticProfileLoader {
    async fn load(&self, account_id: i64, profile_id: i64) -> AppResult<Profile> {
        self.profiles
            .get(&(account_id, profile_id))
            .cloned()
            .ok_or_else(|| AppError::Auth("profile not found".into()))
    }
}

pub fn shared(loader: StaticProfileLoader) -> Arc<dyn ProfileLoader> {
    Arc::new(loader)
}

/// Scope cross-check: if the claimed scope is non-zero and the loaded
/// profile cannot access it, log a SECURITY event `JWT_SCOPE_MISMATCH` and
/// overwrite with the profile's default scope rather than reject. Returns
/// the scope the request should actually run under.
pub fn coerce_scope(claimed_scope_entity_id: i64, profile: &Profile) -> i64 {
    if claimed_scope_entity_id == 0 {
        return profile.default_scope_entity_id;
    }
    if profile.can_access_scope(claimed_scope_entity_id) {
        claimed_scope_entity_id
    } else {
        tracing::warn!(
            security = true,
            event = "JWT_SCOPE_MISMATCH",
            profile_id = profile.profile_id,
            claimed_scope_entity_id,
            coerced_to = profile.default_scope_entity_id,
            "token claimed a scope the profile cannot access; coercing to default scope"
        );
        profile.default_scope_entity_id
    }
}
