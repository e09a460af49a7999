//! Role-based access control: closed permission vocabulary, role
//! directory, and a cached permission evaluator.
//!
//! Permissions are a closed enumeration, not opaque strings: the wire/API
//! form is the lowercase colon-separated name and the category falls out
//! of the prefix. Resolution for `(user, organization?)` is the
//! deduplicated union of the user's global roles and (when an organization
//! is given) the org-scoped roles for that pair, memoized under
//! `user:{id}:org:{org|global}` keys.
//!
//! Overrides: `system:admin` grants everything everywhere;
//! `organization:admin` grants everything in the `organization` category
//! when an organization context is present.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorCode, ErrorContext, Result};

/// User identifier.
pub type UserId = i64;
/// Organization identifier.
pub type OrgId = i64;

/// Permission category, derived from the permission's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionCategory {
    /// `user:*`
    User,
    /// `organization:*`
    Organization,
    /// `role:*`
    Role,
    /// `auth:*`
    Auth,
    /// `system:*`
    System,
}

macro_rules! permissions {
    ($($variant:ident => ($name:literal, $category:ident)),+ $(,)?) => {
        /// Closed set of permissions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Permission {
            $(#[doc = $name] $variant),+
        }

        impl Permission {
            /// Every permission in the vocabulary.
            pub const ALL: &'static [Permission] = &[$(Permission::$variant),+];

            /// Wire/API form of the permission.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Permission::$variant => $name),+
                }
            }

            /// Parse the wire form; `None` for anything outside the set.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($name => Some(Permission::$variant)),+,
                    _ => None,
                }
            }

            /// Category derived from the prefix.
            pub fn category(self) -> PermissionCategory {
                match self {
                    $(Permission::$variant => PermissionCategory::$category),+
                }
            }
        }
    };
}

permissions! {
    UserRead => ("user:read", User),
    UserList => ("user:list", User),
    UserSearch => ("user:search", User),
    UserCreate => ("user:create", User),
    UserUpdate => ("user:update", User),
    UserDelete => ("user:delete", User),
    UserActivate => ("user:activate", User),
    UserDeactivate => ("user:deactivate", User),
    UserProfile => ("user:profile", User),
    UserProfileUpdate => ("user:profile:update", User),
    UserPasswordReset => ("user:password:reset", User),
    OrgRead => ("organization:read", Organization),
    OrgList => ("organization:list", Organization),
    OrgSearch => ("organization:search", Organization),
    OrgCreate => ("organization:create", Organization),
    OrgUpdate => ("organization:update", Organization),
    OrgDelete => ("organization:delete", Organization),
    OrgMemberAdd => ("organization:member:add", Organization),
    OrgMemberRemove => ("organization:member:remove", Organization),
    OrgMemberList => ("organization:member:list", Organization),
    OrgAdmin => ("organization:admin", Organization),
    RoleRead => ("role:read", Role),
    RoleList => ("role:list", Role),
    RoleSearch => ("role:search", Role),
    RoleCreate => ("role:create", Role),
    RoleUpdate => ("role:update", Role),
    RoleDelete => ("role:delete", Role),
    RoleAssign => ("role:assign", Role),
    RoleUnassign => ("role:unassign", Role),
    RolePermissionAdd => ("role:permission:add", Role),
    RolePermissionRemove => ("role:permission:remove", Role),
    AuthLogin => ("auth:login", Auth),
    AuthLogout => ("auth:logout", Auth),
    AuthRefresh => ("auth:refresh", Auth),
    AuthTokenRevoke => ("auth:token:revoke", Auth),
    AuthTokenList => ("auth:token:list", Auth),
    AuthSessionList => ("auth:session:list", Auth),
    AuthSessionRevoke => ("auth:session:revoke", Auth),
    SystemAdmin => ("system:admin", System),
    SystemRead => ("system:read", System),
    SystemHealth => ("system:health", System),
    SystemMetrics => ("system:metrics", System),
    SystemConfig => ("system:config", System),
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope a role applies over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleScope {
    /// Applies everywhere.
    Global,
    /// Applies within one organization at assignment time.
    Organization,
}

/// A named bundle of permissions.
#[derive(Debug, Clone)]
pub struct Role {
    /// Unique role name.
    pub name: String,
    /// Global or organization-scoped.
    pub scope: RoleScope,
    /// Permissions the role grants.
    pub permissions: HashSet<Permission>,
}

impl Role {
    /// Convenience constructor.
    pub fn new(
        name: impl Into<String>,
        scope: RoleScope,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            name: name.into(),
            scope,
            permissions: permissions.into_iter().collect(),
        }
    }
}

/// Resource-access request context.
#[derive(Debug, Clone)]
pub struct AccessContext {
    /// Acting user.
    pub user: UserId,
    /// Organization context, if any.
    pub organization: Option<OrgId>,
    /// Resource kind (e.g. `user`, `organization`).
    pub resource: String,
    /// Action on the resource (e.g. `update`).
    pub action: String,
    /// Source address for the audit trail.
    pub source: String,
}

/// Closed `resource.action → required permissions` table.
///
/// `None` means the pair is not governed: authenticated access suffices.
fn required_permissions(resource: &str, action: &str) -> Option<&'static [Permission]> {
    use Permission::*;
    let required: &'static [Permission] = match (resource, action) {
        ("user", "read") => &[UserRead],
        ("user", "list") => &[UserList],
        ("user", "search") => &[UserSearch],
        ("user", "create") => &[UserCreate],
        ("user", "update") => &[UserUpdate],
        ("user", "delete") => &[UserDelete],
        ("user", "activate") => &[UserActivate],
        ("user", "deactivate") => &[UserDeactivate],
        ("organization", "read") => &[OrgRead],
        ("organization", "list") => &[OrgList],
        ("organization", "create") => &[OrgCreate],
        ("organization", "update") => &[OrgUpdate],
        ("organization", "delete") => &[OrgDelete],
        ("organization", "member:add") => &[OrgMemberAdd],
        ("organization", "member:remove") => &[OrgMemberRemove],
        ("organization", "member:list") => &[OrgMemberList],
        ("role", "read") => &[RoleRead],
        ("role", "list") => &[RoleList],
        ("role", "create") => &[RoleCreate],
        ("role", "update") => &[RoleUpdate],
        ("role", "delete") => &[RoleDelete],
        ("role", "assign") => &[RoleAssign],
        ("role", "unassign") => &[RoleUnassign],
        ("auth", "token:revoke") => &[AuthTokenRevoke],
        ("auth", "token:list") => &[AuthTokenList],
        ("auth", "session:list") => &[AuthSessionList],
        ("auth", "session:revoke") => &[AuthSessionRevoke],
        ("system", "read") => &[SystemRead],
        ("system", "health") => &[SystemHealth],
        ("system", "metrics") => &[SystemMetrics],
        ("system", "config") => &[SystemConfig],
        _ => return None,
    };
    Some(required)
}

#[derive(Debug, Default)]
struct Directory {
    roles: HashMap<String, Role>,
    memberships: HashMap<UserId, HashSet<OrgId>>,
    global_assignments: HashMap<UserId, HashSet<String>>,
    org_assignments: HashMap<(UserId, OrgId), HashSet<String>>,
}

/// Permission resolution with caching over an in-memory role directory.
///
/// The directory stands in for the external user store; only role and
/// membership shape lives here, never credentials.
#[derive(Debug, Default)]
pub struct RbacEvaluator {
    directory: Mutex<Directory>,
    cache: Mutex<HashMap<String, Arc<HashSet<Permission>>>>,
}

impl RbacEvaluator {
    /// Empty evaluator.
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Directory maintenance ─────────────────────────────────────────────

    /// Define or replace a role. Existing assignments keep pointing at the
    /// name, so the affected caches are flushed wholesale.
    pub fn define_role(&self, role: Role) {
        self.directory().roles.insert(role.name.clone(), role);
        self.cache().clear();
    }

    /// Record that `user` belongs to `org`.
    pub fn add_member(&self, user: UserId, org: OrgId) {
        self.directory().memberships.entry(user).or_default().insert(org);
    }

    /// Remove `user` from `org`.
    pub fn remove_member(&self, user: UserId, org: OrgId) {
        let mut directory = self.directory();
        if let Some(orgs) = directory.memberships.get_mut(&user) {
            orgs.remove(&org);
        }
        directory.org_assignments.remove(&(user, org));
        drop(directory);
        self.invalidate(user, Some(org));
    }

    /// Assign `role_name` to `user`, optionally within `org`.
    ///
    /// Rejects a global role given an org context, an org role given no
    /// context, and an org role for a non-member.
    pub fn assign_role_to_user(
        &self,
        user: UserId,
        role_name: &str,
        org: Option<OrgId>,
    ) -> Result<()> {
        let mut directory = self.directory();
        let role = directory
            .roles
            .get(role_name)
            .ok_or_else(|| Error::new(ErrorCode::NotFound, format!("role {role_name} not found")))?;

        match (role.scope, org) {
            (RoleScope::Global, Some(org)) => {
                return Err(Error::new(
                    ErrorCode::InvalidCommand,
                    "global role cannot take an organization context",
                )
                .with_context(ErrorContext::Organization { id: org }));
            }
            (RoleScope::Organization, None) => {
                return Err(Error::new(
                    ErrorCode::InvalidCommand,
                    "organization role requires an organization context",
                ));
            }
            (RoleScope::Organization, Some(org)) => {
                let member = directory
                    .memberships
                    .get(&user)
                    .is_some_and(|orgs| orgs.contains(&org));
                if !member {
                    return Err(Error::new(
                        ErrorCode::AuthorizationFailed,
                        format!("user {user} is not a member of organization {org}"),
                    )
                    .with_context(ErrorContext::Organization { id: org }));
                }
                directory
                    .org_assignments
                    .entry((user, org))
                    .or_default()
                    .insert(role_name.to_string());
            }
            (RoleScope::Global, None) => {
                directory
                    .global_assignments
                    .entry(user)
                    .or_default()
                    .insert(role_name.to_string());
            }
        }
        drop(directory);
        self.invalidate(user, org);
        Ok(())
    }

    /// Remove a role assignment; the inverse of
    /// [`RbacEvaluator::assign_role_to_user`].
    pub fn unassign_role_from_user(
        &self,
        user: UserId,
        role_name: &str,
        org: Option<OrgId>,
    ) -> Result<()> {
        let mut directory = self.directory();
        let removed = match org {
            Some(org) => directory
                .org_assignments
                .get_mut(&(user, org))
                .is_some_and(|roles| roles.remove(role_name)),
            None => directory
                .global_assignments
                .get_mut(&user)
                .is_some_and(|roles| roles.remove(role_name)),
        };
        drop(directory);
        if !removed {
            return Err(Error::new(
                ErrorCode::NotFound,
                format!("user {user} does not hold role {role_name}"),
            ));
        }
        self.invalidate(user, org);
        Ok(())
    }

    // ─── Resolution ────────────────────────────────────────────────────────

    /// Deduplicated permission set for `(user, org?)`: all global roles,
    /// plus the org-scoped roles for that pair when `org` is given.
    pub fn get_user_permissions(
        &self,
        user: UserId,
        org: Option<OrgId>,
    ) -> Arc<HashSet<Permission>> {
        let key = cache_key(user, org);
        if let Some(cached) = self.cache().get(&key) {
            return Arc::clone(cached);
        }

        let directory = self.directory();
        let mut permissions = HashSet::new();
        if let Some(role_names) = directory.global_assignments.get(&user) {
            for name in role_names {
                if let Some(role) = directory.roles.get(name) {
                    permissions.extend(role.permissions.iter().copied());
                }
            }
        }
        if let Some(org) = org {
            if let Some(role_names) = directory.org_assignments.get(&(user, org)) {
                for name in role_names {
                    if let Some(role) = directory.roles.get(name) {
                        permissions.extend(role.permissions.iter().copied());
                    }
                }
            }
        }
        drop(directory);

        let resolved = Arc::new(permissions);
        self.cache().insert(key, Arc::clone(&resolved));
        resolved
    }

    /// Does `user` hold `permission` (in `org` context, if given)?
    ///
    /// `system:admin` short-circuits everything; `organization:admin`
    /// short-circuits the `organization` category when `org` is present.
    pub fn has_permission(&self, user: UserId, permission: Permission, org: Option<OrgId>) -> bool {
        let permissions = self.get_user_permissions(user, org);
        if permissions.contains(&Permission::SystemAdmin) {
            return true;
        }
        if org.is_some()
            && permissions.contains(&Permission::OrgAdmin)
            && permission.category() == PermissionCategory::Organization
        {
            return true;
        }
        permissions.contains(&permission)
    }

    /// Does `user` hold at least one of `candidates`?
    pub fn has_any_permission(
        &self,
        user: UserId,
        candidates: &[Permission],
        org: Option<OrgId>,
    ) -> bool {
        candidates.iter().any(|p| self.has_permission(user, *p, org))
    }

    /// Does `user` hold all of `candidates`?
    pub fn has_all_permissions(
        &self,
        user: UserId,
        candidates: &[Permission],
        org: Option<OrgId>,
    ) -> bool {
        candidates.iter().all(|p| self.has_permission(user, *p, org))
    }

    /// Authorize `resource.action` for an authenticated user.
    ///
    /// Pairs absent from the closed requirement table grant authenticated
    /// access. Denials are audit-logged with the full context.
    pub fn can_access_resource(&self, ctx: &AccessContext) -> Result<()> {
        let Some(required) = required_permissions(&ctx.resource, &ctx.action) else {
            return Ok(());
        };
        if self.has_any_permission(ctx.user, required, ctx.organization) {
            return Ok(());
        }

        let needed = required
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join("|");
        log::warn!(
            "authorization denied: user={} permission={} org={:?} resource={} action={} source={}",
            ctx.user,
            needed,
            ctx.organization,
            ctx.resource,
            ctx.action,
            ctx.source
        );
        Err(Error::new(
            ErrorCode::AuthorizationFailed,
            format!("access to {}.{} denied", ctx.resource, ctx.action),
        )
        .with_context(ErrorContext::Permission {
            user: ctx.user.to_string(),
            permission: needed,
            organization: ctx.organization,
        })
        .with_detail("resource", ctx.resource.clone())
        .with_detail("action", ctx.action.clone()))
    }

    // ─── Cache plumbing ────────────────────────────────────────────────────

    /// Drop the cached resolution for `(user, org)` and for the user's
    /// global scope.
    fn invalidate(&self, user: UserId, org: Option<OrgId>) {
        let mut cache = self.cache();
        cache.remove(&cache_key(user, org));
        cache.remove(&cache_key(user, None));
    }

    /// Cached entry count, for tests.
    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache().len()
    }

    fn directory(&self) -> std::sync::MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<HashSet<Permission>>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cache_key(user: UserId, org: Option<OrgId>) -> String {
    match org {
        Some(org) => format!("user:{user}:org:{org}"),
        None => format!("user:{user}:org:global"),
    }
}
