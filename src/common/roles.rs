/// Hierarchical role and permission resolution.
///
/// Roles form a tree encoded by materialised paths. A user's effective
/// permission set is the union of the permissions of every assigned role
/// and all of its ancestors. The resolver keeps two cache tiers: the role
/// graph snapshot (slow-moving, ~4 h) and per-user effective permissions
/// (~15 min), both cleared on any role-graph mutation, locally and via the
/// shared invalidation channel.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cache::{CacheManager, keys};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::models::{Permission, Role, ROLE_PATH_SEPARATOR};

const ROLE_GRAPH_TTL: Duration = Duration::from_secs(4 * 3600);
const USER_PERMS_TTL: Duration = Duration::from_secs(15 * 60);

/// Immutable snapshot of the role tree and its permission edges.
#[derive(Clone)]
pub struct RoleGraph {
    roles_by_id: HashMap<Uuid, Role>,
    roles_by_name: HashMap<String, Role>,
    direct_permissions: HashMap<Uuid, HashSet<String>>,
}

impl RoleGraph {
    pub fn build(roles: Vec<Role>, permissions: Vec<Permission>, edges: Vec<(Uuid, Uuid)>) -> Self {
        let perm_names: HashMap<Uuid, String> =
            permissions.into_iter().map(|p| (p.id, p.name)).collect();

        let mut direct_permissions: HashMap<Uuid, HashSet<String>> = HashMap::new();
        for (role_id, permission_id) in edges {
            if let Some(name) = perm_names.get(&permission_id) {
                direct_permissions
                    .entry(role_id)
                    .or_default()
                    .insert(name.clone());
            }
        }

        let roles_by_name = roles.iter().map(|r| (r.name.clone(), r.clone())).collect();
        let roles_by_id = roles.into_iter().map(|r| (r.id, r)).collect();

        Self {
            roles_by_id,
            roles_by_name,
            direct_permissions,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles_by_name.get(name)
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<&Role> {
        self.roles_by_id.get(&id)
    }

    /// Permissions granted by one role: its own plus every ancestor's,
    /// read off the materialised path.
    pub fn permissions_of(&self, role: &Role) -> HashSet<String> {
        let mut out = HashSet::new();

        for name in role.path.split(ROLE_PATH_SEPARATOR) {
            if let Some(node) = self.roles_by_name.get(name) {
                if let Some(perms) = self.direct_permissions.get(&node.id) {
                    out.extend(perms.iter().cloned());
                }
            }
        }

        out
    }

    /// Effective permissions across a set of assigned roles.
    pub fn effective_permissions(&self, assigned: &[Role]) -> HashSet<String> {
        let mut out = HashSet::new();
        for role in assigned {
            out.extend(self.permissions_of(role));
        }
        out
    }

    pub fn descendants_of(&self, role: &Role) -> Vec<Role> {
        let mut out: Vec<Role> = self
            .roles_by_id
            .values()
            .filter(|candidate| role.is_strict_ancestor_of(candidate))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    pub fn ancestors_of(&self, role: &Role) -> Vec<Role> {
        role.ancestor_names()
            .into_iter()
            .filter_map(|name| self.roles_by_name.get(name).cloned())
            .collect()
    }

    pub fn roles_at_depth(&self, depth: usize) -> Vec<Role> {
        let mut out: Vec<Role> = self
            .roles_by_id
            .values()
            .filter(|r| r.depth() == depth)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// A write that would make `child` an ancestor of itself is a cycle.
    /// Paths make this a prefix check.
    pub fn would_cycle(&self, child: &Role, new_parent: &Role) -> bool {
        new_parent.id == child.id || child.is_strict_ancestor_of(new_parent)
    }
}

/// Guards role grants: an actor may only hand out roles strictly inside
/// the subtree of one of their own roles.
pub struct RoleHierarchyValidator;

impl RoleHierarchyValidator {
    pub fn validate_grant(actor_roles: &[Role], target: &Role) -> Result<()> {
        let allowed = actor_roles
            .iter()
            .any(|own| own.is_strict_ancestor_of(target));

        if allowed {
            Ok(())
        } else {
            Err(Error::RoleAssignmentForbidden(format!(
                "role {} is outside the actor's subtree",
                target.name
            )))
        }
    }
}

struct CachedGraph {
    graph: Arc<RoleGraph>,
    loaded_at: Instant,
}

struct CachedPermissions {
    permissions: Arc<HashSet<String>>,
    cached_at: Instant,
}

pub struct RoleResolver {
    db: Database,
    cache: CacheManager,
    metrics: Metrics,
    graph: RwLock<Option<CachedGraph>>,
    user_permissions: DashMap<Uuid, CachedPermissions>,
}

impl RoleResolver {
    pub fn new(db: Database, cache: CacheManager, metrics: Metrics) -> Self {
        Self {
            db,
            cache,
            metrics,
            graph: RwLock::new(None),
            user_permissions: DashMap::new(),
        }
    }

    /// Current role-graph snapshot, reloading when the TTL lapses.
    pub async fn graph(&self) -> Result<Arc<RoleGraph>> {
        {
            let guard = self.graph.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < ROLE_GRAPH_TTL {
                    self.count_cache("role_graph", "hit");
                    return Ok(cached.graph.clone());
                }
            }
        }

        self.count_cache("role_graph", "miss");

        let mut guard = self.graph.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = guard.as_ref() {
            if cached.loaded_at.elapsed() < ROLE_GRAPH_TTL {
                return Ok(cached.graph.clone());
            }
        }

        let (roles, permissions, edges) = self.db.load_role_graph().await?;
        let graph = Arc::new(RoleGraph::build(roles, permissions, edges));
        *guard = Some(CachedGraph {
            graph: graph.clone(),
            loaded_at: Instant::now(),
        });

        tracing::debug!("Role graph snapshot refreshed");

        Ok(graph)
    }

    /// Effective permission set for a user, cached in-process and in the
    /// shared store.
    pub async fn effective_permissions(&self, user_id: Uuid) -> Result<Arc<HashSet<String>>> {
        if let Some(entry) = self.user_permissions.get(&user_id) {
            if entry.cached_at.elapsed() < USER_PERMS_TTL {
                self.count_cache("permissions", "hit");
                return Ok(entry.permissions.clone());
            }
        }

        let cache_key = keys::user_permissions(user_id);
        if let Ok(Some(cached)) = self.cache.get::<Vec<String>>(&cache_key).await {
            self.count_cache("permissions", "hit");
            let set: Arc<HashSet<String>> = Arc::new(cached.into_iter().collect());
            self.remember(user_id, set.clone());
            return Ok(set);
        }

        self.count_cache("permissions", "miss");

        let graph = self.graph().await?;
        let assigned = self.db.roles_of_user(user_id).await?;
        let set = Arc::new(graph.effective_permissions(&assigned));

        let as_vec: Vec<&String> = set.iter().collect();
        if let Err(e) = self.cache.set_with_ttl(&cache_key, &as_vec, USER_PERMS_TTL).await {
            tracing::debug!(error = %e, "Failed to publish permission set to shared cache");
        }
        self.remember(user_id, set.clone());

        Ok(set)
    }

    pub async fn has_permission(&self, user_id: Uuid, permission: &str) -> Result<bool> {
        Ok(self.effective_permissions(user_id).await?.contains(permission))
    }

    pub async fn require_permission(&self, user_id: Uuid, permission: &str) -> Result<()> {
        if self.has_permission(user_id, permission).await? {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "This action requires the {} permission",
                permission
            )))
        }
    }

    /// Grant `role_name` to the user identified by email, enforcing the
    /// subtree rule against the acting user's own roles.
    pub async fn assign_role(
        &self,
        actor_id: Uuid,
        target_user_id: Uuid,
        role_name: &str,
    ) -> Result<Role> {
        let graph = self.graph().await?;
        let target_role = graph
            .get(role_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", role_name)))?;

        let actor_roles = self.db.roles_of_user(actor_id).await?;
        RoleHierarchyValidator::validate_grant(&actor_roles, &target_role)?;

        self.db
            .assign_role(target_user_id, target_role.id, Some(actor_id))
            .await?;
        self.invalidate_user(target_user_id).await;

        Ok(target_role)
    }

    pub async fn revoke_role(&self, target_user_id: Uuid, role_name: &str) -> Result<()> {
        let graph = self.graph().await?;
        let role = graph
            .get(role_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", role_name)))?;

        self.db.revoke_role(target_user_id, role.id).await?;
        self.invalidate_user(target_user_id).await;

        Ok(())
    }

    /// Create a role under `parent_name`, validating acyclicity and name
    /// uniqueness against the current snapshot before the write.
    pub async fn create_role(
        &self,
        name: &str,
        description: &str,
        parent_name: Option<&str>,
    ) -> Result<Role> {
        let graph = self.graph().await?;

        if graph.get(name).is_some() {
            return Err(Error::Conflict(format!("Role {} already exists", name)));
        }

        let parent = match parent_name {
            Some(p) => Some(
                graph
                    .get(p)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("Parent role {} not found", p)))?,
            ),
            None => None,
        };

        let role = self.db.create_role(name, description, parent.as_ref()).await?;
        self.invalidate_graph().await;

        Ok(role)
    }

    /// Move a role under a new parent. The path encoding makes the cycle
    /// check a prefix comparison; a write that would cycle never reaches
    /// the store.
    pub async fn move_role(&self, name: &str, new_parent_name: &str) -> Result<Role> {
        let graph = self.graph().await?;

        let role = graph
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", name)))?;
        let new_parent = graph
            .get(new_parent_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", new_parent_name)))?;

        if graph.would_cycle(&role, &new_parent) {
            return Err(Error::BadRequest(format!(
                "Moving {} under {} would create a cycle",
                name, new_parent_name
            )));
        }

        self.db.move_role(&role, &new_parent).await?;
        self.invalidate_graph().await;

        self.graph()
            .await?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Internal("Role vanished during move".to_string()))
    }

    /// Delete a role; children are re-parented to the grandparent inside
    /// the store transaction.
    pub async fn delete_role(&self, name: &str) -> Result<()> {
        let graph = self.graph().await?;
        let role = graph
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", name)))?;

        self.db.delete_role(&role).await?;
        self.invalidate_graph().await;

        Ok(())
    }

    /// Clear the in-process tiers. Called on the shared invalidation
    /// channel as well as after local mutations.
    pub async fn invalidate_local(&self) {
        *self.graph.write().await = None;
        self.user_permissions.clear();
    }

    async fn invalidate_graph(&self) {
        self.invalidate_local().await;

        if let Err(e) = self.cache.delete(&keys::role_graph()).await {
            tracing::warn!(error = %e, "Failed to clear shared role graph cache");
        }
        if let Err(e) = self.cache.delete_pattern("warden:perms:user:*").await {
            tracing::warn!(error = %e, "Failed to clear shared permission caches");
        }
        if let Err(e) = self.cache.publish_invalidation("roles").await {
            tracing::warn!(error = %e, "Failed to publish role invalidation");
        }
    }

    async fn invalidate_user(&self, user_id: Uuid) {
        self.user_permissions.remove(&user_id);
        if let Err(e) = self.cache.delete(&keys::user_permissions(user_id)).await {
            tracing::warn!(error = %e, user_id = %user_id, "Failed to clear shared permission cache");
        }
    }

    fn count_cache(&self, cache: &str, result: &str) {
        self.metrics
            .cache_requests_total
            .with_label_values(&[cache, result])
            .inc();
    }

    fn remember(&self, user_id: Uuid, permissions: Arc<HashSet<String>>) {
        self.user_permissions.insert(
            user_id,
            CachedPermissions {
                permissions,
                cached_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn role(name: &str, path: &str, parent: Option<Uuid>) -> Role {
        Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            parent_id: parent,
            path: path.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn permission(name: &str) -> Permission {
        Permission {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
        }
    }

    /// ROOT -> SUPER_ADMIN -> ADMIN -> USER, plus ADMIN -> AUTH_ADMIN.
    fn seed_graph() -> (RoleGraph, Vec<Role>) {
        let root = role("ROOT", "ROOT", None);
        let super_admin = role("SUPER_ADMIN", "ROOT/SUPER_ADMIN", Some(root.id));
        let admin = role("ADMIN", "ROOT/SUPER_ADMIN/ADMIN", Some(super_admin.id));
        let user = role("USER", "ROOT/SUPER_ADMIN/ADMIN/USER", Some(admin.id));
        let auth_admin = role(
            "AUTH_ADMIN",
            "ROOT/SUPER_ADMIN/ADMIN/AUTH_ADMIN",
            Some(admin.id),
        );

        let perms = vec![
            permission("USER_READ_ANY"),
            permission("USER_EDIT_ANY"),
            permission("USER_PASSWORD_RESET_ANY"),
            permission("OAUTH_CLIENT_MANAGE"),
            permission("ROLE_MANAGE"),
            permission("IP_BLOCKLIST_MANAGE"),
            permission("PROFILE_SELF"),
        ];

        let by_name: HashMap<&str, Uuid> =
            perms.iter().map(|p| (p.name.as_str(), p.id)).collect();

        let edges = vec![
            (auth_admin.id, by_name["USER_READ_ANY"]),
            (auth_admin.id, by_name["USER_EDIT_ANY"]),
            (auth_admin.id, by_name["USER_PASSWORD_RESET_ANY"]),
            (auth_admin.id, by_name["OAUTH_CLIENT_MANAGE"]),
            (super_admin.id, by_name["ROLE_MANAGE"]),
            (super_admin.id, by_name["IP_BLOCKLIST_MANAGE"]),
            (user.id, by_name["PROFILE_SELF"]),
        ];

        let roles = vec![
            root.clone(),
            super_admin.clone(),
            admin.clone(),
            user.clone(),
            auth_admin.clone(),
        ];

        (
            RoleGraph::build(roles.clone(), perms, edges),
            roles,
        )
    }

    #[test]
    fn test_effective_permissions_include_ancestors() {
        let (graph, roles) = seed_graph();
        let auth_admin = roles.iter().find(|r| r.name == "AUTH_ADMIN").unwrap();

        let effective = graph.effective_permissions(std::slice::from_ref(auth_admin));

        // Own permissions
        assert!(effective.contains("USER_READ_ANY"));
        assert!(effective.contains("USER_EDIT_ANY"));
        assert!(effective.contains("USER_PASSWORD_RESET_ANY"));
        assert!(effective.contains("OAUTH_CLIENT_MANAGE"));
        // Inherited from SUPER_ADMIN through the ADMIN ancestor chain
        assert!(effective.contains("ROLE_MANAGE"));
        assert!(effective.contains("IP_BLOCKLIST_MANAGE"));
        // Sibling USER's permission must not leak in
        assert!(!effective.contains("PROFILE_SELF"));
    }

    #[test]
    fn test_descendants_and_ancestors() {
        let (graph, roles) = seed_graph();
        let admin = roles.iter().find(|r| r.name == "ADMIN").unwrap();

        let descendants: Vec<String> = graph
            .descendants_of(admin)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(descendants, vec!["AUTH_ADMIN", "USER"]);

        let ancestors: Vec<String> = graph
            .ancestors_of(admin)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(ancestors, vec!["ROOT", "SUPER_ADMIN"]);
    }

    #[test]
    fn test_roles_at_depth() {
        let (graph, _) = seed_graph();

        let at_depth: Vec<String> = graph.roles_at_depth(3).into_iter().map(|r| r.name).collect();
        assert_eq!(at_depth, vec!["AUTH_ADMIN", "USER"]);
        assert_eq!(graph.roles_at_depth(0).len(), 1);
        assert!(graph.roles_at_depth(9).is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let (graph, roles) = seed_graph();
        let admin = roles.iter().find(|r| r.name == "ADMIN").unwrap();
        let user = roles.iter().find(|r| r.name == "USER").unwrap();

        // Moving ADMIN under its own descendant would cycle
        assert!(graph.would_cycle(admin, user));
        // Self-parenting too
        assert!(graph.would_cycle(admin, admin));
        // Moving USER under AUTH_ADMIN would not
        let auth_admin = roles.iter().find(|r| r.name == "AUTH_ADMIN").unwrap();
        assert!(!graph.would_cycle(user, auth_admin));
    }

    #[test]
    fn test_hierarchy_validator() {
        let (_, roles) = seed_graph();
        let admin = roles.iter().find(|r| r.name == "ADMIN").unwrap().clone();
        let user = roles.iter().find(|r| r.name == "USER").unwrap().clone();
        let super_admin = roles.iter().find(|r| r.name == "SUPER_ADMIN").unwrap().clone();

        // ADMIN may grant USER (inside its subtree)
        assert!(RoleHierarchyValidator::validate_grant(&[admin.clone()], &user).is_ok());
        // ADMIN may not grant SUPER_ADMIN (outside)
        assert!(RoleHierarchyValidator::validate_grant(&[admin.clone()], &super_admin).is_err());
        // Nobody may grant their own role (not strictly inside)
        assert!(RoleHierarchyValidator::validate_grant(&[admin.clone()], &admin).is_err());
    }
}
