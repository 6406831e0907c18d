use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Separator inside a role's materialised path.
pub const ROLE_PATH_SEPARATOR: &str = "/";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub parent_id: Option<Uuid>,
    /// Ancestor chain from root, e.g. `ROOT/SUPER_ADMIN/ADMIN`. The final
    /// segment is always the role's own name, so cycles are detectable with
    /// a prefix check.
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// Names of all ancestors, root first, excluding the role itself.
    pub fn ancestor_names(&self) -> Vec<&str> {
        let mut parts: Vec<&str> = self.path.split(ROLE_PATH_SEPARATOR).collect();
        parts.pop();
        parts
    }

    /// Depth in the tree; the root is at depth 0.
    pub fn depth(&self) -> usize {
        self.path.matches(ROLE_PATH_SEPARATOR).count()
    }

    /// True when `other` sits strictly inside this role's subtree.
    pub fn is_strict_ancestor_of(&self, other: &Role) -> bool {
        other.path.len() > self.path.len()
            && other
                .path
                .strip_prefix(&self.path)
                .is_some_and(|rest| rest.starts_with(ROLE_PATH_SEPARATOR))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub email: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub name: String,
    pub description: String,
    pub path: String,
    pub depth: usize,
}

impl From<Role> for RoleResponse {
    fn from(r: Role) -> Self {
        let depth = r.depth();
        Self {
            name: r.name,
            description: r.description,
            path: r.path,
            depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str, path: &str) -> Role {
        Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            parent_id: None,
            path: path.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_ancestor_names() {
        let r = role("ADMIN", "ROOT/SUPER_ADMIN/ADMIN");
        assert_eq!(r.ancestor_names(), vec!["ROOT", "SUPER_ADMIN"]);
        assert_eq!(role("ROOT", "ROOT").ancestor_names(), Vec::<&str>::new());
    }

    #[test]
    fn test_depth() {
        assert_eq!(role("ROOT", "ROOT").depth(), 0);
        assert_eq!(role("ADMIN", "ROOT/SUPER_ADMIN/ADMIN").depth(), 2);
    }

    #[test]
    fn test_strict_ancestor() {
        let admin = role("ADMIN", "ROOT/SUPER_ADMIN/ADMIN");
        let auth_admin = role("AUTH_ADMIN", "ROOT/SUPER_ADMIN/ADMIN/AUTH_ADMIN");
        assert!(admin.is_strict_ancestor_of(&auth_admin));
        assert!(!auth_admin.is_strict_ancestor_of(&admin));
        assert!(!admin.is_strict_ancestor_of(&admin));

        // A shared prefix that is not a full segment must not count
        let admin2 = role("ADMIN2", "ROOT/SUPER_ADMIN/ADMIN2");
        assert!(!admin.is_strict_ancestor_of(&admin2));
    }
}
