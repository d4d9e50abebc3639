//! Principals and the grants-to relation between them.
//!
//! Membership is reflexive and transitive: a principal is a member of
//! itself, of every role granted to it, and of every role granted to those.
//! Every principal is also a member of the [`PUBLIC_ROLE`] pseudo-role.

use crate::error::{AclError, ResourceType};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const PUBLIC_ROLE: &str = "public";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleMeta {
    pub name: String,
    #[serde(default)]
    pub login: bool,
    /// Roles granted directly to this one.
    #[serde(default)]
    pub member_of: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleRegistry {
    roles: OrdMap<String, RoleMeta>,
}

impl RoleRegistry {
    pub fn contains(&self, name: &str) -> bool {
        name == PUBLIC_ROLE || self.roles.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RoleMeta> {
        self.roles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.roles.keys()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn create_role(&mut self, name: &str, login: bool) -> Result<(), AclError> {
        if name.is_empty() {
            return Err(AclError::Validation("role name must not be empty".into()));
        }
        if self.contains(name) {
            return Err(AclError::AlreadyExists {
                resource_type: ResourceType::Role,
                resource_id: name.to_string(),
            });
        }
        self.roles.insert(
            name.to_string(),
            RoleMeta {
                name: name.to_string(),
                login,
                member_of: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Removes the role and every membership edge that points at it.
    pub fn drop_role(&mut self, name: &str) -> Result<(), AclError> {
        if self.roles.remove(name).is_none() {
            return Err(AclError::not_found(ResourceType::Role, name));
        }
        let dependents: Vec<String> = self
            .roles
            .values()
            .filter(|meta| meta.member_of.contains(name))
            .map(|meta| meta.name.clone())
            .collect();
        for dependent in dependents {
            if let Some(meta) = self.roles.get_mut(&dependent) {
                meta.member_of.remove(name);
            }
        }
        Ok(())
    }

    /// `grant parent to child`. Rejects grants that would close a cycle.
    pub fn grant_role(&mut self, child: &str, parent: &str) -> Result<(), AclError> {
        self.require(child)?;
        self.require(parent)?;
        if parent == PUBLIC_ROLE {
            return Err(AclError::Validation(format!(
                "cannot grant {PUBLIC_ROLE} to {child}"
            )));
        }
        if child == parent || self.is_member(parent, child)? {
            return Err(AclError::RoleCycle {
                path: vec![child.to_string(), parent.to_string(), child.to_string()],
            });
        }
        if let Some(meta) = self.roles.get_mut(child) {
            meta.member_of.insert(parent.to_string());
        }
        Ok(())
    }

    /// `revoke parent from child`. Revoking a membership that was never
    /// granted is a no-op, as long as both roles exist.
    pub fn revoke_role(&mut self, child: &str, parent: &str) -> Result<(), AclError> {
        self.require(child)?;
        self.require(parent)?;
        if let Some(meta) = self.roles.get_mut(child) {
            meta.member_of.remove(parent);
        }
        Ok(())
    }

    pub fn is_member(&self, principal: &str, role: &str) -> Result<bool, AclError> {
        self.require(principal)?;
        self.require(role)?;
        if role == PUBLIC_ROLE || principal == role {
            return Ok(true);
        }
        Ok(self.memberships(principal)?.contains(role))
    }

    /// Full reflexive-transitive closure for `principal`, including
    /// [`PUBLIC_ROLE`]. A cycle anywhere below `principal` is an error.
    pub fn memberships(&self, principal: &str) -> Result<BTreeSet<String>, AclError> {
        self.require(principal)?;
        let mut closed = BTreeSet::new();
        let mut path = Vec::new();
        self.walk(principal, &mut path, &mut closed)?;
        closed.insert(PUBLIC_ROLE.to_string());
        Ok(closed)
    }

    fn walk(
        &self,
        name: &str,
        path: &mut Vec<String>,
        closed: &mut BTreeSet<String>,
    ) -> Result<(), AclError> {
        if let Some(pos) = path.iter().position(|p| p == name) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(name.to_string());
            tracing::warn!(cycle = ?cycle, "role membership cycle detected");
            return Err(AclError::RoleCycle { path: cycle });
        }
        if closed.contains(name) {
            return Ok(());
        }
        path.push(name.to_string());
        if let Some(meta) = self.roles.get(name) {
            for parent in &meta.member_of {
                self.walk(parent, path, closed)?;
            }
        }
        path.pop();
        closed.insert(name.to_string());
        Ok(())
    }

    fn require(&self, name: &str) -> Result<(), AclError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(AclError::not_found(ResourceType::Role, name))
        }
    }
}
