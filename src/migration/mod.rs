//! Versioned, reversible changes: deploy/revert/verify triples ordered by
//! their declared dependencies.

use crate::catalog::{Catalog, DdlOperation};
use crate::config::AclConfig;
use crate::error::{AclError, ResourceType};
use crate::permission::Action;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub change_id: String,
    pub checksum_hex: String,
    pub deployed_at_micros: u64,
    pub deployed_seq: u64,
}

/// A read-only assertion about catalog state, evaluated by `verify`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VerifyCheck {
    RoleExists(String),
    RoleMember {
        member: String,
        role: String,
        expected: bool,
    },
    SecurableExists(String),
    ColumnExists {
        table: String,
        column: String,
    },
    Privilege {
        principal: String,
        securable: String,
        action: Action,
        #[serde(default)]
        column: Option<String>,
        expected: bool,
    },
    RowSecurityEnabled(String),
    PolicyExists {
        table: String,
        name: String,
    },
    TriggerExists {
        table: String,
        name: String,
    },
}

impl VerifyCheck {
    pub fn privilege(principal: &str, securable: &str, action: Action, expected: bool) -> Self {
        VerifyCheck::Privilege {
            principal: principal.to_string(),
            securable: securable.to_string(),
            action,
            column: None,
            expected,
        }
    }

    pub fn column_privilege(
        principal: &str,
        securable: &str,
        action: Action,
        column: &str,
        expected: bool,
    ) -> Self {
        VerifyCheck::Privilege {
            principal: principal.to_string(),
            securable: securable.to_string(),
            action,
            column: Some(column.to_string()),
            expected,
        }
    }

    pub fn member(member: &str, role: &str) -> Self {
        VerifyCheck::RoleMember {
            member: member.to_string(),
            role: role.to_string(),
            expected: true,
        }
    }

    pub fn policy(table: &str, name: &str) -> Self {
        VerifyCheck::PolicyExists {
            table: table.to_string(),
            name: name.to_string(),
        }
    }

    pub fn trigger(table: &str, name: &str) -> Self {
        VerifyCheck::TriggerExists {
            table: table.to_string(),
            name: name.to_string(),
        }
    }

    /// Missing objects make a check fail rather than error, so a verify
    /// after revert reports `false` instead of `NotFound`.
    pub fn holds(&self, catalog: &Catalog, config: &AclConfig) -> Result<bool, AclError> {
        let answer = match self {
            VerifyCheck::RoleExists(role) => Ok(catalog.roles.contains(role)),
            VerifyCheck::RoleMember {
                member,
                role,
                expected,
            } => catalog
                .roles
                .is_member(member, role)
                .map(|is| is == *expected),
            VerifyCheck::SecurableExists(table) => Ok(catalog.table(table).is_ok()),
            VerifyCheck::ColumnExists { table, column } => catalog
                .table(table)
                .map(|schema| schema.has_column(column)),
            VerifyCheck::Privilege {
                principal,
                securable,
                action,
                column,
                expected,
            } => catalog
                .can(principal, securable, *action, column.as_deref(), config)
                .map(|can| can == *expected),
            VerifyCheck::RowSecurityEnabled(table) => Ok(catalog.row_security_enabled(table)),
            VerifyCheck::PolicyExists { table, name } => Ok(catalog.policy(table, name).is_some()),
            VerifyCheck::TriggerExists { table, name } => {
                Ok(catalog.trigger(table, name).is_some())
            }
        };
        match answer {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    pub id: String,
    pub note: String,
    #[serde(default)]
    pub requires: Vec<String>,
    pub deploy: Vec<DdlOperation>,
    #[serde(default)]
    pub revert: Vec<DdlOperation>,
    #[serde(default)]
    pub verify: Vec<VerifyCheck>,
}

impl Change {
    pub fn new(id: &str, note: &str) -> Self {
        Self {
            id: id.to_string(),
            note: note.to_string(),
            requires: Vec::new(),
            deploy: Vec::new(),
            revert: Vec::new(),
            verify: Vec::new(),
        }
    }

    pub fn requires(mut self, ids: &[&str]) -> Self {
        self.requires = ids.iter().map(|id| (*id).to_string()).collect();
        self
    }

    pub fn deploy(mut self, ops: Vec<DdlOperation>) -> Self {
        self.deploy = ops;
        self
    }

    pub fn revert(mut self, ops: Vec<DdlOperation>) -> Self {
        self.revert = ops;
        self
    }

    pub fn verify(mut self, checks: Vec<VerifyCheck>) -> Self {
        self.verify = checks;
        self
    }
}

pub fn checksum_hex(change: &Change) -> Result<String, AclError> {
    let bytes = rmp_serde::to_vec(change).map_err(|e| AclError::Encode(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Declared change list. Construction rejects duplicate ids and
/// dependencies on undeclared changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    changes: Vec<Change>,
}

impl Plan {
    pub fn new(changes: Vec<Change>) -> Result<Self, AclError> {
        let mut ids = BTreeSet::new();
        for change in &changes {
            if !ids.insert(change.id.as_str()) {
                return Err(AclError::AlreadyExists {
                    resource_type: ResourceType::Change,
                    resource_id: change.id.clone(),
                });
            }
        }
        for change in &changes {
            if let Some(missing) = change.requires.iter().find(|r| !ids.contains(r.as_str())) {
                return Err(AclError::not_found(
                    ResourceType::Change,
                    format!("{missing} (required by {})", change.id),
                ));
            }
        }
        Ok(Self { changes })
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn get(&self, id: &str) -> Result<&Change, AclError> {
        self.changes
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| AclError::not_found(ResourceType::Change, id))
    }

    pub fn dependents_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Change> + 'a {
        self.changes
            .iter()
            .filter(move |c| c.requires.iter().any(|r| r == id))
    }

    /// Dependency order, with declaration order breaking ties.
    pub fn ordered(&self) -> Result<Vec<&Change>, AclError> {
        let mut remaining: BTreeMap<usize, BTreeSet<&str>> = self
            .changes
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.requires.iter().map(String::as_str).collect()))
            .collect();
        let mut ordered = Vec::with_capacity(self.changes.len());
        while !remaining.is_empty() {
            let Some(next) = remaining
                .iter()
                .find(|(_, deps)| deps.is_empty())
                .map(|(i, _)| *i)
            else {
                let stuck: Vec<&str> = remaining
                    .keys()
                    .map(|i| self.changes[*i].id.as_str())
                    .collect();
                return Err(AclError::Validation(format!(
                    "dependency cycle among changes: {}",
                    stuck.join(", ")
                )));
            };
            remaining.remove(&next);
            let id = self.changes[next].id.as_str();
            for deps in remaining.values_mut() {
                deps.remove(id);
            }
            ordered.push(&self.changes[next]);
        }
        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_respects_requires_then_declaration_order() {
        let plan = Plan::new(vec![
            Change::new("grants/reporter", "").requires(&["roles/reporter"]),
            Change::new("roles/reporter", ""),
            Change::new("roles/cascadia", ""),
        ])
        .expect("plan");
        let ids: Vec<&str> = plan
            .ordered()
            .expect("order")
            .into_iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["roles/reporter", "grants/reporter", "roles/cascadia"]);
    }

    #[test]
    fn plan_rejects_unknown_dependency_and_cycles() {
        let err = Plan::new(vec![Change::new("a", "").requires(&["b"])]).expect_err("unknown");
        assert!(err.is_not_found());

        let plan = Plan::new(vec![
            Change::new("a", "").requires(&["b"]),
            Change::new("b", "").requires(&["a"]),
        ])
        .expect("declared");
        assert!(matches!(plan.ordered(), Err(AclError::Validation(_))));
    }

    #[test]
    fn checksum_tracks_content() {
        let base = Change::new("roles/reporter", "reporting role")
            .deploy(vec![DdlOperation::create_role("reporter")]);
        let same = base.clone();
        let edited = base
            .clone()
            .deploy(vec![DdlOperation::create_login("reporter")]);
        assert_eq!(
            checksum_hex(&base).expect("a"),
            checksum_hex(&same).expect("b")
        );
        assert_ne!(
            checksum_hex(&base).expect("a"),
            checksum_hex(&edited).expect("c")
        );
        assert_eq!(checksum_hex(&base).expect("hex").len(), 64);
    }

    #[test]
    fn verify_checks_report_false_for_missing_objects() {
        let mut catalog = Catalog::default();
        let config = AclConfig::default();
        let check = VerifyCheck::privilege("reporter", "warehouse.sample", Action::Select, true);
        assert!(!check.holds(&catalog, &config).expect("missing is false"));
        catalog
            .apply_ddl(DdlOperation::create_role("reporter"))
            .expect("role");
        assert!(
            VerifyCheck::RoleExists("reporter".into())
                .holds(&catalog, &config)
                .expect("exists")
        );
    }
}
