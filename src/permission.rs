use crate::error::{AclError, ResourceType};
use im::{OrdMap, OrdSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Table privileges.
///
/// Semantics follow the warehouse's grant statements:
/// - `Select`, `Insert`, `Update` and `References` may be granted per column.
/// - `Delete`, `Truncate` and `Trigger` are table-wide only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    References,
    Trigger,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Select,
        Action::Insert,
        Action::Update,
        Action::Delete,
        Action::Truncate,
        Action::References,
        Action::Trigger,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Select => "select",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Truncate => "truncate",
            Action::References => "references",
            Action::Trigger => "trigger",
        }
    }

    /// Unknown action names are a modeling bug, not a denial.
    pub fn parse(name: &str) -> Result<Action, AclError> {
        let lowered = name.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == lowered)
            .ok_or_else(|| AclError::not_found(ResourceType::Action, name))
    }

    pub fn column_grantable(self) -> bool {
        matches!(
            self,
            Action::Select | Action::Insert | Action::Update | Action::References
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Privileges {
    All,
    Only(Vec<Action>),
}

impl Privileges {
    pub fn one(action: Action) -> Self {
        Privileges::Only(vec![action])
    }

    pub fn actions(&self) -> Vec<Action> {
        match self {
            Privileges::All => Action::ALL.to_vec(),
            Privileges::Only(actions) => actions.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GrantKind {
    Grant,
    Revoke,
    /// The listed columns were dropped: their entries are removed rather
    /// than revoked, so a column added later under the same name starts
    /// from the table-level grant.
    Forget,
}

/// One `grant ... to` / `revoke ... from` statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantEvent {
    pub kind: GrantKind,
    pub securable: String,
    pub privileges: Privileges,
    pub principal: String,
    /// `None` is a table-level statement; `Some` lists the columns.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl GrantEvent {
    pub fn grant(securable: &str, privileges: Privileges, principal: &str) -> Self {
        Self {
            kind: GrantKind::Grant,
            securable: securable.to_string(),
            privileges,
            principal: principal.to_string(),
            columns: None,
        }
    }

    pub fn revoke(securable: &str, privileges: Privileges, principal: &str) -> Self {
        Self {
            kind: GrantKind::Revoke,
            ..Self::grant(securable, privileges, principal)
        }
    }

    pub fn forget_columns(securable: &str, principal: &str, columns: &[&str]) -> Self {
        Self {
            kind: GrantKind::Forget,
            ..Self::grant(securable, Privileges::All, principal)
        }
        .on_columns(columns)
    }

    pub fn on_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| (*c).to_string()).collect());
        self
    }
}

/// Append-only ordered record of grant statements. The effective
/// permissions are the left fold of this log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionLog {
    events: Vec<GrantEvent>,
}

impl PermissionLog {
    pub fn append(&mut self, event: GrantEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[GrantEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn replay(&self) -> PermissionTable {
        let mut table = PermissionTable::default();
        for event in &self.events {
            table.apply(event);
        }
        table
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnState {
    Granted,
    /// A column-level revoke that shadows a table-level grant.
    Revoked,
}

type TableKey = (String, String, Action);
type ColumnKey = (String, String, Action, String);

/// Folded grant state for direct grantees; role inheritance is applied by
/// the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionTable {
    table_grants: OrdSet<TableKey>,
    column_grants: OrdMap<ColumnKey, ColumnState>,
}

impl PermissionTable {
    /// Folds one event into the state.
    ///
    /// - Table-level grant: sets the table bit for each action.
    /// - Table-level revoke: clears the table bit and every column entry
    ///   (granted or revoked) for each action. `revoke all` therefore clears
    ///   the principal's whole footprint on the securable.
    /// - Column-level grant/revoke: last write wins per exact column tuple.
    /// - Forget: drops the column entries of a dropped column.
    pub fn apply(&mut self, event: &GrantEvent) {
        let actions = event.privileges.actions();
        match (&event.columns, event.kind) {
            (None, GrantKind::Grant) => {
                for action in actions {
                    self.table_grants.insert((
                        event.securable.clone(),
                        event.principal.clone(),
                        action,
                    ));
                }
            }
            (None, GrantKind::Revoke | GrantKind::Forget) => {
                for action in actions {
                    self.table_grants.remove(&(
                        event.securable.clone(),
                        event.principal.clone(),
                        action,
                    ));
                    let stale: Vec<ColumnKey> = self
                        .column_grants
                        .keys()
                        .filter(|(s, p, a, _)| {
                            *s == event.securable && *p == event.principal && *a == action
                        })
                        .cloned()
                        .collect();
                    for key in stale {
                        self.column_grants.remove(&key);
                    }
                }
            }
            (Some(columns), GrantKind::Forget) => {
                let stale: Vec<ColumnKey> = self
                    .column_grants
                    .keys()
                    .filter(|(s, p, a, c)| {
                        *s == event.securable
                            && *p == event.principal
                            && actions.contains(a)
                            && columns.contains(c)
                    })
                    .cloned()
                    .collect();
                for key in stale {
                    self.column_grants.remove(&key);
                }
            }
            (Some(columns), kind) => {
                let state = match kind {
                    GrantKind::Grant => ColumnState::Granted,
                    GrantKind::Revoke | GrantKind::Forget => ColumnState::Revoked,
                };
                for action in actions.into_iter().filter(|a| a.column_grantable()) {
                    for column in columns {
                        self.column_grants.insert(
                            (
                                event.securable.clone(),
                                event.principal.clone(),
                                action,
                                column.clone(),
                            ),
                            state,
                        );
                    }
                }
            }
        }
        tracing::debug!(
            kind = ?event.kind,
            securable = %event.securable,
            principal = %event.principal,
            privileges = ?event.privileges,
            columns = ?event.columns,
            "replayed grant event"
        );
    }

    pub fn has_table_grant(&self, securable: &str, principal: &str, action: Action) -> bool {
        self.table_grants.contains(&(
            securable.to_string(),
            principal.to_string(),
            action,
        ))
    }

    pub fn column_state(
        &self,
        securable: &str,
        principal: &str,
        action: Action,
        column: &str,
    ) -> Option<ColumnState> {
        self.column_grants
            .get(&(
                securable.to_string(),
                principal.to_string(),
                action,
                column.to_string(),
            ))
            .copied()
    }

    /// Direct (non-inherited) answer for one grantee.
    pub fn allows(
        &self,
        securable: &str,
        principal: &str,
        action: Action,
        column: Option<&str>,
    ) -> bool {
        match column {
            None => self.has_table_grant(securable, principal, action),
            Some(column) => match self.column_state(securable, principal, action, column) {
                Some(ColumnState::Granted) => true,
                Some(ColumnState::Revoked) => false,
                None => self.has_table_grant(securable, principal, action),
            },
        }
    }

    /// Grantees with any entry on `securable`.
    pub fn grantees_on(&self, securable: &str) -> BTreeSet<String> {
        let from_tables = self
            .table_grants
            .iter()
            .filter(|(s, _, _)| s == securable)
            .map(|(_, p, _)| p.clone());
        let from_columns = self
            .column_grants
            .keys()
            .filter(|(s, _, _, _)| s == securable)
            .map(|(_, p, _, _)| p.clone());
        from_tables.chain(from_columns).collect()
    }

    /// Securables on which `principal` holds any entry.
    pub fn securables_for(&self, principal: &str) -> BTreeSet<String> {
        let from_tables = self
            .table_grants
            .iter()
            .filter(|(_, p, _)| p == principal)
            .map(|(s, _, _)| s.clone());
        let from_columns = self
            .column_grants
            .keys()
            .filter(|(_, p, _, _)| p == principal)
            .map(|(s, _, _, _)| s.clone());
        from_tables.chain(from_columns).collect()
    }
}
