pub mod schema;
pub mod types;

use crate::catalog::schema::{TableAlteration, TableSchema};
use crate::config::AclConfig;
use crate::error::{AclError, ResourceType};
use crate::permission::{Action, GrantEvent, PermissionLog, PermissionTable, Privileges};
use crate::policy::{Policy, PolicyCommand};
use crate::role::RoleRegistry;
use crate::trigger::{Trigger, TriggerKind};
use im::{OrdMap, OrdSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
struct PermissionCacheEntry {
    allowed: bool,
    expires_at: Instant,
}

/// (principal, securable, action, column, owners_bypass)
type PermissionCacheKey = (String, String, Action, Option<String>, bool);
type PermissionCacheMap = HashMap<PermissionCacheKey, PermissionCacheEntry>;

/// Roles, securables, grants, row security and triggers.
///
/// The effective permission table is always the replay of the grant log;
/// only the log is persisted and the table is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "CatalogRecord", into = "CatalogRecord")]
pub struct Catalog {
    pub roles: RoleRegistry,
    tables: OrdMap<String, TableSchema>,
    permission_log: PermissionLog,
    permissions: PermissionTable,
    row_security: OrdSet<String>,
    policies: OrdMap<String, OrdMap<String, Policy>>,
    triggers: OrdMap<String, OrdMap<String, Trigger>>,
    /// TTL cache of `can` answers. Shared by plain clones, replaced by
    /// [`Catalog::fork`].
    permission_cache: Arc<RwLock<PermissionCacheMap>>,
}

#[derive(Serialize, Deserialize)]
struct CatalogRecord {
    #[serde(default)]
    roles: RoleRegistry,
    #[serde(default)]
    tables: OrdMap<String, TableSchema>,
    #[serde(default)]
    permission_log: PermissionLog,
    #[serde(default)]
    row_security: OrdSet<String>,
    #[serde(default)]
    policies: OrdMap<String, OrdMap<String, Policy>>,
    #[serde(default)]
    triggers: OrdMap<String, OrdMap<String, Trigger>>,
}

impl From<CatalogRecord> for Catalog {
    fn from(record: CatalogRecord) -> Self {
        let permissions = record.permission_log.replay();
        Self {
            roles: record.roles,
            tables: record.tables,
            permission_log: record.permission_log,
            permissions,
            row_security: record.row_security,
            policies: record.policies,
            triggers: record.triggers,
            permission_cache: Arc::default(),
        }
    }
}

impl From<Catalog> for CatalogRecord {
    fn from(catalog: Catalog) -> Self {
        Self {
            roles: catalog.roles,
            tables: catalog.tables,
            permission_log: catalog.permission_log,
            row_security: catalog.row_security,
            policies: catalog.policies,
            triggers: catalog.triggers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DdlOperation {
    CreateRole {
        name: String,
        #[serde(default)]
        login: bool,
        #[serde(default)]
        if_not_exists: bool,
    },
    DropRole {
        name: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
    /// `grant <role> to <member>`
    GrantRole {
        role: String,
        member: String,
    },
    RevokeRole {
        role: String,
        member: String,
    },
    CreateTable {
        schema: TableSchema,
        #[serde(default)]
        if_not_exists: bool,
    },
    AlterTable {
        table: String,
        alteration: TableAlteration,
    },
    DropTable {
        table: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
    TransferOwnership {
        table: String,
        new_owner: String,
    },
    /// A privilege `grant` or `revoke` statement.
    Acl(GrantEvent),
    EnableRowSecurity {
        table: String,
    },
    DisableRowSecurity {
        table: String,
    },
    CreatePolicy(Policy),
    DropPolicy {
        table: String,
        name: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
    CreateTrigger(Trigger),
    DropTrigger {
        table: String,
        name: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
}

impl DdlOperation {
    pub fn create_role(name: &str) -> Self {
        DdlOperation::CreateRole {
            name: name.to_string(),
            login: false,
            if_not_exists: false,
        }
    }

    pub fn create_login(name: &str) -> Self {
        DdlOperation::CreateRole {
            name: name.to_string(),
            login: true,
            if_not_exists: false,
        }
    }

    pub fn drop_role(name: &str) -> Self {
        DdlOperation::DropRole {
            name: name.to_string(),
            if_exists: true,
        }
    }

    pub fn grant_role(role: &str, member: &str) -> Self {
        DdlOperation::GrantRole {
            role: role.to_string(),
            member: member.to_string(),
        }
    }

    pub fn revoke_role(role: &str, member: &str) -> Self {
        DdlOperation::RevokeRole {
            role: role.to_string(),
            member: member.to_string(),
        }
    }

    pub fn create_table(schema: TableSchema) -> Self {
        DdlOperation::CreateTable {
            schema,
            if_not_exists: false,
        }
    }

    pub fn drop_table(table: &str) -> Self {
        DdlOperation::DropTable {
            table: table.to_string(),
            if_exists: true,
        }
    }

    pub fn grant(securable: &str, privileges: Privileges, principal: &str) -> Self {
        DdlOperation::Acl(GrantEvent::grant(securable, privileges, principal))
    }

    pub fn revoke(securable: &str, privileges: Privileges, principal: &str) -> Self {
        DdlOperation::Acl(GrantEvent::revoke(securable, privileges, principal))
    }

    pub fn grant_columns(
        securable: &str,
        action: Action,
        principal: &str,
        columns: &[&str],
    ) -> Self {
        DdlOperation::Acl(
            GrantEvent::grant(securable, Privileges::one(action), principal).on_columns(columns),
        )
    }

    pub fn revoke_columns(
        securable: &str,
        action: Action,
        principal: &str,
        columns: &[&str],
    ) -> Self {
        DdlOperation::Acl(
            GrantEvent::revoke(securable, Privileges::one(action), principal).on_columns(columns),
        )
    }

    pub fn enable_row_security(table: &str) -> Self {
        DdlOperation::EnableRowSecurity {
            table: table.to_string(),
        }
    }

    pub fn disable_row_security(table: &str) -> Self {
        DdlOperation::DisableRowSecurity {
            table: table.to_string(),
        }
    }

    pub fn drop_policy(table: &str, name: &str) -> Self {
        DdlOperation::DropPolicy {
            table: table.to_string(),
            name: name.to_string(),
            if_exists: true,
        }
    }

    pub fn drop_trigger(table: &str, name: &str) -> Self {
        DdlOperation::DropTrigger {
            table: table.to_string(),
            name: name.to_string(),
            if_exists: true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DdlOperation::CreateRole { .. } => "create_role",
            DdlOperation::DropRole { .. } => "drop_role",
            DdlOperation::GrantRole { .. } => "grant_role",
            DdlOperation::RevokeRole { .. } => "revoke_role",
            DdlOperation::CreateTable { .. } => "create_table",
            DdlOperation::AlterTable { .. } => "alter_table",
            DdlOperation::DropTable { .. } => "drop_table",
            DdlOperation::TransferOwnership { .. } => "transfer_ownership",
            DdlOperation::Acl(_) => "acl",
            DdlOperation::EnableRowSecurity { .. } => "enable_row_security",
            DdlOperation::DisableRowSecurity { .. } => "disable_row_security",
            DdlOperation::CreatePolicy(_) => "create_policy",
            DdlOperation::DropPolicy { .. } => "drop_policy",
            DdlOperation::CreateTrigger(_) => "create_trigger",
            DdlOperation::DropTrigger { .. } => "drop_trigger",
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            roles: RoleRegistry::default(),
            tables: OrdMap::new(),
            permission_log: PermissionLog::default(),
            permissions: PermissionTable::default(),
            row_security: OrdSet::new(),
            policies: OrdMap::new(),
            triggers: OrdMap::new(),
            permission_cache: Arc::new(RwLock::new(PermissionCacheMap::new())),
        }
    }
}

// The cache is not part of catalog identity.
impl PartialEq for Catalog {
    fn eq(&self, other: &Self) -> bool {
        self.roles == other.roles
            && self.tables == other.tables
            && self.permission_log == other.permission_log
            && self.permissions == other.permissions
            && self.row_security == other.row_security
            && self.policies == other.policies
            && self.triggers == other.triggers
    }
}

impl Eq for Catalog {}

impl Catalog {
    /// Copy for a transaction: same state, private permission cache, so
    /// answers computed against uncommitted DDL never leak into the live
    /// catalog's cache.
    pub fn fork(&self) -> Self {
        Self {
            permission_cache: Arc::new(RwLock::new(PermissionCacheMap::new())),
            ..self.clone()
        }
    }

    pub fn ddl_payload(op: &DdlOperation) -> Result<Vec<u8>, AclError> {
        rmp_serde::to_vec(op).map_err(|e| AclError::Encode(e.to_string()))
    }

    pub fn ddl_from_payload(bytes: &[u8]) -> Result<DdlOperation, AclError> {
        rmp_serde::from_slice(bytes).map_err(|e| AclError::Decode(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, AclError> {
        serde_json::to_vec_pretty(self).map_err(|e| AclError::Encode(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, AclError> {
        serde_json::from_slice(bytes).map_err(|e| AclError::Decode(e.to_string()))
    }

    pub fn apply_ddl(&mut self, op: DdlOperation) -> Result<(), AclError> {
        self.apply_ddl_with(op, &AclConfig::default())
    }

    /// Applies one DDL operation. Every operation validates before it
    /// mutates, so an error leaves the catalog unchanged.
    pub fn apply_ddl_with(&mut self, op: DdlOperation, config: &AclConfig) -> Result<(), AclError> {
        let result = match op {
            DdlOperation::CreateRole {
                name,
                login,
                if_not_exists,
            } => {
                if if_not_exists && self.roles.contains(&name) {
                    Ok(())
                } else {
                    self.roles.create_role(&name, login)
                }
            }
            DdlOperation::DropRole { name, if_exists } => self.drop_role(&name, if_exists),
            DdlOperation::GrantRole { role, member } => self.roles.grant_role(&member, &role),
            DdlOperation::RevokeRole { role, member } => self.roles.revoke_role(&member, &role),
            DdlOperation::CreateTable {
                schema,
                if_not_exists,
            } => self.create_table(schema, if_not_exists),
            DdlOperation::AlterTable { table, alteration } => {
                self.alter_table(&table, alteration, config)
            }
            DdlOperation::DropTable { table, if_exists } => self.drop_table(&table, if_exists),
            DdlOperation::TransferOwnership { table, new_owner } => {
                self.transfer_ownership(&table, &new_owner)
            }
            DdlOperation::Acl(event) => self.apply_grant_event(event),
            DdlOperation::EnableRowSecurity { table } => {
                self.table(&table)?;
                self.row_security.insert(table);
                Ok(())
            }
            DdlOperation::DisableRowSecurity { table } => {
                self.table(&table)?;
                self.row_security.remove(&table);
                Ok(())
            }
            DdlOperation::CreatePolicy(policy) => self.create_policy(policy, config),
            DdlOperation::DropPolicy {
                table,
                name,
                if_exists,
            } => self.drop_policy(&table, &name, if_exists),
            DdlOperation::CreateTrigger(trigger) => self.create_trigger(trigger),
            DdlOperation::DropTrigger {
                table,
                name,
                if_exists,
            } => self.drop_trigger(&table, &name, if_exists),
        };
        self.invalidate_permission_cache();
        result
    }

    fn invalidate_permission_cache(&self) {
        self.permission_cache.write().clear();
    }

    fn permission_cache_get(&self, key: &PermissionCacheKey, now: Instant) -> Option<bool> {
        self.permission_cache
            .read()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.allowed)
    }

    fn permission_cache_put(
        &self,
        key: PermissionCacheKey,
        allowed: bool,
        now: Instant,
        config: &AclConfig,
    ) {
        let mut cache = self.permission_cache.write();
        if cache.len() >= config.permission_cache_max_entries {
            cache.clear();
        }
        cache.insert(
            key,
            PermissionCacheEntry {
                allowed,
                expires_at: now + config.permission_cache_ttl(),
            },
        );
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema, AclError> {
        self.tables
            .get(name)
            .ok_or_else(|| AclError::not_found(ResourceType::Securable, name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn permission_log(&self) -> &PermissionLog {
        &self.permission_log
    }

    pub fn permissions(&self) -> &PermissionTable {
        &self.permissions
    }

    pub fn row_security_enabled(&self, table: &str) -> bool {
        self.row_security.contains(table)
    }

    pub fn policies_on(&self, table: &str) -> impl Iterator<Item = &Policy> {
        self.policies
            .get(table)
            .into_iter()
            .flat_map(|by_name| by_name.values())
    }

    pub fn policy(&self, table: &str, name: &str) -> Option<&Policy> {
        self.policies.get(table).and_then(|by_name| by_name.get(name))
    }

    pub fn triggers_on(&self, table: &str) -> impl Iterator<Item = &Trigger> {
        self.triggers
            .get(table)
            .into_iter()
            .flat_map(|by_name| by_name.values())
    }

    pub fn trigger(&self, table: &str, name: &str) -> Option<&Trigger> {
        self.triggers.get(table).and_then(|by_name| by_name.get(name))
    }

    /// Whether `memberships` (a principal's role closure) includes the
    /// owner of `table`.
    pub fn owned_by(&self, memberships: &BTreeSet<String>, table: &str) -> Result<bool, AclError> {
        Ok(self
            .table(table)?
            .owner_id
            .as_ref()
            .is_some_and(|owner| memberships.contains(owner)))
    }

    /// Privilege check with role inheritance.
    ///
    /// `column = None` asks for the table-level privilege. A column-level
    /// question is answered by an explicit column grant, or by a table-level
    /// grant that no column-level revoke shadows for that column.
    pub fn can(
        &self,
        principal: &str,
        securable: &str,
        action: Action,
        column: Option<&str>,
        config: &AclConfig,
    ) -> Result<bool, AclError> {
        let schema = self.table(securable)?;
        if let Some(column) = column {
            schema.require_column(column)?;
            if !action.column_grantable() {
                return Err(AclError::Validation(format!(
                    "{action} is not a column privilege"
                )));
            }
        }
        if !self.roles.contains(principal) {
            return Err(AclError::not_found(ResourceType::Role, principal));
        }

        let now = Instant::now();
        let cache_key = (
            principal.to_string(),
            securable.to_string(),
            action,
            column.map(str::to_string),
            config.owners_bypass,
        );
        if config.caching_enabled() {
            if let Some(allowed) = self.permission_cache_get(&cache_key, now) {
                return Ok(allowed);
            }
        }

        let memberships = self.roles.memberships(principal)?;
        let granted = memberships
            .iter()
            .any(|role| self.permissions.allows(securable, role, action, column));
        let allowed = if granted {
            true
        } else if config.owners_bypass && self.owned_by(&memberships, securable)? {
            tracing::warn!(
                principal,
                securable,
                action = %action,
                column = ?column,
                "owner privilege used without an explicit grant"
            );
            true
        } else {
            false
        };

        if !allowed && config.log_denials {
            tracing::debug!(
                principal,
                securable,
                action = %action,
                column = ?column,
                "privilege denied"
            );
        }
        if config.caching_enabled() {
            self.permission_cache_put(cache_key, allowed, now, config);
        }
        Ok(allowed)
    }

    /// Columns of `securable`, in table order, that `principal` may use
    /// for `action`.
    pub fn column_set(
        &self,
        principal: &str,
        securable: &str,
        action: Action,
        config: &AclConfig,
    ) -> Result<Vec<String>, AclError> {
        let schema = self.table(securable)?;
        let mut allowed = Vec::new();
        for column in &schema.columns {
            if self.can(principal, securable, action, Some(&column.name), config)? {
                allowed.push(column.name.clone());
            }
        }
        Ok(allowed)
    }

    fn record_grant_event(&mut self, event: GrantEvent) {
        self.permissions.apply(&event);
        self.permission_log.append(event);
    }

    fn apply_grant_event(&mut self, event: GrantEvent) -> Result<(), AclError> {
        let schema = self.table(&event.securable)?;
        if !self.roles.contains(&event.principal) {
            return Err(AclError::not_found(ResourceType::Role, &event.principal));
        }
        if let Privileges::Only(actions) = &event.privileges {
            if actions.is_empty() {
                return Err(AclError::Validation("empty privilege list".into()));
            }
        }
        if let Some(columns) = &event.columns {
            if columns.is_empty() {
                return Err(AclError::Validation("empty column list".into()));
            }
            for column in columns {
                schema.require_column(column)?;
            }
            if let Privileges::Only(actions) = &event.privileges {
                if let Some(action) = actions.iter().find(|a| !a.column_grantable()) {
                    return Err(AclError::Validation(format!(
                        "{action} cannot be granted per column"
                    )));
                }
            }
        }
        self.record_grant_event(event);
        Ok(())
    }

    fn drop_role(&mut self, name: &str, if_exists: bool) -> Result<(), AclError> {
        if self.roles.get(name).is_none() {
            return if if_exists {
                Ok(())
            } else {
                Err(AclError::not_found(ResourceType::Role, name))
            };
        }
        if let Some(owned) = self
            .tables
            .values()
            .find(|t| t.owner_id.as_deref() == Some(name))
        {
            return Err(AclError::Validation(format!(
                "role {name} owns {}",
                owned.qualified_name()
            )));
        }
        let referenced_by_policy = self.policies.values().flat_map(|m| m.values()).find(|p| {
            p.roles.iter().any(|r| r == name) || p.expressions().any(|e| e.references_role(name))
        });
        if let Some(policy) = referenced_by_policy {
            return Err(AclError::Validation(format!(
                "role {name} is referenced by policy {} on {}",
                policy.name, policy.table
            )));
        }
        let referenced_by_trigger = self.triggers.values().flat_map(|m| m.values()).find(|t| {
            matches!(&t.kind, TriggerKind::OriginRoleConsistency { role, .. } if role == name)
        });
        if let Some(trigger) = referenced_by_trigger {
            return Err(AclError::Validation(format!(
                "role {name} is referenced by trigger {} on {}",
                trigger.name, trigger.table
            )));
        }

        for securable in self.permissions.securables_for(name) {
            self.record_grant_event(GrantEvent::revoke(&securable, Privileges::All, name));
        }
        self.roles.drop_role(name)
    }

    fn create_table(&mut self, schema: TableSchema, if_not_exists: bool) -> Result<(), AclError> {
        let key = schema.qualified_name();
        if self.tables.contains_key(&key) {
            return if if_not_exists {
                Ok(())
            } else {
                Err(AclError::AlreadyExists {
                    resource_type: ResourceType::Securable,
                    resource_id: key,
                })
            };
        }
        if schema.schema_name.is_empty() || schema.table_name.is_empty() {
            return Err(AclError::Validation(
                "schema and table name must not be empty".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for column in &schema.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(AclError::Validation(format!(
                    "duplicate column {} in {key}",
                    column.name
                )));
            }
        }
        if let Some(owner) = &schema.owner_id {
            if !self.roles.contains(owner) {
                return Err(AclError::not_found(ResourceType::Role, owner));
            }
        }
        if let Some(pk) = &schema.primary_key {
            schema.require_column(pk)?;
        }
        for fk in &schema.foreign_keys {
            schema.require_column(&fk.column)?;
            let referenced = if fk.references_table == key {
                &schema
            } else {
                self.table(&fk.references_table)?
            };
            if referenced.primary_key.is_none() {
                return Err(AclError::Validation(format!(
                    "{} has no primary key for {}",
                    fk.references_table, fk.name
                )));
            }
        }
        self.tables.insert(key, schema);
        Ok(())
    }

    /// Alters a table, then re-validates every trigger and policy that
    /// depends on it. A dependent that no longer validates rejects the
    /// alteration.
    fn alter_table(
        &mut self,
        table: &str,
        alteration: TableAlteration,
        config: &AclConfig,
    ) -> Result<(), AclError> {
        let mut next = self.table(table)?.clone();
        if let TableAlteration::AddForeignKey(fk) = &alteration {
            if fk.references_table != table {
                self.table(&fk.references_table)?;
            }
        }
        let dropped = match &alteration {
            TableAlteration::DropColumn { name } => Some(name.clone()),
            _ => None,
        };
        next.alter(alteration)?;
        let previous = self.tables.insert(table.to_string(), next);
        if let Err(e) = self.validate_dependents(table, config) {
            if let Some(previous) = previous {
                self.tables.insert(table.to_string(), previous);
            }
            return Err(AclError::Validation(format!("cannot alter {table}: {e}")));
        }
        if let Some(column) = dropped {
            for grantee in self.permissions.grantees_on(table) {
                self.record_grant_event(GrantEvent::forget_columns(table, &grantee, &[&column]));
            }
        }
        Ok(())
    }

    fn validate_dependents(&self, table: &str, config: &AclConfig) -> Result<(), AclError> {
        for trigger in self.triggers.values().flat_map(|m| m.values()) {
            let depends = trigger.table == table
                || matches!(
                    &trigger.kind,
                    TriggerKind::AccessRolePropagation { parent_table, .. } if parent_table == table
                );
            if depends {
                trigger.validate(self)?;
            }
        }
        for policy in self.policies.values().flat_map(|m| m.values()) {
            if policy.table == table || policy.expressions().any(|e| e.references_table(table)) {
                self.validate_policy_expressions(policy, config)?;
            }
        }
        Ok(())
    }

    fn drop_table(&mut self, table: &str, if_exists: bool) -> Result<(), AclError> {
        if !self.tables.contains_key(table) {
            return if if_exists {
                Ok(())
            } else {
                Err(AclError::not_found(ResourceType::Securable, table))
            };
        }
        if let Some(dependent) = self.tables.values().find(|t| {
            t.qualified_name() != table && t.foreign_keys.iter().any(|fk| fk.references_table == table)
        }) {
            return Err(AclError::Validation(format!(
                "{} references {table}",
                dependent.qualified_name()
            )));
        }
        if let Some(trigger) = self.triggers.values().flat_map(|m| m.values()).find(|t| {
            t.table != table
                && matches!(
                    &t.kind,
                    TriggerKind::AccessRolePropagation { parent_table, .. } if parent_table == table
                )
        }) {
            return Err(AclError::Validation(format!(
                "trigger {} on {} depends on {table}",
                trigger.name, trigger.table
            )));
        }
        if let Some(policy) = self.policies.values().flat_map(|m| m.values()).find(|p| {
            p.table != table && p.expressions().any(|e| e.references_table(table))
        }) {
            return Err(AclError::Validation(format!(
                "policy {} on {} depends on {table}",
                policy.name, policy.table
            )));
        }

        for grantee in self.permissions.grantees_on(table) {
            self.record_grant_event(GrantEvent::revoke(table, Privileges::All, &grantee));
        }
        self.policies.remove(table);
        self.triggers.remove(table);
        self.row_security.remove(table);
        self.tables.remove(table);
        Ok(())
    }

    fn transfer_ownership(&mut self, table: &str, new_owner: &str) -> Result<(), AclError> {
        if !self.roles.contains(new_owner) {
            return Err(AclError::not_found(ResourceType::Role, new_owner));
        }
        let mut schema = self.table(table)?.clone();
        schema.owner_id = Some(new_owner.to_string());
        self.tables.insert(table.to_string(), schema);
        Ok(())
    }

    fn validate_policy_expressions(
        &self,
        policy: &Policy,
        config: &AclConfig,
    ) -> Result<(), AclError> {
        let schema = self.table(&policy.table)?;
        for expr in policy.expressions() {
            expr.validate_depth(config.max_predicate_depth)?;
            expr.validate(self, schema)?;
        }
        Ok(())
    }

    fn create_policy(&mut self, policy: Policy, config: &AclConfig) -> Result<(), AclError> {
        if self.policy(&policy.table, &policy.name).is_some() {
            return Err(AclError::AlreadyExists {
                resource_type: ResourceType::Policy,
                resource_id: format!("{} on {}", policy.name, policy.table),
            });
        }
        if policy.roles.is_empty() {
            return Err(AclError::Validation(format!(
                "policy {} targets no roles",
                policy.name
            )));
        }
        if let Some(role) = policy.roles.iter().find(|r| !self.roles.contains(r)) {
            return Err(AclError::not_found(ResourceType::Role, role));
        }
        if policy.with_check.is_some()
            && matches!(policy.command, PolicyCommand::Select | PolicyCommand::Delete)
        {
            return Err(AclError::Validation(format!(
                "policy {}: WITH CHECK cannot be applied to {:?}",
                policy.name, policy.command
            )));
        }
        self.validate_policy_expressions(&policy, config)?;

        let mut by_name = self.policies.get(&policy.table).cloned().unwrap_or_default();
        let table = policy.table.clone();
        by_name.insert(policy.name.clone(), policy);
        self.policies.insert(table, by_name);
        Ok(())
    }

    fn drop_policy(&mut self, table: &str, name: &str, if_exists: bool) -> Result<(), AclError> {
        let Some(mut by_name) = self.policies.get(table).cloned() else {
            return missing(ResourceType::Policy, table, name, if_exists);
        };
        if by_name.remove(name).is_none() {
            return missing(ResourceType::Policy, table, name, if_exists);
        }
        if by_name.is_empty() {
            self.policies.remove(table);
        } else {
            self.policies.insert(table.to_string(), by_name);
        }
        Ok(())
    }

    fn create_trigger(&mut self, trigger: Trigger) -> Result<(), AclError> {
        if self.trigger(&trigger.table, &trigger.name).is_some() {
            return Err(AclError::AlreadyExists {
                resource_type: ResourceType::Trigger,
                resource_id: format!("{} on {}", trigger.name, trigger.table),
            });
        }
        trigger.validate(self)?;
        if let TriggerKind::OriginRoleConsistency { role, .. } = &trigger.kind {
            if !self.roles.contains(role) {
                return Err(AclError::not_found(ResourceType::Role, role));
            }
        }
        let mut by_name = self.triggers.get(&trigger.table).cloned().unwrap_or_default();
        let table = trigger.table.clone();
        by_name.insert(trigger.name.clone(), trigger);
        self.triggers.insert(table, by_name);
        Ok(())
    }

    fn drop_trigger(&mut self, table: &str, name: &str, if_exists: bool) -> Result<(), AclError> {
        let Some(mut by_name) = self.triggers.get(table).cloned() else {
            return missing(ResourceType::Trigger, table, name, if_exists);
        };
        if by_name.remove(name).is_none() {
            return missing(ResourceType::Trigger, table, name, if_exists);
        }
        if by_name.is_empty() {
            self.triggers.remove(table);
        } else {
            self.triggers.insert(table.to_string(), by_name);
        }
        Ok(())
    }
}

fn missing(
    resource_type: ResourceType,
    table: &str,
    name: &str,
    if_exists: bool,
) -> Result<(), AclError> {
    if if_exists {
        Ok(())
    } else {
        Err(AclError::not_found(resource_type, format!("{name} on {table}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::{ColumnDef, SecurableKind};
    use crate::catalog::types::ColumnType;

    const PA: &str = "receiving.presence_absence";

    fn receiving() -> TableSchema {
        TableSchema {
            schema_name: "receiving".into(),
            table_name: "presence_absence".into(),
            kind: SecurableKind::Table,
            owner_id: Some("id3c".into()),
            columns: vec![
                ColumnDef::new("presence_absence_id", ColumnType::Integer, false),
                ColumnDef::new("document", ColumnType::Json, false),
                ColumnDef::new("received", ColumnType::Timestamp, false),
                ColumnDef::new("processing_log", ColumnType::Json, true),
            ],
            primary_key: Some("presence_absence_id".into()),
            foreign_keys: Vec::new(),
        }
    }

    fn catalog() -> Catalog {
        let mut c = Catalog::default();
        for op in [
            DdlOperation::create_role("id3c"),
            DdlOperation::create_role("reporter"),
            DdlOperation::create_role("presence-absence-processor"),
            DdlOperation::create_login("alice"),
            DdlOperation::grant_role("reporter", "alice"),
            DdlOperation::create_table(receiving()),
        ] {
            c.apply_ddl(op).expect("setup");
        }
        c
    }

    #[test]
    fn ddl_payload_roundtrip_and_apply() {
        let op = DdlOperation::grant(PA, Privileges::one(Action::Select), "reporter");
        let bytes = Catalog::ddl_payload(&op).expect("encode");
        let decoded = Catalog::ddl_from_payload(&bytes).expect("decode");
        assert_eq!(decoded, op);
        let mut c = catalog();
        c.apply_ddl(decoded).expect("apply");
        assert!(
            c.can("alice", PA, Action::Select, None, &AclConfig::default())
                .expect("can")
        );
    }

    #[test]
    fn reporter_column_set_excludes_revoked_columns() {
        let mut c = catalog();
        c.apply_ddl(DdlOperation::grant(PA, Privileges::one(Action::Select), "reporter"))
            .expect("grant");
        c.apply_ddl(DdlOperation::revoke_columns(
            PA,
            Action::Select,
            "reporter",
            &["presence_absence_id", "received", "processing_log"],
        ))
        .expect("revoke");
        let cols = c
            .column_set("alice", PA, Action::Select, &AclConfig::strict())
            .expect("columns");
        assert_eq!(cols, vec!["document".to_string()]);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let c = catalog();
        let config = AclConfig::default();
        assert!(
            c.can("nobody", PA, Action::Select, None, &config)
                .expect_err("principal")
                .is_not_found()
        );
        assert!(
            c.can("alice", "receiving.nope", Action::Select, None, &config)
                .expect_err("securable")
                .is_not_found()
        );
        assert!(
            c.can("alice", PA, Action::Select, Some("nope"), &config)
                .expect_err("column")
                .is_not_found()
        );
        let mut c = c;
        let err = c
            .apply_ddl(DdlOperation::grant(PA, Privileges::All, "ghost"))
            .expect_err("unknown grantee");
        assert!(err.is_not_found());
    }

    #[test]
    fn owner_bypass_follows_config() {
        let c = catalog();
        assert!(
            c.can("id3c", PA, Action::Delete, None, &AclConfig::default())
                .expect("owner")
        );
        assert!(
            !c.can("id3c", PA, Action::Delete, None, &AclConfig::strict())
                .expect("strict")
        );
    }

    #[test]
    fn cached_answers_do_not_cross_bypass_settings() {
        let c = catalog();
        let strict = AclConfig::strict();
        let default = AclConfig::default();
        assert!(strict.caching_enabled());
        let log = Some("processing_log");
        for _ in 0..2 {
            assert!(!c.can("id3c", PA, Action::Update, log, &strict).expect("strict"));
            assert!(c.can("id3c", PA, Action::Update, log, &default).expect("owner"));
        }
    }

    #[test]
    fn cached_answers_are_invalidated_by_ddl() {
        let mut c = catalog();
        let config = AclConfig::default();
        assert!(!c.can("alice", PA, Action::Select, None, &config).expect("before"));
        c.apply_ddl(DdlOperation::grant(PA, Privileges::one(Action::Select), "reporter"))
            .expect("grant");
        assert!(c.can("alice", PA, Action::Select, None, &config).expect("after grant"));
        c.apply_ddl(DdlOperation::revoke_role("reporter", "alice"))
            .expect("revoke membership");
        assert!(!c.can("alice", PA, Action::Select, None, &config).expect("after revoke"));
    }

    #[test]
    fn fork_does_not_share_cache() {
        let c = catalog();
        let config = AclConfig::default();
        let mut fork = c.fork();
        fork.apply_ddl(DdlOperation::grant(PA, Privileges::one(Action::Select), "reporter"))
            .expect("grant in fork");
        assert!(fork.can("alice", PA, Action::Select, None, &config).expect("fork"));
        assert!(!c.can("alice", PA, Action::Select, None, &config).expect("live"));
    }

    #[test]
    fn column_lists_reject_table_wide_actions() {
        let mut c = catalog();
        let err = c
            .apply_ddl(DdlOperation::grant_columns(
                PA,
                Action::Delete,
                "reporter",
                &["document"],
            ))
            .expect_err("delete is table-wide");
        assert!(matches!(err, AclError::Validation(_)));
    }

    #[test]
    fn drop_role_revokes_and_refuses_owners() {
        let mut c = catalog();
        c.apply_ddl(DdlOperation::grant(PA, Privileges::All, "presence-absence-processor"))
            .expect("grant");
        c.apply_ddl(DdlOperation::drop_role("presence-absence-processor"))
            .expect("drop");
        assert!(c.permissions().grantees_on(PA).is_empty());
        assert_eq!(c.permissions(), &c.permission_log().replay());
        let err = c
            .apply_ddl(DdlOperation::drop_role("id3c"))
            .expect_err("owner");
        assert!(matches!(err, AclError::Validation(_)));
    }

    #[test]
    fn json_snapshot_rebuilds_permissions() {
        let mut c = catalog();
        c.apply_ddl(DdlOperation::grant(PA, Privileges::one(Action::Select), "reporter"))
            .expect("grant");
        c.apply_ddl(DdlOperation::enable_row_security(PA))
            .expect("rls");
        let bytes = c.to_json().expect("encode");
        let restored = Catalog::from_json(&bytes).expect("decode");
        assert_eq!(restored, c);
        assert!(restored.row_security_enabled(PA));
    }

    #[test]
    fn readded_column_does_not_inherit_dropped_column_grants() {
        let mut c = catalog();
        let config = AclConfig::strict();
        c.apply_ddl(DdlOperation::grant(PA, Privileges::one(Action::Select), "reporter"))
            .expect("grant");
        c.apply_ddl(DdlOperation::revoke_columns(
            PA,
            Action::Select,
            "reporter",
            &["processing_log"],
        ))
        .expect("revoke");
        c.apply_ddl(DdlOperation::grant_columns(
            PA,
            Action::Update,
            "presence-absence-processor",
            &["processing_log"],
        ))
        .expect("column grant");

        c.apply_ddl(DdlOperation::AlterTable {
            table: PA.into(),
            alteration: TableAlteration::DropColumn {
                name: "processing_log".into(),
            },
        })
        .expect("drop column");
        c.apply_ddl(DdlOperation::AlterTable {
            table: PA.into(),
            alteration: TableAlteration::AddColumn(ColumnDef::new(
                "processing_log",
                ColumnType::Json,
                true,
            )),
        })
        .expect("add column back");

        let log = Some("processing_log");
        assert!(c.can("alice", PA, Action::Select, log, &config).expect("table grant"));
        assert!(
            !c.can("presence-absence-processor", PA, Action::Update, log, &config)
                .expect("old column grant")
        );
        assert_eq!(c.permissions(), &c.permission_log().replay());
    }

    #[test]
    fn altering_away_a_trigger_column_is_rejected() {
        let mut c = catalog();
        c.apply_ddl(DdlOperation::create_role("cascadia")).expect("role");
        for column in [
            ColumnDef::new("details", ColumnType::Json, true),
            ColumnDef::new("access_role", ColumnType::Text, true),
        ] {
            c.apply_ddl(DdlOperation::AlterTable {
                table: PA.into(),
                alteration: TableAlteration::AddColumn(column),
            })
            .expect("add column");
        }
        c.apply_ddl(DdlOperation::CreateTrigger(Trigger::origin_role_consistency(
            "origin check",
            PA,
            "cascadia",
            "cascadia",
        )))
        .expect("trigger");

        let err = c
            .apply_ddl(DdlOperation::AlterTable {
                table: PA.into(),
                alteration: TableAlteration::DropColumn {
                    name: "access_role".into(),
                },
            })
            .expect_err("trigger depends on access_role");
        assert!(matches!(err, AclError::Validation(_)));
        assert!(c.table(PA).expect("table").has_column("access_role"));

        c.apply_ddl(DdlOperation::drop_trigger(PA, "origin check"))
            .expect("drop trigger");
        c.apply_ddl(DdlOperation::AlterTable {
            table: PA.into(),
            alteration: TableAlteration::DropColumn {
                name: "access_role".into(),
            },
        })
        .expect("no dependents left");
        assert!(!c.table(PA).expect("table").has_column("access_role"));
    }
}
