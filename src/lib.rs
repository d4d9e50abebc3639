pub mod api;
pub mod catalog;
pub mod changes;
pub mod config;
pub mod error;
mod lib_helpers;
pub mod migration;
pub mod permission;
pub mod policy;
pub mod quota;
pub mod role;
pub mod store;
pub mod trigger;

use crate::api::{Route, RouteAudit};
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, Value};
use crate::catalog::{Catalog, DdlOperation};
use crate::config::AclConfig;
use crate::error::{AclError, ResourceType};
use crate::lib_helpers::*;
use crate::migration::{ChangeRecord, Plan, checksum_hex};
use crate::permission::Action;
use crate::policy::expr::EvalContext;
use crate::policy::{PolicyCommand, check_new_row, row_visible};
use crate::quota::{QUOTA_TABLE, QuotaTable, TestQuota};
use crate::store::RowStore;
use im::OrdMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Catalog, row data and the deployed-change registry, swapped as a whole
/// on every successful write.
#[derive(Debug, Clone, Default)]
struct WarehouseState {
    catalog: Catalog,
    store: RowStore,
    deployed: OrdMap<String, ChangeRecord>,
    seq: u64,
}

impl WarehouseState {
    fn fork(&self) -> Self {
        Self {
            catalog: self.catalog.fork(),
            ..self.clone()
        }
    }
}

/// In-process warehouse: every call is one all-or-nothing transaction.
///
/// Writers hold the exclusive lock, build the next state on a persistent
/// copy and swap it in only on success. Readers see the last committed
/// state.
pub struct Warehouse {
    config: AclConfig,
    state: RwLock<WarehouseState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub applied: Vec<(String, Duration)>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeStatus {
    pub change_id: String,
    pub note: String,
    pub deployed: Option<ChangeRecord>,
    /// Deployed with a checksum that no longer matches the plan.
    pub drifted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseSnapshot {
    pub catalog: Catalog,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    #[serde(default)]
    pub rows: BTreeMap<String, Vec<Row>>,
    #[serde(default)]
    pub quotas: Vec<TestQuota>,
}

impl Default for Warehouse {
    fn default() -> Self {
        Self::new(AclConfig::default())
    }
}

impl Warehouse {
    pub fn new(config: AclConfig) -> Self {
        Self {
            config,
            state: RwLock::new(WarehouseState::default()),
        }
    }

    pub fn with_config(config: AclConfig) -> Result<Self, AclError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &AclConfig {
        &self.config
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut WarehouseState) -> Result<T, AclError>,
    ) -> Result<T, AclError> {
        let mut guard = self.state.write();
        let mut next = guard.fork();
        let out = f(&mut next)?;
        *guard = next;
        Ok(out)
    }

    /// Row-only transaction: the catalog, and its permission cache, stay
    /// in place.
    fn write_rows<T>(
        &self,
        f: impl FnOnce(&Catalog, &mut RowStore) -> Result<T, AclError>,
    ) -> Result<T, AclError> {
        let mut guard = self.state.write();
        let mut store = guard.store.clone();
        let out = f(&guard.catalog, &mut store)?;
        guard.store = store;
        Ok(out)
    }

    // ---- catalog ----

    pub fn apply_ddl(&self, op: DdlOperation) -> Result<(), AclError> {
        self.apply_ddl_batch(vec![op])
    }

    pub fn apply_ddl_batch(&self, ops: Vec<DdlOperation>) -> Result<(), AclError> {
        let config = &self.config;
        self.transact(|state| {
            for op in ops {
                let key = ddl_resource_key(&op);
                let kind = op.kind();
                apply_ddl_to_state(state, op, config)?;
                debug!(kind, resource = %key, "ddl applied");
            }
            Ok(())
        })
    }

    pub fn catalog_snapshot(&self) -> Catalog {
        self.state.read().catalog.clone()
    }

    pub fn can(
        &self,
        principal: &str,
        securable: &str,
        action: Action,
        column: Option<&str>,
    ) -> Result<bool, AclError> {
        self.state
            .read()
            .catalog
            .can(principal, securable, action, column, &self.config)
    }

    pub fn column_set(
        &self,
        principal: &str,
        securable: &str,
        action: Action,
    ) -> Result<Vec<String>, AclError> {
        self.state
            .read()
            .catalog
            .column_set(principal, securable, action, &self.config)
    }

    pub fn is_member(&self, principal: &str, role: &str) -> Result<bool, AclError> {
        self.state.read().catalog.roles.is_member(principal, role)
    }

    pub fn memberships(&self, principal: &str) -> Result<BTreeSet<String>, AclError> {
        self.state.read().catalog.roles.memberships(principal)
    }

    // ---- rows ----

    /// Row security test alone: whether `row` of `table` would be visible
    /// to `principal`, whatever its table grants.
    pub fn visible(&self, principal: &str, table: &str, row: &Row) -> Result<bool, AclError> {
        let state = self.state.read();
        let schema = state.catalog.table(table)?;
        schema.validate_row(row)?;
        let memberships = state.catalog.roles.memberships(principal)?;
        self.row_visible_to(
            &state.catalog,
            &state.store,
            principal,
            &memberships,
            schema,
            row,
            PolicyCommand::Select,
        )
    }

    /// `select *`: every column must be selectable. Rows hidden by row
    /// security are filtered out.
    pub fn select(&self, principal: &str, table: &str) -> Result<Vec<Row>, AclError> {
        let columns = self.state.read().catalog.table(table)?.column_names();
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        self.select_columns(principal, table, &columns)
    }

    pub fn select_columns(
        &self,
        principal: &str,
        table: &str,
        columns: &[&str],
    ) -> Result<Vec<Row>, AclError> {
        let state = self.state.read();
        let catalog = &state.catalog;
        let schema = catalog.table(table)?;
        for column in columns {
            self.require(catalog, principal, table, Action::Select, Some(*column))?;
        }
        let memberships = catalog.roles.memberships(principal)?;
        let mut rows = Vec::new();
        for (_, row) in state.store.scan(table) {
            if self.row_visible_to(
                catalog,
                &state.store,
                principal,
                &memberships,
                schema,
                row,
                PolicyCommand::Select,
            )? {
                rows.push(project_row(schema, row, columns)?);
            }
        }
        Ok(rows)
    }

    /// Inserts a full row image as `principal`. Every non-null column needs
    /// the insert privilege; the row must pass row security, triggers and
    /// foreign keys. Returns the stored key.
    pub fn insert(&self, principal: &str, table: &str, row: Row) -> Result<Value, AclError> {
        ensure_row_table(table)?;
        self.write_rows(|catalog, store| {
            let schema = catalog.table(table)?;
            let mut named_any = false;
            for (column, value) in schema.columns.iter().zip(&row.values) {
                if value.is_null() {
                    continue;
                }
                named_any = true;
                self.require(catalog, principal, table, Action::Insert, Some(column.name.as_str()))?;
            }
            if !named_any {
                self.require(catalog, principal, table, Action::Insert, None)?;
            }
            schema.validate_row(&row)?;
            let memberships = catalog.roles.memberships(principal)?;
            if !self.bypasses_row_security(catalog, &memberships, table)? {
                let ctx = EvalContext {
                    catalog,
                    lookup: &*store,
                    principal,
                    memberships: &memberships,
                };
                check_new_row(&ctx, schema, &row, PolicyCommand::Insert)?;
            }
            run_write_checks(catalog, store, schema, &row)?;
            store.insert(schema, row)
        })
    }

    /// Loads rows as the warehouse superuser: no privilege or row security
    /// checks, but triggers and foreign keys still apply. All or nothing.
    pub fn load_rows(&self, table: &str, rows: Vec<Row>) -> Result<usize, AclError> {
        ensure_row_table(table)?;
        self.write_rows(|catalog, store| {
            let schema = catalog.table(table)?;
            let count = rows.len();
            for row in rows {
                run_write_checks(catalog, store, schema, &row)?;
                store.insert(schema, row)?;
            }
            Ok(count)
        })
    }

    /// `update <table> set ... where <pk> = key`. A row that does not exist
    /// or is hidden from `principal` is not updated and yields `None`.
    pub fn update(
        &self,
        principal: &str,
        table: &str,
        key: &Value,
        assignments: &[(String, Value)],
    ) -> Result<Option<Row>, AclError> {
        ensure_row_table(table)?;
        self.write_rows(|catalog, store| {
            let schema = catalog.table(table)?;
            self.require_key_select(catalog, principal, schema)?;
            for (column, _) in assignments {
                self.require(catalog, principal, table, Action::Update, Some(column.as_str()))?;
            }
            let Some(current) = store.get(table, key).cloned() else {
                return Ok(None);
            };
            let memberships = catalog.roles.memberships(principal)?;
            if !self.row_visible_to(
                catalog,
                store,
                principal,
                &memberships,
                schema,
                &current,
                PolicyCommand::Update,
            )? {
                return Ok(None);
            }
            let next = apply_assignments(schema, &current, assignments)?;
            if !self.bypasses_row_security(catalog, &memberships, table)? {
                let ctx = EvalContext {
                    catalog,
                    lookup: &*store,
                    principal,
                    memberships: &memberships,
                };
                check_new_row(&ctx, schema, &next, PolicyCommand::Update)?;
            }
            run_write_checks(catalog, store, schema, &next)?;
            store.replace(schema, key, next.clone())?;
            Ok(Some(next))
        })
    }

    /// `delete from <table> where <pk> = key`. Returns whether a row was
    /// deleted; hidden rows are left alone.
    pub fn delete(&self, principal: &str, table: &str, key: &Value) -> Result<bool, AclError> {
        ensure_row_table(table)?;
        self.write_rows(|catalog, store| {
            let schema = catalog.table(table)?;
            self.require(catalog, principal, table, Action::Delete, None)?;
            self.require_key_select(catalog, principal, schema)?;
            let Some(current) = store.get(table, key).cloned() else {
                return Ok(false);
            };
            let memberships = catalog.roles.memberships(principal)?;
            if !self.row_visible_to(
                catalog,
                store,
                principal,
                &memberships,
                schema,
                &current,
                PolicyCommand::Delete,
            )? {
                return Ok(false);
            }
            check_no_referencing_rows(catalog, store, table, key)?;
            store.delete(table, key)?;
            Ok(true)
        })
    }

    fn require(
        &self,
        catalog: &Catalog,
        principal: &str,
        securable: &str,
        action: Action,
        column: Option<&str>,
    ) -> Result<(), AclError> {
        if catalog.can(principal, securable, action, column, &self.config)? {
            Ok(())
        } else {
            Err(permission_denied(principal, action, securable, column))
        }
    }

    /// The `where <pk> = ...` of an update or delete reads the key column.
    fn require_key_select(
        &self,
        catalog: &Catalog,
        principal: &str,
        schema: &TableSchema,
    ) -> Result<(), AclError> {
        let table = schema.qualified_name();
        match schema.primary_key.as_deref() {
            Some(pk) => self.require(catalog, principal, &table, Action::Select, Some(pk)),
            None => Err(AclError::Validation(format!(
                "{table} has no primary key to address rows by"
            ))),
        }
    }

    fn bypasses_row_security(
        &self,
        catalog: &Catalog,
        memberships: &BTreeSet<String>,
        table: &str,
    ) -> Result<bool, AclError> {
        Ok(self.config.owners_bypass && catalog.owned_by(memberships, table)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn row_visible_to(
        &self,
        catalog: &Catalog,
        store: &RowStore,
        principal: &str,
        memberships: &BTreeSet<String>,
        schema: &TableSchema,
        row: &Row,
        command: PolicyCommand,
    ) -> Result<bool, AclError> {
        let table = schema.qualified_name();
        if self.bypasses_row_security(catalog, memberships, &table)? {
            return Ok(true);
        }
        let ctx = EvalContext {
            catalog,
            lookup: store,
            principal,
            memberships,
        };
        let visible = row_visible(&ctx, schema, row, command)?;
        if !visible && self.config.log_denials {
            debug!(principal, table = %table, command = ?command, "row hidden by row security");
        }
        Ok(visible)
    }

    // ---- test quotas ----

    pub fn create_quota(&self, principal: &str, quota: TestQuota) -> Result<(), AclError> {
        self.write_rows(|catalog, store| {
            self.require(catalog, principal, QUOTA_TABLE, Action::Insert, None)?;
            store.quotas.insert(quota)
        })
    }

    /// Takes one unit from the quota row of `name` covering `at`.
    pub fn consume_quota(&self, principal: &str, name: &str, at: i64) -> Result<TestQuota, AclError> {
        self.write_rows(|catalog, store| {
            self.require(catalog, principal, QUOTA_TABLE, Action::Select, None)?;
            self.require(catalog, principal, QUOTA_TABLE, Action::Update, Some("used"))?;
            store.quotas.try_consume(name, at)
        })
    }

    pub fn set_quota_used(
        &self,
        principal: &str,
        name: &str,
        at: i64,
        used: i64,
    ) -> Result<TestQuota, AclError> {
        self.write_rows(|catalog, store| {
            self.require(catalog, principal, QUOTA_TABLE, Action::Update, Some("used"))?;
            store.quotas.set_used(name, at, used)
        })
    }

    pub fn quotas(&self, principal: &str, name: &str) -> Result<Vec<TestQuota>, AclError> {
        let state = self.state.read();
        self.require(&state.catalog, principal, QUOTA_TABLE, Action::Select, None)?;
        Ok(state.store.quotas.rows_for(name).cloned().collect())
    }

    // ---- changes ----

    /// Deploys one change of `plan` in a single transaction. Returns
    /// `false` when the same change is already deployed.
    pub fn deploy(&self, plan: &Plan, change_id: &str) -> Result<bool, AclError> {
        let change = plan.get(change_id)?;
        let checksum = checksum_hex(change)?;
        let config = &self.config;
        let deployed = self.transact(|state| {
            if let Some(record) = state.deployed.get(change_id) {
                if record.checksum_hex != checksum {
                    return Err(AclError::IntegrityError {
                        message: format!("change checksum mismatch for {change_id}"),
                    });
                }
                return Ok(None);
            }
            if let Some(missing) = change
                .requires
                .iter()
                .find(|r| !state.deployed.contains_key(r.as_str()))
            {
                return Err(AclError::Validation(format!(
                    "change {change_id} requires {missing}, which is not deployed"
                )));
            }
            for op in &change.deploy {
                if let Err(e) = apply_ddl_to_state(state, op.clone(), config) {
                    warn!(
                        change = change_id,
                        resource = %ddl_resource_key(op),
                        error = %e,
                        "change deploy failed"
                    );
                    return Err(e);
                }
            }
            state.seq += 1;
            let record = ChangeRecord {
                change_id: change_id.to_string(),
                checksum_hex: checksum.clone(),
                deployed_at_micros: now_micros(),
                deployed_seq: state.seq,
            };
            state.deployed.insert(change_id.to_string(), record.clone());
            Ok(Some(record))
        })?;
        match deployed {
            Some(record) => {
                info!(
                    change = change_id,
                    seq = record.deployed_seq,
                    ops = change.deploy.len(),
                    "change deployed"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reverts one deployed change. Refused while a deployed change still
    /// requires it.
    pub fn revert(&self, plan: &Plan, change_id: &str) -> Result<(), AclError> {
        let change = plan.get(change_id)?;
        let config = &self.config;
        self.transact(|state| {
            if !state.deployed.contains_key(change_id) {
                return Err(AclError::not_found(ResourceType::Change, change_id));
            }
            if let Some(dependent) = plan
                .dependents_of(change_id)
                .find(|c| state.deployed.contains_key(&c.id))
            {
                return Err(AclError::Validation(format!(
                    "cannot revert {change_id}: {} depends on it",
                    dependent.id
                )));
            }
            for op in &change.revert {
                if let Err(e) = apply_ddl_to_state(state, op.clone(), config) {
                    warn!(
                        change = change_id,
                        resource = %ddl_resource_key(op),
                        error = %e,
                        "change revert failed"
                    );
                    return Err(e);
                }
            }
            state.deployed.remove(change_id);
            Ok(())
        })?;
        info!(change = change_id, ops = change.revert.len(), "change reverted");
        Ok(())
    }

    /// Whether every verify check of the change holds right now.
    pub fn verify(&self, plan: &Plan, change_id: &str) -> Result<bool, AclError> {
        let change = plan.get(change_id)?;
        let state = self.state.read();
        for check in &change.verify {
            if !check.holds(&state.catalog, &self.config)? {
                debug!(change = change_id, check = ?check, "verify check failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn deploy_all(&self, plan: &Plan) -> Result<DeployReport, AclError> {
        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        for change in plan.ordered()? {
            let started = Instant::now();
            if self.deploy(plan, &change.id)? {
                applied.push((change.id.clone(), started.elapsed()));
            } else {
                skipped.push(change.id.clone());
            }
        }
        Ok(DeployReport { applied, skipped })
    }

    /// Reverts every deployed change of `plan`, dependents first. Returns
    /// the reverted ids in order.
    pub fn revert_all(&self, plan: &Plan) -> Result<Vec<String>, AclError> {
        let mut reverted = Vec::new();
        for change in plan.ordered()?.into_iter().rev() {
            if !self.is_deployed(&change.id) {
                continue;
            }
            self.revert(plan, &change.id)?;
            reverted.push(change.id.clone());
        }
        Ok(reverted)
    }

    pub fn is_deployed(&self, change_id: &str) -> bool {
        self.state.read().deployed.contains_key(change_id)
    }

    /// Deployed changes in deploy order.
    pub fn deployed_changes(&self) -> Vec<ChangeRecord> {
        let mut records: Vec<ChangeRecord> =
            self.state.read().deployed.values().cloned().collect();
        records.sort_by_key(|r| r.deployed_seq);
        records
    }

    pub fn status(&self, plan: &Plan) -> Result<Vec<ChangeStatus>, AclError> {
        let state = self.state.read();
        let mut out = Vec::new();
        for change in plan.ordered()? {
            let deployed = state.deployed.get(&change.id).cloned();
            let drifted = match &deployed {
                Some(record) => record.checksum_hex != checksum_hex(change)?,
                None => false,
            };
            out.push(ChangeStatus {
                change_id: change.id.clone(),
                note: change.note.clone(),
                deployed,
                drifted,
            });
        }
        Ok(out)
    }

    // ---- routes ----

    pub fn authorize_route(&self, principal: &str, route: &Route) -> Result<(), AclError> {
        let state = self.state.read();
        api::authorize_route(&state.catalog, &self.config, principal, route)
    }

    pub fn audit_routes(&self, routes: &[Route]) -> Vec<RouteAudit> {
        let state = self.state.read();
        api::audit_routes(&state.catalog, &self.config, routes)
    }

    // ---- snapshots ----

    pub fn snapshot(&self) -> WarehouseSnapshot {
        let state = self.state.read();
        let mut rows = BTreeMap::new();
        for schema in state.catalog.tables() {
            let table = schema.qualified_name();
            let stored: Vec<Row> = state.store.scan(&table).map(|(_, row)| row.clone()).collect();
            if !stored.is_empty() {
                rows.insert(table, stored);
            }
        }
        let mut changes: Vec<ChangeRecord> = state.deployed.values().cloned().collect();
        changes.sort_by_key(|r| r.deployed_seq);
        WarehouseSnapshot {
            catalog: state.catalog.clone(),
            changes,
            rows,
            quotas: state.store.quotas.all().cloned().collect(),
        }
    }

    pub fn export_json(&self) -> Result<Vec<u8>, AclError> {
        serde_json::to_vec_pretty(&self.snapshot()).map_err(|e| AclError::Encode(e.to_string()))
    }

    pub fn from_snapshot(config: AclConfig, snapshot: WarehouseSnapshot) -> Result<Self, AclError> {
        config.validate()?;
        let mut store = RowStore::default();
        for (table, rows) in snapshot.rows {
            let schema = snapshot.catalog.table(&table)?;
            for row in rows {
                schema.validate_row(&row)?;
                store.insert(schema, row)?;
            }
        }
        let mut quotas = QuotaTable::default();
        for quota in snapshot.quotas {
            quotas.insert(quota)?;
        }
        store.quotas = quotas;
        let seq = snapshot
            .changes
            .iter()
            .map(|r| r.deployed_seq)
            .max()
            .unwrap_or(0);
        let deployed = snapshot
            .changes
            .into_iter()
            .map(|r| (r.change_id.clone(), r))
            .collect();
        Ok(Self {
            config,
            state: RwLock::new(WarehouseState {
                catalog: snapshot.catalog,
                store,
                deployed,
                seq,
            }),
        })
    }

    pub fn from_snapshot_json(config: AclConfig, bytes: &[u8]) -> Result<Self, AclError> {
        let snapshot: WarehouseSnapshot =
            serde_json::from_slice(bytes).map_err(|e| AclError::Decode(e.to_string()))?;
        Self::from_snapshot(config, snapshot)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), AclError> {
        std::fs::write(path, self.export_json()?)?;
        Ok(())
    }

    pub fn load_snapshot(config: AclConfig, path: &Path) -> Result<Self, AclError> {
        let bytes = std::fs::read(path)?;
        Self::from_snapshot_json(config, &bytes)
    }
}
