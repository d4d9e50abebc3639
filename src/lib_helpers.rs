use super::*;

pub(crate) fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Applies one DDL operation to catalog and row data together. Table
/// alterations reshape stored rows against the schema as it was before.
pub(crate) fn apply_ddl_to_state(
    state: &mut WarehouseState,
    op: DdlOperation,
    config: &AclConfig,
) -> Result<(), AclError> {
    match &op {
        DdlOperation::AlterTable { table, alteration } => {
            let before = state.catalog.table(table)?.clone();
            let alteration = alteration.clone();
            state.catalog.apply_ddl_with(op, config)?;
            state.store.apply_alteration(&before, &alteration)
        }
        DdlOperation::DropTable { table, .. } => {
            let table = table.clone();
            state.catalog.apply_ddl_with(op, config)?;
            if state.catalog.table(&table).is_err() {
                state.store.drop_table(&table);
                if table == QUOTA_TABLE {
                    state.store.quotas = QuotaTable::default();
                }
            }
            Ok(())
        }
        _ => state.catalog.apply_ddl_with(op, config),
    }
}

pub(crate) fn ddl_resource_key(op: &DdlOperation) -> String {
    match op {
        DdlOperation::CreateRole { name, .. } | DdlOperation::DropRole { name, .. } => {
            format!("role:{name}")
        }
        DdlOperation::GrantRole { role, member } | DdlOperation::RevokeRole { role, member } => {
            format!("membership:{member}->{role}")
        }
        DdlOperation::CreateTable { schema, .. } => format!("securable:{}", schema.qualified_name()),
        DdlOperation::AlterTable { table, .. }
        | DdlOperation::DropTable { table, .. }
        | DdlOperation::TransferOwnership { table, .. }
        | DdlOperation::EnableRowSecurity { table }
        | DdlOperation::DisableRowSecurity { table } => format!("securable:{table}"),
        DdlOperation::Acl(event) => format!("acl:{}:{}", event.securable, event.principal),
        DdlOperation::CreatePolicy(policy) => format!("policy:{}:{}", policy.table, policy.name),
        DdlOperation::DropPolicy { table, name, .. } => format!("policy:{table}:{name}"),
        DdlOperation::CreateTrigger(trigger) => {
            format!("trigger:{}:{}", trigger.table, trigger.name)
        }
        DdlOperation::DropTrigger { table, name, .. } => format!("trigger:{table}:{name}"),
    }
}

pub(crate) fn ensure_row_table(table: &str) -> Result<(), AclError> {
    if table == QUOTA_TABLE {
        return Err(AclError::Validation(format!(
            "{QUOTA_TABLE} rows are written through the quota operations"
        )));
    }
    Ok(())
}

/// Every non-null foreign key value of `row` must name an existing row.
pub(crate) fn check_foreign_keys(
    store: &RowStore,
    schema: &TableSchema,
    row: &Row,
) -> Result<(), AclError> {
    for fk in &schema.foreign_keys {
        let key = schema.value(row, &fk.column)?;
        if key.is_null() {
            continue;
        }
        if store.get(&fk.references_table, key).is_none() {
            return Err(AclError::IntegrityError {
                message: format!(
                    "{} violates foreign key {}: {}[{key}] does not exist",
                    schema.qualified_name(),
                    fk.name,
                    fk.references_table
                ),
            });
        }
    }
    Ok(())
}

/// Deleting `key` from `table` must not orphan rows that reference it.
pub(crate) fn check_no_referencing_rows(
    catalog: &Catalog,
    store: &RowStore,
    table: &str,
    key: &Value,
) -> Result<(), AclError> {
    for child in catalog.tables() {
        for fk in child.foreign_keys.iter().filter(|fk| fk.references_table == table) {
            let Some(idx) = child.column_index(&fk.column) else {
                continue;
            };
            let child_name = child.qualified_name();
            let referenced = store
                .scan(&child_name)
                .any(|(_, row)| row.values.get(idx) == Some(key));
            if referenced {
                return Err(AclError::IntegrityError {
                    message: format!(
                        "{table}[{key}] is still referenced from {child_name} by {}",
                        fk.name
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Row image after `assignments`, which name columns of `schema`.
pub(crate) fn apply_assignments(
    schema: &TableSchema,
    row: &Row,
    assignments: &[(String, Value)],
) -> Result<Row, AclError> {
    let mut next = row.clone();
    for (column, value) in assignments {
        let idx = schema.require_column(column)?;
        let Some(slot) = next.values.get_mut(idx) else {
            return Err(AclError::Validation(format!(
                "row for {} is missing column {column}",
                schema.qualified_name()
            )));
        };
        *slot = value.clone();
    }
    Ok(next)
}

pub(crate) fn project_row(
    schema: &TableSchema,
    row: &Row,
    columns: &[&str],
) -> Result<Row, AclError> {
    let values = columns
        .iter()
        .map(|column| schema.value(row, column).cloned())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::from_values(values))
}

/// Triggers, then foreign keys, for a full row image about to be written.
pub(crate) fn run_write_checks(
    catalog: &Catalog,
    store: &RowStore,
    schema: &TableSchema,
    row: &Row,
) -> Result<(), AclError> {
    schema.validate_row(row)?;
    let table = schema.qualified_name();
    for trigger in catalog.triggers_on(&table) {
        trigger.before_write(catalog, schema, row, store)?;
    }
    check_foreign_keys(store, schema, row)
}

pub(crate) fn permission_denied(
    principal: &str,
    action: Action,
    securable: &str,
    column: Option<&str>,
) -> AclError {
    match column {
        Some(column) => AclError::PermissionDenied(format!(
            "{principal} lacks {action} on {securable}({column})"
        )),
        None => AclError::PermissionDenied(format!("{principal} lacks {action} on {securable}")),
    }
}
