//! In-memory row data. Persistent maps make a full copy cheap, which is
//! what the warehouse's all-or-nothing transactions rely on.

use crate::catalog::schema::{TableAlteration, TableSchema};
use crate::catalog::types::{Row, Value};
use crate::error::{AclError, ResourceType};
use crate::policy::expr::RowLookup;
use crate::quota::QuotaTable;
use im::OrdMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TableRows {
    rows: OrdMap<Value, Row>,
    /// Synthetic key source for securables without a primary key.
    next_rowid: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowStore {
    tables: OrdMap<String, TableRows>,
    pub quotas: QuotaTable,
}

impl RowStore {
    /// Key a row is stored under: the primary key value, or a fresh rowid.
    fn key_for(&self, schema: &TableSchema, row: &Row) -> Result<Value, AclError> {
        if schema.primary_key.is_some() {
            let key = schema.key_of(row)?;
            if key.is_null() {
                return Err(AclError::NotNullViolation {
                    table: schema.qualified_name(),
                    column: schema.primary_key.clone().unwrap_or_default(),
                });
            }
            return Ok(key.clone());
        }
        let next = self
            .tables
            .get(&schema.qualified_name())
            .map_or(0, |t| t.next_rowid);
        Ok(Value::Integer(next))
    }

    pub fn insert(&mut self, schema: &TableSchema, row: Row) -> Result<Value, AclError> {
        let table = schema.qualified_name();
        let key = self.key_for(schema, &row)?;
        let mut rows = self.tables.get(&table).cloned().unwrap_or_default();
        if rows.rows.contains_key(&key) {
            return Err(AclError::DuplicatePK {
                table,
                key: key.to_string(),
            });
        }
        if schema.primary_key.is_none() {
            rows.next_rowid += 1;
        }
        rows.rows.insert(key.clone(), row);
        self.tables.insert(table, rows);
        Ok(key)
    }

    /// Replaces the row stored under `key`. Primary key changes are
    /// rejected.
    pub fn replace(&mut self, schema: &TableSchema, key: &Value, row: Row) -> Result<(), AclError> {
        let table = schema.qualified_name();
        if schema.primary_key.is_some() && schema.key_of(&row)? != key {
            return Err(AclError::Validation(format!(
                "primary key of {table} cannot be updated"
            )));
        }
        let Some(mut rows) = self.tables.get(&table).cloned() else {
            return Err(row_not_found(&table, key));
        };
        if rows.rows.insert(key.clone(), row).is_none() {
            return Err(row_not_found(&table, key));
        }
        self.tables.insert(table, rows);
        Ok(())
    }

    pub fn delete(&mut self, table: &str, key: &Value) -> Result<Row, AclError> {
        let Some(mut rows) = self.tables.get(table).cloned() else {
            return Err(row_not_found(table, key));
        };
        let removed = rows
            .rows
            .remove(key)
            .ok_or_else(|| row_not_found(table, key))?;
        self.tables.insert(table.to_string(), rows);
        Ok(removed)
    }

    pub fn get(&self, table: &str, key: &Value) -> Option<&Row> {
        self.tables.get(table).and_then(|t| t.rows.get(key))
    }

    /// Rows of `table` in key order.
    pub fn scan(&self, table: &str) -> impl Iterator<Item = (&Value, &Row)> {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|t| t.rows.iter())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Reshapes stored rows after `schema_before` was altered.
    pub fn apply_alteration(
        &mut self,
        schema_before: &TableSchema,
        alteration: &TableAlteration,
    ) -> Result<(), AclError> {
        let table = schema_before.qualified_name();
        let Some(mut rows) = self.tables.get(&table).cloned() else {
            return Ok(());
        };
        match alteration {
            TableAlteration::AddColumn(column) => {
                if !column.nullable && !rows.rows.is_empty() {
                    return Err(AclError::NotNullViolation {
                        table,
                        column: column.name.clone(),
                    });
                }
                rows.rows = rows
                    .rows
                    .into_iter()
                    .map(|(key, mut row)| {
                        row.values.push(Value::Null);
                        (key, row)
                    })
                    .collect();
            }
            TableAlteration::DropColumn { name } => {
                let idx = schema_before.require_column(name)?;
                rows.rows = rows
                    .rows
                    .into_iter()
                    .map(|(key, mut row)| {
                        if idx < row.values.len() {
                            row.values.remove(idx);
                        }
                        (key, row)
                    })
                    .collect();
            }
            TableAlteration::AddForeignKey(_) | TableAlteration::DropForeignKey { .. } => {}
        }
        self.tables.insert(table, rows);
        Ok(())
    }

    pub fn drop_table(&mut self, table: &str) {
        self.tables.remove(table);
    }
}

impl RowLookup for RowStore {
    fn find_row(&self, table: &str, key: &Value) -> Option<Row> {
        self.get(table, key).cloned()
    }
}

fn row_not_found(table: &str, key: &Value) -> AclError {
    AclError::not_found(ResourceType::Row, format!("{table}[{key}]"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::{ColumnDef, SecurableKind};
    use crate::catalog::types::ColumnType;

    fn target() -> TableSchema {
        TableSchema {
            schema_name: "warehouse".into(),
            table_name: "target".into(),
            kind: SecurableKind::Table,
            owner_id: None,
            columns: vec![
                ColumnDef::new("target_id", ColumnType::Integer, false),
                ColumnDef::new("identifier", ColumnType::Text, false),
            ],
            primary_key: Some("target_id".into()),
            foreign_keys: Vec::new(),
        }
    }

    fn row(id: i64, identifier: &str) -> Row {
        Row::from_values(vec![Value::Integer(id), Value::text(identifier)])
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let mut store = RowStore::default();
        let schema = target();
        store.insert(&schema, row(1, "COVID-19")).expect("insert");
        let err = store.insert(&schema, row(1, "Flu_A")).expect_err("dup");
        assert!(matches!(err, AclError::DuplicatePK { .. }));
        assert_eq!(store.row_count("warehouse.target"), 1);
    }

    #[test]
    fn views_get_synthetic_keys() {
        let mut store = RowStore::default();
        let mut view = target();
        view.table_name = "latest_results_v1".into();
        view.kind = SecurableKind::View;
        view.primary_key = None;
        let a = store.insert(&view, row(1, "a")).expect("a");
        let b = store.insert(&view, row(1, "a")).expect("b");
        assert_ne!(a, b);
        assert_eq!(store.row_count("warehouse.latest_results_v1"), 2);
    }

    #[test]
    fn alterations_reshape_existing_rows() {
        let mut store = RowStore::default();
        let mut schema = target();
        store.insert(&schema, row(1, "COVID-19")).expect("insert");
        let add = TableAlteration::AddColumn(ColumnDef::new("access_role", ColumnType::Text, true));
        store.apply_alteration(&schema, &add).expect("add");
        schema.alter(add).expect("schema add");
        let stored = store.get("warehouse.target", &Value::Integer(1)).expect("row");
        assert_eq!(stored.values.len(), 3);
        assert!(stored.values[2].is_null());

        let drop = TableAlteration::DropColumn {
            name: "identifier".into(),
        };
        store.apply_alteration(&schema, &drop).expect("drop");
        let stored = store.get("warehouse.target", &Value::Integer(1)).expect("row");
        assert_eq!(stored.values, vec![Value::Integer(1), Value::Null]);
    }

    #[test]
    fn replace_keeps_primary_key_fixed() {
        let mut store = RowStore::default();
        let schema = target();
        store.insert(&schema, row(1, "COVID-19")).expect("insert");
        store
            .replace(&schema, &Value::Integer(1), row(1, "SARS-CoV-2"))
            .expect("replace");
        assert!(
            store
                .replace(&schema, &Value::Integer(1), row(2, "x"))
                .is_err()
        );
        assert!(store.delete("warehouse.target", &Value::Integer(2)).is_err());
        store
            .delete("warehouse.target", &Value::Integer(1))
            .expect("delete");
    }
}
