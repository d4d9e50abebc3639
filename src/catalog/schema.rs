use crate::catalog::types::{ColumnType, Row, Value};
use crate::error::{AclError, ResourceType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecurableKind {
    Table,
    View,
}

/// A schema-qualified table or view that grants attach to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub schema_name: String,
    pub table_name: String,
    pub kind: SecurableKind,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub columns: Vec<ColumnDef>,
    /// Single-column key. Views have none.
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub column: String,
    /// Qualified name of the referenced table; references its primary key.
    pub references_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableAlteration {
    AddColumn(ColumnDef),
    DropColumn { name: String },
    AddForeignKey(ForeignKey),
    DropForeignKey { name: String },
}

pub fn qualified_name(schema_name: &str, table_name: &str) -> String {
    format!("{schema_name}.{table_name}")
}

impl TableSchema {
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema_name, &self.table_name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn require_column(&self, name: &str) -> Result<usize, AclError> {
        self.column_index(name).ok_or_else(|| {
            AclError::not_found(
                ResourceType::Column,
                format!("{}.{name}", self.qualified_name()),
            )
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn value<'a>(&self, row: &'a Row, column: &str) -> Result<&'a Value, AclError> {
        let idx = self.require_column(column)?;
        row.values.get(idx).ok_or_else(|| {
            AclError::Validation(format!(
                "row for {} is missing column {column}",
                self.qualified_name()
            ))
        })
    }

    pub fn key_of<'a>(&self, row: &'a Row) -> Result<&'a Value, AclError> {
        let Some(pk) = self.primary_key.as_deref() else {
            return Err(AclError::Validation(format!(
                "{} has no primary key",
                self.qualified_name()
            )));
        };
        self.value(row, pk)
    }

    pub fn foreign_key_on(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// Arity, NOT NULL and type checks for a full row image.
    pub fn validate_row(&self, row: &Row) -> Result<(), AclError> {
        let table = self.qualified_name();
        if row.values.len() != self.columns.len() {
            return Err(AclError::Validation(format!(
                "row for {table} has {} values, expected {}",
                row.values.len(),
                self.columns.len()
            )));
        }
        for (col, value) in self.columns.iter().zip(&row.values) {
            if value.is_null() {
                if !col.nullable {
                    return Err(AclError::NotNullViolation {
                        table: table.clone(),
                        column: col.name.clone(),
                    });
                }
                continue;
            }
            if !value.matches_type(col.col_type) {
                return Err(AclError::TypeMismatch {
                    table: table.clone(),
                    column: col.name.clone(),
                    expected: format!("{:?}", col.col_type),
                    actual: value.type_name().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn alter(&mut self, alteration: TableAlteration) -> Result<(), AclError> {
        let table = self.qualified_name();
        match alteration {
            TableAlteration::AddColumn(col) => {
                if self.has_column(&col.name) {
                    return Err(AclError::AlreadyExists {
                        resource_type: ResourceType::Column,
                        resource_id: format!("{table}.{}", col.name),
                    });
                }
                self.columns.push(col);
            }
            TableAlteration::DropColumn { name } => {
                let idx = self.require_column(&name)?;
                if self.primary_key.as_deref() == Some(name.as_str())
                    || self.foreign_key_on(&name).is_some()
                {
                    return Err(AclError::Validation(format!(
                        "cannot drop key column {table}.{name}"
                    )));
                }
                self.columns.remove(idx);
            }
            TableAlteration::AddForeignKey(fk) => {
                self.require_column(&fk.column)?;
                if self.foreign_keys.iter().any(|f| f.name == fk.name) {
                    return Err(AclError::AlreadyExists {
                        resource_type: ResourceType::Column,
                        resource_id: format!("{table}:{}", fk.name),
                    });
                }
                self.foreign_keys.push(fk);
            }
            TableAlteration::DropForeignKey { name } => {
                self.foreign_keys.retain(|fk| fk.name != name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableSchema {
        TableSchema {
            schema_name: "warehouse".into(),
            table_name: "sample".into(),
            kind: SecurableKind::Table,
            owner_id: Some("id3c".into()),
            columns: vec![
                ColumnDef::new("sample_id", ColumnType::Integer, false),
                ColumnDef::new("details", ColumnType::Json, true),
            ],
            primary_key: Some("sample_id".into()),
            foreign_keys: Vec::new(),
        }
    }

    #[test]
    fn validate_row_reports_not_null_and_type() {
        let schema = sample();
        let err = schema
            .validate_row(&Row::from_values(vec![Value::Null, Value::Null]))
            .expect_err("pk null");
        assert!(matches!(err, AclError::NotNullViolation { .. }));

        let err = schema
            .validate_row(&Row::from_values(vec![Value::Integer(1), Value::text("x")]))
            .expect_err("text in json column");
        assert!(matches!(err, AclError::TypeMismatch { .. }));
    }

    #[test]
    fn key_columns_cannot_be_dropped() {
        let mut schema = sample();
        let err = schema
            .alter(TableAlteration::DropColumn {
                name: "sample_id".into(),
            })
            .expect_err("pk");
        assert!(matches!(err, AclError::Validation(_)));
        schema
            .alter(TableAlteration::AddColumn(ColumnDef::new(
                "access_role",
                ColumnType::Text,
                true,
            )))
            .expect("add column");
        assert_eq!(schema.column_index("access_role"), Some(2));
    }
}
