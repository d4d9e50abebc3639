//! Before-insert/update row triggers.

use crate::catalog::Catalog;
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, Value};
use crate::error::{AclError, ResourceType};
use crate::policy::expr::RowLookup;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriggerKind {
    /// The row's `access_role` must equal the `access_role` of the row its
    /// foreign key `fk_column` references in `parent_table`.
    AccessRolePropagation {
        fk_column: String,
        parent_table: String,
    },
    /// `details_column ->> origin_key` equal to `origin` (ignoring case)
    /// holds exactly when `access_role = role`.
    OriginRoleConsistency {
        details_column: String,
        origin_key: String,
        origin: String,
        role: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    pub table: String,
    pub kind: TriggerKind,
}

pub const ACCESS_ROLE_COLUMN: &str = "access_role";

impl Trigger {
    pub fn access_role_propagation(
        name: &str,
        table: &str,
        fk_column: &str,
        parent_table: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            kind: TriggerKind::AccessRolePropagation {
                fk_column: fk_column.to_string(),
                parent_table: parent_table.to_string(),
            },
        }
    }

    pub fn origin_role_consistency(name: &str, table: &str, origin: &str, role: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            kind: TriggerKind::OriginRoleConsistency {
                details_column: "details".to_string(),
                origin_key: "sample_origin".to_string(),
                origin: origin.to_string(),
                role: role.to_string(),
            },
        }
    }

    /// Structural checks performed when the trigger is created.
    pub fn validate(&self, catalog: &Catalog) -> Result<(), AclError> {
        let schema = catalog.table(&self.table)?;
        schema.require_column(ACCESS_ROLE_COLUMN)?;
        match &self.kind {
            TriggerKind::AccessRolePropagation {
                fk_column,
                parent_table,
            } => {
                schema.require_column(fk_column)?;
                let parent = catalog.table(parent_table)?;
                parent.require_column(ACCESS_ROLE_COLUMN)?;
                if parent.primary_key.is_none() {
                    return Err(AclError::Validation(format!(
                        "{parent_table} has no primary key"
                    )));
                }
                Ok(())
            }
            TriggerKind::OriginRoleConsistency { details_column, .. } => {
                schema.require_column(details_column).map(|_| ())
            }
        }
    }

    /// Runs before the row image `row` is written to `schema`'s table.
    /// Rejections leave the store untouched because nothing is written
    /// until every trigger passes.
    pub fn before_write(
        &self,
        catalog: &Catalog,
        schema: &TableSchema,
        row: &Row,
        parents: &dyn RowLookup,
    ) -> Result<(), AclError> {
        match &self.kind {
            TriggerKind::AccessRolePropagation {
                fk_column,
                parent_table,
            } => {
                let child = access_role_of(schema, row)?;
                let key = schema.value(row, fk_column)?;
                let parent = if key.is_null() {
                    None
                } else {
                    let Some(parent_row) = parents.find_row(parent_table, key) else {
                        return Err(AclError::not_found(
                            ResourceType::Row,
                            format!("{parent_table}[{key}]"),
                        ));
                    };
                    access_role_of(catalog.table(parent_table)?, &parent_row)?
                };
                if child != parent {
                    tracing::debug!(
                        trigger = %self.name,
                        table = %self.table,
                        child = ?child,
                        parent = ?parent,
                        "access_role mismatch"
                    );
                    return Err(AclError::AccessRoleMismatch {
                        table: self.table.clone(),
                        parent_table: parent_table.clone(),
                        child,
                        parent,
                    });
                }
                Ok(())
            }
            TriggerKind::OriginRoleConsistency {
                details_column,
                origin_key,
                origin,
                role,
            } => {
                let access_role = access_role_of(schema, row)?;
                let row_origin = json_text_field(schema.value(row, details_column)?, origin_key)?;
                let from_origin = row_origin.is_some_and(|o| o.eq_ignore_ascii_case(origin));
                let tagged = access_role.as_deref() == Some(role.as_str());
                if from_origin != tagged {
                    return Err(AclError::CheckConstraintFailed {
                        table: self.table.clone(),
                        constraint: self.name.clone(),
                    });
                }
                Ok(())
            }
        }
    }
}

fn access_role_of(schema: &TableSchema, row: &Row) -> Result<Option<String>, AclError> {
    Ok(schema
        .value(row, ACCESS_ROLE_COLUMN)?
        .as_str()
        .map(str::to_string))
}

/// `details ->> key` for a JSON column. Null or absent keys yield `None`.
fn json_text_field(value: &Value, key: &str) -> Result<Option<String>, AclError> {
    let Value::Json(raw) = value else {
        return Ok(None);
    };
    let parsed: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| AclError::Decode(e.to_string()))?;
    Ok(match parsed.get(key) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}
