use crate::catalog::Catalog;
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, Value, lineage_is_under};
use crate::error::{AclError, ResourceType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Row predicate used by policies (`using` / `with check`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    True,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Evaluating principal is a member of the named role.
    MemberOf(String),
    /// Evaluating principal is a member of the role named by the column's
    /// value. Null never matches.
    MemberOfColumn(String),
    /// Lineage column is the given path or one of its descendants.
    LineageUnder(String, String),
    /// The row referenced by `column` (a key into `table`) exists and
    /// satisfies `predicate`.
    Related {
        column: String,
        table: String,
        predicate: Box<Expr>,
    },
}

impl Expr {
    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn related(column: &str, table: &str, predicate: Expr) -> Expr {
        Expr::Related {
            column: column.to_string(),
            table: table.to_string(),
            predicate: Box::new(predicate),
        }
    }

    /// `access_role is null or pg_has_role(access_role, 'usage')`.
    pub fn access_role_visible(column: &str) -> Expr {
        Expr::IsNull(column.to_string()).or(Expr::MemberOfColumn(column.to_string()))
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::True
            | Expr::Eq(_, _)
            | Expr::Ne(_, _)
            | Expr::Lt(_, _)
            | Expr::Lte(_, _)
            | Expr::Gt(_, _)
            | Expr::Gte(_, _)
            | Expr::In(_, _)
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::MemberOf(_)
            | Expr::MemberOfColumn(_)
            | Expr::LineageUnder(_, _) => 1,
            Expr::Not(inner) => 1 + inner.depth(),
            Expr::Related { predicate, .. } => 1 + predicate.depth(),
            Expr::And(left, right) | Expr::Or(left, right) => 1 + left.depth().max(right.depth()),
        }
    }

    pub fn validate_depth(&self, max_depth: usize) -> Result<(), AclError> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(AclError::Validation(format!(
                "expression depth {depth} exceeds maximum allowed depth of {max_depth}"
            )));
        }
        Ok(())
    }

    pub fn references_table(&self, name: &str) -> bool {
        match self {
            Expr::Related {
                table, predicate, ..
            } => table == name || predicate.references_table(name),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.references_table(name) || rhs.references_table(name)
            }
            Expr::Not(inner) => inner.references_table(name),
            _ => false,
        }
    }

    pub fn references_role(&self, role: &str) -> bool {
        match self {
            Expr::MemberOf(r) => r == role,
            Expr::Related { predicate, .. } => predicate.references_role(role),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.references_role(role) || rhs.references_role(role)
            }
            Expr::Not(inner) => inner.references_role(role),
            _ => false,
        }
    }

    /// Checks column and role references against the catalog. Related
    /// predicates are validated against the referenced table.
    pub fn validate(&self, catalog: &Catalog, schema: &TableSchema) -> Result<(), AclError> {
        match self {
            Expr::True => Ok(()),
            Expr::Eq(col, _)
            | Expr::Ne(col, _)
            | Expr::Lt(col, _)
            | Expr::Lte(col, _)
            | Expr::Gt(col, _)
            | Expr::Gte(col, _)
            | Expr::In(col, _)
            | Expr::IsNull(col)
            | Expr::IsNotNull(col)
            | Expr::MemberOfColumn(col)
            | Expr::LineageUnder(col, _) => schema.require_column(col).map(|_| ()),
            Expr::MemberOf(role) => {
                if catalog.roles.contains(role) {
                    Ok(())
                } else {
                    Err(AclError::not_found(ResourceType::Role, role.as_str()))
                }
            }
            Expr::Related {
                column,
                table,
                predicate,
            } => {
                schema.require_column(column)?;
                let target = catalog.table(table)?;
                if target.primary_key.is_none() {
                    return Err(AclError::Validation(format!(
                        "{table} has no primary key to relate through"
                    )));
                }
                predicate.validate(catalog, target)
            }
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.validate(catalog, schema)?;
                rhs.validate(catalog, schema)
            }
            Expr::Not(inner) => inner.validate(catalog, schema),
        }
    }
}

/// Point lookup of a row by primary key, used for foreign-key hops.
pub trait RowLookup {
    fn find_row(&self, table: &str, key: &Value) -> Option<Row>;
}

/// Everything a predicate may consult besides the row itself.
pub struct EvalContext<'a> {
    pub catalog: &'a Catalog,
    pub lookup: &'a dyn RowLookup,
    pub principal: &'a str,
    /// Reflexive-transitive role closure of `principal`.
    pub memberships: &'a BTreeSet<String>,
}

impl EvalContext<'_> {
    pub fn eval(&self, expr: &Expr, schema: &TableSchema, row: &Row) -> Result<bool, AclError> {
        match expr {
            Expr::True => Ok(true),
            Expr::Eq(col, value) => self.compare(schema, row, col, value, |o| o.is_eq()),
            Expr::Ne(col, value) => self.compare(schema, row, col, value, |o| o.is_ne()),
            Expr::Lt(col, value) => self.compare(schema, row, col, value, |o| o.is_lt()),
            Expr::Lte(col, value) => self.compare(schema, row, col, value, |o| o.is_le()),
            Expr::Gt(col, value) => self.compare(schema, row, col, value, |o| o.is_gt()),
            Expr::Gte(col, value) => self.compare(schema, row, col, value, |o| o.is_ge()),
            Expr::In(col, values) => {
                let v = schema.value(row, col)?;
                Ok(!v.is_null() && values.iter().any(|candidate| v == candidate))
            }
            Expr::IsNull(col) => Ok(schema.value(row, col)?.is_null()),
            Expr::IsNotNull(col) => Ok(!schema.value(row, col)?.is_null()),
            Expr::And(lhs, rhs) => {
                Ok(self.eval(lhs, schema, row)? && self.eval(rhs, schema, row)?)
            }
            Expr::Or(lhs, rhs) => Ok(self.eval(lhs, schema, row)? || self.eval(rhs, schema, row)?),
            Expr::Not(inner) => Ok(!self.eval(inner, schema, row)?),
            Expr::MemberOf(role) => Ok(self.memberships.contains(role)),
            Expr::MemberOfColumn(col) => Ok(schema
                .value(row, col)?
                .as_str()
                .is_some_and(|role| self.memberships.contains(role))),
            Expr::LineageUnder(col, ancestor) => Ok(schema
                .value(row, col)?
                .as_str()
                .is_some_and(|path| lineage_is_under(path, ancestor))),
            Expr::Related {
                column,
                table,
                predicate,
            } => {
                let key = schema.value(row, column)?;
                if key.is_null() {
                    return Ok(false);
                }
                let target = self.catalog.table(table)?;
                match self.lookup.find_row(table, key) {
                    Some(related) => self.eval(predicate, target, &related),
                    None => Ok(false),
                }
            }
        }
    }

    // SQL comparison: null on either side is never true.
    fn compare(
        &self,
        schema: &TableSchema,
        row: &Row,
        col: &str,
        value: &Value,
        accept: impl Fn(Ordering) -> bool,
    ) -> Result<bool, AclError> {
        let v = schema.value(row, col)?;
        if v.is_null() || value.is_null() {
            return Ok(false);
        }
        Ok(accept(v.cmp(value)))
    }
}
