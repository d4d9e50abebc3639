//! Row security: per-table policies combined permissively.
//!
//! A table without row security enabled shows every row to anyone holding
//! the table grant. Once enabled, a row is visible to a principal only if at
//! least one policy that targets one of the principal's roles and covers the
//! command accepts it. No applicable policy means no rows.

pub mod expr;

use crate::catalog::schema::TableSchema;
use crate::catalog::types::Row;
use crate::error::AclError;
use crate::role::PUBLIC_ROLE;
use expr::{EvalContext, Expr};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicyCommand {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub fn covers(self, command: PolicyCommand) -> bool {
        self == PolicyCommand::All || self == command
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub table: String,
    pub command: PolicyCommand,
    /// Target roles; [`PUBLIC_ROLE`] targets everyone.
    pub roles: Vec<String>,
    /// Filter for existing rows (select, update, delete).
    pub using: Expr,
    /// Filter for new row images (insert, update). Falls back to `using`.
    #[serde(default)]
    pub with_check: Option<Expr>,
}

impl Policy {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            command: PolicyCommand::All,
            roles: vec![PUBLIC_ROLE.to_string()],
            using: Expr::True,
            with_check: None,
        }
    }

    pub fn for_command(mut self, command: PolicyCommand) -> Self {
        self.command = command;
        self
    }

    pub fn to_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| (*r).to_string()).collect();
        self
    }

    pub fn using(mut self, expr: Expr) -> Self {
        self.using = expr;
        self
    }

    pub fn with_check(mut self, expr: Expr) -> Self {
        self.with_check = Some(expr);
        self
    }

    pub fn applies_to(&self, ctx: &EvalContext<'_>) -> bool {
        self.roles.iter().any(|r| ctx.memberships.contains(r))
    }

    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        std::iter::once(&self.using).chain(self.with_check.as_ref())
    }

    fn check_expr(&self) -> &Expr {
        self.with_check.as_ref().unwrap_or(&self.using)
    }
}

/// Existing-row test for `command` (select, update or delete).
pub fn row_visible(
    ctx: &EvalContext<'_>,
    schema: &TableSchema,
    row: &Row,
    command: PolicyCommand,
) -> Result<bool, AclError> {
    let table = schema.qualified_name();
    if !ctx.catalog.row_security_enabled(&table) {
        return Ok(true);
    }
    for policy in ctx.catalog.policies_on(&table) {
        if !policy.command.covers(command) || !policy.applies_to(ctx) {
            continue;
        }
        if ctx.eval(&policy.using, schema, row)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// New-row test for inserts and updates. Returns the name of the table
/// when no applicable policy admits the row.
pub fn check_new_row(
    ctx: &EvalContext<'_>,
    schema: &TableSchema,
    row: &Row,
    command: PolicyCommand,
) -> Result<(), AclError> {
    let table = schema.qualified_name();
    if !ctx.catalog.row_security_enabled(&table) {
        return Ok(());
    }
    for policy in ctx.catalog.policies_on(&table) {
        if !policy.command.covers(command) || !policy.applies_to(ctx) {
            continue;
        }
        if ctx.eval(policy.check_expr(), schema, row)? {
            return Ok(());
        }
    }
    Err(AclError::PermissionDenied(format!(
        "new row violates row-level security policy for table {table} (principal {})",
        ctx.principal
    )))
}
