//! `operations.test_quota`: named allowances over non-overlapping time spans.
//!
//! The table only constrains `max >= 0`, `used >= 0` and span exclusion per
//! name. Keeping `used <= max` is up to writers; [`QuotaTable::try_consume`]
//! is the guarded increment they should use.

use crate::error::{AclError, ResourceType};
use im::OrdMap;
use serde::{Deserialize, Serialize};

pub const QUOTA_TABLE: &str = "operations.test_quota";
const EXCLUSION_CONSTRAINT: &str = "test_quota_name_timespan_excl";

/// Half-open span `[start, end)` in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSpan {
    pub start: i64,
    pub end: i64,
}

impl TimeSpan {
    pub fn new(start: i64, end: i64) -> Result<Self, AclError> {
        if end <= start {
            return Err(AclError::Validation(format!(
                "empty or inverted timespan [{start}, {end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, at: i64) -> bool {
        self.start <= at && at < self.end
    }
}

impl std::fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestQuota {
    pub name: String,
    pub timespan: TimeSpan,
    pub max: i64,
    pub used: i64,
}

impl TestQuota {
    pub fn new(name: impl Into<String>, timespan: TimeSpan, max: i64) -> Self {
        Self {
            name: name.into(),
            timespan,
            max,
            used: 0,
        }
    }

    pub fn remaining(&self) -> i64 {
        self.max - self.used
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaTable {
    rows: OrdMap<(String, i64), TestQuota>,
}

impl QuotaTable {
    pub fn insert(&mut self, quota: TestQuota) -> Result<(), AclError> {
        check_non_negative("max", quota.max)?;
        check_non_negative("used", quota.used)?;
        if let Some(existing) = self
            .rows_for(&quota.name)
            .find(|row| row.timespan.overlaps(&quota.timespan))
        {
            tracing::debug!(
                name = %quota.name,
                existing = %existing.timespan,
                proposed = %quota.timespan,
                "test_quota timespan overlap"
            );
            return Err(AclError::OverlapViolation {
                constraint: EXCLUSION_CONSTRAINT.to_string(),
                key: format!("{} {}", quota.name, quota.timespan),
            });
        }
        self.rows
            .insert((quota.name.clone(), quota.timespan.start), quota);
        Ok(())
    }

    pub fn rows_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TestQuota> + 'a {
        self.rows.values().filter(move |row| row.name == name)
    }

    pub fn all(&self) -> impl Iterator<Item = &TestQuota> {
        self.rows.values()
    }

    pub fn covering(&self, name: &str, at: i64) -> Option<&TestQuota> {
        self.rows
            .values()
            .find(|row| row.name == name && row.timespan.contains(at))
    }

    /// Raw column update. Only non-negativity is enforced, exactly like the
    /// table constraint; `used` may exceed `max`.
    pub fn set_used(&mut self, name: &str, at: i64, used: i64) -> Result<TestQuota, AclError> {
        check_non_negative("used", used)?;
        let key = self.covering_key(name, at)?;
        let Some(row) = self.rows.get_mut(&key) else {
            return Err(quota_not_found(name, at));
        };
        row.used = used;
        Ok(row.clone())
    }

    /// `update ... set used = used + 1 where used < max` on the span
    /// covering `at`. Callers run this under the store's write lock.
    pub fn try_consume(&mut self, name: &str, at: i64) -> Result<TestQuota, AclError> {
        let key = self.covering_key(name, at)?;
        let Some(row) = self.rows.get_mut(&key) else {
            return Err(quota_not_found(name, at));
        };
        if row.used >= row.max {
            return Err(AclError::QuotaExhausted {
                name: row.name.clone(),
                used: row.used,
                max: row.max,
            });
        }
        row.used += 1;
        Ok(row.clone())
    }

    fn covering_key(&self, name: &str, at: i64) -> Result<(String, i64), AclError> {
        self.covering(name, at)
            .map(|row| (row.name.clone(), row.timespan.start))
            .ok_or_else(|| quota_not_found(name, at))
    }
}

fn quota_not_found(name: &str, at: i64) -> AclError {
    AclError::not_found(ResourceType::Quota, format!("{name}@{at}"))
}

fn check_non_negative(column: &str, value: i64) -> Result<(), AclError> {
    if value < 0 {
        return Err(AclError::CheckConstraintFailed {
            table: QUOTA_TABLE.to_string(),
            constraint: format!("test_quota_{column}_check"),
        });
    }
    Ok(())
}
