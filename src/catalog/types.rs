use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
    /// Dot-separated label path, compared with ltree semantics.
    Lineage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Json(CompactString),
    Lineage(CompactString),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl Value {
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(CompactString::new(s.as_ref()))
    }

    pub fn json(v: &serde_json::Value) -> Self {
        Value::Json(CompactString::new(v.to_string()))
    }

    pub fn lineage(path: impl AsRef<str>) -> Self {
        Value::Lineage(CompactString::new(path.as_ref()))
    }

    /// Text-valued optional column (`access_role`): `None` becomes `Null`.
    pub fn opt_text(s: Option<&str>) -> Self {
        s.map(Value::text).unwrap_or(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Json(s) | Value::Lineage(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn matches_type(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Text(_), ColumnType::Text)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Timestamp(_), ColumnType::Timestamp)
                | (Value::Json(_), ColumnType::Json)
                | (Value::Lineage(_), ColumnType::Lineage)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "Text",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Boolean(_) => "Boolean",
            Value::Timestamp(_) => "Timestamp",
            Value::Json(_) => "Json",
            Value::Lineage(_) => "Lineage",
            Value::Null => "Null",
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Float(_) => 4,
            Value::Text(_) => 5,
            Value::Lineage(_) => 6,
            Value::Json(_) => 7,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) | Value::Json(s) | Value::Lineage(s) => write!(f, "{s}"),
            Value::Integer(v) | Value::Timestamp(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Null => write!(f, "null"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Lineage(a), Value::Lineage(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// ltree `<@`: true when `ancestor` is `path` or one of its ancestors,
/// label by label.
pub fn lineage_is_under(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    let mut labels = path.split('.');
    ancestor
        .split('.')
        .all(|want| labels.next().is_some_and(|have| have == want))
}
