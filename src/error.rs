use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Role,
    Securable,
    Column,
    Action,
    Policy,
    Trigger,
    Row,
    Quota,
    Change,
    Route,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Role => write!(f, "role"),
            ResourceType::Securable => write!(f, "securable"),
            ResourceType::Column => write!(f, "column"),
            ResourceType::Action => write!(f, "action"),
            ResourceType::Policy => write!(f, "policy"),
            ResourceType::Trigger => write!(f, "trigger"),
            ResourceType::Row => write!(f, "row"),
            ResourceType::Quota => write!(f, "quota"),
            ResourceType::Change => write!(f, "change"),
            ResourceType::Route => write!(f, "route"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    IntegrityError,
    AlreadyExists,
    RoleNotFound,
    SecurableNotFound,
    ColumnNotFound,
    ActionNotFound,
    PolicyNotFound,
    TriggerNotFound,
    RowNotFound,
    QuotaNotFound,
    ChangeNotFound,
    RouteNotFound,
    DuplicatePrimaryKey,
    CheckConstraintFailed,
    NotNullViolation,
    TypeMismatch,
    PermissionDenied,
    AccessRoleMismatch,
    OverlapViolation,
    QuotaExhausted,
    RoleCycle,
}

impl AclErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AclErrorCode::Io => "io",
            AclErrorCode::Encode => "encode",
            AclErrorCode::Decode => "decode",
            AclErrorCode::Validation => "validation",
            AclErrorCode::InvalidConfig => "invalid_config",
            AclErrorCode::IntegrityError => "integrity_error",
            AclErrorCode::AlreadyExists => "already_exists",
            AclErrorCode::RoleNotFound => "role_not_found",
            AclErrorCode::SecurableNotFound => "securable_not_found",
            AclErrorCode::ColumnNotFound => "column_not_found",
            AclErrorCode::ActionNotFound => "action_not_found",
            AclErrorCode::PolicyNotFound => "policy_not_found",
            AclErrorCode::TriggerNotFound => "trigger_not_found",
            AclErrorCode::RowNotFound => "row_not_found",
            AclErrorCode::QuotaNotFound => "quota_not_found",
            AclErrorCode::ChangeNotFound => "change_not_found",
            AclErrorCode::RouteNotFound => "route_not_found",
            AclErrorCode::DuplicatePrimaryKey => "duplicate_primary_key",
            AclErrorCode::CheckConstraintFailed => "check_constraint_failed",
            AclErrorCode::NotNullViolation => "not_null_violation",
            AclErrorCode::TypeMismatch => "type_mismatch",
            AclErrorCode::PermissionDenied => "permission_denied",
            // Same condition name the warehouse triggers raise.
            AclErrorCode::AccessRoleMismatch => "triggered_action_exception",
            AclErrorCode::OverlapViolation => "exclusion_violation",
            AclErrorCode::QuotaExhausted => "quota_exhausted",
            AclErrorCode::RoleCycle => "role_cycle",
        }
    }
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("duplicate primary key in table '{table}': {key}")]
    DuplicatePK { table: String, key: String },
    #[error("check constraint '{constraint}' failed on table '{table}'")]
    CheckConstraintFailed { table: String, constraint: String },
    #[error("NOT NULL violation: column '{column}' in table '{table}'")]
    NotNullViolation { table: String, column: String },
    #[error(
        "type mismatch: column '{column}' in table '{table}' expected {expected}, got {actual}"
    )]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(
        "access_role mismatch on '{table}': row has {child:?} but {parent_table} row has {parent:?}"
    )]
    AccessRoleMismatch {
        table: String,
        parent_table: String,
        child: Option<String>,
        parent: Option<String>,
    },
    #[error("conflicting key value violates exclusion constraint '{constraint}' for '{key}'")]
    OverlapViolation { constraint: String, key: String },
    #[error("quota '{name}' exhausted: used {used} of {max}")]
    QuotaExhausted { name: String, used: i64, max: i64 },
    #[error("role membership cycle: {}", .path.join(" -> "))]
    RoleCycle { path: Vec<String> },
}

impl AclError {
    pub fn code(&self) -> AclErrorCode {
        match self {
            AclError::Io(_) => AclErrorCode::Io,
            AclError::Encode(_) => AclErrorCode::Encode,
            AclError::Decode(_) => AclErrorCode::Decode,
            AclError::Validation(_) => AclErrorCode::Validation,
            AclError::InvalidConfig { .. } => AclErrorCode::InvalidConfig,
            AclError::IntegrityError { .. } => AclErrorCode::IntegrityError,
            AclError::AlreadyExists { .. } => AclErrorCode::AlreadyExists,
            AclError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Role => AclErrorCode::RoleNotFound,
                ResourceType::Securable => AclErrorCode::SecurableNotFound,
                ResourceType::Column => AclErrorCode::ColumnNotFound,
                ResourceType::Action => AclErrorCode::ActionNotFound,
                ResourceType::Policy => AclErrorCode::PolicyNotFound,
                ResourceType::Trigger => AclErrorCode::TriggerNotFound,
                ResourceType::Row => AclErrorCode::RowNotFound,
                ResourceType::Quota => AclErrorCode::QuotaNotFound,
                ResourceType::Change => AclErrorCode::ChangeNotFound,
                ResourceType::Route => AclErrorCode::RouteNotFound,
            },
            AclError::DuplicatePK { .. } => AclErrorCode::DuplicatePrimaryKey,
            AclError::CheckConstraintFailed { .. } => AclErrorCode::CheckConstraintFailed,
            AclError::NotNullViolation { .. } => AclErrorCode::NotNullViolation,
            AclError::TypeMismatch { .. } => AclErrorCode::TypeMismatch,
            AclError::PermissionDenied(_) => AclErrorCode::PermissionDenied,
            AclError::AccessRoleMismatch { .. } => AclErrorCode::AccessRoleMismatch,
            AclError::OverlapViolation { .. } => AclErrorCode::OverlapViolation,
            AclError::QuotaExhausted { .. } => AclErrorCode::QuotaExhausted,
            AclError::RoleCycle { .. } => AclErrorCode::RoleCycle,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True only for trigger rejections of a child row whose `access_role`
    /// disagrees with its parent. Speculative writers ignore exactly this kind.
    pub fn is_access_role_mismatch(&self) -> bool {
        matches!(self, AclError::AccessRoleMismatch { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AclError::NotFound { .. })
    }

    pub(crate) fn not_found(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        AclError::NotFound {
            resource_type,
            resource_id: resource_id.into(),
        }
    }
}
