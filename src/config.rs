use crate::error::AclError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime configuration for a [`crate::Warehouse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Lifetime of a cached `can` answer. Zero disables caching.
    pub permission_cache_ttl_ms: u64,
    pub permission_cache_max_entries: usize,
    /// Upper bound on policy predicate nesting accepted by `create_policy`.
    pub max_predicate_depth: usize,
    /// Members of a securable's owner role hold every privilege on it and
    /// bypass its row security.
    pub owners_bypass: bool,
    /// Emit a `debug!` event for every denied privilege or hidden row.
    pub log_denials: bool,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            permission_cache_ttl_ms: 30_000,
            permission_cache_max_entries: 1_000,
            max_predicate_depth: 32,
            owners_bypass: true,
            log_denials: false,
        }
    }
}

impl AclConfig {
    /// Owners are treated like any other principal: every privilege must be
    /// granted explicitly and row security applies to them too.
    pub fn strict() -> Self {
        Self {
            owners_bypass: false,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            permission_cache_ttl_ms: 0,
            log_denials: true,
            ..Self::default()
        }
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.permission_cache_ttl_ms)
    }

    pub fn caching_enabled(&self) -> bool {
        self.permission_cache_ttl_ms > 0 && self.permission_cache_max_entries > 0
    }

    pub fn validate(&self) -> Result<(), AclError> {
        if self.max_predicate_depth == 0 {
            return Err(AclError::InvalidConfig {
                message: "max_predicate_depth must be at least 1".into(),
            });
        }
        if self.permission_cache_ttl_ms > 0 && self.permission_cache_max_entries == 0 {
            return Err(AclError::InvalidConfig {
                message: "permission_cache_max_entries must be positive when caching is enabled"
                    .into(),
            });
        }
        Ok(())
    }

    /// Loads a JSON config file. Missing fields fall back to [`AclConfig::default`].
    pub fn from_json_file(path: &Path) -> Result<Self, AclError> {
        let bytes = std::fs::read(path)?;
        let config: AclConfig =
            serde_json::from_slice(&bytes).map_err(|e| AclError::Decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
