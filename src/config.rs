//! Directory configuration.

use crate::error::{DirectoryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default refresh period for the in-memory view.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Directory configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Name of the durable table holding subscription records.
    /// Default: "subscriptions"
    pub table: String,

    /// How often the view is rebuilt from the store.
    /// Default: 30s
    pub refresh_interval: Duration,

    /// Max buffered refresh outcomes for an observer before new ones are dropped.
    /// Default: 16
    pub observer_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            table: "subscriptions".to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            observer_capacity: 16,
        }
    }
}

impl DirectoryConfig {
    /// Config for a given table, other knobs at their defaults.
    pub fn with_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: DirectoryConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(DirectoryError::InvalidConfig("table name is empty".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(DirectoryError::InvalidConfig(
                "refresh interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
