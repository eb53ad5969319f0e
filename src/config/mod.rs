//! Static configuration: databases reachable from a unit of work, and request
//! settings.
//!
//! Loaded from JSON. Every section is optional:
//!
//! ```json
//! {
//!   "databases": {
//!     "primary": { "connection_string": "postgres://app@localhost/app" },
//!     "secondary": [
//!       { "name": "Reporting", "connection_string": "postgres://app@localhost/reporting" },
//!       { "name": "Legacy", "connection_string": "postgres://legacy", "automatic_transactions": false }
//!     ]
//!   },
//!   "requests": { "slow_request_threshold_secs": 30, "development": false }
//! }
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::{DatabaseError, DatabaseIdentity, DatabaseInfo};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("secondary database names must not be empty")]
    InvalidDatabaseName,

    #[error("secondary database `{0}` is configured more than once")]
    DuplicateDatabase(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub databases: DatabaseConfig,
    pub requests: RequestSettings,
}

impl AppConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.databases.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

/// Connection settings for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub connection_string: String,
    #[serde(default = "default_automatic_transactions")]
    pub automatic_transactions: bool,
}

fn default_automatic_transactions() -> bool {
    true
}

impl DatabaseSettings {
    /// Settings with automatic transactions enabled.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            automatic_transactions: true,
        }
    }

    #[must_use]
    pub fn without_automatic_transactions(mut self) -> Self {
        self.automatic_transactions = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryDatabaseSettings {
    pub name: String,
    #[serde(flatten)]
    pub settings: DatabaseSettings,
}

/// The primary database and every named secondary database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub primary: Option<DatabaseSettings>,
    pub secondary: Vec<SecondaryDatabaseSettings>,
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_primary(mut self, settings: DatabaseSettings) -> Self {
        self.primary = Some(settings);
        self
    }

    #[must_use]
    pub fn with_secondary(mut self, name: impl Into<String>, settings: DatabaseSettings) -> Self {
        self.secondary.push(SecondaryDatabaseSettings {
            name: name.into(),
            settings,
        });
        self
    }

    /// Rejects empty and duplicate secondary names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for secondary in &self.secondary {
            if secondary.name.trim().is_empty() {
                return Err(ConfigError::InvalidDatabaseName);
            }
            if !seen.insert(secondary.name.as_str()) {
                return Err(ConfigError::DuplicateDatabase(secondary.name.clone()));
            }
        }
        Ok(())
    }

    /// Resolves the settings for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::UnknownDatabase`] if `identity` is not configured.
    pub fn database_info(&self, identity: &DatabaseIdentity) -> Result<DatabaseInfo, DatabaseError> {
        let settings = match identity {
            DatabaseIdentity::Primary => self.primary.as_ref(),
            DatabaseIdentity::Secondary(name) => self
                .secondary
                .iter()
                .find(|secondary| &secondary.name == name)
                .map(|secondary| &secondary.settings),
        }
        .ok_or_else(|| DatabaseError::UnknownDatabase(identity.clone()))?;

        Ok(DatabaseInfo {
            identity: identity.clone(),
            connection_string: settings.connection_string.clone(),
            automatic_transactions: settings.automatic_transactions,
        })
    }
}

/// Per-request settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Requests slower than this are reported.
    pub slow_request_threshold_secs: u64,
    /// Development installations do not report slow requests.
    pub development: bool,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            slow_request_threshold_secs: 30,
            development: false,
        }
    }
}

impl RequestSettings {
    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_secs(self.slow_request_threshold_secs)
    }
}
