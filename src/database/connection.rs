//! Physical connection seam: the capability set a database-access layer supplies.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DatabaseError, DatabaseIdentity, DatabaseInfo};
use crate::config::DatabaseConfig;

/// A physical database connection.
///
/// Every operation is fallible and may block on I/O. The coordinator calls them
/// sequentially, never concurrently, and only in these orders:
///
/// - `open` → (`begin_transaction`) on first use;
/// - (`pre_execute_commit_time_validation`) before any commit;
/// - (`commit_transaction` | `rollback_transaction`) → `close` at cleanup.
#[async_trait]
pub trait Connection: Send {
    /// Error reported by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    async fn open(&mut self) -> Result<(), Self::Error>;

    async fn begin_transaction(&mut self) -> Result<(), Self::Error>;

    async fn commit_transaction(&mut self) -> Result<(), Self::Error>;

    async fn rollback_transaction(&mut self) -> Result<(), Self::Error>;

    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Runs checks that must pass before the transaction may commit.
    ///
    /// Called for every transactional connection before the first commit of a
    /// unit of work, so a failure here can still abort every database.
    async fn pre_execute_commit_time_validation(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Builds unopened physical connections for configured databases.
pub trait ConnectionProvider: Send + Sync + 'static {
    type Connection: Connection;

    /// Creates a connection for `info`. The coordinator opens it.
    fn create(&self, info: &DatabaseInfo) -> Result<Self::Connection, DatabaseError>;
}

/// Static configuration paired with a provider, shared by every unit of work.
///
/// Cloning is cheap: both halves are reference-counted.
pub struct ConnectionSource<P> {
    config: Arc<DatabaseConfig>,
    provider: Arc<P>,
}

impl<P> Clone for ConnectionSource<P> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P: ConnectionProvider> ConnectionSource<P> {
    pub fn new(config: DatabaseConfig, provider: P) -> Self {
        Self::from_shared(Arc::new(config), Arc::new(provider))
    }

    pub fn from_shared(config: Arc<DatabaseConfig>, provider: Arc<P>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Resolves `identity` against the configuration and creates its connection.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::UnknownDatabase`] if the identity is not
    /// configured, or whatever the provider reports.
    pub fn resolve(
        &self,
        identity: &DatabaseIdentity,
    ) -> Result<(DatabaseInfo, P::Connection), DatabaseError> {
        let info = self.config.database_info(identity)?;
        let connection = self.provider.create(&info)?;
        Ok((info, connection))
    }
}
