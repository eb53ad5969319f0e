//! PostgreSQL backend over [`sqlx`].
//!
//! Transactions are driven with plain `BEGIN` / `COMMIT` / `ROLLBACK` statements
//! on a single [`PgConnection`], so the connection stays usable for queries
//! between them.

use async_trait::async_trait;
use sqlx::{Connection as SqlxConnection, PgConnection};
use thiserror::Error;

use super::{Connection, ConnectionProvider, DatabaseError, DatabaseInfo};

#[derive(Debug, Error)]
pub enum PgSessionError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("connection is not open")]
    NotOpen,
}

/// Creates a [`PgSession`] per database from its configured connection string.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgProvider;

impl ConnectionProvider for PgProvider {
    type Connection = PgSession;

    fn create(&self, info: &DatabaseInfo) -> Result<PgSession, DatabaseError> {
        Ok(PgSession::new(info.connection_string.clone()))
    }
}

/// One lazily opened PostgreSQL connection.
pub struct PgSession {
    url: String,
    connection: Option<PgConnection>,
}

impl PgSession {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// The open connection, for running queries.
    pub fn executor(&mut self) -> Result<&mut PgConnection, PgSessionError> {
        self.connection.as_mut().ok_or(PgSessionError::NotOpen)
    }

    async fn execute_raw(&mut self, sql: &'static str) -> Result<(), PgSessionError> {
        sqlx::raw_sql(sql).execute(self.executor()?).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for PgSession {
    type Error = PgSessionError;

    async fn open(&mut self) -> Result<(), PgSessionError> {
        self.connection = Some(PgConnection::connect(&self.url).await?);
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<(), PgSessionError> {
        self.execute_raw("BEGIN").await
    }

    async fn commit_transaction(&mut self) -> Result<(), PgSessionError> {
        self.execute_raw("COMMIT").await
    }

    async fn rollback_transaction(&mut self) -> Result<(), PgSessionError> {
        self.execute_raw("ROLLBACK").await
    }

    async fn close(&mut self) -> Result<(), PgSessionError> {
        if let Some(connection) = self.connection.take() {
            connection.close().await?;
        }
        Ok(())
    }
}
