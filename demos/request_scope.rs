//! Walks through a request and a background job against a logging backend.
//!
//! Run with `RUST_LOG=debug cargo run --example request_scope`.

use std::sync::Arc;

use async_trait::async_trait;
use autotx::database::DatabaseInfo;
use autotx::{
    AppConfig, BoxError, Connection, ConnectionProvider, ConnectionSource, DatabaseError,
    DatabaseIdentity, MemoryCache, RequestState, TaskQueue,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "databases": {
        "primary": { "connection_string": "memory://app" },
        "secondary": [
            { "name": "Reporting", "connection_string": "memory://reporting" },
            { "name": "Search", "connection_string": "memory://search", "automatic_transactions": false }
        ]
    },
    "requests": { "slow_request_threshold_secs": 1, "development": true }
}"#;

struct LoggingProvider;

impl ConnectionProvider for LoggingProvider {
    type Connection = LoggingConnection;

    fn create(&self, info: &DatabaseInfo) -> Result<LoggingConnection, DatabaseError> {
        Ok(LoggingConnection {
            url: info.connection_string.clone(),
        })
    }
}

struct LoggingConnection {
    url: String,
}

#[async_trait]
impl Connection for LoggingConnection {
    type Error = std::io::Error;

    async fn open(&mut self) -> Result<(), std::io::Error> {
        info!(url = %self.url, "open");
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<(), std::io::Error> {
        info!(url = %self.url, "begin");
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), std::io::Error> {
        info!(url = %self.url, "commit");
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<(), std::io::Error> {
        info!(url = %self.url, "rollback");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), std::io::Error> {
        info!(url = %self.url, "close");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_json_str(CONFIG)?;
    let source = ConnectionSource::new(config.databases, LoggingProvider);
    let cache = Arc::new(MemoryCache::new());

    // A request touching two databases, with a post-commit cache write.
    let state = RequestState::new(
        "/orders/42",
        source.clone(),
        Arc::clone(&cache),
        config.requests.clone(),
    );
    let deferred_cache = Arc::clone(&cache);
    state
        .execute(|request| {
            Box::pin(async move {
                request.connection(&DatabaseIdentity::Primary).await?;
                request.connection(&DatabaseIdentity::secondary("Reporting")).await?;
                request.connection(&DatabaseIdentity::secondary("Search")).await?;
                request.add_deferred_action(move || async move {
                    info!(cache_enabled = deferred_cache.is_enabled(), "publishing order 42");
                    Ok::<(), BoxError>(())
                });
                Ok::<_, DatabaseError>(())
            })
        })
        .await?;

    // A request that fails: everything is rolled back.
    let state = RequestState::new("/orders/43", source.clone(), Arc::clone(&cache), config.requests);
    let failed = state
        .execute(|request| {
            Box::pin(async move {
                request.connection(&DatabaseIdentity::Primary).await?;
                Err::<(), BoxError>("order 43 is locked".into())
            })
        })
        .await;
    info!(error = ?failed.err().map(|e| e.to_string()), "second request finished");

    // Background jobs each get their own unit of work.
    let queue = TaskQueue::spawn(source, 8);
    queue
        .submit(|connections| {
            Box::pin(async move {
                connections.connection(&DatabaseIdentity::Primary).await?;
                Ok::<(), BoxError>(())
            })
        })
        .await?;
    let stats = queue.shutdown().await?;
    info!(succeeded = stats.succeeded, failed = stats.failed, "background jobs done");

    Ok(())
}
