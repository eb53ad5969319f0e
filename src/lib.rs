//! # autotx
//!
//! Automatic per-request database connection and transaction management.
//!
//! Every unit of work (an inbound request or a background task) lazily opens
//! connections to a primary database and any number of named secondary
//! databases, wraps each in an automatically managed transaction, queues
//! side effects until after commit, and at the end commits or rolls back and
//! closes everything in a fixed order, even when some of those steps fail.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use autotx::{AppConfig, ConnectionSource, DatabaseIdentity, MemoryCache, RequestState};
//! use autotx::database::postgres::PgProvider;
//!
//! let config = AppConfig::load("autotx.json")?;
//! let source = ConnectionSource::new(config.databases, PgProvider);
//! let cache = Arc::new(MemoryCache::new());
//!
//! let state = RequestState::new("/orders/42", source.clone(), cache, config.requests);
//! state
//!     .execute(|request| Box::pin(async move {
//!         let db = request.connection(&DatabaseIdentity::Primary).await?.executor()?;
//!         sqlx::query("UPDATE orders SET shipped = true WHERE id = 42").execute(db).await?;
//!         request.add_deferred_action(|| async { notify_warehouse(42).await });
//!         Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
//!     }))
//!     .await?;
//! ```

pub mod background;
pub mod cache;
pub mod config;
pub mod context;
pub mod database;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use background::{TaskQueue, execute_cancellable, execute_with_automatic_connections};
pub use cache::{CacheLayer, MemoryCache};
pub use config::{AppConfig, ConfigError, DatabaseConfig, DatabaseSettings, RequestSettings};
pub use context::RequestState;
pub use database::{
    AutomaticConnectionManager, BoxError, Connection, ConnectionProvider, ConnectionSource,
    DatabaseError, DatabaseIdentity,
};
