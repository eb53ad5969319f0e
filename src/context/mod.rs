//! Per-request state: one unit of work per inbound request.
//!
//! [`RequestState`] owns the request's [`AutomaticConnectionManager`], typed
//! request extensions and the errors recorded while handling the request. It is
//! created when the request arrives and consumed when the request ends.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cache::MemoryCache;
use crate::config::RequestSettings;
use crate::database::{
    AutomaticConnectionManager, BoxError, ConnectionProvider, ConnectionSource, DatabaseError,
    DatabaseIdentity,
};

/// Type-erased request extensions map, used to carry per-request state between
/// parts of a handler without them knowing about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Creates an empty extensions map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    /// Returns the value of type `T`, if one was inserted.
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes and returns the value of type `T`.
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// The state of one inbound request.
///
/// # Lifecycle
///
/// 1. [`RequestState::new`] when the request arrives. The shared cache is
///    cleared so the request starts from fresh data.
/// 2. Handler code obtains connections with [`connection`](Self::connection) and
///    queues post-commit work with
///    [`add_deferred_action`](Self::add_deferred_action).
/// 3. Exactly one of [`commit`](Self::commit) (after
///    [`pre_execute_commit_time_validation`](Self::pre_execute_commit_time_validation))
///    or [`rollback`](Self::rollback).
/// 4. [`clean_up`](Self::clean_up), always.
///
/// [`execute`](Self::execute) runs the whole sequence around a handler.
pub struct RequestState<P: ConnectionProvider> {
    url: String,
    began: Instant,
    settings: RequestSettings,
    connections: AutomaticConnectionManager<P>,
    extensions: Extensions,
    errors: Vec<(String, BoxError)>,
}

impl<P: ConnectionProvider> RequestState<P> {
    /// Starts the state of a request for `url`, clearing the shared cache.
    pub fn new(
        url: impl Into<String>,
        source: ConnectionSource<P>,
        cache: Arc<MemoryCache>,
        settings: RequestSettings,
    ) -> Self {
        cache.clear();
        let url = url.into();
        debug!(url = %url, "request state created");
        Self {
            url,
            began: Instant::now(),
            settings,
            connections: AutomaticConnectionManager::new(source).with_cache(cache),
            extensions: Extensions::new(),
            errors: Vec::new(),
        }
    }

    /// The URL the request was made to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// When the request state was created.
    pub fn began(&self) -> Instant {
        self.began
    }

    /// Time spent on the request so far.
    pub fn elapsed(&self) -> Duration {
        self.began.elapsed()
    }

    /// Typed values attached to the request.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The request's connection manager.
    pub fn connections(&self) -> &AutomaticConnectionManager<P> {
        &self.connections
    }

    /// Returns the connection for `identity`, opening it on first use.
    pub async fn connection(
        &mut self,
        identity: &DatabaseIdentity,
    ) -> Result<&mut P::Connection, DatabaseError> {
        self.connections.connection(identity).await
    }

    /// Queues `action` to run after the request's transactions commit.
    pub fn add_deferred_action<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.connections.add_deferred_action(action);
    }

    /// Records an error to be reported when the request is cleaned up.
    pub fn add_error(&mut self, prefix: impl Into<String>, error: impl Into<BoxError>) {
        self.errors.push((prefix.into(), error.into()));
    }

    /// Number of errors recorded with [`add_error`](Self::add_error).
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Runs the commit-time checks of every open transaction.
    pub async fn pre_execute_commit_time_validation(&mut self) -> Result<(), DatabaseError> {
        self.connections.pre_execute_commit_time_validation().await
    }

    /// Commits every open transaction, then runs deferred actions with the cache
    /// disabled.
    pub async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.connections.commit_and_flush().await
    }

    /// Rolls back every open transaction and discards deferred actions.
    pub async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.connections.rollback_and_flush().await
    }

    /// Final cleanup: closes any connection still open and reports the request's
    /// errors or slowness.
    ///
    /// Deferred actions still queued here are discarded: running them could open
    /// connections again after the request is finished.
    pub async fn clean_up(&mut self) -> Result<(), DatabaseError> {
        let result = self.connections.clean_up(true).await;

        if !self.errors.is_empty() {
            for (prefix, e) in &self.errors {
                error!(url = %self.url, prefix = %prefix, error = %e, "request failed");
            }
        } else {
            let elapsed = self.elapsed();
            let threshold = self.settings.slow_request_threshold();
            if elapsed > threshold && !self.settings.development {
                warn!(
                    url = %self.url,
                    elapsed = ?elapsed,
                    threshold = ?threshold,
                    "request exceeded the slow request threshold"
                );
            }
        }

        result
    }

    /// Runs `handler` as the body of the request.
    ///
    /// On success the open transactions are validated and committed; if the
    /// handler, the validation, or the commit fails, everything is rolled back.
    /// The request is always cleaned up. The handler's error takes precedence
    /// over any later failure, which is recorded on the request instead.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let state = RequestState::new("/orders", source, cache, settings);
    /// let total = state
    ///     .execute(|request| Box::pin(async move {
    ///         let db = request.connection(&DatabaseIdentity::Primary).await?;
    ///         load_total(db).await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn execute<T, E, F>(self, handler: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T, E>>,
        E: From<DatabaseError>,
    {
        self.execute_cancellable(handler, std::future::pending()).await
    }

    /// Like [`execute`](Self::execute), but abandons `handler` as soon as
    /// `cancel` completes, for example when the client disconnects. A cancelled
    /// request is rolled back, cleaned up and reported as
    /// [`DatabaseError::Cancelled`].
    pub async fn execute_cancellable<T, E, F, C>(mut self, handler: F, cancel: C) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T, E>>,
        E: From<DatabaseError>,
        C: Future<Output = ()>,
    {
        let handled = tokio::select! {
            biased;
            () = cancel => None,
            outcome = handler(&mut self) => Some(outcome),
        };

        let outcome = match handled {
            Some(Ok(value)) => self.finish().await.map(|()| value).map_err(E::from),
            Some(Err(e)) => {
                self.roll_back_recording("rollback after handler failure").await;
                Err(e)
            }
            None => {
                warn!(url = %self.url, elapsed = ?self.elapsed(), "request cancelled; rolling back");
                self.roll_back_recording("rollback after cancellation").await;
                Err(E::from(DatabaseError::Cancelled))
            }
        };

        match self.clean_up().await {
            Ok(()) => outcome,
            Err(e) => outcome.and(Err(E::from(e))),
        }
    }

    async fn roll_back_recording(&mut self, prefix: &str) {
        if let Err(rollback_error) = self.rollback().await {
            self.add_error(prefix, rollback_error);
        }
    }

    // Validate, then commit. A validation failure rolls back instead.
    async fn finish(&mut self) -> Result<(), DatabaseError> {
        if let Err(e) = self.pre_execute_commit_time_validation().await {
            self.roll_back_recording("rollback after validation failure").await;
            return Err(e);
        }
        self.commit().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cache::CacheLayer;
    use crate::database::Operation;
    use crate::database::fake::FakeProvider;

    fn request(provider: &FakeProvider, cache: &Arc<MemoryCache>) -> RequestState<FakeProvider> {
        RequestState::new(
            "https://example.com/orders",
            provider.source(&[("Reporting", true)]),
            Arc::clone(cache),
            RequestSettings::default(),
        )
    }

    // ── Extensions ────────────────────────────────────────────────────────────

    #[test]
    fn extensions_store_one_value_per_type() {
        let mut extensions = Extensions::new();
        assert_eq!(extensions.insert(7_u32), None);
        assert_eq!(extensions.insert(8_u32), Some(7));
        extensions.insert(String::from("user"));

        assert_eq!(extensions.get::<u32>(), Some(&8));
        *extensions.get_mut::<String>().unwrap() += "-42";
        assert_eq!(extensions.remove::<String>().as_deref(), Some("user-42"));
        assert_eq!(extensions.get::<String>(), None);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn new_request_clears_the_cache() {
        let cache = Arc::new(MemoryCache::new());
        cache.insert("stale", 1_u8);
        let provider = FakeProvider::new();

        let state = request(&provider, &cache);

        assert!(cache.is_empty());
        assert_eq!(state.url(), "https://example.com/orders");
        assert!(state.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn execute_commits_and_runs_deferred_actions_with_cache_disabled() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        let observed = Arc::new(Mutex::new(None));
        let deferred_cache = Arc::clone(&cache);
        let deferred_observed = Arc::clone(&observed);

        let value = request(&provider, &cache)
            .execute(|state| {
                Box::pin(async move {
                    state.connection(&DatabaseIdentity::Primary).await?;
                    state.add_deferred_action(move || async move {
                        *deferred_observed.lock().unwrap() = Some(deferred_cache.is_enabled());
                        Ok::<(), BoxError>(())
                    });
                    Ok::<_, DatabaseError>(42)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(*observed.lock().unwrap(), Some(false));
        assert!(cache.is_enabled());
        assert_eq!(
            provider.journal(),
            [
                "open primary",
                "begin primary",
                "validate primary",
                "commit primary",
                "close primary",
            ]
        );
    }

    #[tokio::test]
    async fn execute_rolls_back_when_handler_fails() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        let ran = Arc::new(Mutex::new(false));

        let result: Result<(), DatabaseError> = request(&provider, &cache)
            .execute(|state| {
                let ran = Arc::clone(&ran);
                Box::pin(async move {
                    state.connection(&DatabaseIdentity::Primary).await?;
                    state.add_deferred_action(move || async move {
                        *ran.lock().unwrap() = true;
                        Ok::<(), BoxError>(())
                    });
                    Err::<(), _>(DatabaseError::Cancelled)
                })
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Cancelled)));
        assert!(!*ran.lock().unwrap());
        assert_eq!(
            provider.journal(),
            ["open primary", "begin primary", "rollback primary", "close primary"]
        );
    }

    #[tokio::test]
    async fn execute_rolls_back_when_validation_fails() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        provider.fail("Reporting", Operation::CommitTimeValidation);

        let err = request(&provider, &cache)
            .execute(|state| {
                Box::pin(async move {
                    state.connection(&DatabaseIdentity::Primary).await?;
                    state.connection(&DatabaseIdentity::secondary("Reporting")).await?;
                    Ok::<_, DatabaseError>(())
                })
            })
            .await
            .unwrap_err();

        assert_eq!(
            err.connection_failure(),
            Some((
                &DatabaseIdentity::secondary("Reporting"),
                Operation::CommitTimeValidation
            ))
        );
        let journal = provider.journal();
        assert!(!journal.iter().any(|entry| entry.starts_with("commit")));
        assert!(journal.contains(&"rollback primary".to_owned()));
        assert!(journal.contains(&"rollback Reporting".to_owned()));
    }

    #[tokio::test]
    async fn execute_surfaces_commit_failure() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        provider.fail("primary", Operation::CommitTransaction);

        let err = request(&provider, &cache)
            .execute(|state| {
                Box::pin(async move {
                    state.connection(&DatabaseIdentity::Primary).await?;
                    state.connection(&DatabaseIdentity::secondary("Reporting")).await?;
                    Ok::<_, DatabaseError>(())
                })
            })
            .await
            .unwrap_err();

        assert_eq!(
            err.connection_failure(),
            Some((&DatabaseIdentity::Primary, Operation::CommitTransaction))
        );
        assert!(provider.journal().contains(&"rollback Reporting".to_owned()));
    }

    #[tokio::test]
    async fn cancelled_request_is_rolled_back_and_closed() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        let ran = Arc::new(Mutex::new(false));

        let result: Result<(), DatabaseError> = request(&provider, &cache)
            .execute_cancellable(
                |state| {
                    let ran = Arc::clone(&ran);
                    Box::pin(async move {
                        state.connection(&DatabaseIdentity::Primary).await?;
                        state.add_deferred_action(move || async move {
                            *ran.lock().unwrap() = true;
                            Ok::<(), BoxError>(())
                        });
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, DatabaseError>(())
                    })
                },
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;

        assert!(matches!(result, Err(DatabaseError::Cancelled)));
        assert!(!*ran.lock().unwrap());
        assert_eq!(
            provider.journal(),
            ["open primary", "begin primary", "rollback primary", "close primary"]
        );
    }

    #[tokio::test]
    async fn cancellation_error_survives_rollback_failure() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        provider.fail("primary", Operation::RollbackTransaction);
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let err = request(&provider, &cache)
            .execute_cancellable(
                move |state| {
                    Box::pin(async move {
                        state.connection(&DatabaseIdentity::Primary).await?;
                        let _ = cancel_tx.send(());
                        std::future::pending::<()>().await;
                        Ok::<_, DatabaseError>(())
                    })
                },
                async move {
                    let _ = cancel_rx.await;
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::Cancelled));
        assert!(provider.journal().contains(&"close primary".to_owned()));
    }

    #[tokio::test]
    async fn clean_up_closes_connections_left_open_and_skips_deferred_actions() {
        let cache = Arc::new(MemoryCache::new());
        let provider = FakeProvider::new();
        let ran = Arc::new(Mutex::new(false));
        let mut state = request(&provider, &cache);

        state.connection(&DatabaseIdentity::Primary).await.unwrap();
        let flag = Arc::clone(&ran);
        state.add_deferred_action(move || async move {
            *flag.lock().unwrap() = true;
            Ok::<(), BoxError>(())
        });
        state.add_error("while rendering", "template missing");

        state.clean_up().await.unwrap();

        assert!(!*ran.lock().unwrap());
        assert_eq!(state.error_count(), 1);
        assert!(state.connections().initialized_identities().is_empty());
        assert_eq!(state.connections().pending_deferred_actions(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_keep_shared_cache_disabled_until_both_finish() {
        let cache = Arc::new(MemoryCache::new());
        cache.disable();
        let provider = FakeProvider::new();

        request(&provider, &cache)
            .execute(|state| {
                Box::pin(async move {
                    state.add_deferred_action(|| async { Ok::<(), BoxError>(()) });
                    Ok::<_, DatabaseError>(())
                })
            })
            .await
            .unwrap();

        // The other scope's disable is still in force.
        assert!(!cache.is_enabled());
        cache.reset();
        assert!(cache.is_enabled());
    }
}
