//! Per-unit-of-work connection registry and transaction coordinator.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::cleanup::Failures;
use super::{
    BoxError, Connection, ConnectionProvider, ConnectionSource, DatabaseError, DatabaseIdentity,
    DatabaseInfo, Operation,
};
use crate::cache::{CacheBracket, CacheLayer};

/// A side effect queued to run only after every transaction has committed.
pub type DeferredAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

// An initialized connection. Its presence in the registry is what marks the
// identity as initialized.
struct ConnectionSlot<C> {
    info: DatabaseInfo,
    connection: C,
}

/// Opens connections on first use and commits, rolls back and closes them at the
/// end of a unit of work.
///
/// One manager belongs to exactly one sequential flow of control (a request or a
/// background task); it is not shared. Within it there is at most one connection,
/// and at most one transaction, per [`DatabaseIdentity`].
///
/// Cleanup processes the primary database first and secondaries in the order
/// they were first used. There is no two-phase commit: if a commit fails, every
/// connection cleaned up after it is rolled back instead of committed. The primary
/// goes first because it is the most likely to fail.
///
/// # Examples
///
/// ```rust,ignore
/// let mut connections = AutomaticConnectionManager::new(source);
/// let primary = connections.connection(&DatabaseIdentity::Primary).await?;
/// // ... run queries on `primary` ...
/// connections.add_deferred_action(|| async { notify_search_index().await });
/// connections.commit_and_flush().await?;
/// ```
pub struct AutomaticConnectionManager<P: ConnectionProvider> {
    source: ConnectionSource<P>,
    primary: Option<ConnectionSlot<P::Connection>>,
    // In first-access order.
    secondary: Vec<ConnectionSlot<P::Connection>>,
    deferred: Vec<DeferredAction>,
    cache: Option<Arc<dyn CacheLayer>>,
    marked_for_rollback: bool,
}

impl<P: ConnectionProvider> AutomaticConnectionManager<P> {
    /// Creates a manager with nothing initialized and no cache bracket.
    pub fn new(source: ConnectionSource<P>) -> Self {
        Self {
            source,
            primary: None,
            secondary: Vec::new(),
            deferred: Vec::new(),
            cache: None,
            marked_for_rollback: false,
        }
    }

    /// Brackets deferred actions with `cache`: it is disabled while they run and
    /// reset afterwards.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The configuration and provider connections are created from.
    pub fn source(&self) -> &ConnectionSource<P> {
        &self.source
    }

    /// Whether `identity` has an open connection in this unit of work.
    pub fn is_initialized(&self, identity: &DatabaseIdentity) -> bool {
        self.slot(identity).is_some()
    }

    /// Initialized identities in cleanup order.
    pub fn initialized_identities(&self) -> Vec<DatabaseIdentity> {
        self.slots().map(|slot| slot.info.identity.clone()).collect()
    }

    /// Whether the current cleanup pass rolls back instead of committing.
    pub fn is_marked_for_rollback(&self) -> bool {
        self.marked_for_rollback
    }

    /// Number of deferred actions waiting for the next cleanup.
    pub fn pending_deferred_actions(&self) -> usize {
        self.deferred.len()
    }

    /// Opens the connection for `identity`, beginning a transaction if the
    /// database uses automatic transactions. Does nothing if the identity is
    /// already initialized.
    ///
    /// # Errors
    ///
    /// If opening fails the identity stays uninitialized. If beginning the
    /// transaction fails, the just-opened connection is closed first and the
    /// identity stays uninitialized.
    pub async fn ensure_initialized(&mut self, identity: &DatabaseIdentity) -> Result<(), DatabaseError> {
        if self.is_initialized(identity) {
            return Ok(());
        }

        let (info, mut connection) = self.source.resolve(identity)?;
        connection
            .open()
            .await
            .map_err(|e| DatabaseError::connection(identity, Operation::Open, e))?;

        if info.automatic_transactions {
            if let Err(e) = connection.begin_transaction().await {
                if let Err(close_error) = connection.close().await {
                    warn!(identity = %identity, error = %close_error, "failed to close connection after begin failure");
                }
                return Err(DatabaseError::connection(identity, Operation::BeginTransaction, e));
            }
        }

        debug!(
            identity = %identity,
            automatic_transactions = info.automatic_transactions,
            "database connection initialized"
        );
        let slot = ConnectionSlot { info, connection };
        match identity {
            DatabaseIdentity::Primary => self.primary = Some(slot),
            DatabaseIdentity::Secondary(_) => self.secondary.push(slot),
        }
        Ok(())
    }

    /// Returns the connection for `identity`, initializing it on first use.
    pub async fn connection(
        &mut self,
        identity: &DatabaseIdentity,
    ) -> Result<&mut P::Connection, DatabaseError> {
        self.ensure_initialized(identity).await?;
        self.slot_mut(identity)
            .map(|slot| &mut slot.connection)
            .ok_or_else(|| DatabaseError::UnknownDatabase(identity.clone()))
    }

    /// Queues `action` to run after every transaction has committed.
    ///
    /// Actions run in insertion order. They are discarded without running if the
    /// unit of work rolls back.
    pub fn add_deferred_action<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.deferred
            .push(Box::new(move || -> BoxFuture<'static, Result<(), BoxError>> { Box::pin(action()) }));
    }

    /// Runs the commit-time validation hook of every transactional connection.
    ///
    /// Call this before [`commit_and_flush`](Self::commit_and_flush) so a failure
    /// on any database can still abort the commits on all of them.
    pub async fn pre_execute_commit_time_validation(&mut self) -> Result<(), DatabaseError> {
        for slot in self.primary.iter_mut().chain(self.secondary.iter_mut()) {
            if !slot.info.automatic_transactions {
                continue;
            }
            slot.connection
                .pre_execute_commit_time_validation()
                .await
                .map_err(|e| {
                    DatabaseError::connection(&slot.info.identity, Operation::CommitTimeValidation, e)
                })?;
        }
        Ok(())
    }

    /// Commits every transaction, closes every connection, then runs the deferred
    /// actions.
    pub async fn commit_and_flush(&mut self) -> Result<(), DatabaseError> {
        self.clean_up(false).await
    }

    /// Rolls back every transaction and closes every connection. Deferred actions
    /// are discarded.
    pub async fn rollback_and_flush(&mut self) -> Result<(), DatabaseError> {
        self.marked_for_rollback = true;
        self.clean_up(false).await
    }

    /// Cleans up every initialized connection, then flushes the deferred actions.
    ///
    /// Every step runs even when an earlier one fails; the first failure is
    /// returned with later ones attached (see [`DatabaseError::Multiple`]).
    /// Afterwards no identity is initialized, the deferred queue is empty and the
    /// rollback mark is cleared.
    ///
    /// With `skip_deferred` the deferred actions are discarded without running.
    ///
    /// If the returned future is dropped partway, connections not yet cleaned up
    /// stay registered (and are reported when the manager is dropped) and the
    /// rollback mark is still cleared.
    pub async fn clean_up(&mut self, skip_deferred: bool) -> Result<(), DatabaseError> {
        debug!(
            connections = self.slots().count(),
            deferred = self.deferred.len(),
            skip_deferred,
            marked_for_rollback = self.marked_for_rollback,
            "cleaning up unit of work"
        );

        let pass = CleanupPass { manager: self };
        pass.manager.clean_up_registered(skip_deferred).await
    }

    // Each slot leaves the registry only once its own cleanup has finished.
    async fn clean_up_registered(&mut self, skip_deferred: bool) -> Result<(), DatabaseError> {
        let mut failures = Failures::default();

        if let Some(slot) = self.primary.as_mut() {
            failures.record(clean_up_connection(slot, &mut self.marked_for_rollback).await);
            self.primary = None;
        }
        while let Some(slot) = self.secondary.first_mut() {
            failures.record(clean_up_connection(slot, &mut self.marked_for_rollback).await);
            self.secondary.remove(0);
        }
        failures.record(self.flush_deferred(skip_deferred).await);

        if !failures.is_empty() {
            warn!("unit of work cleanup finished with failures");
        }
        failures.into_result()
    }

    async fn flush_deferred(&mut self, skip_deferred: bool) -> Result<(), DatabaseError> {
        let actions = std::mem::take(&mut self.deferred);
        if actions.is_empty() {
            return Ok(());
        }
        if skip_deferred || self.marked_for_rollback {
            debug!(count = actions.len(), "discarding deferred actions");
            return Ok(());
        }

        match &self.cache {
            Some(cache) => {
                let _bracket = CacheBracket::enter(cache.as_ref());
                run_deferred(actions).await
            }
            None => run_deferred(actions).await,
        }
    }

    fn slots(&self) -> impl Iterator<Item = &ConnectionSlot<P::Connection>> {
        self.primary.iter().chain(self.secondary.iter())
    }

    fn slot(&self, identity: &DatabaseIdentity) -> Option<&ConnectionSlot<P::Connection>> {
        match identity {
            DatabaseIdentity::Primary => self.primary.as_ref(),
            DatabaseIdentity::Secondary(_) => {
                self.secondary.iter().find(|slot| &slot.info.identity == identity)
            }
        }
    }

    fn slot_mut(&mut self, identity: &DatabaseIdentity) -> Option<&mut ConnectionSlot<P::Connection>> {
        match identity {
            DatabaseIdentity::Primary => self.primary.as_mut(),
            DatabaseIdentity::Secondary(_) => {
                self.secondary.iter_mut().find(|slot| &slot.info.identity == identity)
            }
        }
    }
}

impl<P: ConnectionProvider> Drop for AutomaticConnectionManager<P> {
    fn drop(&mut self) {
        let open = self.slots().count();
        if open > 0 {
            warn!(connections = open, "unit of work dropped without cleanup; connections were not closed");
        }
    }
}

// Clears the rollback mark when a cleanup pass ends, however it ends.
struct CleanupPass<'a, P: ConnectionProvider> {
    manager: &'a mut AutomaticConnectionManager<P>,
}

impl<P: ConnectionProvider> Drop for CleanupPass<'_, P> {
    fn drop(&mut self) {
        let remaining = self.manager.slots().count();
        if remaining > 0 {
            warn!(connections = remaining, "cleanup interrupted; connections left open");
        }
        self.manager.marked_for_rollback = false;
    }
}

// Commits (or rolls back) and closes one connection. A commit failure marks the
// rest of the pass for rollback, so cleanup order matters.
async fn clean_up_connection<C: Connection>(
    slot: &mut ConnectionSlot<C>,
    marked_for_rollback: &mut bool,
) -> Result<(), DatabaseError> {
    let identity = &slot.info.identity;
    let mut failures = Failures::default();

    if slot.info.automatic_transactions {
        if !*marked_for_rollback {
            if let Err(e) = slot.connection.commit_transaction().await {
                warn!(identity = %identity, error = %e, "commit failed; rolling back remaining connections");
                *marked_for_rollback = true;
                failures.push(DatabaseError::connection(identity, Operation::CommitTransaction, e));
            }
        }
        if *marked_for_rollback {
            failures.record(
                slot.connection
                    .rollback_transaction()
                    .await
                    .map_err(|e| DatabaseError::connection(identity, Operation::RollbackTransaction, e)),
            );
        }
    }

    failures.record(
        slot.connection
            .close()
            .await
            .map_err(|e| DatabaseError::connection(identity, Operation::Close, e)),
    );
    debug!(identity = %identity, rolled_back = *marked_for_rollback, "database connection cleaned up");
    failures.into_result()
}

// Runs actions in order; the first failure stops the rest.
async fn run_deferred(actions: Vec<DeferredAction>) -> Result<(), DatabaseError> {
    let count = actions.len();
    for (index, action) in actions.into_iter().enumerate() {
        if let Err(e) = action().await {
            warn!(index, count, error = %e, "deferred action failed; skipping the rest");
            return Err(DatabaseError::DeferredAction(e));
        }
    }
    debug!(count, "deferred actions executed");
    Ok(())
}
