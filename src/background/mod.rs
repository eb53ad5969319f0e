//! Background tasks: units of work that run outside any request.
//!
//! A background task gets its own [`AutomaticConnectionManager`] with no cache
//! bracket. The task's connections are committed when it succeeds and rolled back
//! when it fails or is cancelled; they are never left open.
//!
//! ## Core types
//!
//! - [`execute_with_automatic_connections`]: run one unit of work.
//! - [`execute_cancellable`]: the same, racing a cancellation signal.
//! - [`TaskQueue`]: an in-process queue running each job as its own unit of work.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use futures::future::BoxFuture;

use crate::database::cleanup::Failures;
use crate::database::{AutomaticConnectionManager, BoxError, ConnectionProvider, ConnectionSource, DatabaseError};

/// Runs `work` as a unit of work with automatically managed connections.
///
/// If `work` succeeds every transaction is committed and deferred actions run.
/// If `work` or the commit fails, everything is rolled back and the original
/// error is returned.
pub async fn execute_with_automatic_connections<P, T, E, F>(
    source: ConnectionSource<P>,
    work: F,
) -> Result<T, E>
where
    P: ConnectionProvider,
    F: for<'a> FnOnce(&'a mut AutomaticConnectionManager<P>) -> BoxFuture<'a, Result<T, E>>,
    E: From<DatabaseError>,
{
    execute_cancellable(source, work, std::future::pending()).await
}

/// Like [`execute_with_automatic_connections`], but abandons `work` as soon as
/// `cancel` completes. A cancelled unit of work is rolled back and reported as
/// [`DatabaseError::Cancelled`]; if the rollback fails too, its failure is
/// attached through [`DatabaseError::Multiple`].
///
/// When `work` itself fails, its error is returned unchanged. `E` is the
/// caller's type, so a failure of the follow-up rollback cannot be attached to
/// it and is logged at error level instead.
pub async fn execute_cancellable<P, T, E, F, C>(
    source: ConnectionSource<P>,
    work: F,
    cancel: C,
) -> Result<T, E>
where
    P: ConnectionProvider,
    F: for<'a> FnOnce(&'a mut AutomaticConnectionManager<P>) -> BoxFuture<'a, Result<T, E>>,
    E: From<DatabaseError>,
    C: Future<Output = ()>,
{
    let mut connections = AutomaticConnectionManager::new(source);

    let outcome = tokio::select! {
        biased;
        () = cancel => None,
        outcome = work(&mut connections) => Some(outcome),
    };

    match outcome {
        // A failed commit has already rolled back everything after it.
        Some(Ok(value)) => connections.commit_and_flush().await.map(|()| value).map_err(E::from),
        Some(Err(e)) => {
            if let Err(rollback_error) = connections.rollback_and_flush().await {
                error!(error = %rollback_error, "rollback after failed work also failed");
            }
            Err(e)
        }
        None => {
            warn!(
                connections = connections.initialized_identities().len(),
                "unit of work cancelled; rolling back"
            );
            let mut failures = Failures::default();
            failures.push(DatabaseError::Cancelled);
            failures.record(connections.rollback_and_flush().await);
            Err(E::from(failures.into_result().err().unwrap_or(DatabaseError::Cancelled)))
        }
    }
}

/// A job for [`TaskQueue`]: async work against the job's own connections.
pub type Job<P> = Box<
    dyn for<'a> FnOnce(&'a mut AutomaticConnectionManager<P>) -> BoxFuture<'a, Result<(), BoxError>>
        + Send,
>;

/// Errors produced by [`TaskQueue`].
#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("task queue is shut down")]
    Closed,

    #[error("task queue worker panicked")]
    WorkerPanicked,
}

/// Job outcomes counted by a [`TaskQueue`] worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// In-process queue of background jobs, executed one at a time in submission
/// order by a single Tokio worker task.
///
/// Every job runs in its own unit of work via
/// [`execute_with_automatic_connections`]. Job failures are logged and counted,
/// never propagated.
///
/// # Examples
///
/// ```rust,ignore
/// let queue = TaskQueue::spawn(source, 64);
/// queue
///     .submit(|connections| Box::pin(async move {
///         let db = connections.connection(&DatabaseIdentity::Primary).await?;
///         purge_expired_sessions(db).await?;
///         Ok(())
///     }))
///     .await?;
/// let stats = queue.shutdown().await?;
/// ```
pub struct TaskQueue<P: ConnectionProvider> {
    sender: mpsc::Sender<Job<P>>,
    worker: JoinHandle<TaskStats>,
}

impl<P: ConnectionProvider> TaskQueue<P> {
    /// Starts the worker. `capacity` bounds the number of jobs waiting to run.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(source: ConnectionSource<P>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(source, receiver));
        Self { sender, worker }
    }

    /// Queues `job`, waiting for room if the queue is full.
    pub async fn submit<F>(&self, job: F) -> Result<(), TaskQueueError>
    where
        F: for<'a> FnOnce(&'a mut AutomaticConnectionManager<P>) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + 'static,
    {
        self.sender
            .send(Box::new(job))
            .await
            .map_err(|_| TaskQueueError::Closed)
    }

    /// Stops accepting jobs, waits for queued jobs to finish and returns the
    /// worker's counts.
    pub async fn shutdown(self) -> Result<TaskStats, TaskQueueError> {
        drop(self.sender);
        self.worker.await.map_err(|_| TaskQueueError::WorkerPanicked)
    }
}

async fn run_worker<P: ConnectionProvider>(
    source: ConnectionSource<P>,
    mut receiver: mpsc::Receiver<Job<P>>,
) -> TaskStats {
    let mut stats = TaskStats::default();
    debug!("task queue worker started");

    while let Some(job) = receiver.recv().await {
        match execute_with_automatic_connections::<P, (), BoxError, _>(source.clone(), job).await {
            Ok(()) => stats.succeeded += 1,
            Err(e) => {
                warn!(error = %e, "background job failed");
                stats.failed += 1;
            }
        }
    }

    info!(succeeded = stats.succeeded, failed = stats.failed, "task queue worker stopped");
    stats
}
