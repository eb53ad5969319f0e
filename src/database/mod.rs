//! Database layer: lazily opened connections with automatic transactions.
//!
//! A unit of work (one inbound request, or one background task) talks to a
//! primary database and any number of named secondary databases. The first time
//! code asks for a connection to a database, the connection is opened and, if the
//! database is configured for it, a transaction is begun. At the end of the unit
//! of work every open connection is committed (or rolled back) and closed, in a
//! fixed order, and queued post-commit side effects are flushed.
//!
//! ## Core types
//!
//! - [`DatabaseIdentity`]: which database a connection belongs to.
//! - [`Connection`] / [`ConnectionProvider`]: the physical connection seam.
//! - [`AutomaticConnectionManager`]: the per-unit-of-work coordinator.
//! - [`DatabaseError`]: every failure surfaced by this layer.

use std::fmt;

use thiserror::Error;

pub(crate) mod cleanup;
pub mod connection;
pub mod manager;
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
pub(crate) mod fake;

pub use connection::{Connection, ConnectionProvider, ConnectionSource};
pub use manager::{AutomaticConnectionManager, DeferredAction};

/// Boxed error used for failures produced by caller-supplied code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identifies one of the databases reachable from a unit of work.
///
/// There is exactly one primary database; secondary databases are identified by
/// name.
///
/// # Examples
///
/// ```
/// use autotx::database::DatabaseIdentity;
///
/// let reporting = DatabaseIdentity::secondary("Reporting");
/// assert_eq!(reporting.secondary_name(), Some("Reporting"));
/// assert!(DatabaseIdentity::Primary.is_primary());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseIdentity {
    Primary,
    Secondary(String),
}

impl DatabaseIdentity {
    /// Creates a secondary identity with the given name.
    pub fn secondary(name: impl Into<String>) -> Self {
        Self::Secondary(name.into())
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }

    /// Returns the name of a secondary database, or `None` for the primary.
    pub fn secondary_name(&self) -> Option<&str> {
        match self {
            Self::Primary => None,
            Self::Secondary(name) => Some(name.as_str()),
        }
    }
}

impl fmt::Display for DatabaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary database"),
            Self::Secondary(name) => write!(f, "secondary database `{name}`"),
        }
    }
}

/// Resolved static configuration for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub identity: DatabaseIdentity,
    pub connection_string: String,
    /// Whether connections are wrapped in a transaction that is begun on first
    /// use and committed or rolled back at the end of the unit of work.
    pub automatic_transactions: bool,
}

/// A physical connection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    Close,
    CommitTimeValidation,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::BeginTransaction => "begin",
            Self::CommitTransaction => "commit",
            Self::RollbackTransaction => "rollback",
            Self::Close => "close",
            Self::CommitTimeValidation => "validate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the database layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A physical connection operation failed.
    #[error("{operation} failed on {identity}: {source}")]
    Connection {
        identity: DatabaseIdentity,
        operation: Operation,
        #[source]
        source: BoxError,
    },

    #[error("{0} is not configured")]
    UnknownDatabase(DatabaseIdentity),

    /// A queued post-commit action failed.
    #[error("deferred action failed: {0}")]
    DeferredAction(#[source] BoxError),

    #[error("unit of work was cancelled")]
    Cancelled,

    /// Several cleanup steps failed. `first` is the failure the caller should act
    /// on; `suppressed` holds every later one, in the order they happened.
    #[error("{first} ({} further failure(s) during cleanup)", .suppressed.len())]
    Multiple {
        #[source]
        first: Box<DatabaseError>,
        suppressed: Vec<DatabaseError>,
    },
}

impl DatabaseError {
    pub(crate) fn connection<E>(identity: &DatabaseIdentity, operation: Operation, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            identity: identity.clone(),
            operation,
            source: Box::new(source),
        }
    }

    /// Returns the primary failure, looking through [`DatabaseError::Multiple`].
    pub fn first(&self) -> &DatabaseError {
        match self {
            Self::Multiple { first, .. } => first.first(),
            other => other,
        }
    }

    /// Returns failures that happened after the primary one.
    pub fn suppressed(&self) -> &[DatabaseError] {
        match self {
            Self::Multiple { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// The identity and operation of a physical connection failure.
    pub fn connection_failure(&self) -> Option<(&DatabaseIdentity, Operation)> {
        match self.first() {
            Self::Connection {
                identity,
                operation,
                ..
            } => Some((identity, *operation)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn identity_display() {
        assert_eq!(DatabaseIdentity::Primary.to_string(), "primary database");
        assert_eq!(
            DatabaseIdentity::secondary("Reporting").to_string(),
            "secondary database `Reporting`"
        );
    }

    #[test]
    fn identity_accessors() {
        assert!(DatabaseIdentity::Primary.is_primary());
        assert_eq!(DatabaseIdentity::Primary.secondary_name(), None);
        let reporting = DatabaseIdentity::secondary("Reporting");
        assert!(!reporting.is_primary());
        assert_eq!(reporting.secondary_name(), Some("Reporting"));
    }

    #[test]
    fn connection_error_message_names_operation_and_identity() {
        let err = DatabaseError::connection(&DatabaseIdentity::Primary, Operation::CommitTransaction, Boom);
        assert_eq!(err.to_string(), "commit failed on primary database: boom");
        assert_eq!(
            err.connection_failure(),
            Some((&DatabaseIdentity::Primary, Operation::CommitTransaction))
        );
    }

    #[test]
    fn multiple_exposes_first_and_suppressed() {
        let err = DatabaseError::Multiple {
            first: Box::new(DatabaseError::connection(
                &DatabaseIdentity::Primary,
                Operation::CommitTransaction,
                Boom,
            )),
            suppressed: vec![DatabaseError::Cancelled],
        };
        assert!(err.to_string().ends_with("(1 further failure(s) during cleanup)"));
        assert!(matches!(err.first(), DatabaseError::Connection { .. }));
        assert_eq!(err.suppressed().len(), 1);
        assert!(DatabaseError::Cancelled.suppressed().is_empty());
    }
}
